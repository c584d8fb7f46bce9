//! Message handlers: protocol semantics for each message type.
//!
//! Handlers run inline on the receive loop of the connection the message
//! arrived on. Malformed or failing requests are answered with an error
//! field where the protocol has a reply, and logged otherwise; only a
//! failure to write to the connection ends the loop.

use crate::node::WeakNode;
use crate::object::{DistributedObject, MethodCall, TypeRegistry};
use crate::storage::{LiveEntry, ObjectStorage};
use async_trait::async_trait;
use std::sync::Arc;
use tether_types::{
    Contact, Id, Message, MessageType, NodeConfig, ObjectWithType, SerializedEntry, TetherError,
    TetherResult, Value,
};
use tether_wire::{ClientLookup, Dispatcher, MessageHandler, SideChannel};
use tracing::{debug, warn};

/// Node state shared by every handler.
pub(crate) struct HandlerContext {
    pub(crate) config: NodeConfig,
    pub(crate) self_contact: Contact,
    pub(crate) storage: Arc<ObjectStorage>,
    pub(crate) clients: ClientLookup,
    pub(crate) side_channel: SideChannel,
    pub(crate) types: Arc<TypeRegistry>,
    pub(crate) node: WeakNode,
}

impl HandlerContext {
    /// Send `reply` back over the connection `request` arrived on.
    async fn reply(&self, request: &Message, reply: Message) -> TetherResult<()> {
        let Some(sender) = request.sender else {
            warn!(message_type = request.message_type, "request without sender, not replying");
            return Ok(());
        };
        let Some(handler) = self.clients.get(&sender) else {
            warn!(%sender, "no connection to reply on");
            return Ok(());
        };
        match handler.send(reply).await {
            Err(e) if e.is_disconnect() => {
                debug!(%sender, "peer went away before the reply: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    /// The local copy of an object, preferring the one this node owns.
    fn local_object(&self, id: Option<Id>) -> TetherResult<Arc<dyn DistributedObject>> {
        let id = id.ok_or_else(|| TetherError::InvalidArgument("missing object id".into()))?;
        let entries = self.storage.find(&id);
        entries
            .iter()
            .find(|e| e.owner == self.self_contact)
            .or_else(|| entries.first())
            .and_then(|e| e.value.clone())
            .ok_or_else(|| TetherError::ObjectVanished(id.to_string()))
    }

    fn from_client(&self, message: &Message) -> bool {
        self.config.acts_as_server() && message.sender != Some(self.self_contact)
    }
}

fn member<'a>(name: &'a Option<String>, what: &str) -> TetherResult<&'a str> {
    name.as_deref()
        .ok_or_else(|| TetherError::InvalidArgument(format!("missing {}", what)))
}

/// Fill the result or error field of a reply.
fn set_outcome(reply: &mut Message, outcome: TetherResult<Value>) {
    match outcome.and_then(|value| ObjectWithType::from_value(&value)) {
        Ok(result) => reply.result = Some(result),
        Err(e) => reply.error = Some(e.to_string()),
    }
}

/// Fetch: answer with every entry this node owns under the key.
pub(crate) struct FetchHandler(pub(crate) Arc<HandlerContext>);

#[async_trait]
impl MessageHandler for FetchHandler {
    async fn handle(&self, message: Message) -> TetherResult<()> {
        let ctx = &self.0;
        let Some(key) = message.fetch_key else {
            warn!(sender = ?message.sender, "fetch without key");
            return Ok(());
        };

        let entries: Vec<SerializedEntry> = ctx
            .storage
            .find_owned_by(&key, &ctx.self_contact)
            .into_iter()
            .filter_map(|entry| match ctx.types.encode(entry.value.as_ref()) {
                Ok(value) => Some(SerializedEntry {
                    key: entry.key,
                    owner: entry.owner,
                    value,
                }),
                Err(e) => {
                    warn!(%key, "could not serialize entry: {}", e);
                    None
                }
            })
            .collect();

        debug!(%key, entries = entries.len(), sender = ?message.sender, "answering fetch");
        let reply = Message::fetch_result(key, entries).answering(&message);
        ctx.reply(&message, reply).await
    }
}

/// FetchResult: store the received entries, then wake the waiting lookup.
pub(crate) struct FetchResultHandler(pub(crate) Arc<HandlerContext>);

#[async_trait]
impl MessageHandler for FetchResultHandler {
    async fn handle(&self, message: Message) -> TetherResult<()> {
        let ctx = &self.0;
        for entry in message.fetch_result.iter().flatten() {
            // Our own copy is authoritative.
            if entry.owner == ctx.self_contact
                || !ctx
                    .storage
                    .find_owned_by(&entry.key, &ctx.self_contact)
                    .is_empty()
            {
                continue;
            }
            match ctx.types.decode(&entry.value) {
                Ok(value) => {
                    if let Some(object) = &value {
                        object.attach(ctx.node.clone(), entry.key);
                    }
                    ctx.storage
                        .update_or_put(LiveEntry::new(entry.key, entry.owner, value));
                }
                Err(e) => warn!(
                    key = %entry.key,
                    owner = %entry.owner,
                    "dropping fetched entry: {}",
                    e
                ),
            }
        }
        ctx.side_channel.put(message);
        Ok(())
    }
}

pub(crate) struct GetPropertyHandler(pub(crate) Arc<HandlerContext>);

#[async_trait]
impl MessageHandler for GetPropertyHandler {
    async fn handle(&self, message: Message) -> TetherResult<()> {
        let ctx = &self.0;
        let outcome = ctx.local_object(message.object_id).and_then(|object| {
            let property = member(&message.property_name, "property name")?;
            object.get_direct(property)
        });
        let mut reply = Message::reply_to(&message, MessageType::GetPropertyResult);
        set_outcome(&mut reply, outcome);
        ctx.reply(&message, reply).await
    }
}

pub(crate) struct SetPropertyHandler(pub(crate) Arc<HandlerContext>);

impl SetPropertyHandler {
    fn apply(&self, message: &Message) -> TetherResult<()> {
        let ctx = &self.0;
        let property = member(&message.property_name, "property name")?;
        if ctx.from_client(message) {
            return Err(TetherError::MemberAccess(format!(
                "{}: clients may not set properties",
                property
            )));
        }
        let object = ctx.local_object(message.object_id)?;
        let value = match &message.property_value {
            Some(wire) => wire.to_value()?,
            None => Value::Null,
        };
        object.set_direct(property, value)
    }
}

#[async_trait]
impl MessageHandler for SetPropertyHandler {
    async fn handle(&self, message: Message) -> TetherResult<()> {
        let outcome = self.apply(&message);
        if message.wants_confirmation {
            let mut reply = Message::reply_to(&message, MessageType::SetPropertyConfirmation);
            if let Err(e) = outcome {
                reply.error = Some(e.to_string());
            }
            return self.0.reply(&message, reply).await;
        }
        if let Err(e) = outcome {
            warn!(
                sender = ?message.sender,
                property = ?message.property_name,
                "set property failed: {}",
                e
            );
        }
        Ok(())
    }
}

pub(crate) struct InvokeHandler(pub(crate) Arc<HandlerContext>);

impl InvokeHandler {
    async fn execute(&self, message: &Message) -> TetherResult<Value> {
        let ctx = &self.0;
        let method = member(&message.method_name, "method name")?;
        let object = ctx.local_object(message.object_id)?;
        let access = object
            .method_access(method)
            .ok_or_else(|| TetherError::MissingMethod(method.to_string()))?;
        if ctx.from_client(message) && !access.callable_by_client() {
            return Err(TetherError::MemberAccess(format!(
                "{} is not client-callable",
                method
            )));
        }

        let arguments = message
            .arguments
            .iter()
            .flatten()
            .map(ObjectWithType::to_value)
            .collect::<TetherResult<Vec<_>>>()?;
        let call = MethodCall::new(arguments)
            .with_type_arguments(message.type_arguments.clone().unwrap_or_default());
        object.invoke_direct(method, call).await
    }
}

#[async_trait]
impl MessageHandler for InvokeHandler {
    async fn handle(&self, message: Message) -> TetherResult<()> {
        let outcome = self.execute(&message).await;
        let mut reply = Message::reply_to(&message, MessageType::InvokeResult);
        set_outcome(&mut reply, outcome);
        self.0.reply(&message, reply).await
    }
}

pub(crate) struct PingHandler(pub(crate) Arc<HandlerContext>);

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, message: Message) -> TetherResult<()> {
        let reply = Message::reply_to(&message, MessageType::ConnectionPong);
        self.0.reply(&message, reply).await
    }
}

/// Replies: hand them to whoever waits on the side channel.
pub(crate) struct SideChannelHandler(pub(crate) SideChannel);

#[async_trait]
impl MessageHandler for SideChannelHandler {
    async fn handle(&self, message: Message) -> TetherResult<()> {
        self.0.put(message);
        Ok(())
    }
}

/// The dispatcher every connection of a node shares.
pub(crate) fn dispatcher(ctx: Arc<HandlerContext>) -> Dispatcher {
    let mailbox: Arc<dyn MessageHandler> = Arc::new(SideChannelHandler(ctx.side_channel.clone()));
    Dispatcher::new()
        .with(MessageType::Fetch, Arc::new(FetchHandler(Arc::clone(&ctx))))
        .with(
            MessageType::FetchResult,
            Arc::new(FetchResultHandler(Arc::clone(&ctx))),
        )
        .with(
            MessageType::GetProperty,
            Arc::new(GetPropertyHandler(Arc::clone(&ctx))),
        )
        .with(
            MessageType::SetProperty,
            Arc::new(SetPropertyHandler(Arc::clone(&ctx))),
        )
        .with(MessageType::Invoke, Arc::new(InvokeHandler(Arc::clone(&ctx))))
        .with(MessageType::ConnectionPing, Arc::new(PingHandler(ctx)))
        .with(MessageType::GetPropertyResult, Arc::clone(&mailbox))
        .with(MessageType::InvokeResult, Arc::clone(&mailbox))
        .with(MessageType::SetPropertyConfirmation, Arc::clone(&mailbox))
        .with(MessageType::ConnectionPong, mailbox)
}
