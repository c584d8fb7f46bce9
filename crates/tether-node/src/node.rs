//! The node: binds a local endpoint and routes every object operation.
//!
//! A [`Node`] is a cheap handle around shared state. It starts unbound; once
//! bound it accepts connections, registers a loopback handler under its own
//! contact and answers protocol messages. After [`Node::close`] every
//! operation fails with [`TetherError::Closed`].

use crate::handlers::{self, HandlerContext};
use crate::lookup::ObjectLookup;
use crate::object::{DistributedObject, MethodCall, SharedObject, SharedType, TypeRegistry};
use crate::routing::{self, Operation, Route};
use crate::storage::{LiveEntry, ObjectStorage};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock, Weak};
use tether_types::{
    Contact, Id, Message, MessageType, NodeConfig, ObjectWithType, TetherError, TetherResult,
    Value,
};
use tether_wire::{
    context, retry, ClientConnector, ClientHandler, ClientLookup, ConnectionHandler, LogSink,
    SideChannel, UnhandledErrorSink,
};
use tracing::{debug, info, warn};

struct Bound {
    contact: Contact,
    listener: ConnectionHandler,
    connector: ClientConnector,
    lookup: ObjectLookup,
}

enum NodeState {
    Unbound,
    Bound(Arc<Bound>),
    Closed,
}

struct NodeInner {
    config: NodeConfig,
    types: Arc<TypeRegistry>,
    storage: Arc<ObjectStorage>,
    clients: ClientLookup,
    side_channel: SideChannel,
    sink: Arc<dyn UnhandledErrorSink>,
    state: RwLock<NodeState>,
}

/// A participant in the object space.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Non-owning handle to a [`Node`], held by the objects it stores.
#[derive(Clone, Default)]
pub struct WeakNode(Weak<NodeInner>);

impl WeakNode {
    pub fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(|inner| Node { inner })
    }
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        Self::with_sink(config, Arc::new(LogSink))
    }

    /// A node that reports receive-loop errors to `sink`.
    pub fn with_sink(config: NodeConfig, sink: Arc<dyn UnhandledErrorSink>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                config,
                types: Arc::new(TypeRegistry::new()),
                storage: Arc::new(ObjectStorage::new()),
                clients: ClientLookup::new(),
                side_channel: SideChannel::new(),
                sink,
                state: RwLock::new(NodeState::Unbound),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Make `T` known so fetched objects of that type can be rebuilt.
    pub fn register_type<T: SharedType>(&self) {
        self.inner.types.register::<T>();
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    pub fn storage(&self) -> &Arc<ObjectStorage> {
        &self.inner.storage
    }

    pub fn clients(&self) -> &ClientLookup {
        &self.inner.clients
    }

    pub fn side_channel(&self) -> &SideChannel {
        &self.inner.side_channel
    }

    /// The object lookup of a bound node.
    pub fn lookup(&self) -> TetherResult<ObjectLookup> {
        Ok(self.bound()?.lookup.clone())
    }

    /// The local endpoint, once bound.
    pub fn self_contact(&self) -> Option<Contact> {
        self.bound().ok().map(|b| b.contact)
    }

    pub fn is_bound(&self) -> bool {
        self.bound().is_ok()
    }

    /// Every connected contact other than this node.
    pub fn contacts(&self) -> Vec<Contact> {
        match self.self_contact() {
            Some(me) => self.inner.clients.contacts_except(&me),
            None => self.inner.clients.contacts(),
        }
    }

    fn bound(&self) -> TetherResult<Arc<Bound>> {
        let state = self.inner.state.read().unwrap_or_else(|e| e.into_inner());
        match &*state {
            NodeState::Bound(bound) => Ok(Arc::clone(bound)),
            NodeState::Unbound => Err(TetherError::NotBound),
            NodeState::Closed => Err(TetherError::Closed),
        }
    }

    fn check_unbound(&self) -> TetherResult<()> {
        let state = self.inner.state.read().unwrap_or_else(|e| e.into_inner());
        match &*state {
            NodeState::Unbound => Ok(()),
            NodeState::Bound(bound) => Err(TetherError::AlreadyBound(bound.contact)),
            NodeState::Closed => Err(TetherError::Closed),
        }
    }

    /// Bind to `address:port` and start accepting connections.
    ///
    /// Port 0 picks a free port; the returned contact carries the real one.
    pub async fn bind(&self, address: IpAddr, port: u16) -> TetherResult<Contact> {
        self.check_unbound()?;

        let inner = &self.inner;
        let listener = ConnectionHandler::bind(SocketAddr::new(address, port)).await?;
        let contact = listener.contact();

        let ctx = Arc::new(HandlerContext {
            config: inner.config.clone(),
            self_contact: contact,
            storage: Arc::clone(&inner.storage),
            clients: inner.clients.clone(),
            side_channel: inner.side_channel.clone(),
            types: Arc::clone(&inner.types),
            node: self.downgrade(),
        });
        let dispatcher = Arc::new(handlers::dispatcher(ctx));
        let connector = ClientConnector::new(
            inner.clients.clone(),
            inner.side_channel.clone(),
            Arc::clone(&dispatcher),
            Arc::clone(&inner.sink),
        )
        .with_timeout(inner.config.connect_timeout())
        .advertise(contact.port);
        let lookup = ObjectLookup::new(
            Arc::clone(&inner.storage),
            inner.clients.clone(),
            inner.side_channel.clone(),
            contact,
        );
        let bound = Arc::new(Bound {
            contact,
            listener,
            connector,
            lookup,
        });

        let conflict = {
            let mut state = inner.state.write().unwrap_or_else(|e| e.into_inner());
            let conflict = match &*state {
                NodeState::Unbound => None,
                NodeState::Bound(other) => Some(TetherError::AlreadyBound(other.contact)),
                NodeState::Closed => Some(TetherError::Closed),
            };
            if conflict.is_none() {
                *state = NodeState::Bound(Arc::clone(&bound));
            }
            conflict
        };
        if let Some(e) = conflict {
            bound.listener.stop().await;
            return Err(e);
        }

        inner.clients.register(ClientHandler::loopback(
            contact,
            Arc::clone(&dispatcher),
            Arc::clone(&inner.sink),
        ));
        bound
            .listener
            .start(inner.clients.clone(), dispatcher, Arc::clone(&inner.sink));

        info!(
            %contact,
            architecture = %inner.config.architecture,
            caching = %inner.config.caching,
            server = inner.config.is_server,
            "node bound"
        );
        Ok(contact)
    }

    /// Stop listening and close every connection. Closing twice is a no-op.
    pub async fn close(&self) {
        let previous = {
            let mut state = self.inner.state.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, NodeState::Closed)
        };
        let NodeState::Bound(bound) = previous else {
            return;
        };

        bound.listener.stop().await;
        for handler in self.inner.clients.drain() {
            handler.stop().await;
        }
        info!(contact = %bound.contact, "node closed");
    }

    /// Open a connection to `contact` unless one exists.
    pub async fn connect(&self, contact: Contact) -> TetherResult<()> {
        let bound = self.bound()?;
        self.handler_for(&bound, contact).await.map(|_| ())
    }

    async fn handler_for(
        &self,
        bound: &Bound,
        contact: Contact,
    ) -> TetherResult<Arc<ClientHandler>> {
        match self.inner.clients.get(&contact) {
            Some(handler) => Ok(handler),
            None => bound.connector.connect(contact).await,
        }
    }

    /// Store `value` under `id`, owned by this node.
    pub fn store(&self, id: Id, value: Arc<dyn DistributedObject>) -> TetherResult<()> {
        let bound = self.bound()?;
        value.attach(self.downgrade(), id);
        debug!(%id, name = value.name(), "storing object");
        self.inner
            .storage
            .update_or_put(LiveEntry::new(id, bound.contact, Some(value)));
        Ok(())
    }

    /// Store a shared object under the hash of its name, or under the key it
    /// is already attached to.
    pub fn share<T: SharedType>(&self, object: &Arc<SharedObject<T>>) -> TetherResult<()> {
        let value: Arc<dyn DistributedObject> = Arc::clone(object) as Arc<dyn DistributedObject>;
        self.store(object.id(), value)
    }

    /// Resolve `id`, asking peers if it is not stored locally.
    pub async fn fetch(&self, id: Id) -> TetherResult<Option<Arc<dyn DistributedObject>>> {
        let bound = self.bound()?;
        let entry = bound
            .lookup
            .get_first(id, self.inner.config.fetch_timeout())
            .await?;
        Ok(entry.and_then(|e| e.value))
    }

    /// [`fetch`](Self::fetch), downcast to a concrete type.
    pub async fn fetch_as<T: SharedType>(
        &self,
        id: Id,
    ) -> TetherResult<Option<Arc<SharedObject<T>>>> {
        Ok(self
            .fetch(id)
            .await?
            .and_then(|object| object.into_any().downcast::<SharedObject<T>>().ok()))
    }

    async fn resolve(
        &self,
        bound: &Bound,
        id: Id,
    ) -> TetherResult<(LiveEntry, Arc<dyn DistributedObject>)> {
        let entry = bound
            .lookup
            .get_first(id, self.inner.config.fetch_timeout())
            .await?
            .ok_or_else(|| TetherError::ObjectVanished(id.to_string()))?;
        let object = entry.object()?;
        Ok((entry, object))
    }

    pub async fn get_property(&self, id: Id, property: &str) -> TetherResult<Value> {
        let bound = self.bound()?;
        let (entry, object) = self.resolve(&bound, id).await?;
        let route = routing::route(
            &self.inner.config,
            Operation::Get,
            property,
            entry.owner == bound.contact,
        )?;
        debug!(%id, property, ?route, "get property");

        match route {
            Route::Local | Route::LocalThenBroadcast => object.get_direct(property),
            Route::RemoteRequest | Route::RemoteSend => {
                let reply = self
                    .request(
                        &bound,
                        entry.owner,
                        Message::get_property(id, property),
                        MessageType::GetPropertyResult,
                    )
                    .await?;
                result_value(&reply)
            }
        }
    }

    /// Set a property. A remote owner is not waited for.
    pub async fn set_property(&self, id: Id, property: &str, value: Value) -> TetherResult<()> {
        self.set(id, property, value, false).await
    }

    /// Set a property and wait until the owner confirms it.
    pub async fn set_property_confirmed(
        &self,
        id: Id,
        property: &str,
        value: Value,
    ) -> TetherResult<()> {
        self.set(id, property, value, true).await
    }

    async fn set(&self, id: Id, property: &str, value: Value, confirm: bool) -> TetherResult<()> {
        let bound = self.bound()?;
        let (entry, object) = self.resolve(&bound, id).await?;
        let route = routing::route(
            &self.inner.config,
            Operation::Set,
            property,
            entry.owner == bound.contact,
        )?;
        debug!(%id, property, ?route, confirm, "set property");

        match route {
            Route::Local => object.set_direct(property, value),
            Route::LocalThenBroadcast => {
                let wire = ObjectWithType::from_value(&value)?;
                object.set_direct(property, value)?;
                self.broadcast_set(&bound, id, property, wire).await;
                Ok(())
            }
            Route::RemoteSend if !confirm => {
                let wire = ObjectWithType::from_value(&value)?;
                let handler = self.handler_for(&bound, entry.owner).await?;
                handler
                    .send(Message::set_property(id, property, wire, false))
                    .await
            }
            Route::RemoteSend | Route::RemoteRequest => {
                let wire = ObjectWithType::from_value(&value)?;
                self.request(
                    &bound,
                    entry.owner,
                    Message::set_property(id, property, wire, true),
                    MessageType::SetPropertyConfirmation,
                )
                .await
                .map(|_| ())
            }
        }
    }

    /// Call `method` on the object stored under `id`.
    pub async fn invoke(
        &self,
        id: Id,
        method: &str,
        type_arguments: Vec<String>,
        arguments: Vec<Value>,
    ) -> TetherResult<Value> {
        let bound = self.bound()?;
        let (entry, object) = self.resolve(&bound, id).await?;
        let access = object
            .method_access(method)
            .ok_or_else(|| TetherError::MissingMethod(method.to_string()))?;
        let route = routing::route(
            &self.inner.config,
            Operation::Invoke(access),
            method,
            entry.owner == bound.contact,
        )?;
        debug!(%id, method, ?route, "invoke");

        match route {
            Route::Local | Route::LocalThenBroadcast => {
                let call = MethodCall::new(arguments).with_type_arguments(type_arguments);
                object.invoke_direct(method, call).await
            }
            Route::RemoteRequest | Route::RemoteSend => {
                let arguments = arguments
                    .iter()
                    .map(ObjectWithType::from_value)
                    .collect::<TetherResult<Vec<_>>>()?;
                let reply = self
                    .request(
                        &bound,
                        entry.owner,
                        Message::invoke(id, method, type_arguments, arguments),
                        MessageType::InvokeResult,
                    )
                    .await?;
                result_value(&reply)
            }
        }
    }

    /// Bring one property in line across nodes.
    ///
    /// Authoritative: push the local value to every other contact.
    /// Otherwise: pull the owner's value and apply it to the local copy.
    pub async fn synchronise(
        &self,
        target: Id,
        property: &str,
        authoritative: bool,
    ) -> TetherResult<()> {
        let bound = self.bound()?;
        let (entry, object) = self.resolve(&bound, target).await?;

        if authoritative {
            if self.inner.config.is_client() {
                return Err(TetherError::MemberAccess(format!(
                    "{}: only the server may push property values",
                    property
                )));
            }
            let wire = ObjectWithType::from_value(&object.get_direct(property)?)?;
            self.broadcast_set(&bound, target, property, wire).await;
            return Ok(());
        }

        if entry.owner == bound.contact {
            return Ok(());
        }
        let reply = self
            .request(
                &bound,
                entry.owner,
                Message::get_property(target, property),
                MessageType::GetPropertyResult,
            )
            .await?;
        object.set_direct(property, result_value(&reply)?)
    }

    /// Send `message` to `owner` and wait for the reply of `reply_type`.
    async fn request(
        &self,
        bound: &Bound,
        owner: Contact,
        message: Message,
        reply_type: MessageType,
    ) -> TetherResult<Message> {
        context::check_deadlock(&owner)?;
        let handler = self.handler_for(bound, owner).await?;
        let id = message.id;
        let config = &self.inner.config;

        let reply = retry::send_with_retry(
            &self.inner.side_channel,
            owner,
            config.retries,
            config.request_timeout(),
            || handler.send(message.clone()),
            |m| m.is_reply(reply_type, id),
        )
        .await;
        // Resends or a timeout can leave replies behind.
        self.inner.side_channel.abandon(id);
        let reply = reply?;

        match reply.error {
            Some(error) => Err(TetherError::Remote(error)),
            None => Ok(reply),
        }
    }

    /// SetProperty to every contact except this node. Failures are logged.
    async fn broadcast_set(&self, bound: &Bound, id: Id, property: &str, wire: ObjectWithType) {
        for contact in self.inner.clients.contacts_except(&bound.contact) {
            let Some(handler) = self.inner.clients.get(&contact) else {
                continue;
            };
            let message = Message::set_property(id, property, wire.clone(), false);
            if let Err(e) = handler.send(message).await {
                warn!(%contact, %id, property, "broadcast failed: {}", e);
            }
        }
    }
}

fn result_value(reply: &Message) -> TetherResult<Value> {
    match &reply.result {
        Some(result) => result.to_value(),
        None => Ok(Value::Null),
    }
}
