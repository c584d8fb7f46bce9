//! Client handlers: one per connection, plus a loopback for the local node.
//!
//! A [`ClientHandler`] owns one TCP connection. Once started it runs a
//! receive loop in its own task: each frame is decoded, stamped with the
//! remote endpoint, and passed to the [`Dispatcher`], which awaits the
//! handler registered for the message's type tag before reading the next
//! frame. A slow handler therefore delays only its own connection.
//!
//! Three variants exist:
//! - **listening**: created by the [`ConnectionHandler`](crate::ConnectionHandler)
//!   for each accepted connection;
//! - **active**: created by the [`ClientConnector`](crate::ClientConnector)
//!   for outbound connections;
//! - **loopback**: the local node's own endpoint; `send` dispatches in-process.
//!
//! A listening handler is first known by the peer's ephemeral address. When
//! the peer's ConnectionPing advertises its listening port, the handler
//! moves to that contact in the lookup, unless a connection to it already
//! exists.

use crate::context::{self, ReceiveContext};
use crate::frame;
use crate::lookup::ClientLookup;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tether_types::{Contact, Message, MessageType, TetherError, TetherResult};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Protocol semantics for one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> TetherResult<()>;
}

/// Destination for errors raised on a receive loop.
///
/// A receive loop never lets an error escape: I/O failures and handler
/// errors are reported here and the loop for that connection ends.
pub trait UnhandledErrorSink: Send + Sync + 'static {
    fn report(&self, endpoint: &Contact, error: &TetherError);
}

/// Default sink: logs the error.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl UnhandledErrorSink for LogSink {
    fn report(&self, endpoint: &Contact, error: &TetherError) {
        error!(%endpoint, %error, "unhandled error on receive loop");
    }
}

/// Type tag → handler map shared by every connection of a node.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<i32, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a message type, replacing any previous one.
    pub fn register(&mut self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(message_type.tag(), handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, message_type: MessageType, handler: Arc<dyn MessageHandler>) -> Self {
        self.register(message_type, handler);
        self
    }

    /// Run the handler for the message's type. Unknown types are dropped.
    pub async fn dispatch(&self, message: Message) -> TetherResult<()> {
        match self.handlers.get(&message.message_type) {
            Some(handler) => handler.handle(message).await,
            None => {
                warn!(
                    message_type = message.message_type,
                    sender = ?message.sender,
                    "no handler registered, dropping message"
                );
                Ok(())
            }
        }
    }
}

/// Which side created the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Listening,
    Active,
    Loopback,
}

/// Lifecycle of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Created,
    Started,
    Stopped,
}

enum Transport {
    Socket {
        reader: Mutex<Option<OwnedReadHalf>>,
        writer: tokio::sync::Mutex<OwnedWriteHalf>,
    },
    Loopback,
}

/// One connection (or the loopback) and its receive loop.
pub struct ClientHandler {
    serial: u64,
    contact: Mutex<Contact>,
    kind: HandlerKind,
    transport: Transport,
    state: Mutex<HandlerState>,
    task: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn UnhandledErrorSink>,
}

impl std::fmt::Debug for ClientHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandler")
            .field("serial", &self.serial)
            .field("contact", &self.contact())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientHandler {
    fn with_transport(
        contact: Contact,
        kind: HandlerKind,
        transport: Transport,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn UnhandledErrorSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            contact: Mutex::new(contact),
            kind,
            transport,
            state: Mutex::new(HandlerState::Created),
            task: Mutex::new(None),
            dispatcher,
            sink,
        })
    }

    fn from_stream(
        stream: TcpStream,
        contact: Contact,
        kind: HandlerKind,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn UnhandledErrorSink>,
    ) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%contact, "could not set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        let transport = Transport::Socket {
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
        };
        Self::with_transport(contact, kind, transport, dispatcher, sink)
    }

    /// Handler for an accepted inbound connection from `contact`.
    pub fn listening(
        stream: TcpStream,
        contact: Contact,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn UnhandledErrorSink>,
    ) -> Arc<Self> {
        Self::from_stream(stream, contact, HandlerKind::Listening, dispatcher, sink)
    }

    /// Handler for an outbound connection to `contact`.
    pub fn active(
        stream: TcpStream,
        contact: Contact,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn UnhandledErrorSink>,
    ) -> Arc<Self> {
        Self::from_stream(stream, contact, HandlerKind::Active, dispatcher, sink)
    }

    /// Handler for the local node's own endpoint. No socket is involved.
    pub fn loopback(
        contact: Contact,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn UnhandledErrorSink>,
    ) -> Arc<Self> {
        Self::with_transport(contact, HandlerKind::Loopback, Transport::Loopback, dispatcher, sink)
    }

    /// Unique per-process serial, used to tell handlers for the same contact apart.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The remote endpoint (or the local one for the loopback).
    pub fn contact(&self) -> Contact {
        *self.contact.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn state(&self) -> HandlerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the receive loop.
    ///
    /// When `lookup` is given the handler removes itself from it once the
    /// loop ends. Starting twice, or after stop, does nothing.
    pub fn start(self: &Arc<Self>, lookup: Option<ClientLookup>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let current = *state;
            if current != HandlerState::Created {
                warn!(contact = %self.contact(), state = ?current, "handler already started");
                return;
            }
            *state = HandlerState::Started;
        }

        let reader = match &self.transport {
            Transport::Socket { reader, .. } => {
                reader.lock().unwrap_or_else(|e| e.into_inner()).take()
            }
            Transport::Loopback => return,
        };
        let Some(reader) = reader else {
            return;
        };

        let connection = Connection {
            handler: Arc::downgrade(self),
            contact: self.contact(),
            serial: self.serial,
            lookup,
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let sink = Arc::clone(&self.sink);
        let task = tokio::spawn(async move {
            let connection = receive_loop(reader, connection, &dispatcher, &*sink).await;
            if let Some(lookup) = &connection.lookup {
                lookup.remove_if_serial(&connection.contact, connection.serial);
            }
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Send one message.
    ///
    /// Socket handlers serialize and write under the per-connection send
    /// lock. The loopback stamps the local endpoint as sender and dispatches
    /// in the calling task. Messages sent from inside a receive loop are
    /// flagged `nested`.
    pub async fn send(&self, mut message: Message) -> TetherResult<()> {
        message.require_id()?;
        if context::in_receive_loop() {
            message.nested = true;
        }

        match &self.transport {
            Transport::Socket { writer, .. } => {
                if self.state() == HandlerState::Stopped {
                    return Err(TetherError::ConnectionClosed);
                }
                let bytes = frame::encode_message(&message)?;
                let mut writer = writer.lock().await;
                writer.write_all(&bytes).await?;
                writer.flush().await?;
                Ok(())
            }
            Transport::Loopback => {
                message.sender = Some(self.contact());
                self.dispatcher.dispatch(message).await
            }
        }
    }

    /// Close the connection and wait for the receive loop to exit.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == HandlerState::Stopped {
                return;
            }
            *state = HandlerState::Stopped;
        }

        if let Transport::Socket { writer, .. } = &self.transport {
            if let Err(e) = writer.lock().await.shutdown().await {
                debug!(contact = %self.contact(), "shutdown: {}", e);
            }
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            // Stopping from our own receive loop: the abort takes effect at
            // the next await point, there is nothing to join.
            let own_loop = context::current().is_some_and(|c| c.endpoint == self.contact());
            if !own_loop {
                let _ = task.await;
            }
        }
        debug!(contact = %self.contact(), kind = ?self.kind, "handler stopped");
    }
}

/// What a receive loop knows about its own connection.
struct Connection {
    handler: Weak<ClientHandler>,
    contact: Contact,
    serial: u64,
    lookup: Option<ClientLookup>,
}

impl Connection {
    /// Move a listening handler to the contact its peer listens on.
    fn adopt_listening_port(&mut self, port: u16) {
        let (Some(lookup), Some(handler)) = (&self.lookup, self.handler.upgrade()) else {
            return;
        };
        if handler.kind != HandlerKind::Listening || port == self.contact.port {
            return;
        }
        let advertised = Contact::new(self.contact.address, port);
        if lookup.get(&advertised).is_some() {
            debug!(
                from = %self.contact,
                %advertised,
                "already connected, keeping ephemeral contact"
            );
            return;
        }

        lookup.remove_if_serial(&self.contact, self.serial);
        *handler.contact.lock().unwrap_or_else(|e| e.into_inner()) = advertised;
        if lookup.register_if_absent(Arc::clone(&handler)) {
            debug!(from = %self.contact, to = %advertised, "peer advertised its listening port");
            self.contact = advertised;
        } else {
            // Lost a race with a connection to the advertised contact.
            *handler.contact.lock().unwrap_or_else(|e| e.into_inner()) = self.contact;
            lookup.register(handler);
        }
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    mut connection: Connection,
    dispatcher: &Dispatcher,
    sink: &dyn UnhandledErrorSink,
) -> Connection {
    loop {
        let mut message = match frame::read_message(&mut reader).await {
            Ok(message) => message,
            Err(e) if e.is_disconnect() => {
                debug!(contact = %connection.contact, "connection ended: {}", e);
                return connection;
            }
            Err(e) => {
                sink.report(&connection.contact, &e);
                return connection;
            }
        };
        if message.is(MessageType::ConnectionPing) {
            if let Some(port) = message.listen_port {
                connection.adopt_listening_port(port);
            }
        }
        let contact = connection.contact;
        message.sender = Some(contact);

        let marker = ReceiveContext {
            endpoint: contact,
            nested: message.nested,
        };
        let outcome = AssertUnwindSafe(context::scope(marker, dispatcher.dispatch(message)))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(panic) => TetherError::HandlerPanicked(panic_message(panic.as_ref())),
        };
        sink.report(&contact, &error);
        return connection;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::side_channel::SideChannel;
    use std::time::Duration;
    use tether_types::Id;
    use tokio::net::TcpListener;

    /// Puts every message it sees on a side channel.
    struct Collect(SideChannel);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, message: Message) -> TetherResult<()> {
            self.0.put(message);
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl MessageHandler for Fail {
        async fn handle(&self, _message: Message) -> TetherResult<()> {
            Err(TetherError::MissingMethod("boom".into()))
        }
    }

    struct Panic;

    #[async_trait]
    impl MessageHandler for Panic {
        async fn handle(&self, _message: Message) -> TetherResult<()> {
            panic!("handler exploded");
        }
    }

    /// Records reported errors.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl UnhandledErrorSink for Recorder {
        fn report(&self, _endpoint: &Contact, error: &TetherError) {
            self.0.lock().unwrap().push(error.to_string());
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream, Contact) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, Contact::from(peer))
    }

    async fn wait_for_state(handler: &ClientHandler, state: HandlerState) {
        for _ in 0..100 {
            if handler.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_receive_loop_stamps_sender_and_dispatches() {
        let (client, server, peer) = socket_pair().await;
        let inbox = SideChannel::new();
        let dispatcher = Arc::new(
            Dispatcher::new().with(MessageType::Fetch, Arc::new(Collect(inbox.clone()))),
        );
        let listening = ClientHandler::listening(server, peer, dispatcher, Arc::new(LogSink));
        listening.start(None);
        assert_eq!(listening.state(), HandlerState::Started);

        let (_, mut writer) = client.into_split();
        let msg = Message::fetch(Id::new_hash("world"));
        frame::write_message(&mut writer, &msg).await.unwrap();

        let got = inbox
            .wait_until(|m| m.id == msg.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got.sender, Some(peer));
        assert!(!got.nested);

        listening.stop().await;
        assert_eq!(listening.state(), HandlerState::Stopped);
    }

    #[tokio::test]
    async fn test_handler_error_goes_to_sink_and_ends_loop() {
        let (client, server, peer) = socket_pair().await;
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Arc::new(Dispatcher::new().with(MessageType::Fetch, Arc::new(Fail)));
        let lookup = ClientLookup::new();
        let listening = ClientHandler::listening(server, peer, dispatcher, recorder.clone());
        lookup.register(listening.clone());
        listening.start(Some(lookup.clone()));

        let (_, mut writer) = client.into_split();
        frame::write_message(&mut writer, &Message::fetch(Id::new_hash("x")))
            .await
            .unwrap();

        for _ in 0..100 {
            if lookup.get(&peer).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(lookup.get(&peer).is_none());
        let reported = recorder.0.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("boom"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_reported() {
        let (client, server, peer) = socket_pair().await;
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Arc::new(Dispatcher::new().with(MessageType::Invoke, Arc::new(Panic)));
        let listening = ClientHandler::listening(server, peer, dispatcher, recorder.clone());
        listening.start(None);

        let (_, mut writer) = client.into_split();
        let msg = Message::invoke(Id::new_hash("x"), "grow", vec![], vec![]);
        frame::write_message(&mut writer, &msg).await.unwrap();

        for _ in 0..100 {
            if !recorder.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reported = recorder.0.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_remote_close_is_graceful() {
        let (client, server, peer) = socket_pair().await;
        let recorder = Arc::new(Recorder::default());
        let lookup = ClientLookup::new();
        let listening =
            ClientHandler::listening(server, peer, Arc::new(Dispatcher::new()), recorder.clone());
        lookup.register(listening.clone());
        listening.start(Some(lookup.clone()));

        drop(client);
        for _ in 0..100 {
            if lookup.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(lookup.is_empty());
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unblocks_idle_loop() {
        let (_client, server, peer) = socket_pair().await;
        let listening =
            ClientHandler::listening(server, peer, Arc::new(Dispatcher::new()), Arc::new(LogSink));
        listening.start(None);

        tokio::time::timeout(Duration::from_secs(5), listening.stop())
            .await
            .expect("stop should not hang");
        wait_for_state(&listening, HandlerState::Stopped).await;
        assert!(matches!(
            listening.send(Message::ping()).await,
            Err(TetherError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_loopback_dispatches_in_process() {
        let me = Contact::new([127, 0, 0, 1].into(), 7000);
        let inbox = SideChannel::new();
        let dispatcher = Arc::new(
            Dispatcher::new().with(MessageType::ConnectionPing, Arc::new(Collect(inbox.clone()))),
        );
        let loopback = ClientHandler::loopback(me, dispatcher, Arc::new(LogSink));
        assert_eq!(loopback.kind(), HandlerKind::Loopback);

        let ping = Message::ping();
        loopback.send(ping.clone()).await.unwrap();
        let got = inbox.take(|m| m.id == ping.id).unwrap();
        assert_eq!(got.sender, Some(me));
    }

    #[tokio::test]
    async fn test_send_without_id_fails() {
        let me = Contact::new([127, 0, 0, 1].into(), 7000);
        let loopback = ClientHandler::loopback(me, Arc::new(Dispatcher::new()), Arc::new(LogSink));
        assert!(matches!(
            loopback.send(Message::default()).await,
            Err(TetherError::MissingCorrelationId)
        ));
    }

    #[test]
    fn test_debug_shows_contact_kind_and_state() {
        let me = Contact::new([127, 0, 0, 1].into(), 7000);
        let loopback = ClientHandler::loopback(me, Arc::new(Dispatcher::new()), Arc::new(LogSink));
        let rendered = format!("{:?}", loopback);
        assert!(rendered.contains("127.0.0.1"));
        assert!(rendered.contains("Loopback"));
        assert!(rendered.contains("Created"));
    }

    #[tokio::test]
    async fn test_send_inside_receive_loop_is_nested() {
        let me = Contact::new([127, 0, 0, 1].into(), 7000);
        let other = Contact::new([127, 0, 0, 1].into(), 7001);
        let inbox = SideChannel::new();
        let dispatcher = Arc::new(
            Dispatcher::new().with(MessageType::ConnectionPing, Arc::new(Collect(inbox.clone()))),
        );
        let loopback = ClientHandler::loopback(me, dispatcher, Arc::new(LogSink));

        let marker = ReceiveContext {
            endpoint: other,
            nested: false,
        };
        context::scope(marker, loopback.send(Message::ping()))
            .await
            .unwrap();
        assert!(inbox.has(|m| m.nested));
    }
}
