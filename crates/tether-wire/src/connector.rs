//! Client connector: opens outbound connections.
//!
//! A connection counts as established once the remote side answers a
//! ConnectionPing with a ConnectionPong from the same endpoint. If no pong
//! arrives within the timeout the connection is torn down again and the
//! attempt fails with [`TetherError::ConnectionFailed`].

use crate::handler::{ClientHandler, Dispatcher, UnhandledErrorSink};
use crate::lookup::ClientLookup;
use crate::side_channel::SideChannel;
use std::sync::Arc;
use std::time::Duration;
use tether_types::{Contact, Message, MessageType, TetherError, TetherResult};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Default bound for the ping/pong handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens active connections and checks their liveness.
#[derive(Clone)]
pub struct ClientConnector {
    lookup: ClientLookup,
    side_channel: SideChannel,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn UnhandledErrorSink>,
    timeout: Duration,
    listen_port: Option<u16>,
}

impl ClientConnector {
    pub fn new(
        lookup: ClientLookup,
        side_channel: SideChannel,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn UnhandledErrorSink>,
    ) -> Self {
        Self {
            lookup,
            side_channel,
            dispatcher,
            sink,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            listen_port: None,
        }
    }

    /// Override the ping/pong timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Advertise `port` in every ping so the remote side files the
    /// connection under the contact this node listens on.
    pub fn advertise(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Connect to `contact`, register the handler and wait for a pong.
    pub async fn connect(&self, contact: Contact) -> TetherResult<Arc<ClientHandler>> {
        info!("connecting to {}", contact);
        let stream = TcpStream::connect(contact.socket_addr())
            .await
            .map_err(|e| TetherError::ConnectionFailed {
                contact,
                reason: e.to_string(),
            })?;

        let handler = ClientHandler::active(
            stream,
            contact,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.sink),
        );
        if let Some(previous) = self.lookup.register(Arc::clone(&handler)) {
            previous.stop().await;
        }
        handler.start(Some(self.lookup.clone()));

        let ping = match self.listen_port {
            Some(port) => Message::ping_from(port),
            None => Message::ping(),
        };
        let ping_id = ping.id;
        let pong = match handler.send(ping).await {
            Ok(()) => {
                self.side_channel
                    .wait_until(
                        |m| m.is(MessageType::ConnectionPong) && m.sender == Some(contact),
                        self.timeout,
                    )
                    .await
            }
            Err(e) => {
                warn!("ping to {} failed: {}", contact, e);
                None
            }
        };

        if pong.is_none() {
            self.side_channel.abandon(ping_id);
            self.lookup.remove_if_serial(&contact, handler.serial());
            handler.stop().await;
            return Err(TetherError::ConnectionFailed {
                contact,
                reason: format!("no pong within {:?}", self.timeout),
            });
        }

        info!("connected to {}", contact);
        Ok(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{LogSink, MessageHandler};
    use crate::listener::ConnectionHandler;
    use async_trait::async_trait;

    struct PingHandler(ClientLookup);

    #[async_trait]
    impl MessageHandler for PingHandler {
        async fn handle(&self, message: Message) -> TetherResult<()> {
            let reply = Message::reply_to(&message, MessageType::ConnectionPong);
            if let Some(handler) = message.sender.and_then(|s| self.0.get(&s)) {
                handler.send(reply).await?;
            }
            Ok(())
        }
    }

    struct PongHandler(SideChannel);

    #[async_trait]
    impl MessageHandler for PongHandler {
        async fn handle(&self, message: Message) -> TetherResult<()> {
            self.0.put(message);
            Ok(())
        }
    }

    fn dispatcher(lookup: &ClientLookup, side_channel: &SideChannel) -> Arc<Dispatcher> {
        Arc::new(
            Dispatcher::new()
                .with(
                    MessageType::ConnectionPing,
                    Arc::new(PingHandler(lookup.clone())),
                )
                .with(
                    MessageType::ConnectionPong,
                    Arc::new(PongHandler(side_channel.clone())),
                ),
        )
    }

    #[tokio::test]
    async fn test_connect_with_ping_pong() {
        let server_lookup = ClientLookup::new();
        let server_channel = SideChannel::new();
        let server = ConnectionHandler::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        server.start(
            server_lookup.clone(),
            dispatcher(&server_lookup, &server_channel),
            Arc::new(LogSink),
        );

        let lookup = ClientLookup::new();
        let side_channel = SideChannel::new();
        let connector = ClientConnector::new(
            lookup.clone(),
            side_channel.clone(),
            dispatcher(&lookup, &side_channel),
            Arc::new(LogSink),
        );
        let handler = connector.connect(server.contact()).await.unwrap();

        assert_eq!(handler.contact(), server.contact());
        assert!(lookup.get(&server.contact()).is_some());
        assert!(side_channel.is_empty());
    }

    #[tokio::test]
    async fn test_advertised_port_renames_inbound_handler() {
        let server_lookup = ClientLookup::new();
        let server_channel = SideChannel::new();
        let server = ConnectionHandler::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        server.start(
            server_lookup.clone(),
            dispatcher(&server_lookup, &server_channel),
            Arc::new(LogSink),
        );

        let lookup = ClientLookup::new();
        let side_channel = SideChannel::new();
        let connector = ClientConnector::new(
            lookup.clone(),
            side_channel.clone(),
            dispatcher(&lookup, &side_channel),
            Arc::new(LogSink),
        )
        .advertise(4711);
        connector.connect(server.contact()).await.unwrap();

        let advertised = Contact::new([127, 0, 0, 1].into(), 4711);
        assert_eq!(server_lookup.contacts(), vec![advertised]);
        let inbound = server_lookup.get(&advertised).unwrap();
        assert_eq!(inbound.contact(), advertised);
    }

    #[tokio::test]
    async fn test_connect_times_out_without_pong() {
        // The server never answers pings.
        let server_lookup = ClientLookup::new();
        let server = ConnectionHandler::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        server.start(server_lookup, Arc::new(Dispatcher::new()), Arc::new(LogSink));

        let lookup = ClientLookup::new();
        let side_channel = SideChannel::new();
        let connector = ClientConnector::new(
            lookup.clone(),
            side_channel.clone(),
            dispatcher(&lookup, &side_channel),
            Arc::new(LogSink),
        )
        .with_timeout(Duration::from_millis(100));

        let err = connector.connect(server.contact()).await.unwrap_err();
        assert!(matches!(err, TetherError::ConnectionFailed { .. }));
        assert!(lookup.is_empty());
        assert!(side_channel.is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let lookup = ClientLookup::new();
        let side_channel = SideChannel::new();
        let connector = ClientConnector::new(
            lookup.clone(),
            side_channel.clone(),
            dispatcher(&lookup, &side_channel),
            Arc::new(LogSink),
        );
        let err = connector.connect(Contact::from(addr)).await.unwrap_err();
        assert!(matches!(err, TetherError::ConnectionFailed { .. }));
    }
}
