//! Connection handler: accepts inbound connections.
//!
//! Binds a TCP listener and runs an accept loop in a spawned task. Every
//! accepted connection becomes a listening [`ClientHandler`], registered in
//! the [`ClientLookup`] under the remote endpoint before its receive loop
//! starts, so replies to its first message already have a route back.

use crate::handler::{ClientHandler, Dispatcher, UnhandledErrorSink};
use crate::lookup::ClientLookup;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_types::{Contact, TetherResult};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// The local listening endpoint of a node.
pub struct ConnectionHandler {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandler {
    /// Bind `addr`. Connections are accepted once [`start`](Self::start) runs.
    pub async fn bind(addr: SocketAddr) -> TetherResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            task: Mutex::new(None),
        })
    }

    /// Start the accept loop. Calling it again does nothing.
    pub fn start(
        &self,
        lookup: ClientLookup,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn UnhandledErrorSink>,
    ) {
        let Some(listener) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, lookup, dispatcher, sink).await;
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// The actual bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound address as a contact.
    pub fn contact(&self) -> Contact {
        Contact::from(self.local_addr)
    }

    /// Stop accepting connections. Already accepted connections are unaffected.
    pub async fn stop(&self) {
        self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            debug!("stopped listening on {}", self.local_addr);
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        lookup: ClientLookup,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn UnhandledErrorSink>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    let handler = ClientHandler::listening(
                        stream,
                        Contact::from(addr),
                        Arc::clone(&dispatcher),
                        Arc::clone(&sink),
                    );
                    if let Some(previous) = lookup.register(Arc::clone(&handler)) {
                        previous.stop().await;
                    }
                    handler.start(Some(lookup.clone()));
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}
