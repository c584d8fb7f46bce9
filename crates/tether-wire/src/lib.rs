//! Tether wire layer: framing, connections and request correlation.
//!
//! ## Architecture
//!
//! - **frame**: `[i32 length][i32 checksum][payload]` message I/O
//! - **ClientHandler**: one connection (or the loopback for the local node)
//!   with its receive loop and a type→handler [`Dispatcher`]
//! - **ClientLookup**: endpoint → handler registry
//! - **ConnectionHandler**: accepts inbound connections
//! - **ClientConnector**: opens outbound connections with a ping/pong check
//! - **SideChannel**: mailbox used to match replies to requests
//! - **retry**: resend-with-timeout on top of the side channel
//! - **context**: receive-loop marker used for deadlock detection

pub mod connector;
pub mod context;
pub mod frame;
pub mod handler;
pub mod listener;
pub mod lookup;
pub mod retry;
pub mod side_channel;

pub use connector::ClientConnector;
pub use context::ReceiveContext;
pub use handler::{
    ClientHandler, Dispatcher, HandlerKind, HandlerState, LogSink, MessageHandler,
    UnhandledErrorSink,
};
pub use listener::ConnectionHandler;
pub use lookup::ClientLookup;
pub use side_channel::SideChannel;
