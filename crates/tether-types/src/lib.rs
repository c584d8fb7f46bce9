//! Core types for Tether, a runtime for sharing named objects between nodes.
//!
//! This crate defines the data shared by the wire layer and the node layer:
//! identifiers, contacts, the message envelope, the error taxonomy and node
//! configuration. It contains no networking logic.

pub mod config;
pub mod contact;
pub mod error;
pub mod id;
pub mod message;

pub use config::{Architecture, Caching, NodeConfig};
pub use contact::Contact;
pub use error::{TetherError, TetherResult};
pub use id::Id;
pub use message::{Message, MessageType, ObjectWithType, SerializedEntry, Value};
