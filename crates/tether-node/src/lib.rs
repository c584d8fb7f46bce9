//! Tether node layer: shared objects, their storage and the routing facade.
//!
//! ## Architecture
//!
//! - **object**: capability tables, [`SharedObject`] and the [`TypeRegistry`]
//! - **storage**: key → (owner, value) entries
//! - **lookup**: local lookup with a broadcast fetch fallback
//! - **handlers**: protocol semantics for each message type
//! - **routing**: the architecture × caching decision matrix
//! - **node**: [`Node`], binding, connections and routed operations
//!
//! ```no_run
//! # async fn demo() -> tether_node::TetherResult<()> {
//! use tether_node::{Node, NodeConfig};
//!
//! let node = Node::new(NodeConfig::peer_to_peer());
//! let me = node.bind("127.0.0.1".parse().unwrap(), 9400).await?;
//! println!("listening on {}", me);
//! node.close().await;
//! # Ok(())
//! # }
//! ```

mod handlers;
pub mod lookup;
pub mod node;
pub mod object;
pub mod routing;
pub mod storage;

pub use lookup::ObjectLookup;
pub use node::{Node, WeakNode};
pub use object::{
    Capabilities, DistributedObject, Method, MethodAccess, MethodCall, SharedObject, SharedType,
    TypeRegistry,
};
pub use routing::{Operation, Route};
pub use storage::{LiveEntry, ObjectStorage};
pub use tether_types::{
    Architecture, Caching, Contact, Id, NodeConfig, TetherError, TetherResult, Value,
};
