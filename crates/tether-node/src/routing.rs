//! Routing matrix: where a property access or method call executes.
//!
//! | Architecture | Role / caching | Get | Set | Invoke |
//! |---|---|---|---|---|
//! | peer-to-peer | - | local if owned, else request | local if owned, else send | local |
//! | server-client | server | local | local, broadcast on push-on-change | local |
//! | server-client | client, push-on-change | local cache | denied | client-callable only, request |
//! | server-client | client, pull-on-demand | request | denied | client-callable only, request |
//!
//! Permission checks happen here, before anything is sent.

use crate::object::MethodAccess;
use tether_types::{Architecture, Caching, NodeConfig, TetherError, TetherResult};

/// The kind of member access being routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Set,
    Invoke(MethodAccess),
}

/// Where an operation executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// On the local copy.
    Local,
    /// On the local copy, then SetProperty to every other contact.
    LocalThenBroadcast,
    /// On the owner; the caller waits for the result.
    RemoteRequest,
    /// On the owner; the caller does not wait.
    RemoteSend,
}

/// Decide where `operation` on `member` executes.
///
/// `owner_is_self` tells whether the resolved entry is owned by this node.
/// A client-owned object is served from the client itself.
pub fn route(
    config: &NodeConfig,
    operation: Operation,
    member: &str,
    owner_is_self: bool,
) -> TetherResult<Route> {
    let remote_or_local = |remote: Route| {
        if owner_is_self {
            Route::Local
        } else {
            remote
        }
    };

    let route = match config.architecture {
        Architecture::PeerToPeer => match operation {
            Operation::Get => remote_or_local(Route::RemoteRequest),
            Operation::Set => remote_or_local(Route::RemoteSend),
            Operation::Invoke(_) => Route::Local,
        },
        Architecture::ServerClient if config.is_server => match operation {
            Operation::Get | Operation::Invoke(_) => Route::Local,
            Operation::Set => match config.caching {
                Caching::PushOnChange => Route::LocalThenBroadcast,
                Caching::PullOnDemand => Route::Local,
            },
        },
        Architecture::ServerClient => match operation {
            Operation::Get => match config.caching {
                Caching::PushOnChange => Route::Local,
                Caching::PullOnDemand => remote_or_local(Route::RemoteRequest),
            },
            Operation::Set => {
                return Err(TetherError::MemberAccess(format!(
                    "{}: only the server may set properties",
                    member
                )))
            }
            Operation::Invoke(access) => {
                if !access.callable_by_client() {
                    return Err(TetherError::MemberAccess(format!(
                        "{} is not client-callable",
                        member
                    )));
                }
                remote_or_local(Route::RemoteRequest)
            }
        },
    };
    Ok(route)
}
