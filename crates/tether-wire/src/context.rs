//! Receive-loop context used for deadlock detection.
//!
//! Handlers run inline on their connection's receive loop. While a handler
//! runs, the loop cannot read further frames from that connection, so a
//! handler that sends a request to the same endpoint and awaits its reply
//! would wait forever. The receive loop installs a task-local
//! [`ReceiveContext`] around every dispatch; [`check_deadlock`] consults it
//! before an awaited request is sent.

use std::future::Future;
use tether_types::{Contact, TetherError, TetherResult};

/// Marker describing the receive loop the current task is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveContext {
    /// Endpoint whose receive loop is executing the current handler.
    pub endpoint: Contact,
    /// Whether the triggering message itself came from a remote receive loop.
    pub nested: bool,
}

tokio::task_local! {
    static RECEIVE_CONTEXT: ReceiveContext;
}

/// Run `fut` with `context` installed for its whole duration.
pub async fn scope<F>(context: ReceiveContext, fut: F) -> F::Output
where
    F: Future,
{
    RECEIVE_CONTEXT.scope(context, fut).await
}

/// The context of the receive loop running the current task, if any.
pub fn current() -> Option<ReceiveContext> {
    RECEIVE_CONTEXT.try_with(|c| *c).ok()
}

/// Whether the current task is running a handler for some receive loop.
pub fn in_receive_loop() -> bool {
    current().is_some()
}

/// Fail if an awaited request to `target` would block its own receive loop.
pub fn check_deadlock(target: &Contact) -> TetherResult<()> {
    match current() {
        Some(context) if context.endpoint == *target => Err(TetherError::DeadlockDetected {
            endpoint: context.endpoint,
            nested: context.nested,
        }),
        _ => Ok(()),
    }
}
