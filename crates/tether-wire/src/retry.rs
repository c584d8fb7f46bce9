//! Automatic retry: resend a request until a matching reply shows up on the
//! side channel.
//!
//! Each attempt sends once and waits up to `timeout` for the predicate to
//! match. After `max(retries, 1)` unanswered attempts the call fails with
//! [`TetherError::NoResponse`].

use crate::side_channel::SideChannel;
use std::future::Future;
use std::time::Duration;
use tether_types::{Contact, Message, TetherError, TetherResult};
use tracing::{debug, warn};

/// Send with `send` and wait for `predicate`, retrying on timeout.
///
/// Send errors are returned immediately; only missing replies are retried.
pub async fn send_with_retry<S, Fut, P>(
    side_channel: &SideChannel,
    contact: Contact,
    retries: u32,
    timeout: Duration,
    mut send: S,
    predicate: P,
) -> TetherResult<Message>
where
    S: FnMut() -> Fut,
    Fut: Future<Output = TetherResult<()>>,
    P: Fn(&Message) -> bool,
{
    let attempts = retries.max(1);

    for attempt in 1..=attempts {
        send().await?;
        if let Some(reply) = side_channel.wait_until(&predicate, timeout).await {
            if attempt > 1 {
                debug!(%contact, attempt, "reply received after resend");
            }
            return Ok(reply);
        }
        if attempt < attempts {
            debug!(%contact, attempt, "no reply within {:?}, resending", timeout);
        }
    }

    warn!(%contact, attempts, "request exhausted all attempts");
    Err(TetherError::NoResponse { contact, attempts })
}
