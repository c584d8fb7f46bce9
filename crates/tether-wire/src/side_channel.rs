//! Message side channel: the mailbox that correlates replies with requests.
//!
//! Reply handlers [`put`](SideChannel::put) messages here; callers awaiting a
//! reply [`wait_until`](SideChannel::wait_until) a predicate matches. Every
//! `put` wakes all waiters, which rescan the mailbox, so the first match wins
//! and a waiter with no match returns `None` once its timeout has elapsed.
//!
//! A caller that stops waiting [`abandon`](SideChannel::abandon)s its
//! correlation ids: pending replies with those ids are dropped, and so are
//! replies that arrive later.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_types::{Id, Message};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// How many abandoned correlation ids are remembered.
const ABANDONED_CAPACITY: usize = 4096;

#[derive(Default)]
struct Mailbox {
    messages: Vec<Message>,
    abandoned: HashSet<Id>,
    abandoned_order: VecDeque<Id>,
}

impl Mailbox {
    fn is_abandoned(&self, message: &Message) -> bool {
        message.id.is_some_and(|id| self.abandoned.contains(&id))
    }
}

#[derive(Default)]
struct Inner {
    mailbox: Mutex<Mailbox>,
    arrived: Notify,
}

/// Shared ordered collection of received-but-unconsumed messages.
#[derive(Clone, Default)]
pub struct SideChannel {
    inner: Arc<Inner>,
}

impl SideChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&self) -> std::sync::MutexGuard<'_, Mailbox> {
        self.inner.mailbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a message and wake every waiter.
    ///
    /// Messages whose correlation id was abandoned are dropped.
    pub fn put(&self, message: Message) {
        {
            let mut mailbox = self.mailbox();
            if mailbox.is_abandoned(&message) {
                debug!(id = ?message.id, sender = ?message.sender, "dropping late reply");
                return;
            }
            mailbox.messages.push(message);
        }
        self.inner.arrived.notify_waiters();
    }

    /// Stop waiting for replies with these correlation ids.
    ///
    /// Matching messages already present are removed; later ones are dropped
    /// on arrival. Only the most recent ids are remembered.
    pub fn abandon<I>(&self, ids: I)
    where
        I: IntoIterator<Item = Id>,
    {
        let mut mailbox = self.mailbox();
        for id in ids {
            if mailbox.abandoned.insert(id) {
                mailbox.abandoned_order.push_back(id);
            }
        }
        while mailbox.abandoned_order.len() > ABANDONED_CAPACITY {
            if let Some(oldest) = mailbox.abandoned_order.pop_front() {
                mailbox.abandoned.remove(&oldest);
            }
        }
        let Mailbox {
            messages, abandoned, ..
        } = &mut *mailbox;
        messages.retain(|m| !m.id.is_some_and(|id| abandoned.contains(&id)));
    }

    /// Whether any unconsumed message matches, without consuming it.
    pub fn has<P>(&self, predicate: P) -> bool
    where
        P: Fn(&Message) -> bool,
    {
        self.mailbox().messages.iter().any(predicate)
    }

    /// Remove and return the first matching message, if any.
    pub fn take<P>(&self, predicate: P) -> Option<Message>
    where
        P: Fn(&Message) -> bool,
    {
        let mut mailbox = self.mailbox();
        let index = mailbox.messages.iter().position(predicate)?;
        Some(mailbox.messages.remove(index))
    }

    /// Wait for a matching message, removing and returning it.
    ///
    /// Returns immediately if a match is already present. Returns `None` only
    /// after `timeout` has elapsed without a match.
    pub async fn wait_until<P>(&self, predicate: P, timeout: Duration) -> Option<Message>
    where
        P: Fn(&Message) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before scanning so a put between the scan and
            // the await still wakes us.
            let notified = self.inner.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.take(&predicate) {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take(&predicate);
            }
        }
    }

    /// Number of unconsumed messages.
    pub fn len(&self) -> usize {
        self.mailbox().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::{Id, MessageType};

    fn pong() -> Message {
        Message::new(MessageType::ConnectionPong)
    }

    #[test]
    fn test_take_removes_first_match_only() {
        let channel = SideChannel::new();
        channel.put(pong());
        channel.put(pong());
        let taken = tokio_test::block_on(
            channel.wait_until(|m| m.is(MessageType::ConnectionPong), Duration::ZERO),
        );
        assert!(taken.is_some());
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_present_match_immediately() {
        let channel = SideChannel::new();
        channel.put(Message::fetch(Id::new_hash("a")));
        channel.put(pong());

        let start = Instant::now();
        let found = channel
            .wait_until(|m| m.is(MessageType::ConnectionPong), Duration::from_secs(5))
            .await;
        assert!(found.is_some());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!channel.has(|m| m.is(MessageType::ConnectionPong)));
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_after_bound() {
        let channel = SideChannel::new();
        channel.put(Message::fetch(Id::new_hash("a")));

        let start = Instant::now();
        let found = channel
            .wait_until(|m| m.is(MessageType::ConnectionPong), Duration::from_millis(100))
            .await;
        assert!(found.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_later_put() {
        let channel = SideChannel::new();
        let producer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.put(Message::fetch(Id::new_hash("noise")));
            producer.put(pong());
        });

        let found = channel
            .wait_until(|m| m.is(MessageType::ConnectionPong), Duration::from_secs(5))
            .await;
        assert!(found.is_some());
        assert!(channel.has(|m| m.is(MessageType::Fetch)));
    }

    #[test]
    fn test_abandoned_replies_are_dropped() {
        let channel = SideChannel::new();
        let early = pong();
        let kept = pong();
        channel.put(early.clone());
        channel.put(kept.clone());

        channel.abandon(early.id);
        assert_eq!(channel.len(), 1);
        assert!(channel.has(|m| m.id == kept.id));

        // A late duplicate of the abandoned request never lands.
        channel.put(early);
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn test_abandoned_ids_are_bounded() {
        let channel = SideChannel::new();
        let first = pong();
        channel.abandon(first.id);
        channel.abandon((0..ABANDONED_CAPACITY).map(|_| Id::new_random()));

        channel.put(first);
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let channel = SideChannel::new();
        let first = pong();
        let second = pong();
        channel.put(first.clone());
        channel.put(second.clone());

        let got = channel
            .wait_until(|m| m.is(MessageType::ConnectionPong), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got.id, first.id);
        let got = channel.take(|m| m.is(MessageType::ConnectionPong)).unwrap();
        assert_eq!(got.id, second.id);
        assert!(channel.is_empty());
    }
}
