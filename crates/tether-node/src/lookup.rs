//! Object lookup: resolve a key locally, then by asking every peer.

use crate::storage::{LiveEntry, ObjectStorage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_types::{Contact, Id, Message, MessageType, TetherResult};
use tether_wire::{context, ClientLookup, SideChannel};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Resolves keys to stored entries, fetching from peers on a local miss.
#[derive(Clone)]
pub struct ObjectLookup {
    storage: Arc<ObjectStorage>,
    clients: ClientLookup,
    side_channel: SideChannel,
    self_contact: Contact,
}

impl ObjectLookup {
    pub fn new(
        storage: Arc<ObjectStorage>,
        clients: ClientLookup,
        side_channel: SideChannel,
        self_contact: Contact,
    ) -> Self {
        Self {
            storage,
            clients,
            side_channel,
            self_contact,
        }
    }

    fn first_local(&self, key: &Id) -> Option<LiveEntry> {
        self.storage.find(key).into_iter().next()
    }

    /// The first entry stored under `key`.
    ///
    /// On a local miss a Fetch goes to every known contact except this node.
    /// Waiting ends as soon as a match lands in storage, every asked contact
    /// has answered, or `timeout` elapses. Replies still outstanding at that
    /// point are abandoned on the side channel.
    pub async fn get_first(&self, key: Id, timeout: Duration) -> TetherResult<Option<LiveEntry>> {
        if let Some(entry) = self.first_local(&key) {
            return Ok(Some(entry));
        }

        // A peer whose receive loop runs this task cannot answer until we return.
        let serving = context::current().map(|c| c.endpoint);

        // Fetch id → contact that owes the reply.
        let mut outstanding = HashMap::new();
        for contact in self.clients.contacts_except(&self.self_contact) {
            if serving == Some(contact) {
                debug!(%contact, "not fetching from the endpoint being served");
                continue;
            }
            let Some(handler) = self.clients.get(&contact) else {
                continue;
            };
            let request = Message::fetch(key);
            let Some(id) = request.id else {
                continue;
            };
            match handler.send(request).await {
                Ok(()) => {
                    outstanding.insert(id, contact);
                }
                Err(e) => warn!(%contact, %key, "fetch request failed: {}", e),
            }
        }
        debug!(%key, peers = outstanding.len(), "fetch sent");

        let deadline = Instant::now() + timeout;
        while !outstanding.is_empty() {
            if self.first_local(&key).is_some() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(%key, missing = outstanding.len(), "fetch timed out");
                break;
            }
            let reply = self
                .side_channel
                .wait_until(
                    |m| {
                        m.is(MessageType::FetchResult)
                            && m.id.is_some_and(|id| outstanding.contains_key(&id))
                    },
                    remaining,
                )
                .await;
            match reply.and_then(|m| m.id) {
                Some(id) => {
                    outstanding.remove(&id);
                }
                None => {
                    debug!(%key, missing = outstanding.len(), "fetch timed out");
                    break;
                }
            }
        }

        self.side_channel.abandon(outstanding.into_keys());
        Ok(self.first_local(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::testing::counter;
    use crate::object::DistributedObject;
    use async_trait::async_trait;
    use tether_types::{ObjectWithType, SerializedEntry};
    use tether_wire::{ClientHandler, Dispatcher, LogSink, MessageHandler};

    fn contact(port: u16) -> Contact {
        Contact::new([127, 0, 0, 1].into(), port)
    }

    /// Stands in for a remote peer: answers Fetch by storing an entry and
    /// posting a FetchResult, as the real FetchResult handler would.
    struct Peer {
        storage: Arc<ObjectStorage>,
        side_channel: SideChannel,
        owner: Contact,
        has_object: bool,
    }

    #[async_trait]
    impl MessageHandler for Peer {
        async fn handle(&self, message: Message) -> TetherResult<()> {
            let key = message.fetch_key.unwrap();
            let mut entries = Vec::new();
            if self.has_object {
                let object: Arc<dyn DistributedObject> = counter("remote", 9);
                self.storage
                    .update_or_put(LiveEntry::new(key, self.owner, Some(object)));
                entries.push(SerializedEntry {
                    key,
                    owner: self.owner,
                    value: ObjectWithType::null(),
                });
            }
            let mut reply = Message::fetch_result(key, entries).answering(&message);
            reply.sender = Some(self.owner);
            self.side_channel.put(reply);
            Ok(())
        }
    }

    fn register_peer(lookup: &ObjectLookup, port: u16, has_object: bool) {
        let peer = Peer {
            storage: Arc::clone(&lookup.storage),
            side_channel: lookup.side_channel.clone(),
            owner: contact(port),
            has_object,
        };
        let dispatcher = Dispatcher::new().with(MessageType::Fetch, Arc::new(peer));
        lookup.clients.register(ClientHandler::loopback(
            contact(port),
            Arc::new(dispatcher),
            Arc::new(LogSink),
        ));
    }

    fn lookup() -> ObjectLookup {
        ObjectLookup::new(
            Arc::new(ObjectStorage::new()),
            ClientLookup::new(),
            SideChannel::new(),
            contact(1),
        )
    }

    #[tokio::test]
    async fn test_local_hit_sends_nothing() {
        let lookup = lookup();
        let object: Arc<dyn DistributedObject> = counter("local", 1);
        let key = Id::new_hash("local");
        lookup
            .storage
            .put(LiveEntry::new(key, contact(1), Some(object)));

        let found = lookup.get_first(key, Duration::from_millis(50)).await.unwrap();
        assert_eq!(found.unwrap().owner, contact(1));
    }

    #[tokio::test]
    async fn test_miss_without_peers_returns_none() {
        let lookup = lookup();
        let found = lookup
            .get_first(Id::new_hash("missing"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_fetches_from_peer() {
        let lookup = lookup();
        register_peer(&lookup, 2, false);
        register_peer(&lookup, 3, true);

        let key = Id::new_hash("remote");
        let found = lookup.get_first(key, Duration::from_secs(5)).await.unwrap();
        assert_eq!(found.unwrap().owner, contact(3));
        assert!(lookup.side_channel.is_empty());
    }

    /// Answers Fetch with an empty FetchResult after a delay.
    struct SlowPeer {
        side_channel: SideChannel,
        owner: Contact,
    }

    #[async_trait]
    impl MessageHandler for SlowPeer {
        async fn handle(&self, message: Message) -> TetherResult<()> {
            let side_channel = self.side_channel.clone();
            let mut reply =
                Message::fetch_result(message.fetch_key.unwrap(), vec![]).answering(&message);
            reply.sender = Some(self.owner);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                side_channel.put(reply);
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_late_replies_are_dropped() {
        let lookup = lookup();
        let peer = SlowPeer {
            side_channel: lookup.side_channel.clone(),
            owner: contact(2),
        };
        let dispatcher = Dispatcher::new().with(MessageType::Fetch, Arc::new(peer));
        lookup.clients.register(ClientHandler::loopback(
            contact(2),
            Arc::new(dispatcher),
            Arc::new(LogSink),
        ));

        let found = lookup
            .get_first(Id::new_hash("slow"), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(found.is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(lookup.side_channel.is_empty());
    }

    #[tokio::test]
    async fn test_all_peers_answer_empty() {
        let lookup = lookup();
        register_peer(&lookup, 2, false);
        register_peer(&lookup, 3, false);

        let started = Instant::now();
        let found = lookup
            .get_first(Id::new_hash("nowhere"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(found.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(lookup.side_channel.is_empty());
    }
}
