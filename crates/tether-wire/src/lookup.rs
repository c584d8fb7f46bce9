//! Client lookup: maps endpoints to their connection handlers.
//!
//! Handlers are expected to be registered before traffic for them starts;
//! the registry takes a short lock per call and never holds it across an
//! await.

use crate::handler::ClientHandler;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tether_types::Contact;

/// Registry of every connection a node knows, keyed by remote endpoint.
#[derive(Clone, Default)]
pub struct ClientLookup {
    handlers: Arc<RwLock<HashMap<Contact, Arc<ClientHandler>>>>,
}

impl ClientLookup {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its contact, returning any handler it replaced.
    pub fn register(&self, handler: Arc<ClientHandler>) -> Option<Arc<ClientHandler>> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(handler.contact(), handler)
    }

    /// Register a handler unless its contact is already taken.
    pub fn register_if_absent(&self, handler: Arc<ClientHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        match handlers.entry(handler.contact()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    /// The handler for a contact.
    pub fn get(&self, contact: &Contact) -> Option<Arc<ClientHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(contact).cloned()
    }

    /// Remove the handler for a contact.
    pub fn remove(&self, contact: &Contact) -> Option<Arc<ClientHandler>> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(contact)
    }

    /// Remove the handler for a contact only if it is the one with `serial`.
    ///
    /// Used by a finished receive loop so it does not evict a newer
    /// connection registered under the same contact.
    pub fn remove_if_serial(&self, contact: &Contact, serial: u64) -> Option<Arc<ClientHandler>> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        match handlers.get(contact) {
            Some(handler) if handler.serial() == serial => handlers.remove(contact),
            _ => None,
        }
    }

    /// Every known contact.
    pub fn contacts(&self) -> Vec<Contact> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().copied().collect()
    }

    /// Every known contact except `me`.
    pub fn contacts_except(&self, me: &Contact) -> Vec<Contact> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().filter(|c| *c != me).copied().collect()
    }

    /// Remove and return every handler.
    pub fn drain(&self) -> Vec<Arc<ClientHandler>> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.drain().map(|(_, h)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Dispatcher, LogSink};

    fn loopback(port: u16) -> Arc<ClientHandler> {
        ClientHandler::loopback(
            Contact::new([127, 0, 0, 1].into(), port),
            Arc::new(Dispatcher::new()),
            Arc::new(LogSink),
        )
    }

    #[test]
    fn test_register_and_get() {
        let lookup = ClientLookup::new();
        let handler = loopback(1);
        assert!(lookup.register(handler.clone()).is_none());
        assert_eq!(lookup.get(&handler.contact()).unwrap().serial(), handler.serial());
        assert_eq!(lookup.len(), 1);
    }

    #[test]
    fn test_register_if_absent_keeps_existing() {
        let lookup = ClientLookup::new();
        let first = loopback(1);
        assert!(lookup.register_if_absent(first.clone()));
        assert!(!lookup.register_if_absent(loopback(1)));
        assert_eq!(lookup.get(&first.contact()).unwrap().serial(), first.serial());
    }

    #[test]
    fn test_register_replaces() {
        let lookup = ClientLookup::new();
        let first = loopback(1);
        let second = loopback(1);
        lookup.register(first.clone());
        let replaced = lookup.register(second.clone()).unwrap();
        assert_eq!(replaced.serial(), first.serial());
        assert_eq!(lookup.len(), 1);
    }

    #[test]
    fn test_remove_if_serial_keeps_newer_handler() {
        let lookup = ClientLookup::new();
        let old = loopback(1);
        let new = loopback(1);
        lookup.register(new.clone());
        assert!(lookup.remove_if_serial(&old.contact(), old.serial()).is_none());
        assert!(lookup.get(&new.contact()).is_some());
        assert!(lookup.remove_if_serial(&new.contact(), new.serial()).is_some());
        assert!(lookup.is_empty());
    }

    #[test]
    fn test_contacts_except_self() {
        let lookup = ClientLookup::new();
        lookup.register(loopback(1));
        lookup.register(loopback(2));
        lookup.register(loopback(3));
        let me = Contact::new([127, 0, 0, 1].into(), 2);
        let mut others = lookup.contacts_except(&me);
        others.sort();
        assert_eq!(others.len(), 2);
        assert!(!others.contains(&me));
        assert_eq!(lookup.contacts().len(), 3);
        assert_eq!(lookup.drain().len(), 3);
        assert!(lookup.is_empty());
    }
}
