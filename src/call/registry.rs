//! Peer Connection Registry
//!
//! Besitzt exklusiv die Zuordnung Teilnehmer-ID → Media-Verbindung samt
//! Transportzustand. Alle Mutationen laufen synchron aus Sicht des
//! Orchestrators; das eigentliche Schließen der Verbindung übernimmt
//! der Aufrufer mit dem zurückgegebenen Endpoint.

use crate::media::{LinkState, MediaEndpoint};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    /// `insert` verlangt check-then-create durch den Aufrufer
    #[error("connection for '{0}' already exists")]
    Duplicate(String),
}

/// Eintrag pro Peer: Verbindung plus zuletzt gemeldeter Zustand
pub struct PeerLink {
    pub endpoint: Arc<dyn MediaEndpoint>,
    pub state: LinkState,
}

/// Registry aller aktiven Peer-Verbindungen einer Session
#[derive(Default)]
pub struct PeerRegistry {
    links: HashMap<String, PeerLink>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert eine frische Verbindung für `peer_id`.
    pub fn insert(
        &mut self,
        peer_id: &str,
        endpoint: Arc<dyn MediaEndpoint>,
    ) -> Result<(), RegistryError> {
        if self.links.contains_key(peer_id) {
            return Err(RegistryError::Duplicate(peer_id.to_string()));
        }
        self.links.insert(
            peer_id.to_string(),
            PeerLink {
                endpoint,
                state: LinkState::New,
            },
        );
        Ok(())
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<dyn MediaEndpoint>> {
        self.links.get(peer_id).map(|l| Arc::clone(&l.endpoint))
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    /// Übernimmt eine Zustandsmeldung der Media-Schicht; unbekannte
    /// Peers werden ignoriert (Verbindung bereits abgebaut).
    pub fn set_state(&mut self, peer_id: &str, state: LinkState) {
        if let Some(link) = self.links.get_mut(peer_id) {
            link.state = state;
        }
    }

    pub fn state(&self, peer_id: &str) -> Option<LinkState> {
        self.links.get(peer_id).map(|l| l.state)
    }

    /// Entfernt den Eintrag und gibt den Endpoint zum Schließen zurück.
    /// Doppelt aufrufen ist erlaubt (None).
    pub fn remove(&mut self, peer_id: &str) -> Option<Arc<dyn MediaEndpoint>> {
        self.links.remove(peer_id).map(|l| l.endpoint)
    }

    /// Räumt alle Einträge ab (Anrufende)
    pub fn drain(&mut self) -> Vec<Arc<dyn MediaEndpoint>> {
        self.links.drain().map(|(_, l)| l.endpoint).collect()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockBackend;
    use crate::media::MediaBackend;
    use tokio::sync::mpsc;

    async fn endpoint_for(backend: &MockBackend, peer: &str) -> Arc<dyn MediaEndpoint> {
        let (tx, _rx) = mpsc::unbounded_channel();
        backend.open_endpoint(peer, tx).await.unwrap()
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let backend = MockBackend::default();
        let mut registry = PeerRegistry::new();

        registry
            .insert("bob", endpoint_for(&backend, "bob").await)
            .unwrap();
        let err = registry
            .insert("bob", endpoint_for(&backend, "bob").await)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_is_safe_to_call_twice() {
        let backend = MockBackend::default();
        let mut registry = PeerRegistry::new();
        registry
            .insert("bob", endpoint_for(&backend, "bob").await)
            .unwrap();

        assert!(registry.remove("bob").is_some());
        assert!(registry.remove("bob").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn state_updates_ignore_unknown_peers() {
        let backend = MockBackend::default();
        let mut registry = PeerRegistry::new();
        registry
            .insert("bob", endpoint_for(&backend, "bob").await)
            .unwrap();

        registry.set_state("bob", LinkState::Connected);
        registry.set_state("ghost", LinkState::Failed);

        assert_eq!(registry.state("bob"), Some(LinkState::Connected));
        assert_eq!(registry.state("ghost"), None);
    }

    #[tokio::test]
    async fn drain_empties_the_registry() {
        let backend = MockBackend::default();
        let mut registry = PeerRegistry::new();
        registry
            .insert("alice", endpoint_for(&backend, "alice").await)
            .unwrap();
        registry
            .insert("bob", endpoint_for(&backend, "bob").await)
            .unwrap();

        let endpoints = registry.drain();
        assert_eq!(endpoints.len(), 2);
        assert!(registry.is_empty());
    }
}
