//! In-band Signal Relay (DTMF)
//!
//! Hält pro Peer einen lazily aufgelösten Tone-Sender-Cache und den
//! Anzeige-Puffer der Session. Der Puffer sammelt lokale wie entfernte
//! Ziffern in einem gemeinsamen Strang; bei empfangenen Tönen wird die
//! Zeile mit dem Absender präfixiert. Zurückgesetzt wird beim
//! Anrufende.

use crate::media::{MediaEndpoint, ToneSender};
use std::collections::HashMap;
use std::sync::Arc;

/// DTMF-Zustand einer Session
#[derive(Default)]
pub struct DtmfRelay {
    /// Cache: Teilnehmer → Sendekanal des ausgehenden Audio-Senders
    senders: HashMap<String, Arc<dyn ToneSender>>,

    /// Gesammelte Ziffern der laufenden Session
    buffer: String,
}

impl DtmfRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Löst den Tone-Sender für einen Peer auf und cached ihn.
    /// `None` wenn die Verbindung keinen auflösbaren Audio-Sender hat.
    pub fn sender_for(
        &mut self,
        peer_id: &str,
        endpoint: &Arc<dyn MediaEndpoint>,
    ) -> Option<Arc<dyn ToneSender>> {
        if let Some(sender) = self.senders.get(peer_id) {
            return Some(Arc::clone(sender));
        }
        let sender = endpoint.tone_sender()?;
        self.senders
            .insert(peer_id.to_string(), Arc::clone(&sender));
        Some(sender)
    }

    /// Übernimmt eine lokal gesendete Ziffer und rendert die Anzeige
    pub fn push_local(&mut self, digit: char) -> String {
        self.buffer.push(digit);
        self.buffer.clone()
    }

    /// Übernimmt eine empfangene Ziffer und rendert die Anzeige
    /// mit Absender-Präfix
    pub fn push_remote(&mut self, sender: &str, digit: char) -> String {
        self.buffer.push(digit);
        format!("{}: {}", sender, self.buffer)
    }

    pub fn display(&self) -> &str {
        &self.buffer
    }

    /// Wirft den gecachten Sender eines Peers weg (Verbindungsabbau)
    pub fn evict(&mut self, peer_id: &str) {
        self.senders.remove(peer_id);
    }

    /// Setzt Sender-Cache und Anzeige zurück (Anrufende)
    pub fn reset(&mut self) {
        self.senders.clear();
        self.buffer.clear();
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
    async fn sender_is_cached_after_first_resolution() {
        let backend = MockBackend::default();
        let endpoint = endpoint_for(&backend, "bob").await;
        let mut relay = DtmfRelay::new();

        let first = relay.sender_for("bob", &endpoint).unwrap();
        let second = relay.sender_for("bob", &endpoint).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn unresolvable_sender_yields_none() {
        let backend = MockBackend::default();
        backend.without_tone.lock().insert("bob".into());
        let endpoint = endpoint_for(&backend, "bob").await;
        let mut relay = DtmfRelay::new();

        assert!(relay.sender_for("bob", &endpoint).is_none());
    }

    #[test]
    fn display_accumulates_and_prefixes_remote_digits() {
        let mut relay = DtmfRelay::new();
        assert_eq!(relay.push_local('5'), "5");
        assert_eq!(relay.push_local('1'), "51");
        assert_eq!(relay.push_remote("alice", '9'), "alice: 519");
    }

    #[tokio::test]
    async fn reset_clears_cache_and_display() {
        let backend = MockBackend::default();
        let endpoint = endpoint_for(&backend, "bob").await;
        let mut relay = DtmfRelay::new();

        relay.sender_for("bob", &endpoint);
        relay.push_local('7');
        relay.reset();

        assert_eq!(relay.display(), "");
        // Nach dem Reset wird neu aufgelöst
        backend.without_tone.lock().insert("bob".into());
        let fresh = endpoint_for(&backend, "bob").await;
        assert!(relay.sender_for("bob", &fresh).is_none());
    }
}
