//! Media Module - WebRTC Peer Connections und Audio
//!
//! Dieses Modul kapselt die Media-Engine hinter Trait-Seams:
//! - `MediaBackend` erzeugt pro Peer einen `MediaEndpoint`
//! - `MediaEndpoint` wickelt Offer/Answer/ICE ab
//! - `ToneSender` schickt DTMF-Töne in-band über die Audioverbindung
//!
//! Der Orchestrator kennt nur die Traits; die echte Implementierung
//! (webrtc + cpal) liegt in `webrtc.rs` und `capture.rs`.

pub mod capture;
pub mod g711;
mod webrtc;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use capture::{MediaSource, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use webrtc::WebRtcBackend;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    /// Lokale Audioaufnahme nicht verfügbar - fatal für jeden Anrufaufbau
    #[error("media acquisition failed: {0}")]
    Acquisition(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Failed to send tone: {0}")]
    ToneFailed(String),
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Transportzustand einer einzelnen Peer-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Verbindungen in diesem Zustand zählen als "lebendig"
    pub fn is_live(&self) -> bool {
        matches!(self, LinkState::New | LinkState::Connecting | LinkState::Connected)
    }
}

/// Asynchrone Meldungen aus der Media-Schicht an den Orchestrator
#[derive(Debug, Clone)]
pub enum TransportUpdate {
    /// Verbindungszustand zu einem Peer hat sich geändert
    StateChanged { peer_id: String, state: LinkState },

    /// Lokaler ICE Candidate, muss über Signaling zum Peer
    IceCandidate { peer_id: String, candidate: String },
}

// ============================================================================
// TRAIT SEAMS
// ============================================================================

/// DTMF-Sendefähigkeit eines ausgehenden Audio-Senders
#[async_trait]
pub trait ToneSender: Send + Sync {
    async fn insert_tone(&self, digit: char) -> Result<(), MediaError>;
}

/// Eine Media-Verbindung zu genau einem Peer
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Erstellt ein SDP Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Wendet ein Remote Offer an und gibt das SDP Answer zurück
    async fn accept_offer(&self, offer_sdp: String) -> Result<String, MediaError>;

    /// Wendet das Remote Answer auf eine wartende Verbindung an
    async fn apply_answer(&self, answer_sdp: String) -> Result<(), MediaError>;

    /// Reicht einen ICE Candidate der Gegenseite weiter
    async fn add_ice_candidate(&self, candidate: String) -> Result<(), MediaError>;

    /// Sendekanal für DTMF, falls die Verbindung einen Audio-Sender hat
    fn tone_sender(&self) -> Option<Arc<dyn ToneSender>>;

    /// Schließt die Verbindung; mehrfacher Aufruf ist erlaubt
    async fn close(&self);
}

/// Fabrik für Peer-Verbindungen, eine pro Session
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Öffnet eine neue Verbindung zu `peer_id` inklusive lokaler
    /// Audio-Tracks. Zustandsänderungen und lokale ICE Candidates
    /// laufen über `updates` zurück.
    async fn open_endpoint(
        &self,
        peer_id: &str,
        updates: mpsc::UnboundedSender<TransportUpdate>,
    ) -> Result<Arc<dyn MediaEndpoint>, MediaError>;
}

// ============================================================================
// TEST DOUBLES
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    /// Nimmt gesendete Töne auf
    #[derive(Default)]
    pub struct MockToneSender {
        pub digits: Mutex<Vec<char>>,
        pub fail: bool,
    }

    #[async_trait]
    impl ToneSender for MockToneSender {
        async fn insert_tone(&self, digit: char) -> Result<(), MediaError> {
            if self.fail {
                return Err(MediaError::ToneFailed("mock".into()));
            }
            self.digits.lock().push(digit);
            Ok(())
        }
    }

    pub struct MockEndpoint {
        pub peer_id: String,
        pub offers_created: Mutex<u32>,
        pub applied_answer: Mutex<Option<String>>,
        pub applied_offer: Mutex<Option<String>>,
        pub candidates: Mutex<Vec<String>>,
        pub closed: Mutex<bool>,
        pub tone: Option<Arc<MockToneSender>>,
        pub fail_accept: bool,
    }

    impl MockEndpoint {
        fn new(peer_id: &str, tone: bool, fail_accept: bool) -> Self {
            Self {
                peer_id: peer_id.to_string(),
                offers_created: Mutex::new(0),
                applied_answer: Mutex::new(None),
                applied_offer: Mutex::new(None),
                candidates: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
                tone: tone.then(|| Arc::new(MockToneSender::default())),
                fail_accept,
            }
        }
    }

    #[async_trait]
    impl MediaEndpoint for MockEndpoint {
        async fn create_offer(&self) -> Result<String, MediaError> {
            *self.offers_created.lock() += 1;
            Ok(format!("offer-for-{}", self.peer_id))
        }

        async fn accept_offer(&self, offer_sdp: String) -> Result<String, MediaError> {
            if self.fail_accept {
                return Err(MediaError::WebRtc("mock accept failure".into()));
            }
            *self.applied_offer.lock() = Some(offer_sdp);
            Ok(format!("answer-from-{}", self.peer_id))
        }

        async fn apply_answer(&self, answer_sdp: String) -> Result<(), MediaError> {
            *self.applied_answer.lock() = Some(answer_sdp);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: String) -> Result<(), MediaError> {
            self.candidates.lock().push(candidate);
            Ok(())
        }

        fn tone_sender(&self) -> Option<Arc<dyn ToneSender>> {
            self.tone.clone().map(|t| t as Arc<dyn ToneSender>)
        }

        async fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    /// Backend das alle erzeugten Endpoints festhält
    #[derive(Default)]
    pub struct MockBackend {
        pub endpoints: Mutex<HashMap<String, Arc<MockEndpoint>>>,
        /// Jeder open_endpoint-Aufruf in Reihenfolge
        pub open_log: Mutex<Vec<String>>,
        /// Peers ohne auflösbaren DTMF-Sender
        pub without_tone: Mutex<HashSet<String>>,
        /// Peers bei denen accept_offer fehlschlagen soll
        pub fail_accept_for: Mutex<HashSet<String>>,
        /// Peers bei denen open_endpoint selbst fehlschlagen soll
        pub fail_open_for: Mutex<HashSet<String>>,
    }

    impl MockBackend {
        pub fn endpoint(&self, peer_id: &str) -> Option<Arc<MockEndpoint>> {
            self.endpoints.lock().get(peer_id).cloned()
        }

        pub fn opened(&self) -> Vec<String> {
            let mut ids: Vec<String> = self.endpoints.lock().keys().cloned().collect();
            ids.sort();
            ids
        }
    }

    #[async_trait]
    impl MediaBackend for MockBackend {
        async fn open_endpoint(
            &self,
            peer_id: &str,
            _updates: mpsc::UnboundedSender<TransportUpdate>,
        ) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
            self.open_log.lock().push(peer_id.to_string());
            if self.fail_open_for.lock().contains(peer_id) {
                return Err(MediaError::WebRtc("mock open failure".into()));
            }
            let tone = !self.without_tone.lock().contains(peer_id);
            let fail_accept = self.fail_accept_for.lock().contains(peer_id);
            let endpoint = Arc::new(MockEndpoint::new(peer_id, tone, fail_accept));
            self.endpoints
                .lock()
                .insert(peer_id.to_string(), Arc::clone(&endpoint));
            Ok(endpoint)
        }
    }
}
