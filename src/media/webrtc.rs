//! WebRTC Media Backend
//!
//! Eine RTCPeerConnection pro Peer (Full Mesh). Der lokale PCMU-Track
//! wird aus dem Frame-Broadcast der MediaSource gespeist, eingehende
//! Tracks werden dekodiert und in den Playback-Buffer geschrieben.
//! DTMF geht als RFC 4733 telephone-event über denselben Audio-Track.

use super::capture::{MediaSource, FRAME_SIZE, SAMPLE_RATE};
use super::{g711, LinkState, MediaBackend, MediaEndpoint, MediaError, ToneSender, TransportUpdate};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

fn map_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

// ============================================================================
// RTP CLOCK
// ============================================================================

/// Gemeinsamer Sequenz-/Timestamp-Zähler für Audio- und DTMF-Pakete
/// auf demselben Track
struct RtpClock {
    sequence: u16,
    timestamp: u32,
}

impl RtpClock {
    fn next(&mut self, samples: u32) -> (u16, u32) {
        let seq = self.sequence;
        let ts = self.timestamp;
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples);
        (seq, ts)
    }
}

// ============================================================================
// TONE SENDER (RFC 4733)
// ============================================================================

fn digit_to_event(digit: char) -> Option<u8> {
    match digit {
        '0'..='9' => Some(digit as u8 - b'0'),
        '*' => Some(10),
        '#' => Some(11),
        'A'..='D' => Some(12 + (digit as u8 - b'A')),
        _ => None,
    }
}

struct RtpToneSender {
    track: Arc<TrackLocalStaticRTP>,
    clock: Arc<Mutex<RtpClock>>,
}

impl RtpToneSender {
    async fn write_event(
        &self,
        event: u8,
        duration: u16,
        end: bool,
        marker: bool,
    ) -> Result<(), MediaError> {
        let (sequence_number, timestamp) = {
            let mut clock = self.clock.lock();
            // telephone-event Pakete eines Tons teilen sich den
            // Timestamp des Tonbeginns
            let seq = clock.sequence;
            clock.sequence = clock.sequence.wrapping_add(1);
            (seq, clock.timestamp)
        };

        let volume: u8 = 10;
        let byte1 = if end { 0x80 | volume } else { volume };
        let payload = Bytes::from(vec![
            event,
            byte1,
            (duration >> 8) as u8,
            (duration & 0xFF) as u8,
        ]);

        let packet = Packet {
            header: Header {
                version: 2,
                marker,
                sequence_number,
                timestamp,
                ..Default::default()
            },
            payload,
        };

        self.track
            .write_rtp(&packet)
            .await
            .map_err(|e| MediaError::ToneFailed(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ToneSender for RtpToneSender {
    async fn insert_tone(&self, digit: char) -> Result<(), MediaError> {
        let event = digit_to_event(digit)
            .ok_or_else(|| MediaError::ToneFailed(format!("not a DTMF digit: {digit:?}")))?;

        // 100ms Ton: Start-Paket mit Marker, zwei Fortsetzungen,
        // dreifaches End-Paket wie in RFC 4733 empfohlen
        let step = (SAMPLE_RATE / 50) as u16; // 20ms in Samples
        self.write_event(event, step, false, true).await?;
        self.write_event(event, step * 2, false, false).await?;
        self.write_event(event, step * 3, false, false).await?;
        for _ in 0..3 {
            self.write_event(event, step * 5, true, false).await?;
        }
        Ok(())
    }
}

// ============================================================================
// ENDPOINT
// ============================================================================

struct WebRtcEndpoint {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticRTP>,
    clock: Arc<Mutex<RtpClock>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl MediaEndpoint for WebRtcEndpoint {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn accept_offer(&self, offer_sdp: String) -> Result<String, MediaError> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        Ok(answer.sdp)
    }

    async fn apply_answer(&self, answer_sdp: String) -> Result<(), MediaError> {
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: String) -> Result<(), MediaError> {
        let init: RTCIceCandidateInit = serde_json::from_str(&candidate)
            .map_err(|e| MediaError::InvalidCandidate(e.to_string()))?;

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))
    }

    fn tone_sender(&self) -> Option<Arc<dyn ToneSender>> {
        Some(Arc::new(RtpToneSender {
            track: Arc::clone(&self.track),
            clock: Arc::clone(&self.clock),
        }))
    }

    async fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Closing connection to {}: {}", self.peer_id, e);
        }
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// Erzeugt pro Peer eine RTCPeerConnection mit lokalem PCMU-Track
pub struct WebRtcBackend {
    source: Arc<Mutex<MediaSource>>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcBackend {
    pub fn new(source: Arc<Mutex<MediaSource>>) -> Self {
        Self {
            source,
            ice_servers: default_ice_servers(),
        }
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn open_endpoint(
        &self,
        peer_id: &str,
        updates: mpsc::UnboundedSender<TransportUpdate>,
    ) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        let pc = self.create_peer_connection().await?;

        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "meshcall".to_string(),
        ));

        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        // Verbindungszustand an den Orchestrator melden
        let state_tx = updates.clone();
        let state_peer = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state with {}: {:?}", state_peer, s);
            let _ = state_tx.send(TransportUpdate::StateChanged {
                peer_id: state_peer.clone(),
                state: map_state(s),
            });
            Box::pin(async {})
        }));

        // Lokale ICE Candidates über Signaling weiterreichen
        let ice_tx = updates;
        let ice_peer = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if let Ok(candidate_str) = serde_json::to_string(&json) {
                        let _ = ice_tx.send(TransportUpdate::IceCandidate {
                            peer_id: ice_peer.clone(),
                            candidate: candidate_str,
                        });
                    }
                }
            }
            Box::pin(async {})
        }));

        // Eingehendes Audio dekodieren und abspielen
        let playback_source = Arc::clone(&self.source);
        let track_peer = peer_id.to_string();
        pc.on_track(Box::new(move |remote_track, _, _| {
            let source = Arc::clone(&playback_source);
            let peer = track_peer.clone();
            Box::pin(async move {
                tracing::info!("Received track from {}: {:?}", peer, remote_track.codec());
                while let Ok((packet, _)) = remote_track.read_rtp().await {
                    // telephone-event und andere Kurzpakete überspringen
                    if packet.payload.len() < FRAME_SIZE / 4 {
                        continue;
                    }
                    let samples = g711::decode_frame(&packet.payload);
                    source.lock().write_playback(&samples);
                }
                tracing::debug!("Track from {} ended", peer);
            })
        }));

        let clock = Arc::new(Mutex::new(RtpClock {
            sequence: 0,
            timestamp: 0,
        }));

        // Lokale Frames auf den Track pumpen
        let mut frames = self.source.lock().subscribe_frames();
        let pump_track = Arc::clone(&track);
        let pump_clock = Arc::clone(&clock);
        let pump = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(payload) => {
                        let (sequence_number, timestamp) =
                            pump_clock.lock().next(FRAME_SIZE as u32);
                        let packet = Packet {
                            header: Header {
                                version: 2,
                                sequence_number,
                                timestamp,
                                ..Default::default()
                            },
                            payload,
                        };
                        if pump_track.write_rtp(&packet).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Audio pump lagged, skipped {} frames", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Arc::new(WebRtcEndpoint {
            peer_id: peer_id.to_string(),
            pc,
            track,
            clock,
            tasks: Mutex::new(vec![pump]),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_mapping_covers_the_dial_pad() {
        assert_eq!(digit_to_event('0'), Some(0));
        assert_eq!(digit_to_event('9'), Some(9));
        assert_eq!(digit_to_event('*'), Some(10));
        assert_eq!(digit_to_event('#'), Some(11));
        assert_eq!(digit_to_event('A'), Some(12));
        assert_eq!(digit_to_event('D'), Some(15));
        assert_eq!(digit_to_event('x'), None);
    }

    #[test]
    fn rtp_clock_advances_and_wraps() {
        let mut clock = RtpClock {
            sequence: u16::MAX,
            timestamp: 100,
        };
        let (seq, ts) = clock.next(160);
        assert_eq!((seq, ts), (u16::MAX, 100));
        let (seq, ts) = clock.next(160);
        assert_eq!((seq, ts), (0, 260));
    }
}
