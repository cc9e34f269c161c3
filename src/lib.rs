//! MeshCall - P2P Mesh Audio Calls
//!
//! Mehrparteien-Audiokonferenzen über ein volles WebRTC-Mesh:
//! - WebSocket-Signaling mit Reconnect und Login-Replay
//! - Eine Peer-Verbindung pro Teilnehmerpaar (G.711 PCMU, 8 kHz)
//! - Invite-Protokoll für Mesh-Wachstum bei laufendem Anruf
//! - DTMF in-band (RFC 4733) plus Anzeige-Relay über Signaling
//!
//! Einstiegspunkt ist [`CallSession`]; sie besitzt Audiogerät,
//! Signaling-Client und Orchestrator und wird über ein Handle mit
//! Kommandos gefüttert.

pub mod call;
pub mod media;
pub mod session;
pub mod signaling;

pub use call::{CallError, CallPhase, CallUpdate};
pub use media::{MediaError, MediaSource};
pub use session::{CallSession, SessionError};
pub use signaling::{LinkStatus, SignalingClient, SignalingError};

/// Initialisiert das Logging; einmal pro Prozess aufrufen.
/// `RUST_LOG` überschreibt die Default-Direktiven.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("meshcall=debug".parse().expect("static directive"))
        .add_directive("webrtc=warn".parse().expect("static directive"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
