//! Call Module - Anrufzustand und Mesh-Orchestrierung
//!
//! - `roster`: Mitgliedermenge plus die beiden Pending-Slots
//! - `registry`: Peer-Verbindungen nach User-ID
//! - `dtmf`: Tone-Sender-Cache und geteilter Anzeigepuffer
//! - `orchestrator`: die Zustandsmaschine über allem

pub mod dtmf;
pub mod orchestrator;
pub mod registry;
pub mod roster;

pub use orchestrator::{CallError, CallOrchestrator, CallPhase, CallUpdate};
pub use registry::PeerRegistry;
pub use roster::Roster;
