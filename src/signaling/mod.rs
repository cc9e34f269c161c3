//! Signaling Module - WebSocket Client für den Koordinationsserver
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - WebSocket-Verbindung aufbauen und halten (Reconnect/Backoff)
//! - Ausgehende Nachrichten serialisieren und senden
//! - Eingehende Nachrichten parsen und weiterleiten
//!

mod client;
mod messages;

pub use client::{LinkStatus, SignalingClient, SignalingError};
pub use messages::{ClientMessage, ServerMessage};
