//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die Verbindung zum Koordinationsserver:
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Keepalive-Ping
//! - Login-Replay nach Reconnect
//! - Eingehende Nachrichten parsen und als Broadcast weiterreichen
//!
//! Die Transportgesundheit wird ausschließlich als Status-Enum über
//! einen watch-Channel veröffentlicht; Darstellung ist Sache der UI.

use super::messages::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Maximale Reconnect-Versuche bevor der Client aufgibt
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Obergrenze für den Backoff zwischen Reconnects
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Keepalive-Intervall
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Verbindungen die so lange halten setzen den Reconnect-Zähler zurück;
/// ein Server der sofort wieder trennt zählt weiter hoch.
const STABLE_SESSION: Duration = Duration::from_secs(30);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// LINK STATUS
// ============================================================================

/// Transportgesundheit des Signaling-Kanals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Default)]
struct ClientState {
    /// Für das Login-Replay nach einem Reconnect
    username: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Signaling-Kommunikation
pub struct SignalingClient {
    state: Arc<RwLock<ClientState>>,
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    event_tx: broadcast::Sender<ServerMessage>,
    status_rx: watch::Receiver<LinkStatus>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl SignalingClient {
    /// Startet den Client; die Verbindung wird im Hintergrund aufgebaut
    /// und bei Abbrüchen automatisch neu versucht.
    pub fn connect(server_url: &str) -> Result<Self, SignalingError> {
        let url = Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(100);
        let (status_tx, status_rx) = watch::channel(LinkStatus::Reconnecting);
        let state = Arc::new(RwLock::new(ClientState::default()));

        let supervisor = tokio::spawn(supervise(
            url.to_string(),
            out_rx,
            event_tx.clone(),
            status_tx,
            Arc::clone(&state),
        ));

        Ok(Self {
            state,
            out_tx,
            event_tx,
            status_rx,
            supervisor,
        })
    }

    /// Registriert die Präsenz; der Username wird nach jedem Reconnect
    /// erneut angemeldet.
    pub fn login(&self, username: &str) -> Result<(), SignalingError> {
        self.state.write().username = Some(username.to_string());
        self.send(ClientMessage::Login {
            username: username.to_string(),
        })
    }

    /// Reiht eine Nachricht in die Sendewarteschlange ein (fire-and-forget)
    pub fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        self.out_tx
            .send(msg)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Gibt einen Receiver für eingehende Server-Nachrichten zurück
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.event_tx.subscribe()
    }

    /// Beobachter für die Transportgesundheit
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Prüft ob aktuell verbunden
    pub fn is_connected(&self) -> bool {
        *self.status_rx.borrow() == LinkStatus::Connected
    }

    /// Gibt den angemeldeten Username zurück (falls eingeloggt)
    pub fn username(&self) -> Option<String> {
        self.state.read().username.clone()
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("status", &*self.status_rx.borrow())
            .field("username", &self.state.read().username)
            .finish()
    }
}

// ============================================================================
// SUPERVISOR
// ============================================================================

/// Verbindet, pumpt Nachrichten in beide Richtungen und reconnectet
/// mit Backoff bis `MAX_RECONNECT_ATTEMPTS` erreicht ist.
async fn supervise(
    url: String,
    mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
    event_tx: broadcast::Sender<ServerMessage>,
    status_tx: watch::Sender<LinkStatus>,
    state: Arc<RwLock<ClientState>>,
) {
    let mut attempt: u32 = 0;

    loop {
        tracing::info!("Connecting to signaling server: {}", url);

        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                status_tx.send_replace(LinkStatus::Connected);
                tracing::info!("Connected to signaling server");
                let connected_at = tokio::time::Instant::now();

                let (mut sink, mut stream) = ws_stream.split();

                // Login-Replay nach Reconnect; ein Fehlschlag läuft wie
                // jeder andere Abbruch in den Backoff
                let username = state.read().username.clone();
                let replay_ok = match username {
                    Some(username) => {
                        send_message(&mut sink, &ClientMessage::Login { username })
                            .await
                            .is_ok()
                    }
                    None => true,
                };
                if !replay_ok {
                    tracing::warn!("Connection lost during login replay");
                }

                let mut ping = tokio::time::interval(PING_INTERVAL);
                ping.tick().await; // erster Tick feuert sofort

                while replay_ok {
                    tokio::select! {
                        outbound = out_rx.recv() => {
                            let Some(msg) = outbound else {
                                // Client wurde gedroppt
                                return;
                            };
                            if send_message(&mut sink, &msg).await.is_err() {
                                break;
                            }
                        }

                        _ = ping.tick() => {
                            if send_message(&mut sink, &ClientMessage::Ping).await.is_err() {
                                break;
                            }
                        }

                        inbound = stream.next() => {
                            match inbound {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<ServerMessage>(&text) {
                                        Ok(msg) => {
                                            let _ = event_tx.send(msg);
                                        }
                                        Err(e) => {
                                            tracing::warn!("Unparseable server message: {}", e);
                                        }
                                    }
                                }
                                Some(Ok(Message::Close(_))) => {
                                    tracing::info!("WebSocket closed by server");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    tracing::error!("WebSocket error: {}", e);
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }

                if session_was_stable(connected_at.elapsed()) {
                    attempt = 0;
                }
            }
            Err(e) => {
                tracing::warn!("Connection attempt failed: {}", e);
            }
        }

        attempt += 1;
        if attempt > MAX_RECONNECT_ATTEMPTS {
            tracing::error!("Max reconnection attempts reached, giving up");
            status_tx.send_replace(LinkStatus::Failed);
            return;
        }

        status_tx.send_replace(LinkStatus::Reconnecting);
        let delay = backoff_delay(attempt);
        tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        tokio::time::sleep(delay).await;
    }
}

async fn send_message<S>(sink: &mut S, msg: &ClientMessage) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let Ok(json) = serde_json::to_string(msg) else {
        return Ok(());
    };
    match sink.send(Message::Text(json)).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tracing::error!("Failed to send WebSocket message");
            Err(())
        }
    }
}

/// Exponentieller Backoff: 1s, 2s, 4s, ... gedeckelt bei 30s
fn backoff_delay(attempt: u32) -> Duration {
    let exp = Duration::from_millis(1000u64.saturating_mul(1 << (attempt - 1).min(16)));
    exp.min(MAX_BACKOFF)
}

/// Nur Sessions die `STABLE_SESSION` überlebt haben setzen den
/// Reconnect-Zähler zurück
fn session_was_stable(connected_for: Duration) -> bool {
    connected_for >= STABLE_SESSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn only_long_lived_sessions_reset_the_attempt_counter() {
        // Ein sofort wieder trennender Server darf den Zähler nicht
        // zurücksetzen, sonst greift MAX_RECONNECT_ATTEMPTS nie
        assert!(!session_was_stable(Duration::from_millis(50)));
        assert!(!session_was_stable(Duration::from_secs(29)));
        assert!(session_was_stable(Duration::from_secs(30)));
        assert!(session_was_stable(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn rejects_invalid_url() {
        assert!(matches!(
            SignalingClient::connect("not a url"),
            Err(SignalingError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn queues_messages_before_connection_established() {
        let client = SignalingClient::connect("ws://127.0.0.1:1/ws").unwrap();
        // Senden darf nicht fehlschlagen solange der Supervisor lebt
        client.login("alice").unwrap();
        client
            .send(ClientMessage::JoinCall {
                joining_user_id: "bob".into(),
            })
            .unwrap();
        assert_eq!(client.username().as_deref(), Some("alice"));
    }
}
