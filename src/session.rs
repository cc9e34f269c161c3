//! Call Session - verbindet Signaling, Media und Orchestrator
//!
//! Die Session besitzt alle drei Schichten und treibt sie in einem
//! einzelnen Task: Server-Nachrichten, Transportmeldungen und
//! Benutzerkommandos laufen durch dieselbe select!-Schleife, der
//! Orchestrator sieht dadurch nie zwei Events gleichzeitig.

use crate::call::{CallError, CallOrchestrator, CallUpdate};
use crate::media::{MediaBackend, MediaError, MediaSource, TransportUpdate, WebRtcBackend};
use crate::signaling::{ClientMessage, LinkStatus, SignalingClient, SignalingError};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("session task is gone")]
    Closed,
}

// ============================================================================
// COMMANDS
// ============================================================================

enum SessionCommand {
    PlaceCall {
        target: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    AcceptCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    RejectCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    AcceptInvite {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    RejectInvite {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SendDtmf {
        digit: char,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// SESSION
// ============================================================================

/// Handle auf eine laufende Anrufsession; klonbar für mehrere
/// UI-Konsumenten ist nur der Update-Stream, Kommandos laufen über
/// dieses Handle.
pub struct CallSession {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    update_rx: broadcast::Receiver<CallUpdate>,
    status_rx: watch::Receiver<LinkStatus>,
    source: Option<Arc<Mutex<MediaSource>>>,
    pump: JoinHandle<()>,
}

impl CallSession {
    /// Baut die komplette Session auf: Audiogerät öffnen,
    /// Signaling-Verbindung starten, einloggen und den Pump-Task
    /// spawnen. Ohne Mikrofon schlägt der Aufbau fehl.
    pub fn start(server_url: &str, username: &str) -> Result<Self, SessionError> {
        let mut source = MediaSource::acquire()?;
        source.start()?;
        let source = Arc::new(Mutex::new(source));
        let backend: Arc<dyn MediaBackend> = Arc::new(WebRtcBackend::new(Arc::clone(&source)));

        let client = SignalingClient::connect(server_url)?;
        client.login(username)?;

        Ok(Self::spawn(client, backend, username, Some(source)))
    }

    fn spawn(
        client: SignalingClient,
        backend: Arc<dyn MediaBackend>,
        username: &str,
        source: Option<Arc<Mutex<MediaSource>>>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let orchestrator =
            CallOrchestrator::new(username.to_string(), backend, signal_tx, transport_tx);
        let update_rx = orchestrator.subscribe();
        let status_rx = client.status();

        let pump = tokio::spawn(run_pump(orchestrator, client, signal_rx, transport_rx, cmd_rx));

        Self {
            cmd_tx,
            update_rx,
            status_rx,
            source,
            pump,
        }
    }

    /// Neuer Empfänger für Session-Ereignisse
    pub fn subscribe(&self) -> broadcast::Receiver<CallUpdate> {
        self.update_rx.resubscribe()
    }

    /// Zustand der Signaling-Verbindung
    pub fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    pub async fn place_call(&self, target: &str) -> Result<(), SessionError> {
        self.call_command(|reply| SessionCommand::PlaceCall {
            target: target.to_string(),
            reply,
        })
        .await
    }

    pub async fn accept_call(&self) -> Result<(), SessionError> {
        self.call_command(|reply| SessionCommand::AcceptCall { reply }).await
    }

    pub async fn reject_call(&self) -> Result<(), SessionError> {
        self.call_command(|reply| SessionCommand::RejectCall { reply }).await
    }

    pub async fn accept_invite(&self) -> Result<(), SessionError> {
        self.call_command(|reply| SessionCommand::AcceptInvite { reply }).await
    }

    pub async fn reject_invite(&self) -> Result<(), SessionError> {
        self.call_command(|reply| SessionCommand::RejectInvite { reply }).await
    }

    pub async fn send_dtmf(&self, digit: char) -> Result<(), SessionError> {
        self.call_command(|reply| SessionCommand::SendDtmf { digit, reply }).await
    }

    /// Verlässt den laufenden Anruf; ohne Anruf ein no-op
    pub async fn leave_call(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Leave { reply })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(source) = &self.source {
            source.lock().set_muted(muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.source.as_ref().map(|s| s.lock().is_muted()).unwrap_or(false)
    }

    /// Aktuelle Audio-Pegel (Eingang, Ausgang) für die Anzeige
    pub fn levels(&self) -> (f32, f32) {
        self.source.as_ref().map(|s| s.lock().levels()).unwrap_or((0.0, 0.0))
    }

    async fn call_command<F>(&self, build: F) -> Result<(), SessionError>
    where
        F: FnOnce(oneshot::Sender<Result<(), CallError>>) -> SessionCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?.map_err(SessionError::from)
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

// ============================================================================
// PUMP TASK
// ============================================================================

async fn run_pump(
    mut orchestrator: CallOrchestrator,
    client: SignalingClient,
    mut signal_rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportUpdate>,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let mut server_rx = client.subscribe();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    // Handle weg: Anruf geordnet beenden
                    orchestrator.leave_call().await;
                    return;
                };
                dispatch_command(&mut orchestrator, cmd).await;
            }

            Some(msg) = signal_rx.recv() => {
                if let Err(e) = client.send(msg) {
                    tracing::warn!("Failed to queue signaling message: {}", e);
                }
            }

            Some(update) = transport_rx.recv() => {
                orchestrator.handle_transport(update).await;
            }

            msg = server_rx.recv() => {
                match msg {
                    Ok(msg) => orchestrator.handle_signal(msg).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Dropped {} signaling events, consumer too slow", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        orchestrator.leave_call().await;
                        return;
                    }
                }
            }
        }
    }
}

async fn dispatch_command(orchestrator: &mut CallOrchestrator, cmd: SessionCommand) {
    match cmd {
        SessionCommand::PlaceCall { target, reply } => {
            let _ = reply.send(orchestrator.place_call(&target).await);
        }
        SessionCommand::AcceptCall { reply } => {
            let _ = reply.send(orchestrator.accept_call().await);
        }
        SessionCommand::RejectCall { reply } => {
            let _ = reply.send(orchestrator.reject_call());
        }
        SessionCommand::AcceptInvite { reply } => {
            let _ = reply.send(orchestrator.accept_invite().await);
        }
        SessionCommand::RejectInvite { reply } => {
            let _ = reply.send(orchestrator.reject_invite());
        }
        SessionCommand::SendDtmf { digit, reply } => {
            let _ = reply.send(orchestrator.send_dtmf(digit).await);
        }
        SessionCommand::Leave { reply } => {
            orchestrator.leave_call().await;
            let _ = reply.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockBackend;

    fn test_session(username: &str) -> (CallSession, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::default());
        // Der Client verbindet im Hintergrund ins Leere; gesendete
        // Nachrichten bleiben in der Warteschlange
        let client = SignalingClient::connect("ws://127.0.0.1:9").unwrap();
        let session = CallSession::spawn(
            client,
            Arc::clone(&backend) as Arc<dyn MediaBackend>,
            username,
            None,
        );
        (session, backend)
    }

    #[tokio::test]
    async fn commands_reach_the_orchestrator() {
        let (session, backend) = test_session("alice");
        let mut updates = session.subscribe();

        session.place_call("bob").await.unwrap();

        assert_eq!(backend.opened(), vec!["bob"]);
        let update = updates.recv().await.unwrap();
        assert!(matches!(
            update,
            CallUpdate::PhaseChanged(crate::call::CallPhase::Calling)
        ));
    }

    #[tokio::test]
    async fn command_errors_come_back_through_the_reply() {
        let (session, _backend) = test_session("alice");

        let err = session.accept_call().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Call(CallError::NoPendingCall)
        ));
    }

    #[tokio::test]
    async fn leave_without_a_call_is_a_noop() {
        let (session, backend) = test_session("alice");
        session.leave_call().await.unwrap();
        assert!(backend.opened().is_empty());
    }

    #[tokio::test]
    async fn mute_defaults_to_false_without_a_source() {
        let (session, _backend) = test_session("alice");
        assert!(!session.is_muted());
        session.set_muted(true);
        assert!(!session.is_muted());
    }
}
