//! Call Orchestrator - die Zustandsmaschine der Anrufsession
//!
//! Konsumiert Signaling-Events, Transportmeldungen und Benutzeraktionen,
//! treibt Roster und Registry und entscheidet die Mesh-Topologie beim
//! Beitritt. Alle Wachstums- und Abbaupfade sind idempotent: vor jedem
//! Verbindungsaufbau wird die aktuelle Mitgliedschaft geprüft, damit
//! doppelte oder verschränkte Events keine Doppelverbindungen erzeugen.
//!
//! Richtungsentscheid beim Wachstum: der Beitretende bietet dem Einlader
//! (und allen ihm bereits bekannten Mitgliedern) an; die übrigen
//! Mitglieder bieten dem Beitretenden an, sobald sie per join-call bzw.
//! new-participant-joined von ihm erfahren. Ein eingehendes Offer wird
//! bei laufendem Anruf sofort beantwortet statt den Pending-Slot zu
//! belegen.

use super::dtmf::DtmfRelay;
use super::registry::PeerRegistry;
use super::roster::{PendingCall, PendingInvite, Roster};
use crate::media::{LinkState, MediaBackend, MediaError, TransportUpdate};
use crate::signaling::{ClientMessage, ServerMessage};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("'{0}' is already in the call")]
    AlreadyActive(String),

    #[error("cannot call yourself")]
    SelfCall,

    #[error("no pending incoming call")]
    NoPendingCall,

    #[error("no pending invite")]
    NoPendingInvite,

    #[error("no usable DTMF sender on any connection")]
    NoToneSender,

    /// Mesh-Wachstum teilweise fehlgeschlagen; die übrigen
    /// Verbindungen wurden trotzdem aufgebaut
    #[error("failed to connect to {peers:?}")]
    FanoutFailed { peers: Vec<String> },
}

// ============================================================================
// CALL PHASE
// ============================================================================

/// Sessionzustand des lokalen Prozesses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Keine Teilnehmer
    Idle,
    /// Ausgehendes Offer unterwegs, Antwort steht aus
    Calling,
    /// Eingehendes Offer wartet auf Entscheidung
    RingingIn,
    /// Mindestens ein aktiver Teilnehmer
    InCall,
}

/// UI-gerichtete Ereignisse der Session
#[derive(Debug, Clone)]
pub enum CallUpdate {
    PhaseChanged(CallPhase),
    ParticipantJoined { user_id: String },
    ParticipantLeft { user_id: String },
    IncomingCall { from_user_id: String },
    IncomingInvite { from_user_id: String },
    CallRejectedBy { user_id: String },
    InviteAccepted { user_id: String },
    InviteRejected { user_id: String },
    DtmfDisplay { line: String },
    OnlineUsers { users: Vec<String> },
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct CallOrchestrator {
    username: String,
    phase: CallPhase,
    roster: Roster,
    registry: PeerRegistry,
    dtmf: DtmfRelay,
    backend: Arc<dyn MediaBackend>,
    signal_tx: mpsc::UnboundedSender<ClientMessage>,
    transport_tx: mpsc::UnboundedSender<TransportUpdate>,
    update_tx: broadcast::Sender<CallUpdate>,
}

impl CallOrchestrator {
    /// `signal_tx` nimmt ausgehende Signaling-Nachrichten auf,
    /// `transport_tx` wird an jede neue Media-Verbindung durchgereicht.
    pub fn new(
        username: String,
        backend: Arc<dyn MediaBackend>,
        signal_tx: mpsc::UnboundedSender<ClientMessage>,
        transport_tx: mpsc::UnboundedSender<TransportUpdate>,
    ) -> Self {
        let (update_tx, _) = broadcast::channel(100);
        Self {
            username,
            phase: CallPhase::Idle,
            roster: Roster::new(),
            registry: PeerRegistry::new(),
            dtmf: DtmfRelay::new(),
            backend,
            signal_tx,
            transport_tx,
            update_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallUpdate> {
        self.update_tx.subscribe()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    /// Aktive Teilnehmer (ohne self)
    pub fn participants(&self) -> Vec<String> {
        self.roster.members()
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    /// Startet einen Anruf bzw. lädt bei laufendem Anruf ins Mesh ein.
    pub async fn place_call(&mut self, target: &str) -> Result<(), CallError> {
        if target == self.username {
            return Err(CallError::SelfCall);
        }
        if self.roster.contains(target) {
            return Err(CallError::AlreadyActive(target.to_string()));
        }

        if self.roster.is_empty() {
            self.open_and_offer(target).await?;
            self.set_phase(CallPhase::Calling);
        } else {
            // Mesh wächst über das Invite-Protokoll, nicht über ein
            // frisches Offer
            self.emit(ClientMessage::JoinCall {
                joining_user_id: target.to_string(),
            });
        }
        Ok(())
    }

    /// Nimmt den wartenden eingehenden Anruf an.
    ///
    /// Schlägt ein Schritt fehl, wird der Anruf abgewiesen und keine
    /// halbfertige Verbindung zurückgelassen.
    pub async fn accept_call(&mut self) -> Result<(), CallError> {
        let pending = self.roster.take_pending_call().ok_or(CallError::NoPendingCall)?;

        match self.answer_offer(&pending.from_user_id, pending.offer.clone()).await {
            Ok(()) => {
                self.mark_active(&pending.from_user_id);
                self.set_phase(CallPhase::InCall);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Accepting call from {} failed: {}", pending.from_user_id, e);
                self.emit(ClientMessage::RejectCall {
                    to_user_id: pending.from_user_id,
                });
                self.recompute_phase();
                Err(e)
            }
        }
    }

    /// Lehnt den wartenden eingehenden Anruf ab.
    pub fn reject_call(&mut self) -> Result<(), CallError> {
        let pending = self.roster.take_pending_call().ok_or(CallError::NoPendingCall)?;
        self.emit(ClientMessage::RejectCall {
            to_user_id: pending.from_user_id,
        });
        self.recompute_phase();
        Ok(())
    }

    /// Nimmt die wartende Einladung an: Offer an jedes bekannte
    /// Mitglied und an den Einlader, danach Beitritts-Broadcast.
    /// Einzelne Fehlschläge brechen die übrigen Verbindungen nicht ab.
    pub async fn accept_invite(&mut self) -> Result<(), CallError> {
        let invite = self
            .roster
            .take_pending_invite()
            .ok_or(CallError::NoPendingInvite)?;

        let mut failed: Vec<String> = Vec::new();

        // Zuerst alle bereits bekannten Mitglieder
        for member in self.roster.members() {
            if member == self.username || self.registry.contains(&member) {
                continue;
            }
            if let Err(e) = self.open_and_offer(&member).await {
                tracing::error!("Connecting to participant {} failed: {}", member, e);
                failed.push(member);
            }
        }

        // Dann der Einlader selbst
        let inviter = invite.from_user_id;
        if self.registry.contains(&inviter) {
            self.mark_active(&inviter);
        } else {
            match self.open_and_offer(&inviter).await {
                Ok(()) => self.mark_active(&inviter),
                Err(e) => {
                    tracing::error!("Connecting to inviter {} failed: {}", inviter, e);
                    failed.push(inviter.clone());
                }
            }
        }

        self.emit(ClientMessage::AcceptInvite {
            from_user_id: inviter,
        });

        // Beitritt an alle bisherigen Mitglieder melden, damit jedes
        // eine Gegenverbindung aufbaut
        for member in self.roster.members() {
            self.emit(ClientMessage::NewParticipantJoined {
                to_user_id: member,
                new_participant: self.username.clone(),
            });
        }

        if !self.roster.is_empty() {
            self.set_phase(CallPhase::InCall);
        }

        // Ein Offer eines Mitglieds kann vor der Annahme eingetroffen
        // sein; mit der Einladung ist es jetzt autorisiert.
        if let Some(early) = self.roster.take_pending_call() {
            tracing::debug!("Answering early mesh offer from {}", early.from_user_id);
            self.handle_incoming_call(&early.from_user_id.clone(), early.offer)
                .await;
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(CallError::FanoutFailed { peers: failed })
        }
    }

    /// Lehnt die wartende Einladung ab; keine Verbindungs-Nebenwirkungen.
    pub fn reject_invite(&mut self) -> Result<(), CallError> {
        let invite = self
            .roster
            .take_pending_invite()
            .ok_or(CallError::NoPendingInvite)?;
        self.emit(ClientMessage::RejectInvite {
            from_user_id: invite.from_user_id,
        });
        Ok(())
    }

    /// Beendet den Anruf lokal: Abschied an alle, alles schließen.
    pub async fn leave_call(&mut self) {
        if self.roster.is_empty() {
            return;
        }

        for member in self.roster.members() {
            self.emit(ClientMessage::ParticipantLeft {
                to_user_id: member,
                leaving_user_id: self.username.clone(),
            });
        }

        for endpoint in self.registry.drain() {
            endpoint.close().await;
        }

        self.roster.clear();
        self.dtmf.reset();
        self.set_phase(CallPhase::Idle);
    }

    /// Sendet eine DTMF-Ziffer über alle Verbindungen mit auflösbarem
    /// Sender und relayt sie zur Anzeige an alle Teilnehmer.
    pub async fn send_dtmf(&mut self, digit: char) -> Result<(), CallError> {
        if self.roster.is_empty() {
            tracing::warn!("Cannot send DTMF: no active call");
            return Ok(());
        }

        let mut sent = false;
        for peer in self.registry.peer_ids() {
            let Some(endpoint) = self.registry.get(&peer) else {
                continue;
            };
            let Some(sender) = self.dtmf.sender_for(&peer, &endpoint) else {
                tracing::debug!("No DTMF sender for {}", peer);
                continue;
            };
            match sender.insert_tone(digit).await {
                Ok(()) => sent = true,
                Err(e) => tracing::error!("Failed to send DTMF through {}: {}", peer, e),
            }
        }

        if !sent {
            return Err(CallError::NoToneSender);
        }

        let line = self.dtmf.push_local(digit);
        self.notify(CallUpdate::DtmfDisplay { line });

        for member in self.roster.members() {
            self.emit(ClientMessage::DtmfTone {
                to_user_id: member,
                digit,
                sender: self.username.clone(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // SIGNALING EVENTS
    // ========================================================================

    /// Zentraler Dispatcher für Server-Nachrichten
    pub async fn handle_signal(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::OnlineUsers { users } => {
                self.notify(CallUpdate::OnlineUsers { users });
            }
            ServerMessage::IncomingCall { from_user_id, offer } => {
                self.handle_incoming_call(&from_user_id, offer).await;
            }
            ServerMessage::CallAnswered { from_user_id, answer } => {
                self.handle_call_answered(&from_user_id, answer).await;
            }
            ServerMessage::CallRejected { from_user_id } => {
                self.handle_call_rejected(&from_user_id).await;
            }
            ServerMessage::IceCandidate {
                from_user_id,
                candidate,
            } => {
                self.handle_ice_candidate(&from_user_id, candidate).await;
            }
            ServerMessage::JoinCall { joining_user_id } => {
                self.handle_join_call(&joining_user_id).await;
            }
            ServerMessage::IncomingInvite { from_user_id } => {
                self.handle_incoming_invite(&from_user_id);
            }
            ServerMessage::InviteAccepted { from_user_id } => {
                self.notify(CallUpdate::InviteAccepted {
                    user_id: from_user_id,
                });
            }
            ServerMessage::InviteRejected { from_user_id } => {
                self.notify(CallUpdate::InviteRejected {
                    user_id: from_user_id,
                });
            }
            ServerMessage::NewParticipantJoined { new_participant } => {
                self.handle_new_participant(&new_participant).await;
            }
            ServerMessage::DtmfTone { digit, sender } => {
                let line = self.dtmf.push_remote(&sender, digit);
                self.notify(CallUpdate::DtmfDisplay { line });
            }
            ServerMessage::ParticipantLeft { leaving_user_id } => {
                tracing::info!("Participant left: {}", leaving_user_id);
                self.drop_peer(&leaving_user_id).await;
            }
            ServerMessage::Pong => {}
        }
    }

    /// Meldungen der Media-Schicht (Verbindungszustand, lokale ICE
    /// Candidates)
    pub async fn handle_transport(&mut self, update: TransportUpdate) {
        match update {
            TransportUpdate::StateChanged { peer_id, state } => {
                self.registry.set_state(&peer_id, state);
                if !state.is_live() {
                    // Impliziter Abschied ohne participant-left
                    tracing::info!("Connection to {} degraded ({:?}), removing", peer_id, state);
                    self.drop_peer(&peer_id).await;
                }
            }
            TransportUpdate::IceCandidate { peer_id, candidate } => {
                self.emit(ClientMessage::IceCandidate {
                    to_user_id: peer_id,
                    candidate,
                });
            }
        }
    }

    // ========================================================================
    // EVENT HANDLERS
    // ========================================================================

    async fn handle_incoming_call(&mut self, from: &str, offer: String) {
        if self.roster.is_empty() {
            match self.roster.set_pending_call(PendingCall {
                from_user_id: from.to_string(),
                offer,
            }) {
                Ok(()) => {
                    self.set_phase(CallPhase::RingingIn);
                    self.notify(CallUpdate::IncomingCall {
                        from_user_id: from.to_string(),
                    });
                }
                Err(occupied) => {
                    // Busy: der erste Anrufer behält den Slot
                    tracing::warn!(
                        "Incoming call from {} while call from {} is pending, rejecting",
                        from,
                        occupied.holder
                    );
                    self.emit(ClientMessage::RejectCall {
                        to_user_id: from.to_string(),
                    });
                }
            }
            return;
        }

        // Laufender Anruf: das Offer ist Mesh-Wachstum und wird sofort
        // beantwortet
        if self.registry.contains(from) {
            tracing::debug!("Duplicate offer from {} dropped", from);
            return;
        }
        match self.answer_offer(from, offer).await {
            Ok(()) => self.mark_active(from),
            Err(e) => {
                tracing::error!("Answering mesh offer from {} failed: {}", from, e);
                self.emit(ClientMessage::RejectCall {
                    to_user_id: from.to_string(),
                });
            }
        }
    }

    async fn handle_call_answered(&mut self, from: &str, answer: String) {
        let Some(endpoint) = self.registry.get(from) else {
            // Veraltetes Answer, der Peer ist längst weg
            tracing::warn!("Answer from {} without connection dropped", from);
            return;
        };

        if let Err(e) = endpoint.apply_answer(answer).await {
            tracing::error!("Applying answer from {} failed: {}", from, e);
            self.drop_peer(from).await;
            return;
        }

        tracing::info!("Call answered by {}", from);
        self.mark_active(from);
        self.set_phase(CallPhase::InCall);
    }

    async fn handle_call_rejected(&mut self, from: &str) {
        tracing::info!("Call rejected by {}", from);
        self.notify(CallUpdate::CallRejectedBy {
            user_id: from.to_string(),
        });
        self.drop_peer(from).await;
    }

    async fn handle_ice_candidate(&mut self, from: &str, candidate: String) {
        let Some(endpoint) = self.registry.get(from) else {
            // Candidates dürfen vor der Verbindung eintreffen
            tracing::debug!("ICE candidate from unknown peer {} dropped", from);
            return;
        };
        if let Err(e) = endpoint.add_ice_candidate(candidate).await {
            tracing::warn!("Adding ICE candidate from {} failed: {}", from, e);
        }
    }

    /// Ein neuer Peer stößt zum Anruf: Gegenverbindung aufbauen.
    async fn handle_join_call(&mut self, joining: &str) {
        if joining == self.username {
            return;
        }
        if self.roster.contains(joining) || self.registry.contains(joining) {
            tracing::debug!("Join notice for {} ignored, already connected", joining);
            return;
        }

        match self.open_and_offer(joining).await {
            Ok(()) => {
                // Eager: Mitglied ab Offer-Versand
                self.mark_active(joining);
                self.set_phase(CallPhase::InCall);
            }
            Err(e) => {
                tracing::error!("Connecting to joining peer {} failed: {}", joining, e);
            }
        }
    }

    fn handle_incoming_invite(&mut self, from: &str) {
        match self.roster.set_pending_invite(PendingInvite {
            from_user_id: from.to_string(),
        }) {
            Ok(()) => {
                self.notify(CallUpdate::IncomingInvite {
                    from_user_id: from.to_string(),
                });
            }
            Err(occupied) => {
                tracing::warn!(
                    "Invite from {} while invite from {} is pending, rejecting",
                    from,
                    occupied.holder
                );
                self.emit(ClientMessage::RejectInvite {
                    from_user_id: from.to_string(),
                });
            }
        }
    }

    /// Beitritts-Broadcast: Verbindung zum Neuzugang, falls noch keine
    /// existiert (idempotent bei doppelter Zustellung).
    async fn handle_new_participant(&mut self, participant: &str) {
        if participant == self.username
            || self.roster.contains(participant)
            || self.registry.contains(participant)
        {
            return;
        }

        tracing::info!("New participant joined: {}", participant);
        match self.open_and_offer(participant).await {
            Ok(()) => {
                self.mark_active(participant);
                self.set_phase(CallPhase::InCall);
            }
            Err(e) => {
                tracing::error!("Connecting to new participant {} failed: {}", participant, e);
            }
        }
    }

    // ========================================================================
    // PRIVATE HELPERS
    // ========================================================================

    /// Baut eine Verbindung auf und schickt der Gegenseite ein Offer.
    /// Existiert bereits eine Verbindung, bleibt sie stehen und es geht
    /// kein zweites Offer raus. Bei einem Fehler bleibt kein
    /// Registry-Eintrag zurück.
    async fn open_and_offer(&mut self, peer: &str) -> Result<(), CallError> {
        if self.registry.contains(peer) {
            tracing::debug!("Connection to {} already in flight, not offering again", peer);
            return Ok(());
        }

        let endpoint = self
            .backend
            .open_endpoint(peer, self.transport_tx.clone())
            .await?;

        if self.registry.insert(peer, Arc::clone(&endpoint)).is_err() {
            endpoint.close().await;
            return Err(CallError::AlreadyActive(peer.to_string()));
        }

        match endpoint.create_offer().await {
            Ok(offer) => {
                self.emit(ClientMessage::CallUser {
                    to_user_id: peer.to_string(),
                    offer,
                });
                Ok(())
            }
            Err(e) => {
                if let Some(ep) = self.registry.remove(peer) {
                    ep.close().await;
                }
                Err(e.into())
            }
        }
    }

    /// Baut eine Verbindung auf, beantwortet das Remote-Offer und
    /// schickt das Answer zurück. Bei beidseitigem gleichzeitigem
    /// Anruf ersetzt das eingehende Offer unser eigenes unbeantwortetes;
    /// das Answer geht in jedem Fall raus. Räumt bei jedem Fehler
    /// vollständig auf.
    async fn answer_offer(&mut self, from: &str, offer: String) -> Result<(), CallError> {
        if let Some(stale) = self.registry.remove(from) {
            tracing::info!("Inbound offer from {} replaces our unanswered one", from);
            stale.close().await;
        }

        let endpoint = self
            .backend
            .open_endpoint(from, self.transport_tx.clone())
            .await?;

        if self.registry.insert(from, Arc::clone(&endpoint)).is_err() {
            endpoint.close().await;
            return Err(CallError::AlreadyActive(from.to_string()));
        }

        match endpoint.accept_offer(offer).await {
            Ok(answer) => {
                self.emit(ClientMessage::AnswerCall {
                    to_user_id: from.to_string(),
                    answer,
                });
                Ok(())
            }
            Err(e) => {
                if let Some(ep) = self.registry.remove(from) {
                    ep.close().await;
                }
                Err(e.into())
            }
        }
    }

    /// Entfernt einen einzelnen Teilnehmer samt Verbindung und
    /// DTMF-Cache; doppelt aufrufen ist erlaubt.
    async fn drop_peer(&mut self, peer: &str) {
        if let Some(endpoint) = self.registry.remove(peer) {
            endpoint.close().await;
        }
        self.dtmf.evict(peer);
        if self.roster.remove(peer) {
            self.notify(CallUpdate::ParticipantLeft {
                user_id: peer.to_string(),
            });
        }
        self.recompute_phase();
    }

    /// Nimmt einen Peer in die aktive Menge auf (idempotent)
    fn mark_active(&mut self, peer: &str) {
        if self.roster.add(peer) {
            self.notify(CallUpdate::ParticipantJoined {
                user_id: peer.to_string(),
            });
        }
    }

    /// Fällt auf Idle zurück sobald die Menge leer ist
    fn recompute_phase(&mut self) {
        if self.roster.is_empty() {
            if self.roster.pending_call().is_some() {
                self.set_phase(CallPhase::RingingIn);
            } else {
                self.dtmf.reset();
                self.set_phase(CallPhase::Idle);
            }
        }
    }

    fn set_phase(&mut self, phase: CallPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.notify(CallUpdate::PhaseChanged(phase));
        }
    }

    /// Signaling-Emits sind fire-and-forget; Transportverlust behandelt
    /// der Signaling-Client selbst.
    fn emit(&self, msg: ClientMessage) {
        if self.signal_tx.send(msg).is_err() {
            tracing::warn!("Signaling channel closed, message dropped");
        }
    }

    fn notify(&self, update: CallUpdate) {
        let _ = self.update_tx.send(update);
    }
}

// ============================================================================
// TESTS
// ============================================================================
