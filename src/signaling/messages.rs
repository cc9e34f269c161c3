//! Message Types für das Signaling-Protokoll
//!
//! JSON-Textframes mit `type`-Tag; Feldnamen sind camelCase wie auf
//! dem Koordinationsserver. SDP und ICE Candidates laufen als opake
//! Strings durch - die Media-Schicht interpretiert sie.

use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle ausgehenden Nachrichten
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Präsenz registrieren
    #[serde(rename = "login")]
    Login { username: String },

    /// Direktverbindung vorschlagen
    #[serde(rename = "call-user")]
    CallUser {
        #[serde(rename = "toUserId")]
        to_user_id: String,
        offer: String,
    },

    /// Vorschlag annehmen
    #[serde(rename = "answer-call")]
    AnswerCall {
        #[serde(rename = "toUserId")]
        to_user_id: String,
        answer: String,
    },

    /// Vorschlag ablehnen
    #[serde(rename = "reject-call")]
    RejectCall {
        #[serde(rename = "toUserId")]
        to_user_id: String,
    },

    /// ICE Candidate weiterreichen
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(rename = "toUserId")]
        to_user_id: String,
        candidate: String,
    },

    /// Bestehende Teilnehmer bitten, sich mit einem neuen Peer zu
    /// verbinden (Invite-Protokoll)
    #[serde(rename = "join-call")]
    JoinCall {
        #[serde(rename = "joiningUserId")]
        joining_user_id: String,
    },

    /// Einladung annehmen
    #[serde(rename = "accept-invite")]
    AcceptInvite {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
    },

    /// Einladung ablehnen
    #[serde(rename = "reject-invite")]
    RejectInvite {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
    },

    /// Mesh-Wachstum: Teilnehmer über den Neuzugang informieren
    #[serde(rename = "new-participant-joined")]
    NewParticipantJoined {
        #[serde(rename = "toUserId")]
        to_user_id: String,
        #[serde(rename = "newParticipant")]
        new_participant: String,
    },

    /// DTMF-Anzeige-Relay an einen Teilnehmer
    #[serde(rename = "dtmf-tone")]
    DtmfTone {
        #[serde(rename = "toUserId")]
        to_user_id: String,
        digit: char,
        sender: String,
    },

    /// Geordneter Abschied aus dem Anruf
    #[serde(rename = "participant-left")]
    ParticipantLeft {
        #[serde(rename = "toUserId")]
        to_user_id: String,
        #[serde(rename = "leavingUserId")]
        leaving_user_id: String,
    },

    /// Keepalive
    #[serde(rename = "ping")]
    Ping,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Vollständige Online-Liste
    #[serde(rename = "online-users")]
    OnlineUsers { users: Vec<String> },

    /// Eingehender Anrufvorschlag
    #[serde(rename = "incoming-call")]
    IncomingCall {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
        offer: String,
    },

    /// Gegenseite hat angenommen
    #[serde(rename = "call-answered")]
    CallAnswered {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
        answer: String,
    },

    /// Gegenseite hat abgelehnt
    #[serde(rename = "call-rejected")]
    CallRejected {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
    },

    /// ICE Candidate der Gegenseite
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
        candidate: String,
    },

    /// Ein neuer Peer stößt zum Anruf - Verbindung zu ihm aufbauen
    #[serde(rename = "join-call")]
    JoinCall {
        #[serde(rename = "joiningUserId")]
        joining_user_id: String,
    },

    /// Einladung in einen laufenden Anruf
    #[serde(rename = "incoming-invite")]
    IncomingInvite {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
    },

    /// Eingeladener hat angenommen
    #[serde(rename = "invite-accepted")]
    InviteAccepted {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
    },

    /// Eingeladener hat abgelehnt
    #[serde(rename = "invite-rejected")]
    InviteRejected {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
    },

    /// Neuer Teilnehmer ist dem Mesh beigetreten
    #[serde(rename = "new-participant-joined")]
    NewParticipantJoined {
        #[serde(rename = "newParticipant")]
        new_participant: String,
    },

    /// DTMF-Anzeige-Relay eines Teilnehmers
    #[serde(rename = "dtmf-tone")]
    DtmfTone { digit: char, sender: String },

    /// Teilnehmer hat den Anruf verlassen
    #[serde(rename = "participant-left")]
    ParticipantLeft {
        #[serde(rename = "leavingUserId")]
        leaving_user_id: String,
    },

    /// Keepalive-Antwort
    #[serde(rename = "pong")]
    Pong,
}
