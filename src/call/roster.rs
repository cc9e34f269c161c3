//! Membership Tracker - wer ist gerade in meinem Anruf?
//!
//! Reine Datenhaltung ohne I/O: die Active-Participant-Menge plus die
//! beiden Single-Slot-Felder für unbeantwortete Anrufe/Einladungen.
//! Ein zweiter eingehender Request während einer wartet wird nicht
//! überschrieben sondern dem Aufrufer als Konflikt gemeldet.

use std::collections::BTreeSet;

/// Ein unbeantworteter eingehender Anrufvorschlag
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub from_user_id: String,
    pub offer: String,
}

/// Eine unbeantwortete Einladung in einen laufenden Anruf
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInvite {
    pub from_user_id: String,
}

/// Fehlertyp der Single-Slot-Setter: der Slot ist bereits belegt
#[derive(Debug, PartialEq)]
pub struct SlotOccupied {
    /// Wer den Slot hält
    pub holder: String,
}

/// Lokale Sicht auf die Anrufmitgliedschaft
///
/// Die Menge ist geordnet, damit Fan-Outs deterministisch iterieren.
#[derive(Debug, Default)]
pub struct Roster {
    active: BTreeSet<String>,
    pending_call: Option<PendingCall>,
    pending_invite: Option<PendingInvite>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nimmt einen Teilnehmer auf; `true` wenn er neu war
    pub fn add(&mut self, participant: &str) -> bool {
        self.active.insert(participant.to_string())
    }

    /// Entfernt einen Teilnehmer; `true` wenn er Mitglied war
    pub fn remove(&mut self, participant: &str) -> bool {
        self.active.remove(participant)
    }

    pub fn contains(&self, participant: &str) -> bool {
        self.active.contains(participant)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Aktive Teilnehmer in deterministischer Reihenfolge
    pub fn members(&self) -> Vec<String> {
        self.active.iter().cloned().collect()
    }

    /// Leert die Menge (Anrufende)
    pub fn clear(&mut self) {
        self.active.clear();
    }

    // ========================================================================
    // PENDING SLOTS
    // ========================================================================

    pub fn set_pending_call(&mut self, call: PendingCall) -> Result<(), SlotOccupied> {
        if let Some(existing) = &self.pending_call {
            return Err(SlotOccupied {
                holder: existing.from_user_id.clone(),
            });
        }
        self.pending_call = Some(call);
        Ok(())
    }

    pub fn take_pending_call(&mut self) -> Option<PendingCall> {
        self.pending_call.take()
    }

    pub fn pending_call(&self) -> Option<&PendingCall> {
        self.pending_call.as_ref()
    }

    pub fn set_pending_invite(&mut self, invite: PendingInvite) -> Result<(), SlotOccupied> {
        if let Some(existing) = &self.pending_invite {
            return Err(SlotOccupied {
                holder: existing.from_user_id.clone(),
            });
        }
        self.pending_invite = Some(invite);
        Ok(())
    }

    pub fn take_pending_invite(&mut self) -> Option<PendingInvite> {
        self.pending_invite.take()
    }

    pub fn pending_invite(&self) -> Option<&PendingInvite> {
        self.pending_invite.as_ref()
    }
}
