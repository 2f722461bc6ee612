use crate::error::{CallError, Result};
use crate::peer::types::{CandidateDescriptor, SessionDescription};
use serde::{Deserialize, Serialize};

/// Field a single-shot wait can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    Offer,
    Answer,
}

/// The shared handshake document for one room.
///
/// Every field is optional on the wire: a candidate merge racing a delete
/// recreates the document with candidates only.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    #[serde(rename = "initiatorId", default, skip_serializing_if = "Option::is_none")]
    pub initiator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub candidates: Vec<CandidateDescriptor>,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<i64>,
}

impl SessionRecord {
    pub fn with_offer(initiator_id: &str, offer: SessionDescription, expiration_time: i64) -> Self {
        Self {
            initiator_id: Some(initiator_id.to_string()),
            offer: Some(offer),
            answer: None,
            candidates: Vec::new(),
            expiration_time: Some(expiration_time),
        }
    }

    /// Valid strictly before `expiration_time`. A record without one is never
    /// valid.
    pub fn is_expired(&self, now: i64) -> bool {
        match self.expiration_time {
            Some(expires_at) => now >= expires_at,
            None => true,
        }
    }

    /// Fails with [`CallError::StaleRecord`] once the record has expired.
    pub fn ensure_fresh(&self, room: &str, now: i64) -> Result<()> {
        if self.is_expired(now) {
            return Err(CallError::StaleRecord {
                room: room.to_string(),
                expired_at: self.expiration_time.unwrap_or_default(),
            });
        }
        Ok(())
    }

    pub fn created_by(&self, initiator_id: &str) -> bool {
        self.initiator_id.as_deref() == Some(initiator_id)
    }

    pub fn has(&self, field: RecordField) -> bool {
        match field {
            RecordField::Offer => self.offer.is_some(),
            RecordField::Answer => self.answer.is_some(),
        }
    }

    /// Set-union by descriptor text, keeping first-seen order. Returns whether
    /// anything was added.
    pub fn union_candidates<I>(&mut self, candidates: I) -> bool
    where
        I: IntoIterator<Item = CandidateDescriptor>,
    {
        let mut changed = false;
        for candidate in candidates {
            if self.candidates.iter().any(|c| c.key() == candidate.key()) {
                continue;
            }
            self.candidates.push(candidate);
            changed = true;
        }
        changed
    }
}

/// Field-merge write: present fields overwrite, candidates union.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub answer: Option<SessionDescription>,
    pub candidates: Vec<CandidateDescriptor>,
}

impl RecordPatch {
    pub fn answer(answer: SessionDescription) -> Self {
        Self {
            answer: Some(answer),
            candidates: Vec::new(),
        }
    }

    pub fn candidate(candidate: CandidateDescriptor) -> Self {
        Self {
            answer: None,
            candidates: vec![candidate],
        }
    }

    /// Applies the patch; returns whether the record changed.
    pub fn apply_to(self, record: &mut SessionRecord) -> bool {
        let mut changed = false;
        if let Some(answer) = self.answer {
            if record.answer.as_ref() != Some(&answer) {
                record.answer = Some(answer);
                changed = true;
            }
        }
        changed |= record.union_candidates(self.candidates);
        changed
    }
}
