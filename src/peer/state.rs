use crate::peer::types::CandidateDescriptor;
use std::collections::HashSet;

/// What to do with a candidate received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Already seen in either direction.
    Duplicate,
    /// Held until the description exchange completes.
    Queued,
    /// Ready: apply to the endpoint now.
    ApplyNow(CandidateDescriptor),
}

/// Candidate bookkeeping for one coordinator.
///
/// `pending` holds exactly the remote candidates admitted before `ready` and
/// not yet handed out by [`next_flush_batch`](Self::next_flush_batch). Once
/// `ready` is set, nothing is queued again.
#[derive(Debug, Default)]
pub struct NegotiationState {
    pending: Vec<CandidateDescriptor>,
    seen: HashSet<String>,
    gathered: Vec<CandidateDescriptor>,
    ready: bool,
}

impl NegotiationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a locally discovered candidate. Returns `false` if it was
    /// already seen, in which case it must not be published again.
    pub fn mark_local(&mut self, candidate: &CandidateDescriptor) -> bool {
        if !self.seen.insert(candidate.key().to_string()) {
            return false;
        }
        self.gathered.push(candidate.clone());
        true
    }

    pub fn admit_remote(&mut self, candidate: CandidateDescriptor) -> Admission {
        if !self.seen.insert(candidate.key().to_string()) {
            return Admission::Duplicate;
        }
        if self.ready {
            Admission::ApplyNow(candidate)
        } else {
            self.pending.push(candidate);
            Admission::Queued
        }
    }

    /// Drains the queue in arrival order. When the queue is already empty the
    /// state flips to ready and `None` is returned, so no candidate can slip
    /// in between the last batch and the flip.
    pub fn next_flush_batch(&mut self) -> Option<Vec<CandidateDescriptor>> {
        if self.pending.is_empty() {
            self.ready = true;
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending(&self) -> &[CandidateDescriptor] {
        &self.pending
    }

    pub fn gathered(&self) -> &[CandidateDescriptor] {
        &self.gathered
    }
}
