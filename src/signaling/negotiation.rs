//! Role selection when a peer starts or joins a room.
//!
//! Identity comparison is the only tie-break. Two peers that both read the
//! room before either writes will both initiate; the later offer overwrites
//! the earlier one and that peer's answer wait never resolves.

use crate::peer::types::SessionDescription;
use crate::signaling::record::SessionRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleDecision {
    /// Overwrite the room with a fresh offer.
    Initiate,
    /// Answer the peer's live offer.
    Respond(SessionDescription),
    /// The record is our own leftover (e.g. after a restart): dispose it, then
    /// initiate with a new offer.
    ReclaimOwn,
}

pub fn decide_role(record: Option<&SessionRecord>, local_id: &str, now: i64) -> RoleDecision {
    let Some(record) = record else {
        return RoleDecision::Initiate;
    };
    if record.created_by(local_id) {
        return RoleDecision::ReclaimOwn;
    }
    if record.is_expired(now) {
        tracing::debug!(
            expiration_time = ?record.expiration_time,
            now,
            "ignoring stale record"
        );
        return RoleDecision::Initiate;
    }
    match &record.offer {
        Some(offer) => RoleDecision::Respond(offer.clone()),
        None => RoleDecision::Initiate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_from(initiator: &str, expires_at: i64) -> SessionRecord {
        SessionRecord::with_offer(initiator, SessionDescription::offer("o"), expires_at)
    }

    #[test]
    fn absent_record_initiates() {
        assert_eq!(decide_role(None, "me", 0), RoleDecision::Initiate);
    }

    #[test]
    fn live_foreign_offer_is_answered() {
        let record = record_from("peer", 15_000);
        assert_eq!(
            decide_role(Some(&record), "me", 14_999),
            RoleDecision::Respond(SessionDescription::offer("o"))
        );
    }

    #[test]
    fn expired_foreign_offer_is_overwritten() {
        let record = record_from("peer", 15_000);
        assert_eq!(decide_role(Some(&record), "me", 15_000), RoleDecision::Initiate);
        assert_eq!(decide_role(Some(&record), "me", 20_000), RoleDecision::Initiate);
    }

    #[test]
    fn foreign_record_without_offer_initiates() {
        let mut record = record_from("peer", 15_000);
        record.offer = None;
        assert_eq!(decide_role(Some(&record), "me", 1), RoleDecision::Initiate);
    }

    #[test]
    fn own_record_is_reclaimed_even_when_fresh_or_stale() {
        let record = record_from("me", 15_000);
        assert_eq!(decide_role(Some(&record), "me", 1), RoleDecision::ReclaimOwn);
        assert_eq!(decide_role(Some(&record), "me", 99_999), RoleDecision::ReclaimOwn);
    }
}
