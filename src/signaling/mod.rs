//! Room-scoped shared handshake record with push notification.

use crate::error::{CallError, Result, StoreError};
use crate::peer::types::{CandidateDescriptor, SessionDescription};
use crate::utils::now_millis;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod negotiation;
pub mod record;
pub mod store;

pub use negotiation::{decide_role, RoleDecision};
pub use record::{RecordField, RecordPatch, SessionRecord};
pub use store::{MemoryStore, RecordStore};

pub struct SignalingChannel {
    room: String,
    store: Arc<dyn RecordStore>,
    ttl: Duration,
}

impl SignalingChannel {
    pub fn new(room: impl Into<String>, store: Arc<dyn RecordStore>, ttl: Duration) -> Self {
        Self {
            room: room.into(),
            store,
            ttl,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Replaces the room record with a fresh offer, discarding any previous
    /// answer and candidates.
    pub async fn publish_offer(&self, offer: SessionDescription, initiator_id: &str) -> Result<()> {
        let expiration_time = now_millis() + self.ttl.as_millis() as i64;
        let record = SessionRecord::with_offer(initiator_id, offer, expiration_time);
        self.store.set(&self.room, record).await?;
        tracing::debug!(room = %self.room, expiration_time, "offer published");
        Ok(())
    }

    /// Merges the answer into the live record. An absent or expired record is
    /// not answered, so a late answer cannot recreate a disposed room.
    pub async fn publish_answer(&self, answer: SessionDescription) -> Result<()> {
        match self.store.get(&self.room).await? {
            Some(record) => record.ensure_fresh(&self.room, now_millis())?,
            None => {
                return Err(CallError::Negotiation(format!(
                    "room '{}' has no offer to answer",
                    self.room
                )))
            }
        }
        self.store
            .merge(&self.room, RecordPatch::answer(answer))
            .await?;
        tracing::debug!(room = %self.room, "answer published");
        Ok(())
    }

    pub async fn append_candidate(&self, candidate: CandidateDescriptor) -> Result<()> {
        self.store
            .merge(&self.room, RecordPatch::candidate(candidate))
            .await?;
        Ok(())
    }

    pub async fn fetch_once(&self) -> Result<Option<SessionRecord>> {
        Ok(self.store.get(&self.room).await?)
    }

    /// Calls `on_change` with the current record and then after every change,
    /// including changes made by this peer. Snapshots of an absent record are
    /// skipped. Calls are sequential.
    pub fn subscribe<F, Fut>(&self, mut on_change: F) -> Result<Subscription>
    where
        F: FnMut(SessionRecord) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.store.watch(&self.room)?;
        let token = CancellationToken::new();
        let task_token = token.clone();
        let room = self.room.clone();

        let task = tokio::spawn(async move {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if let Some(record) = snapshot {
                    tokio::select! {
                        biased;
                        _ = task_token.cancelled() => break,
                        _ = on_change(record) => {}
                    }
                }
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            tracing::debug!(%room, "change feed closed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Subscription { token, task })
    }

    /// Resolves once, the first time `field` is present. The underlying
    /// watch is dropped on return.
    pub async fn subscribe_until(
        &self,
        field: RecordField,
        cancel: &CancellationToken,
    ) -> Result<SessionRecord> {
        let mut rx = self.store.watch(&self.room)?;
        loop {
            let hit = match &*rx.borrow_and_update() {
                Some(record) if record.has(field) => Some(record.clone()),
                _ => None,
            };
            if let Some(record) = hit {
                tracing::debug!(room = %self.room, ?field, "awaited field present");
                return Ok(record);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(StoreError::FeedClosed(self.room.clone()).into());
                    }
                }
            }
        }
    }

    /// Deletes the room record; no-op if absent.
    pub async fn dispose(&self) -> Result<()> {
        self.store.delete(&self.room).await?;
        tracing::debug!(room = %self.room, "record disposed");
        Ok(())
    }
}

/// Handle to a [`SignalingChannel::subscribe`] listener. Dropping it detaches
/// the listener as well.
pub struct Subscription {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration as TokioDuration};

    fn channel(store: &Arc<MemoryStore>) -> SignalingChannel {
        SignalingChannel::new("abc", store.clone(), Duration::from_secs(15))
    }

    fn host(n: u8) -> CandidateDescriptor {
        CandidateDescriptor::new(format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 4000{n} typ host"))
    }

    #[tokio::test]
    async fn publish_offer_resets_answer_and_candidates() {
        let store = Arc::new(MemoryStore::new());
        let ch = channel(&store);
        ch.publish_offer(SessionDescription::offer("o1"), "a").await.unwrap();
        ch.publish_answer(SessionDescription::answer("r1")).await.unwrap();
        ch.append_candidate(host(1)).await.unwrap();

        let before = now_millis();
        ch.publish_offer(SessionDescription::offer("o2"), "b").await.unwrap();
        let record = ch.fetch_once().await.unwrap().unwrap();
        assert_eq!(record.offer, Some(SessionDescription::offer("o2")));
        assert_eq!(record.initiator_id.as_deref(), Some("b"));
        assert!(record.answer.is_none());
        assert!(record.candidates.is_empty());
        let expires = record.expiration_time.unwrap();
        assert!(expires >= before + 15_000);
        assert!(expires <= now_millis() + 15_000);
    }

    #[tokio::test]
    async fn append_candidate_twice_keeps_one_entry() {
        let store = Arc::new(MemoryStore::new());
        let ch = channel(&store);
        ch.publish_offer(SessionDescription::offer("o"), "a").await.unwrap();
        ch.append_candidate(host(1)).await.unwrap();
        ch.append_candidate(host(1)).await.unwrap();
        let record = ch.fetch_once().await.unwrap().unwrap();
        assert_eq!(record.candidates, vec![host(1)]);
    }

    #[tokio::test]
    async fn subscribe_until_resolves_once_with_merged_record() {
        let store = Arc::new(MemoryStore::new());
        let ch = Arc::new(channel(&store));
        ch.publish_offer(SessionDescription::offer("o"), "a").await.unwrap();

        let waiter = {
            let ch = ch.clone();
            tokio::spawn(async move {
                ch.subscribe_until(RecordField::Answer, &CancellationToken::new())
                    .await
            })
        };
        ch.append_candidate(host(1)).await.unwrap();
        ch.publish_answer(SessionDescription::answer("r")).await.unwrap();

        let record = timeout(TokioDuration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.offer, Some(SessionDescription::offer("o")));
        assert_eq!(record.answer, Some(SessionDescription::answer("r")));
    }

    #[tokio::test]
    async fn subscribe_until_honors_cancellation() {
        let store = Arc::new(MemoryStore::new());
        let ch = channel(&store);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ch
            .subscribe_until(RecordField::Offer, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Cancelled));
    }

    #[tokio::test]
    async fn subscriber_sees_own_writes_until_detached() {
        let store = Arc::new(MemoryStore::new());
        let ch = channel(&store);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = ch
            .subscribe(move |record: SessionRecord| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(record.candidates.len());
                }
            })
            .unwrap();

        ch.publish_offer(SessionDescription::offer("o"), "a").await.unwrap();
        assert_eq!(rx.recv().await, Some(0));
        ch.append_candidate(host(1)).await.unwrap();
        assert_eq!(rx.recv().await, Some(1));

        sub.unsubscribe();
        ch.append_candidate(host(2)).await.unwrap();
        assert!(timeout(TokioDuration::from_millis(50), rx.recv())
            .await
            .map(|v| v.is_none())
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn answer_needs_a_live_record() {
        let store = Arc::new(MemoryStore::new());
        let ch = channel(&store);
        let err = ch
            .publish_answer(SessionDescription::answer("r"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Negotiation(_)));
        assert!(ch.fetch_once().await.unwrap().is_none());

        store
            .set(
                "abc",
                SessionRecord::with_offer("a", SessionDescription::offer("o"), now_millis() - 1),
            )
            .await
            .unwrap();
        let err = ch
            .publish_answer(SessionDescription::answer("r"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::StaleRecord { .. }));
        assert!(ch.fetch_once().await.unwrap().unwrap().answer.is_none());
    }

    #[tokio::test]
    async fn dispose_absent_record_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let ch = channel(&store);
        ch.dispose().await.unwrap();
        assert!(ch.fetch_once().await.unwrap().is_none());
    }
}
