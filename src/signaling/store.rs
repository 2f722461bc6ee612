use crate::error::StoreError;
use crate::signaling::record::{RecordPatch, SessionRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Document store keyed by room identifier.
///
/// Writes are either a full overwrite (`set`) or a field merge (`merge`);
/// neither takes a lock visible to other writers.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, room: &str) -> StoreResult<Option<SessionRecord>>;

    async fn set(&self, room: &str, record: SessionRecord) -> StoreResult<()>;

    /// Creates the document if it does not exist.
    async fn merge(&self, room: &str, patch: RecordPatch) -> StoreResult<()>;

    /// No-op when the document does not exist.
    async fn delete(&self, room: &str) -> StoreResult<()>;

    /// Change feed for one room. The receiver starts at the current snapshot
    /// (`None` while absent); intermediate snapshots may be coalesced.
    fn watch(&self, room: &str) -> StoreResult<watch::Receiver<Option<SessionRecord>>>;
}

/// Process-local store; both peers of a call share one instance.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<String, watch::Sender<Option<SessionRecord>>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    /// Runs `f` on the room's channel, creating it if needed. Only writes and
    /// watches create rooms.
    fn with_room<T>(&self, room: &str, f: impl FnOnce(&watch::Sender<Option<SessionRecord>>) -> T) -> T {
        let mut rooms = self.rooms.lock();
        let sender = rooms
            .entry(room.to_string())
            .or_insert_with(|| watch::channel(None).0);
        f(sender)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, room: &str) -> StoreResult<Option<SessionRecord>> {
        self.check()?;
        Ok(self
            .rooms
            .lock()
            .get(room)
            .and_then(|tx| (*tx.borrow()).clone()))
    }

    async fn set(&self, room: &str, record: SessionRecord) -> StoreResult<()> {
        self.check()?;
        self.with_room(room, |tx| {
            tx.send_replace(Some(record));
        });
        Ok(())
    }

    async fn merge(&self, room: &str, patch: RecordPatch) -> StoreResult<()> {
        self.check()?;
        self.with_room(room, |tx| {
            tx.send_if_modified(|slot| {
                let record = slot.get_or_insert_with(SessionRecord::default);
                patch.apply_to(record)
            });
        });
        Ok(())
    }

    async fn delete(&self, room: &str) -> StoreResult<()> {
        self.check()?;
        let mut rooms = self.rooms.lock();
        if let Some(tx) = rooms.get(room) {
            tx.send_if_modified(|slot| slot.take().is_some());
            if tx.receiver_count() == 0 {
                rooms.remove(room);
            }
        }
        Ok(())
    }

    fn watch(&self, room: &str) -> StoreResult<watch::Receiver<Option<SessionRecord>>> {
        self.check()?;
        Ok(self.with_room(room, |tx| tx.subscribe()))
    }
}
