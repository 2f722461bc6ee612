#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peercall_lib::error::{CallError, Result};
use peercall_lib::media::{LocalTrack, RemoteTrack, TrackKind};
use peercall_lib::peer::{
    CandidateDescriptor, ConnectionState, PeerTransport, SessionDescription, TransportEvent,
    TransportFactory,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

static NEXT_SDP: AtomicUsize = AtomicUsize::new(1);

pub fn host(peer: u8, n: u8) -> CandidateDescriptor {
    CandidateDescriptor::new(format!(
        "candidate:{peer}{n} 1 udp 2130706431 10.0.{peer}.{n} 400{n} typ host"
    ))
}

pub fn srflx(peer: u8) -> CandidateDescriptor {
    CandidateDescriptor::new(format!(
        "candidate:{peer}9 1 udp 1694498815 203.0.113.{peer} 50000 typ srflx raddr 0.0.0.0 rport 0"
    ))
}

/// Any candidate containing this marker is rejected by [`FakeTransport`].
pub const REJECTED: &str = "bogus";

/// Scripted endpoint: emits its configured candidates when a local
/// description is set and a remote track when a remote one is.
pub struct FakeTransport {
    events: broadcast::Sender<TransportEvent>,
    gather: Vec<CandidateDescriptor>,
    pub calls: Mutex<Vec<String>>,
    pub applied: Mutex<Vec<CandidateDescriptor>>,
    pub tracks: Mutex<Vec<TrackKind>>,
    pub remote: Mutex<Option<SessionDescription>>,
}

impl FakeTransport {
    pub fn new(gather: Vec<CandidateDescriptor>) -> Self {
        Self {
            events: broadcast::channel(64).0,
            gather,
            calls: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.emit(TransportEvent::ConnectionState(state));
    }

    pub fn applied(&self) -> Vec<CandidateDescriptor> {
        self.applied.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record("create_offer");
        let n = NEXT_SDP.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("v=0 fake-offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer");
        let n = NEXT_SDP.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("v=0 fake-answer-{n}")))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        self.record("set_local_description");
        for candidate in &self.gather {
            self.emit(TransportEvent::LocalCandidate(candidate.clone()));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record("set_remote_description");
        *self.remote.lock() = Some(desc);
        self.emit(TransportEvent::Track(RemoteTrack::new(
            "remote-video",
            "remote-stream",
            TrackKind::Video,
        )));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateDescriptor) -> Result<()> {
        if candidate.candidate.contains(REJECTED) {
            return Err(CallError::Negotiation("unparsable candidate".into()));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.tracks.lock().push(track.kind());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        self.set_state(ConnectionState::Closed);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    gather: Vec<CandidateDescriptor>,
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn new(gather: Vec<CandidateDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            gather,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    /// Waits for the first endpoint this factory hands out.
    pub async fn transport(&self) -> Arc<FakeTransport> {
        eventually(|| self.created.lock().first().cloned()).await
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, _stun_servers: &[String]) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(FakeTransport::new(self.gather.clone()));
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Polls `check` until it yields a value, failing the test after two seconds.
pub async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
