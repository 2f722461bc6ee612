//! Drives one handshake and one media session to `connected` or `failed`.

use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventBus};
use crate::logger::{analyze_candidates, dump_candidate};
use crate::media::{LocalMediaStream, RemoteMediaStream, RemoteTrack};
use crate::peer::ice::apply_batch;
use crate::peer::state::{Admission, NegotiationState};
use crate::peer::transport::{PeerTransport, TransportEvent, TransportFactory};
use crate::peer::types::{CandidateDescriptor, ConnectionState, SdpType, SessionDescription};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Connected,
    Failed(String),
}

#[derive(Debug, Default)]
struct Descriptions {
    local_offer: Option<SessionDescription>,
    remote_answer: Option<SessionDescription>,
    /// Offer accepted as responder and the answer produced for it.
    accepted: Option<(SessionDescription, SessionDescription)>,
}

impl Descriptions {
    fn exchange_complete(&self) -> bool {
        self.remote_answer.is_some() || self.accepted.is_some()
    }
}

/// Drives one peer endpoint through offer/answer and candidate exchange.
///
/// Peer candidates that arrive before both descriptions are in place are
/// queued and applied by [`flush_pending_candidates`](Self::flush_pending_candidates).
/// Once the transport reports `connected` or `failed` the outcome is fixed
/// and every later operation is refused. Status is published as
/// [`CallEvent`]s; the `on_*` helpers spawn a task per handler.
pub struct ConnectionCoordinator {
    factory: Arc<dyn TransportFactory>,
    stun_servers: Vec<String>,
    local_media: Option<LocalMediaStream>,
    transport: tokio::sync::Mutex<Option<Arc<dyn PeerTransport>>>,
    // Serializes description operations so a repeated call observes the
    // result of the first.
    op_lock: tokio::sync::Mutex<()>,
    state: Mutex<NegotiationState>,
    descriptions: Mutex<Descriptions>,
    remote_stream: Mutex<Option<RemoteMediaStream>>,
    outcome: Mutex<Option<Outcome>>,
    events: EventBus,
    local_candidates_tx: mpsc::UnboundedSender<CandidateDescriptor>,
    local_candidates_rx: Mutex<Option<mpsc::UnboundedReceiver<CandidateDescriptor>>>,
    cancel: CancellationToken,
}

impl ConnectionCoordinator {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        stun_servers: Vec<String>,
        local_media: Option<LocalMediaStream>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            factory,
            stun_servers,
            local_media,
            transport: tokio::sync::Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(NegotiationState::new()),
            descriptions: Mutex::new(Descriptions::default()),
            remote_stream: Mutex::new(None),
            outcome: Mutex::new(None),
            events: EventBus::new(),
            local_candidates_tx: tx,
            local_candidates_rx: Mutex::new(Some(rx)),
            cancel,
        })
    }

    /// Creates the endpoint, registers local tracks, creates an offer and
    /// installs it as the local description.
    pub async fn start_as_initiator(self: &Arc<Self>) -> Result<SessionDescription> {
        let _op = self.op_lock.lock().await;
        self.ensure_live()?;
        {
            let desc = self.descriptions.lock();
            if desc.local_offer.is_some() || desc.accepted.is_some() {
                return Err(CallError::Negotiation(
                    "negotiation already started on this connection".into(),
                ));
            }
        }

        let transport = self.ensure_transport().await?;
        let offer = self.guarded(transport.create_offer()).await?;
        self.guarded(transport.set_local_description(offer.clone()))
            .await?;
        self.descriptions.lock().local_offer = Some(offer.clone());
        tracing::info!("local offer created");
        Ok(offer)
    }

    /// Applies the peer's offer and answers it. Calling again with the same
    /// offer returns the answer already produced.
    pub async fn accept_remote_offer(
        self: &Arc<Self>,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let _op = self.op_lock.lock().await;
        self.ensure_live()?;
        if offer.kind != SdpType::Offer {
            return Err(CallError::Negotiation(format!(
                "expected an offer, got {:?}",
                offer.kind
            )));
        }
        {
            let desc = self.descriptions.lock();
            if let Some((accepted, answer)) = &desc.accepted {
                if *accepted == offer {
                    tracing::debug!("offer already accepted, returning cached answer");
                    return Ok(answer.clone());
                }
                return Err(CallError::Negotiation(
                    "a different offer was already accepted".into(),
                ));
            }
            if desc.local_offer.is_some() {
                return Err(CallError::Negotiation(
                    "cannot accept an offer while a local offer is outstanding".into(),
                ));
            }
        }

        let transport = self.ensure_transport().await?;
        self.guarded(transport.set_remote_description(offer.clone()))
            .await?;
        let answer = self.guarded(transport.create_answer()).await?;
        self.guarded(transport.set_local_description(answer.clone()))
            .await?;
        self.descriptions.lock().accepted = Some((offer, answer.clone()));
        tracing::info!("remote offer accepted, answer created");
        Ok(answer)
    }

    /// Applies the peer's answer to our offer.
    pub async fn establish_remote_answer(self: &Arc<Self>, answer: SessionDescription) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_live()?;
        if answer.kind != SdpType::Answer {
            return Err(CallError::Negotiation(format!(
                "expected an answer, got {:?}",
                answer.kind
            )));
        }
        {
            let desc = self.descriptions.lock();
            if desc.local_offer.is_none() {
                return Err(CallError::Negotiation(
                    "remote answer received before a local offer exists".into(),
                ));
            }
            if desc.remote_answer.as_ref() == Some(&answer) {
                return Ok(());
            }
            if desc.remote_answer.is_some() {
                return Err(CallError::Negotiation("remote answer already applied".into()));
            }
        }

        let transport = self.current_transport().await?;
        self.guarded(transport.set_remote_description(answer.clone()))
            .await?;
        self.descriptions.lock().remote_answer = Some(answer);
        tracing::info!("remote answer applied");
        Ok(())
    }

    /// Applies a peer candidate now if ready, otherwise queues it. Candidates
    /// already seen in either direction are ignored.
    pub async fn submit_candidate(&self, candidate: CandidateDescriptor) -> Result<()> {
        if self.is_terminal() {
            tracing::trace!(candidate = %candidate.candidate, "session ended, candidate ignored");
            return Ok(());
        }
        let admission = self.state.lock().admit_remote(candidate);
        match admission {
            Admission::Duplicate => Ok(()),
            Admission::Queued => {
                tracing::debug!("remote candidate queued until descriptions are exchanged");
                Ok(())
            }
            Admission::ApplyNow(candidate) => {
                dump_candidate("REMOTE", &candidate);
                let transport = self.current_transport().await?;
                self.guarded(transport.add_ice_candidate(candidate)).await
            }
        }
    }

    /// Applies all queued candidates in arrival order, then marks the
    /// coordinator ready. Returns the number the endpoint accepted.
    pub async fn flush_pending_candidates(&self) -> Result<usize> {
        if !self.descriptions.lock().exchange_complete() {
            return Err(CallError::Negotiation(
                "cannot flush candidates before the description exchange completes".into(),
            ));
        }
        let transport = self.current_transport().await?;

        let mut applied = 0;
        loop {
            let batch = self.state.lock().next_flush_batch();
            let Some(batch) = batch else { break };
            applied += apply_batch(transport.as_ref(), batch, &self.cancel).await?;
        }
        tracing::debug!(applied, "pending candidates flushed, ready");
        Ok(applied)
    }

    /// Locally discovered candidates, already deduplicated, for publishing.
    /// Can be taken once.
    pub fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<CandidateDescriptor>> {
        self.local_candidates_rx.lock().take()
    }

    /// Moves the session to the terminal `failed` state. Returns `false` if
    /// it had already ended.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.settle(Outcome::Failed(reason.into()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Runs `handler` once the call connects. The task ends with the coordinator.
    pub fn on_connected<H>(&self, mut handler: H) -> tokio::task::JoinHandle<()>
    where
        H: FnMut() + Send + 'static,
    {
        self.events.observe(
            |event| matches!(event, CallEvent::Connected).then_some(()),
            move |()| handler(),
        )
    }

    pub fn on_failed<H>(&self, handler: H) -> tokio::task::JoinHandle<()>
    where
        H: FnMut(String) + Send + 'static,
    {
        self.events.observe(
            |event| match event {
                CallEvent::Failed { reason } => Some(reason),
                _ => None,
            },
            handler,
        )
    }

    pub fn on_remote_stream<H>(&self, handler: H) -> tokio::task::JoinHandle<()>
    where
        H: FnMut(RemoteMediaStream) + Send + 'static,
    {
        self.events.observe(
            |event| match event {
                CallEvent::RemoteStream(stream) => Some(stream),
                _ => None,
            },
            handler,
        )
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().is_ready()
    }

    pub fn pending_candidates(&self) -> Vec<CandidateDescriptor> {
        self.state.lock().pending().to_vec()
    }

    pub fn local_offer(&self) -> Option<SessionDescription> {
        self.descriptions.lock().local_offer.clone()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.lock().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.lock().is_some()
    }

    pub fn remote_stream(&self) -> Option<RemoteMediaStream> {
        self.remote_stream.lock().clone()
    }

    pub fn local_media(&self) -> Option<&LocalMediaStream> {
        self.local_media.as_ref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels every suspended operation and closes the endpoint.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            transport.close().await?;
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }
        if let Some(outcome) = self.outcome.lock().as_ref() {
            return Err(CallError::Negotiation(format!(
                "session already ended: {outcome:?}"
            )));
        }
        Ok(())
    }

    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CallError::Cancelled),
            res = fut => res,
        }
    }

    async fn current_transport(&self) -> Result<Arc<dyn PeerTransport>> {
        self.transport
            .lock()
            .await
            .clone()
            .ok_or_else(|| CallError::Negotiation("no transport endpoint".into()))
    }

    async fn ensure_transport(self: &Arc<Self>) -> Result<Arc<dyn PeerTransport>> {
        let mut slot = self.transport.lock().await;
        if let Some(transport) = slot.as_ref() {
            return Ok(transport.clone());
        }

        let transport = self
            .guarded(self.factory.create(&self.stun_servers))
            .await
            .map_err(|e| match e {
                CallError::Cancelled | CallError::Negotiation(_) => e,
                other => CallError::Negotiation(format!("failed to create endpoint: {other}")),
            })?;

        // Subscribe before anything can make the endpoint gather.
        let rx = transport.subscribe();
        tokio::spawn(Self::pump(Arc::downgrade(self), rx, self.cancel.clone()));

        if let Some(media) = &self.local_media {
            for track in &media.tracks {
                self.guarded(transport.add_track(track)).await?;
            }
            tracing::debug!(stream = %media.id, tracks = media.tracks.len(), "local tracks registered");
        }

        *slot = Some(transport.clone());
        Ok(transport)
    }

    async fn pump(
        this: Weak<Self>,
        mut rx: broadcast::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(event) => {
                    let Some(this) = this.upgrade() else { break };
                    this.handle_transport_event(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "transport events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.state.lock().mark_local(&candidate) {
                    dump_candidate("LOCAL", &candidate);
                    let _ = self.local_candidates_tx.send(candidate);
                }
            }
            TransportEvent::ConnectionState(state) => {
                tracing::debug!(%state, "connection state");
                if !state.is_terminal() {
                    return;
                }
                let outcome = if state == ConnectionState::Connected {
                    Outcome::Connected
                } else {
                    Outcome::Failed(
                        CallError::TransportFailure("connection failed".into()).to_string(),
                    )
                };
                self.settle(outcome);
            }
            TransportEvent::Track(track) => self.add_remote_track(track),
        }
    }

    fn add_remote_track(&self, track: RemoteTrack) {
        let snapshot = {
            let mut slot = self.remote_stream.lock();
            let stream = slot.get_or_insert_with(RemoteMediaStream::default);
            if !stream.add_track(track) {
                return;
            }
            stream.clone()
        };
        self.events.emit(CallEvent::RemoteStream(snapshot));
    }

    fn settle(&self, outcome: Outcome) -> bool {
        {
            let mut slot = self.outcome.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome.clone());
        }
        analyze_candidates(self.state.lock().gathered());
        match outcome {
            Outcome::Connected => {
                tracing::info!("connection established");
                self.events.emit(CallEvent::Connected);
            }
            Outcome::Failed(reason) => {
                tracing::warn!(%reason, "connection failed");
                self.events.emit(CallEvent::Failed { reason });
            }
        }
        true
    }
}
