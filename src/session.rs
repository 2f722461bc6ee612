//! The call surface a front end drives: listen, run camera, share screen, and
//! observe status text plus local and remote streams.

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::events::CallEvent;
use crate::identity::{FileIdentityStore, IdentityStore};
use crate::media::{
    LocalMediaStream, MediaConstraints, MediaSource, MediaSourceRequest, RemoteMediaStream,
    SampleTrackSource,
};
use crate::peer::connection::{ConnectionCoordinator, Outcome};
use crate::peer::transport::{TransportFactory, WebRtcTransportFactory};
use crate::peer::types::SessionDescription;
use crate::signaling::{
    decide_role, RecordField, RecordStore, RoleDecision, SignalingChannel, Subscription,
};
use crate::utils::now_millis;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

pub const FEEDBACK_INITIALIZING: &str = "Connection initializing...";
pub const FEEDBACK_ESTABLISHED: &str = "Connection established";
pub const FEEDBACK_FAILED: &str = "Connection failed please reload page and try again";

/// Which side of the handshake this peer ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// State of the call started by the last `start_stream`.
struct ActiveCall {
    coordinator: Arc<ConnectionCoordinator>,
    candidates: Option<Subscription>,
    cancel: CancellationToken,
}

/// One user's side of a call in a single room.
///
/// At most one call runs at a time. A call that ended `failed` is released,
/// so the next `run_camera`/`share_screen` starts over from scratch.
pub struct CallSession {
    config: CallConfig,
    identity: Arc<dyn IdentityStore>,
    media: Arc<dyn MediaSource>,
    transports: Arc<dyn TransportFactory>,
    channel: Arc<SignalingChannel>,
    feedback: watch::Sender<Option<String>>,
    local_stream: Mutex<Option<LocalMediaStream>>,
    remote_stream: watch::Sender<Option<RemoteMediaStream>>,
    active: Mutex<Option<ActiveCall>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        store: Arc<dyn RecordStore>,
        identity: Arc<dyn IdentityStore>,
        media: Arc<dyn MediaSource>,
        transports: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let channel = Arc::new(SignalingChannel::new(
            config.room_id.clone(),
            store,
            config.record_ttl,
        ));
        Arc::new(Self {
            config,
            identity,
            media,
            transports,
            channel,
            feedback: watch::channel(None).0,
            local_stream: Mutex::new(None),
            remote_stream: watch::channel(None).0,
            active: Mutex::new(None),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// WebRTC transport, sample-track media and a file-backed identity.
    pub fn with_defaults(config: CallConfig, store: Arc<dyn RecordStore>) -> Arc<Self> {
        let identity = Arc::new(FileIdentityStore::new(config.identity_path.clone()));
        Self::new(
            config,
            store,
            identity,
            Arc::new(SampleTrackSource::new()),
            Arc::new(WebRtcTransportFactory),
        )
    }

    /// Clears the room, waits for a peer's offer and answers it with the
    /// camera unless a call was started in the meantime.
    pub async fn listen_connection(self: &Arc<Self>) -> Result<()> {
        self.channel.dispose().await?;
        tracing::info!(room = %self.channel.room(), "listening for an offer");
        self.channel
            .subscribe_until(RecordField::Offer, &self.cancel)
            .await?;

        if self.started.load(Ordering::SeqCst) {
            tracing::debug!("offer arrived but a call is already running");
            return Ok(());
        }
        self.run_camera(MediaConstraints::default()).await.map(|_| ())
    }

    pub async fn run_camera(self: &Arc<Self>, constraints: MediaConstraints) -> Result<Role> {
        self.start_stream(MediaSourceRequest::camera(constraints))
            .await
    }

    pub async fn share_screen(self: &Arc<Self>, constraints: MediaConstraints) -> Result<Role> {
        self.start_stream(MediaSourceRequest::screen(constraints))
            .await
    }

    /// Acquires media, then joins or starts the negotiation in the room.
    pub async fn start_stream(self: &Arc<Self>, request: MediaSourceRequest) -> Result<Role> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CallError::Negotiation("a call is already running".into()));
        }

        let media = match self.media.acquire(&request).await {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(error = %e, "media acquisition failed");
                self.set_feedback(format!("Unable to start {:?} capture: {e}", request.kind));
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.local_stream.lock() = Some(media.clone());
        self.set_feedback(FEEDBACK_INITIALIZING);

        let call_cancel = self.cancel.child_token();
        // Handshake waits stop as soon as the call settles either way.
        let negotiation = call_cancel.child_token();
        let coordinator = ConnectionCoordinator::new(
            self.transports.clone(),
            self.config.stun_servers.clone(),
            Some(media),
            call_cancel.clone(),
        );
        self.spawn_status_watcher(coordinator.subscribe(), call_cancel.clone(), negotiation.clone());

        match self.negotiate(&coordinator, &call_cancel, &negotiation).await {
            Ok(role) => {
                tracing::info!(?role, room = %self.channel.room(), "negotiation complete");
                Ok(role)
            }
            Err(e) => {
                let e = match (e, coordinator.outcome()) {
                    (CallError::Cancelled, Some(Outcome::Failed(reason))) => {
                        CallError::CallFailed(reason)
                    }
                    (e, _) => e,
                };
                if e.is_terminal() {
                    coordinator.fail(e.to_string());
                }
                self.release(&coordinator).await;
                Err(e)
            }
        }
    }

    async fn negotiate(
        self: &Arc<Self>,
        coordinator: &Arc<ConnectionCoordinator>,
        call_cancel: &CancellationToken,
        negotiation: &CancellationToken,
    ) -> Result<Role> {
        let local_id = self.identity.get_or_create()?;

        *self.active.lock() = Some(ActiveCall {
            coordinator: coordinator.clone(),
            candidates: None,
            cancel: call_cancel.clone(),
        });
        let (published_tx, published_rx) = watch::channel(false);
        self.spawn_candidate_publisher(coordinator, published_rx, call_cancel.clone());

        let role = self
            .process_connection(coordinator, &local_id, &published_tx, negotiation)
            .await?;
        coordinator.flush_pending_candidates().await?;
        Ok(role)
    }

    /// Feeds peer candidates from the record into the coordinator. Snapshots
    /// that carry a different offer belong to another negotiation and are
    /// skipped.
    fn attach_candidates(
        &self,
        coordinator: &Arc<ConnectionCoordinator>,
        offer: SessionDescription,
    ) -> Result<()> {
        if coordinator.is_terminal() {
            return Ok(());
        }
        let subscription = {
            let coordinator = coordinator.clone();
            self.channel.subscribe(move |record| {
                let coordinator = coordinator.clone();
                let current = record.offer.as_ref() == Some(&offer);
                async move {
                    if !current {
                        tracing::debug!("skipping candidates of a superseded record");
                        return;
                    }
                    for candidate in record.candidates {
                        if let Err(e) = coordinator.submit_candidate(candidate).await {
                            tracing::warn!(error = %e, "failed to apply remote candidate");
                        }
                    }
                }
            })?
        };
        if let Some(call) = self.active.lock().as_mut() {
            call.candidates = Some(subscription);
        }
        Ok(())
    }

    /// Closes the endpoint of a call that did not complete and allows a new
    /// start.
    async fn release(&self, coordinator: &ConnectionCoordinator) {
        let subscription = self
            .active
            .lock()
            .as_mut()
            .and_then(|call| call.candidates.take());
        drop(subscription);
        if let Err(e) = coordinator.close().await {
            tracing::warn!(error = %e, "failed to close endpoint");
        }
        self.started.store(false, Ordering::SeqCst);
    }

    async fn process_connection(
        &self,
        coordinator: &Arc<ConnectionCoordinator>,
        local_id: &str,
        published: &watch::Sender<bool>,
        cancel: &CancellationToken,
    ) -> Result<Role> {
        let record = self.channel.fetch_once().await?;
        match decide_role(record.as_ref(), local_id, now_millis()) {
            RoleDecision::Respond(offer) => {
                let answer = coordinator.accept_remote_offer(offer.clone()).await?;
                self.channel.publish_answer(answer).await?;
                published.send_replace(true);
                self.attach_candidates(coordinator, offer)?;
                return Ok(Role::Responder);
            }
            RoleDecision::ReclaimOwn => {
                tracing::info!(room = %self.channel.room(), "discarding our own leftover offer");
                self.channel.dispose().await?;
            }
            RoleDecision::Initiate => {}
        }

        let offer = coordinator.start_as_initiator().await?;
        self.channel.publish_offer(offer.clone(), local_id).await?;
        published.send_replace(true);
        self.attach_candidates(coordinator, offer)?;

        let record = self
            .channel
            .subscribe_until(RecordField::Answer, cancel)
            .await?;
        let answer = record
            .answer
            .ok_or_else(|| CallError::Negotiation("answer vanished from record".into()))?;
        coordinator.establish_remote_answer(answer).await?;
        Ok(Role::Initiator)
    }

    /// Forwards local candidates to the record once our description is in it.
    /// Writing earlier would let the offer overwrite them.
    fn spawn_candidate_publisher(
        self: &Arc<Self>,
        coordinator: &Arc<ConnectionCoordinator>,
        mut published: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) {
        let Some(mut local) = coordinator.take_local_candidates() else {
            return;
        };
        let channel = self.channel.clone();
        let coordinator = Arc::downgrade(coordinator);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                gate = async { published.wait_for(|published| *published).await.map(|_| ()) } => {
                    if gate.is_err() {
                        return;
                    }
                }
            }
            loop {
                let candidate = tokio::select! {
                    _ = cancel.cancelled() => break,
                    candidate = local.recv() => candidate,
                };
                let Some(candidate) = candidate else { break };
                let Some(coordinator) = coordinator.upgrade() else { break };
                if coordinator.is_terminal() {
                    break;
                }
                if let Err(e) = channel.append_candidate(candidate).await {
                    coordinator.fail(e.to_string());
                    break;
                }
            }
        });
    }

    fn spawn_status_watcher(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<CallEvent>,
        cancel: CancellationToken,
        negotiation: CancellationToken,
    ) {
        let session: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                // Events already emitted win over cancellation.
                let event = tokio::select! {
                    biased;
                    event = events.recv() => event,
                    _ = cancel.cancelled() => break,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(session) = session.upgrade() else { break };
                match event {
                    CallEvent::Connected => {
                        negotiation.cancel();
                        session.set_feedback(FEEDBACK_ESTABLISHED);
                        session.finish_signaling().await;
                    }
                    CallEvent::Failed { reason } => {
                        tracing::warn!(%reason, "call failed");
                        negotiation.cancel();
                        session.set_feedback(FEEDBACK_FAILED);
                        session.finish_signaling().await;
                    }
                    CallEvent::RemoteStream(stream) => {
                        session.remote_stream.send_replace(Some(stream));
                    }
                }
            }
        });
    }

    /// Stops listening for candidates and deletes the room record.
    async fn finish_signaling(&self) {
        let subscription = self
            .active
            .lock()
            .as_mut()
            .and_then(|call| call.candidates.take());
        drop(subscription);
        if let Err(e) = self.channel.dispose().await {
            tracing::warn!(error = %e, "failed to dispose session record");
        }
    }

    /// Ends the current call: cancels pending work, closes the endpoint and
    /// deletes the room record. A new call can be started afterwards.
    pub async fn hang_up(&self) -> Result<()> {
        let call = self.active.lock().take();
        if let Some(call) = call {
            call.cancel.cancel();
            drop(call.candidates);
            call.coordinator.close().await?;
        }
        self.channel.dispose().await?;
        self.local_stream.lock().take();
        self.remote_stream.send_replace(None);
        self.started.store(false, Ordering::SeqCst);
        tracing::info!(room = %self.channel.room(), "hung up");
        Ok(())
    }

    fn set_feedback(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%message, "feedback");
        self.feedback.send_replace(Some(message));
    }

    pub fn feedback_message(&self) -> Option<String> {
        self.feedback.borrow().clone()
    }

    pub fn watch_feedback(&self) -> watch::Receiver<Option<String>> {
        self.feedback.subscribe()
    }

    pub fn local_media_stream(&self) -> Option<LocalMediaStream> {
        self.local_stream.lock().clone()
    }

    pub fn remote_media_stream(&self) -> Option<RemoteMediaStream> {
        self.remote_stream.borrow().clone()
    }

    pub fn watch_remote_stream(&self) -> watch::Receiver<Option<RemoteMediaStream>> {
        self.remote_stream.subscribe()
    }

    pub fn coordinator(&self) -> Option<Arc<ConnectionCoordinator>> {
        self.active.lock().as_ref().map(|call| call.coordinator.clone())
    }

    pub fn channel(&self) -> &SignalingChannel {
        &self.channel
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
