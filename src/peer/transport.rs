use crate::error::{CallError, Result};
use crate::media::{LocalTrack, RemoteTrack};
use crate::peer::types::{CandidateDescriptor, ConnectionState, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const TRANSPORT_EVENT_CAPACITY: usize = 128;

/// Notifications pushed by a transport endpoint.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionState(ConnectionState),
    /// A local network path was discovered.
    LocalCandidate(CandidateDescriptor),
    /// A remote media track arrived.
    Track(RemoteTrack),
}

/// Peer-connection abstraction driven by the coordinator.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: CandidateDescriptor) -> Result<()>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Subscribes to endpoint notifications. Events emitted before the call
    /// are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    async fn close(&self) -> Result<()>;
}

/// Creates transport endpoints configured with a fixed STUN server list.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, stun_servers: &[String]) -> Result<Arc<dyn PeerTransport>>;
}

/// [`PeerTransport`] on top of the `webrtc` crate.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: broadcast::Sender<TransportEvent>,
}

impl WebRtcTransport {
    pub async fn new(stun_servers: &[String]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::Negotiation(format!("failed to register codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| CallError::Negotiation(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(stun_servers))
                .await
                .map_err(|e| {
                    CallError::Negotiation(format!("failed to create peer connection: {e}"))
                })?,
        );
        let (events, _) = broadcast::channel(TRANSPORT_EVENT_CAPACITY);

        let transport = Self { pc, events };
        transport.wire_handlers();
        Ok(transport)
    }

    fn wire_handlers(&self) {
        let tx = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let _ = tx.send(TransportEvent::LocalCandidate(init.into()));
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to serialize local candidate"),
                    },
                    None => tracing::debug!("ICE candidate gathering completed"),
                }
                Box::pin(async {})
            }));

        self.pc.on_ice_gathering_state_change(Box::new(move |state| {
            tracing::debug!(?state, "ICE gathering state changed");
            Box::pin(async {})
        }));

        let tx = self.events.clone();
        let pc_stats = Arc::downgrade(&self.pc);
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                tracing::debug!(state = ?st, "peer connection state changed");
                if st == RTCPeerConnectionState::Failed {
                    if let Some(pc) = pc_stats.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                }
                let _ = tx.send(TransportEvent::ConnectionState(st.into()));
                Box::pin(async {})
            }));

        let tx = self.events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                tracing::debug!(id = %track.id(), kind = ?track.kind(), "remote track");
                let _ = tx.send(TransportEvent::Track(RemoteTrack::from_rtc(track)));
                Box::pin(async {})
            },
        ));
    }

    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        self.pc.clone()
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        SessionDescription::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        SessionDescription::from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateDescriptor) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let sender = self.pc.add_track(rtc_track).await?;

        // RTCP must be drained for interceptors (NACK, reports) to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcTransportFactory;

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, stun_servers: &[String]) -> Result<Arc<dyn PeerTransport>> {
        let transport = WebRtcTransport::new(stun_servers).await?;
        Ok(Arc::new(transport))
    }
}

/// STUN-only configuration; no relay servers, no credentials.
fn rtc_config(stun_servers: &[String]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: if stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }]
        },
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Logs the nominated candidate pair from `getStats`.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                tracing::info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}
