//! Local and remote media streams and the capture collaborator.
//!
//! The core never captures frames itself. A [`MediaSource`] turns a
//! [`MediaSourceRequest`] into a [`LocalMediaStream`] whose tracks an external
//! capture pipeline feeds with encoded samples.

use crate::error::{CallError, Result};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            RTPCodecType::Unspecified => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Camera,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    /// Requested horizontal resolution; `None` lets the source decide.
    pub width: Option<u32>,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            width: None,
            audio: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSourceRequest {
    pub kind: MediaKind,
    pub constraints: MediaConstraints,
}

impl MediaSourceRequest {
    pub fn camera(constraints: MediaConstraints) -> Self {
        Self {
            kind: MediaKind::Camera,
            constraints,
        }
    }

    pub fn screen(constraints: MediaConstraints) -> Self {
        Self {
            kind: MediaKind::Screen,
            constraints,
        }
    }
}

/// A sendable track backed by a sample writer.
#[derive(Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.into(),
        ));
        Self { id, kind, track }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Pushes one encoded frame. Frames written before the track is bound to
    /// a connected transport are dropped by the sample writer.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| CallError::TransportFailure(e.to_string()))
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LocalMediaStream {
    pub id: String,
    pub source: MediaKind,
    pub tracks: Vec<LocalTrack>,
}

impl LocalMediaStream {
    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Video)
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Audio)
    }
}

/// A track received from the peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    rtp: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    /// Track known only by its identifiers, as reported by a non-RTP transport.
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            rtp: None,
        }
    }

    pub fn from_rtc(track: Arc<TrackRemote>) -> Self {
        let kind = TrackKind::from_codec_type(track.kind()).unwrap_or(TrackKind::Video);
        Self {
            id: track.id().to_string(),
            stream_id: track.stream_id().to_string(),
            kind,
            rtp: Some(track),
        }
    }

    /// RTP reader for rendering, when the transport is WebRTC.
    pub fn rtp(&self) -> Option<&Arc<TrackRemote>> {
        self.rtp.as_ref()
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Remote tracks collected into one stream, created on the first track.
#[derive(Debug, Clone, Default)]
pub struct RemoteMediaStream {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteMediaStream {
    /// Adds a track unless one with the same id is already present.
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }
}

/// Capture collaborator: camera or screen.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, request: &MediaSourceRequest) -> Result<LocalMediaStream>;
}

/// Builds VP8 video and Opus audio sample tracks for an external capture
/// pipeline to feed.
#[derive(Debug, Clone)]
pub struct SampleTrackSource {
    allow_camera: bool,
    allow_screen: bool,
}

impl SampleTrackSource {
    pub fn new() -> Self {
        Self {
            allow_camera: true,
            allow_screen: true,
        }
    }

    pub fn camera_only() -> Self {
        Self {
            allow_camera: true,
            allow_screen: false,
        }
    }
}

impl Default for SampleTrackSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for SampleTrackSource {
    async fn acquire(&self, request: &MediaSourceRequest) -> Result<LocalMediaStream> {
        let allowed = match request.kind {
            MediaKind::Camera => self.allow_camera,
            MediaKind::Screen => self.allow_screen,
        };
        if !allowed {
            return Err(CallError::MediaAcquisition(format!(
                "{:?} capture is not available",
                request.kind
            )));
        }
        if request.constraints.width == Some(0) {
            return Err(CallError::MediaAcquisition(
                "requested video width must be positive".into(),
            ));
        }

        let stream_id = format!("peercall-{}", random_id());
        let mut tracks = vec![LocalTrack::new(
            TrackKind::Video,
            format!("video-{}", random_id()),
            stream_id.clone(),
        )];
        if request.constraints.audio {
            tracks.push(LocalTrack::new(
                TrackKind::Audio,
                format!("audio-{}", random_id()),
                stream_id.clone(),
            ));
        }
        tracing::debug!(
            stream = %stream_id,
            source = ?request.kind,
            width = ?request.constraints.width,
            tracks = tracks.len(),
            "local media acquired"
        );

        Ok(LocalMediaStream {
            id: stream_id,
            source: request.kind,
            tracks,
        })
    }
}
