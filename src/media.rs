//! Local capture lifecycle and the projection of inbound tracks.

use crate::error::MediaError;
use crate::peer::types::{MediaKind, RemoteTrack};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Capture preferences recognized by `acquire`. Anything else a caller may
/// want is an application concern, not a negotiation one.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints {
                width: 1280,
                height: 720,
            }),
            audio: true,
        }
    }
}

/// One captured outbound track plus the hook to stop its device pump.
pub trait CaptureTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// The handle that gets attached to the connection resource.
    fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync>;
    /// Stops capture. Idempotent.
    fn stop(&self);
}

/// Device-acquisition collaborator. Failing must leave no track half-open.
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    async fn open(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn CaptureTrack>>, MediaError>;
}

/// Sample-fed capture track (Opus audio or VP8 video). The embedding
/// application pumps samples into `sample_track` from whatever capture
/// source it owns; that pump is the out-of-scope device collaborator.
pub struct SampleTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl SampleTrack {
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl CaptureTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Default device backend: builds sample-fed local tracks sized by the
/// constraints.
pub struct SampleCapture;

#[async_trait]
impl CaptureDevices for SampleCapture {
    async fn open(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn CaptureTrack>>, MediaError> {
        if !constraints.audio && constraints.video.is_none() {
            return Err(MediaError::Unavailable {
                reason: "constraints request no tracks".into(),
            });
        }

        let mut tracks: Vec<Arc<dyn CaptureTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(SampleTrack {
                id: "audio0".into(),
                kind: MediaKind::Audio,
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        ..Default::default()
                    },
                    "audio0".to_owned(),
                    "capture".to_owned(),
                )),
                stopped: AtomicBool::new(false),
            }));
        }
        if let Some(video) = constraints.video {
            tracks.push(Arc::new(SampleTrack {
                id: format!("video0-{}x{}", video.width, video.height),
                kind: MediaKind::Video,
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90000,
                        ..Default::default()
                    },
                    "video0".to_owned(),
                    "capture".to_owned(),
                )),
                stopped: AtomicBool::new(false),
            }));
        }
        Ok(tracks)
    }
}

/// Owns the capture device handles for this participant. At most one source
/// is active per process; it survives session teardown until the user stops
/// sharing.
pub struct LocalMediaSource {
    devices: Arc<dyn CaptureDevices>,
    tracks: Vec<Arc<dyn CaptureTrack>>,
    active: bool,
}

impl LocalMediaSource {
    pub fn new(devices: Arc<dyn CaptureDevices>) -> Self {
        Self {
            devices,
            tracks: Vec::new(),
            active: false,
        }
    }

    /// Opens devices for `constraints`. On failure the current source stays
    /// untouched; on success any previously active source is stopped before
    /// the new handles are recorded, so two never coexist.
    pub async fn acquire(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<&[Arc<dyn CaptureTrack>], MediaError> {
        let fresh = self.devices.open(constraints).await?;
        self.release();
        log::info!("local capture active with {} track(s)", fresh.len());
        self.tracks = fresh;
        self.active = true;
        Ok(&self.tracks)
    }

    /// Stops every owned track and clears the active flag. Safe to call when
    /// nothing is active.
    pub fn release(&mut self) {
        for track in self.tracks.drain(..) {
            track.stop();
        }
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn tracks(&self) -> &[Arc<dyn CaptureTrack>] {
        &self.tracks
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

/// Inbound tracks for one session: a read-only projection the rendering
/// layer consumes. Entries appear as the transport reports them.
#[derive(Debug, Default)]
pub struct RemoteMediaSink {
    tracks: Vec<RemoteTrack>,
}

impl RemoteMediaSink {
    pub fn record(&mut self, track: RemoteTrack) {
        if self.tracks.iter().any(|t| t.id == track.id) {
            log::debug!("duplicate remote track {} ignored", track.id);
            return;
        }
        log::info!("remote {:?} track {} available", track.kind, track.id);
        self.tracks.push(track);
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}
