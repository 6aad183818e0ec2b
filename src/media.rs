//! Seam between the peer session and platform media capture. Device capture
//! is OS-specific, so it lives behind [`MediaDevices`]; the session only sees
//! local tracks and a stop signal.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    pub fn audio_video() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            video: false,
            audio: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no capture device found")]
    NotFound,
    #[error("capture device is busy")]
    Busy,
    /// Terminal: never retried, surfaced to the user immediately.
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("media capture failed: {0}")]
    Failed(String),
}

/// Local capture bundle. Stopping is observable so producers can halt their
/// sample pumps.
#[derive(Debug)]
pub struct LocalMedia {
    pub audio: Option<Arc<TrackLocalStaticSample>>,
    pub video: Option<Arc<TrackLocalStaticSample>>,
    stop: watch::Sender<bool>,
}

impl LocalMedia {
    pub fn new(
        audio: Option<Arc<TrackLocalStaticSample>>,
        video: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self { audio, video, stop }
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_live(&self) -> bool {
        !*self.stop.borrow()
    }

    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = Vec::new();
        if let Some(audio) = &self.audio {
            tracks.push(Arc::clone(audio) as Arc<dyn TrackLocal + Send + Sync>);
        }
        if let Some(video) = &self.video {
            tracks.push(Arc::clone(video) as Arc<dyn TrackLocal + Send + Sync>);
        }
        tracks
    }
}

/// A shared display/window source. `ended` flips when the user stops sharing,
/// at which point the session reverts to the camera track.
pub struct DisplayMedia {
    pub video: Arc<TrackLocalStaticSample>,
    ended: watch::Receiver<bool>,
}

impl DisplayMedia {
    /// Returns the handle plus the sender the producer flips when the shared
    /// source goes away.
    pub fn new(video: Arc<TrackLocalStaticSample>) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { video, ended: rx }, tx)
    }

    pub fn ended(&self) -> watch::Receiver<bool> {
        self.ended.clone()
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_capture(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
    async fn open_display(&self) -> Result<DisplayMedia, MediaError>;
}

/// Deployments without capture hardware (chat/whiteboard-only tutoring) still
/// negotiate a session; the data channel carries everything.
pub struct NoMediaDevices;

#[async_trait]
impl MediaDevices for NoMediaDevices {
    async fn open_capture(&self, _constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        Ok(LocalMedia::new(None, None))
    }

    async fn open_display(&self) -> Result<DisplayMedia, MediaError> {
        Err(MediaError::NotFound)
    }
}

pub fn opus_audio_track(id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        "tutorlink".to_owned(),
    ))
}

pub fn vp8_video_track(id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        "tutorlink".to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_media_stop_is_observable() {
        let media = LocalMedia::new(Some(opus_audio_track("audio")), None);
        let rx = media.stopped();
        assert!(media.is_live());
        media.stop();
        assert!(!media.is_live());
        assert!(*rx.borrow());
    }

    #[test]
    fn track_bundle_orders_audio_first() {
        let media = LocalMedia::new(Some(opus_audio_track("audio")), Some(vp8_video_track("video")));
        assert_eq!(media.tracks().len(), 2);
    }
}
