use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::MediaError;
use crate::transport::MediaKind;

/// Logical sender slot; a peer carries at most one sender per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackSlot {
    Audio,
    Camera,
    Screen,
    ScreenAudio,
}

impl TrackSlot {
    pub const ALL: [TrackSlot; 4] = [
        TrackSlot::Audio,
        TrackSlot::Camera,
        TrackSlot::Screen,
        TrackSlot::ScreenAudio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrackSlot::Audio => "audio",
            TrackSlot::Camera => "camera",
            TrackSlot::Screen => "screen",
            TrackSlot::ScreenAudio => "screen-audio",
        }
    }

    pub fn media_kind(self) -> MediaKind {
        match self {
            TrackSlot::Audio | TrackSlot::ScreenAudio => MediaKind::Audio,
            TrackSlot::Camera | TrackSlot::Screen => MediaKind::Video,
        }
    }

    pub fn stream_id(self) -> &'static str {
        match self {
            TrackSlot::Audio | TrackSlot::Camera => "parley-camera",
            TrackSlot::Screen | TrackSlot::ScreenAudio => "parley-screen",
        }
    }

    /// Screen slots are added and removed outright; the others keep their sender
    /// and swap tracks in place.
    pub fn removed_on_stop(self) -> bool {
        matches!(self, TrackSlot::Screen | TrackSlot::ScreenAudio)
    }
}

impl fmt::Display for TrackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally captured track shared by every peer sender it is attached to.
pub struct LocalTrack {
    id: String,
    slot: TrackSlot,
    label: String,
    enabled: AtomicBool,
    ended: CancellationToken,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(slot: TrackSlot, label: impl Into<String>) -> Arc<Self> {
        let id = format!("{}-{}", slot.as_str(), Uuid::new_v4());
        let mime_type = match slot.media_kind() {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            slot.stream_id().to_owned(),
        ));
        Arc::new(Self {
            id,
            slot,
            label: label.into(),
            enabled: AtomicBool::new(true),
            ended: CancellationToken::new(),
            rtp,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn slot(&self) -> TrackSlot {
        self.slot
    }

    pub fn kind(&self) -> MediaKind {
        self.slot.media_kind()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stream_id(&self) -> &str {
        self.slot.stream_id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Mute toggle. Senders keep the track; disabled tracks simply stop emitting.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Marks the track ended. Capture drivers call this when the source goes away.
    pub fn stop(&self) {
        self.ended.cancel();
    }

    pub async fn ended(&self) {
        self.ended.cancelled().await;
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    /// Pushes one encoded sample. Returns false when the track is muted.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        if self.is_ended() {
            return Err(MediaError::TrackEnded(self.id.clone()));
        }
        if !self.is_enabled() {
            return Ok(false);
        }
        self.rtp
            .write_sample(sample)
            .await
            .map_err(|err| MediaError::Sample(err.to_string()))?;
        Ok(true)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn slots_map_to_kinds_and_streams() {
        assert_eq!(TrackSlot::ScreenAudio.media_kind(), MediaKind::Audio);
        assert_eq!(TrackSlot::Camera.stream_id(), TrackSlot::Audio.stream_id());
        assert!(TrackSlot::Screen.removed_on_stop());
        assert!(!TrackSlot::Camera.removed_on_stop());
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let a = LocalTrack::new(TrackSlot::Camera, "cam");
        let b = LocalTrack::new(TrackSlot::Camera, "cam");
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("camera-"));
    }

    #[tokio::test]
    async fn muted_track_skips_samples() {
        let track = LocalTrack::new(TrackSlot::Audio, "mic");
        let sample = Sample {
            data: Bytes::from_static(&[0u8; 4]),
            duration: Duration::from_millis(20),
            ..Default::default()
        };
        track.set_enabled(false);
        assert!(!track.write_sample(&sample).await.expect("muted write"));
        track.set_enabled(true);
        assert!(track.write_sample(&sample).await.expect("live write"));
        track.stop();
        assert!(matches!(
            track.write_sample(&sample).await,
            Err(MediaError::TrackEnded(_))
        ));
    }
}
