//! Local capture state and previews.
//!
//! [`TrackManager`] owns at most one live track per [`TrackSlot`]. Its mutators return
//! the slot changes so the mesh can push them onto every peer sender.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OnceCell, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod classify;
mod track;

pub use classify::{
    KeywordClassifier, RemoteStreams, StreamClass, TrackClassifier, default_classifier,
};
pub use track::{LocalTrack, TrackSlot};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("microphone unavailable: {0}")]
    AudioUnavailable(String),
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("display capture unavailable: {0}")]
    DisplayUnavailable(String),
    #[error("media acquisition cancelled")]
    Cancelled,
    #[error("track {0} has ended")]
    TrackEnded(String),
    #[error("failed to write sample: {0}")]
    Sample(String),
}

/// Video plus optional system audio from one display capture.
#[derive(Debug, Clone)]
pub struct DisplayCapture {
    pub video: Arc<LocalTrack>,
    pub audio: Option<Arc<LocalTrack>>,
}

/// Permission-gated capture sources.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self) -> Result<Arc<LocalTrack>, MediaError>;
    async fn open_camera(&self, device_id: Option<&str>) -> Result<Arc<LocalTrack>, MediaError>;
    async fn open_display(&self) -> Result<DisplayCapture, MediaError>;
}

/// Headless environments: every acquisition fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMediaDevices;

#[async_trait]
impl MediaDevices for NoMediaDevices {
    async fn open_microphone(&self) -> Result<Arc<LocalTrack>, MediaError> {
        Err(MediaError::AudioUnavailable("no capture devices".into()))
    }

    async fn open_camera(&self, _device_id: Option<&str>) -> Result<Arc<LocalTrack>, MediaError> {
        Err(MediaError::CameraUnavailable("no capture devices".into()))
    }

    async fn open_display(&self) -> Result<DisplayCapture, MediaError> {
        Err(MediaError::DisplayUnavailable("no capture devices".into()))
    }
}

/// One slot transition to apply to every peer.
#[derive(Debug, Clone)]
pub struct TrackChange {
    pub slot: TrackSlot,
    pub track: Option<Arc<LocalTrack>>,
}

/// Tracks of one local preview aggregate.
#[derive(Debug, Clone, Default)]
pub struct PreviewBundle {
    tracks: Vec<Arc<LocalTrack>>,
}

impl PreviewBundle {
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn track_ids(&self) -> Vec<&str> {
        self.tracks.iter().map(|t| t.id()).collect()
    }

    /// Removes unwanted tracks and appends missing ones. Returns whether anything changed.
    pub fn sync(&mut self, wanted: &[Arc<LocalTrack>]) -> bool {
        let before = self.tracks.len();
        self.tracks
            .retain(|t| wanted.iter().any(|w| w.id() == t.id()));
        let mut changed = self.tracks.len() != before;
        for track in wanted {
            if !self.tracks.iter().any(|t| t.id() == track.id()) {
                self.tracks.push(Arc::clone(track));
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalPreviews {
    /// Microphone plus camera.
    pub camera: PreviewBundle,
    /// Screen video plus screen audio.
    pub screen: PreviewBundle,
}

#[derive(Default)]
struct LiveTracks {
    audio: Option<Arc<LocalTrack>>,
    camera: Option<Arc<LocalTrack>>,
    screen: Option<Arc<LocalTrack>>,
    screen_audio: Option<Arc<LocalTrack>>,
}

impl LiveTracks {
    fn get(&self, slot: TrackSlot) -> Option<&Arc<LocalTrack>> {
        match slot {
            TrackSlot::Audio => self.audio.as_ref(),
            TrackSlot::Camera => self.camera.as_ref(),
            TrackSlot::Screen => self.screen.as_ref(),
            TrackSlot::ScreenAudio => self.screen_audio.as_ref(),
        }
    }

    fn camera_bundle(&self) -> Vec<Arc<LocalTrack>> {
        [&self.audio, &self.camera]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn screen_bundle(&self) -> Vec<Arc<LocalTrack>> {
        [&self.screen, &self.screen_audio]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

pub struct TrackManager {
    devices: Arc<dyn MediaDevices>,
    /// Microphone track; only successful acquisitions are cached.
    audio: OnceCell<Arc<LocalTrack>>,
    live: Mutex<LiveTracks>,
    previews: watch::Sender<LocalPreviews>,
    cancel: CancellationToken,
}

impl TrackManager {
    pub fn new(devices: Arc<dyn MediaDevices>, cancel: CancellationToken) -> Self {
        let (previews, _) = watch::channel(LocalPreviews::default());
        Self {
            devices,
            audio: OnceCell::new(),
            live: Mutex::new(LiveTracks::default()),
            previews,
            cancel,
        }
    }

    pub fn previews(&self) -> watch::Receiver<LocalPreviews> {
        self.previews.subscribe()
    }

    /// Live tracks in slot order, for attaching to a freshly created peer.
    pub fn live_tracks(&self) -> Vec<(TrackSlot, Arc<LocalTrack>)> {
        let live = self.live.lock();
        TrackSlot::ALL
            .into_iter()
            .filter_map(|slot| live.get(slot).map(|t| (slot, Arc::clone(t))))
            .collect()
    }

    pub fn track(&self, slot: TrackSlot) -> Option<Arc<LocalTrack>> {
        self.live.lock().get(slot).cloned()
    }

    pub async fn ensure_audio_track(&self) -> Result<Arc<LocalTrack>, MediaError> {
        if self.cancel.is_cancelled() {
            return Err(MediaError::Cancelled);
        }
        let track = self
            .audio
            .get_or_try_init(|| async {
                let track = self.acquire(self.devices.open_microphone()).await?;
                info!(target: "parley::media", track_id = %track.id(), "microphone acquired");
                Ok::<_, MediaError>(track)
            })
            .await?
            .clone();
        {
            let mut live = self.live.lock();
            if live.audio.is_none() {
                live.audio = Some(Arc::clone(&track));
            }
        }
        self.resync_previews();
        Ok(track)
    }

    /// Returns false when no microphone track exists.
    pub fn set_mic_enabled(&self, enabled: bool) -> bool {
        match self.live.lock().audio.as_ref() {
            Some(track) => {
                track.set_enabled(enabled);
                debug!(target: "parley::media", enabled, "microphone toggled");
                true
            }
            None => false,
        }
    }

    /// Opens a camera, replacing and stopping any previous one.
    pub async fn start_camera(&self, device_id: Option<&str>) -> Result<TrackChange, MediaError> {
        let track = self.acquire(self.devices.open_camera(device_id)).await?;
        let previous = self.live.lock().camera.replace(Arc::clone(&track));
        if let Some(previous) = previous {
            previous.stop();
        }
        self.resync_previews();
        info!(target: "parley::media", track_id = %track.id(), "camera started");
        Ok(TrackChange {
            slot: TrackSlot::Camera,
            track: Some(track),
        })
    }

    pub fn stop_camera(&self) -> Option<TrackChange> {
        let previous = self.live.lock().camera.take()?;
        previous.stop();
        self.resync_previews();
        info!(target: "parley::media", track_id = %previous.id(), "camera stopped");
        Some(TrackChange {
            slot: TrackSlot::Camera,
            track: None,
        })
    }

    pub async fn start_screen_share(&self) -> Result<(DisplayCapture, Vec<TrackChange>), MediaError> {
        let capture = self.acquire(self.devices.open_display()).await?;
        let (old_video, old_audio) = {
            let mut live = self.live.lock();
            (
                live.screen.replace(Arc::clone(&capture.video)),
                std::mem::replace(&mut live.screen_audio, capture.audio.clone()),
            )
        };
        for old in [old_video, old_audio].into_iter().flatten() {
            old.stop();
        }
        self.resync_previews();
        info!(
            target: "parley::media",
            track_id = %capture.video.id(),
            with_audio = capture.audio.is_some(),
            "screen share started"
        );
        let changes = vec![
            TrackChange {
                slot: TrackSlot::Screen,
                track: Some(Arc::clone(&capture.video)),
            },
            TrackChange {
                slot: TrackSlot::ScreenAudio,
                track: capture.audio.clone(),
            },
        ];
        Ok((capture, changes))
    }

    pub fn stop_screen_share(&self) -> Vec<TrackChange> {
        let (video, audio) = {
            let mut live = self.live.lock();
            (live.screen.take(), live.screen_audio.take())
        };
        if video.is_none() && audio.is_none() {
            return Vec::new();
        }
        let mut changes = Vec::new();
        for (slot, track) in [(TrackSlot::Screen, video), (TrackSlot::ScreenAudio, audio)] {
            if let Some(track) = track {
                track.stop();
                changes.push(TrackChange { slot, track: None });
            }
        }
        self.resync_previews();
        info!(target: "parley::media", "screen share stopped");
        changes
    }

    /// Stops sharing only if `video_id` is still the live screen track.
    pub fn stop_screen_share_if_current(&self, video_id: &str) -> Vec<TrackChange> {
        let current = self
            .live
            .lock()
            .screen
            .as_ref()
            .is_some_and(|t| t.id() == video_id);
        if current {
            self.stop_screen_share()
        } else {
            Vec::new()
        }
    }

    /// Stops every local track and clears the previews.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let tracks = {
            let mut live = self.live.lock();
            std::mem::take(&mut *live)
        };
        for track in [tracks.audio, tracks.camera, tracks.screen, tracks.screen_audio]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
        if let Some(audio) = self.audio.get() {
            audio.stop();
        }
        self.resync_previews();
    }

    async fn acquire<T>(
        &self,
        acquisition: impl std::future::Future<Output = Result<T, MediaError>>,
    ) -> Result<T, MediaError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MediaError::Cancelled),
            result = acquisition => result,
        }
    }

    fn resync_previews(&self) {
        let (camera, screen) = {
            let live = self.live.lock();
            (live.camera_bundle(), live.screen_bundle())
        };
        self.previews.send_if_modified(|previews| {
            let camera_changed = previews.camera.sync(&camera);
            let screen_changed = previews.screen.sync(&screen);
            camera_changed || screen_changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDevices {
        microphone_calls: AtomicUsize,
        fail_microphone: bool,
    }

    #[async_trait]
    impl MediaDevices for CountingDevices {
        async fn open_microphone(&self) -> Result<Arc<LocalTrack>, MediaError> {
            self.microphone_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_microphone {
                return Err(MediaError::AudioUnavailable("denied".into()));
            }
            Ok(LocalTrack::new(TrackSlot::Audio, "Built-in Microphone"))
        }

        async fn open_camera(&self, device_id: Option<&str>) -> Result<Arc<LocalTrack>, MediaError> {
            Ok(LocalTrack::new(
                TrackSlot::Camera,
                device_id.unwrap_or("Default Camera"),
            ))
        }

        async fn open_display(&self) -> Result<DisplayCapture, MediaError> {
            Ok(DisplayCapture {
                video: LocalTrack::new(TrackSlot::Screen, "Screen 1"),
                audio: Some(LocalTrack::new(TrackSlot::ScreenAudio, "Screen audio")),
            })
        }
    }

    fn manager(devices: CountingDevices) -> (Arc<CountingDevices>, TrackManager) {
        let devices = Arc::new(devices);
        let manager = TrackManager::new(devices.clone(), CancellationToken::new());
        (devices, manager)
    }

    #[tokio::test]
    async fn microphone_is_acquired_once() {
        let (devices, manager) = manager(CountingDevices::default());
        let first = manager.ensure_audio_track().await.expect("first");
        let second = manager.ensure_audio_track().await.expect("second");
        assert_eq!(first.id(), second.id());
        assert_eq!(devices.microphone_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.previews().borrow().camera.track_ids(), [first.id()]);
    }

    #[tokio::test]
    async fn failed_microphone_is_not_cached() {
        let (devices, manager) = manager(CountingDevices {
            fail_microphone: true,
            ..Default::default()
        });
        assert!(matches!(
            manager.ensure_audio_track().await,
            Err(MediaError::AudioUnavailable(_))
        ));
        assert!(manager.ensure_audio_track().await.is_err());
        assert_eq!(devices.microphone_calls.load(Ordering::SeqCst), 2);
        assert!(!manager.set_mic_enabled(false));
    }

    #[tokio::test]
    async fn mute_keeps_track_attached() {
        let (_, manager) = manager(CountingDevices::default());
        let track = manager.ensure_audio_track().await.expect("audio");
        assert!(manager.set_mic_enabled(false));
        assert!(!track.is_enabled());
        assert_eq!(manager.live_tracks().len(), 1);
    }

    #[tokio::test]
    async fn switching_camera_stops_previous_track() {
        let (_, manager) = manager(CountingDevices::default());
        let first = manager.start_camera(None).await.expect("camera").track.expect("track");
        let second = manager
            .start_camera(Some("USB Camera"))
            .await
            .expect("camera")
            .track
            .expect("track");
        assert!(first.is_ended());
        assert!(!second.is_ended());
        assert_eq!(manager.previews().borrow().camera.track_ids(), [second.id()]);

        let change = manager.stop_camera().expect("stop");
        assert!(change.track.is_none());
        assert!(second.is_ended());
        assert!(manager.stop_camera().is_none());
    }

    #[tokio::test]
    async fn screen_share_fills_and_clears_screen_preview() {
        let (_, manager) = manager(CountingDevices::default());
        let (capture, changes) = manager.start_screen_share().await.expect("share");
        assert_eq!(changes.len(), 2);
        assert_eq!(manager.previews().borrow().screen.tracks().len(), 2);

        assert!(manager.stop_screen_share_if_current("other").is_empty());
        let changes = manager.stop_screen_share_if_current(capture.video.id());
        assert_eq!(changes.len(), 2);
        assert!(capture.video.is_ended());
        assert!(manager.previews().borrow().screen.tracks().is_empty());
    }

    #[test]
    fn preview_sync_is_idempotent() {
        let a = LocalTrack::new(TrackSlot::Audio, "mic");
        let b = LocalTrack::new(TrackSlot::Camera, "cam");
        let mut bundle = PreviewBundle::default();
        assert!(bundle.sync(&[a.clone(), b.clone()]));
        assert!(!bundle.sync(&[a.clone(), b.clone()]));
        assert!(bundle.sync(&[b.clone()]));
        assert_eq!(bundle.track_ids(), [b.id()]);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_and_stops_tracks() {
        let (_, manager) = manager(CountingDevices::default());
        let audio = manager.ensure_audio_track().await.expect("audio");
        manager.shutdown();
        assert!(audio.is_ended());
        assert!(manager.live_tracks().is_empty());
        assert!(matches!(
            manager.start_camera(None).await,
            Err(MediaError::Cancelled)
        ));
    }
}
