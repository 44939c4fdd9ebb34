use std::sync::Arc;

use crate::transport::RemoteTrack;

pub const DEFAULT_SCREEN_KEYWORDS: &[&str] = &["screen", "display", "window", "monitor"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamClass {
    Camera,
    Screen,
}

/// Decides which remote aggregate an inbound track joins.
pub trait TrackClassifier: Send + Sync {
    fn classify(&self, track: &RemoteTrack) -> StreamClass;
}

/// Case-insensitive label keyword match. Tracks matching no keyword are treated as
/// camera tracks, so unconventional screen labels land in the camera aggregate.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    keywords: Vec<String>,
}

impl KeywordClassifier {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .collect(),
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SCREEN_KEYWORDS.iter().copied())
    }
}

impl TrackClassifier for KeywordClassifier {
    fn classify(&self, track: &RemoteTrack) -> StreamClass {
        let label = track.label.to_lowercase();
        if self.keywords.iter().any(|k| label.contains(k.as_str())) {
            StreamClass::Screen
        } else {
            StreamClass::Camera
        }
    }
}

pub fn default_classifier() -> Arc<dyn TrackClassifier> {
    Arc::new(KeywordClassifier::default())
}

/// Inbound tracks of one peer, grouped by class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStreams {
    pub camera: Vec<RemoteTrack>,
    pub screen: Vec<RemoteTrack>,
}

impl RemoteStreams {
    /// Returns false when the track id is already known.
    pub fn add(&mut self, track: RemoteTrack, class: StreamClass) -> bool {
        let known = self
            .camera
            .iter()
            .chain(self.screen.iter())
            .any(|t| t.id == track.id);
        if known {
            return false;
        }
        match class {
            StreamClass::Camera => self.camera.push(track),
            StreamClass::Screen => self.screen.push(track),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MediaKind;

    fn track(id: &str, label: &str) -> RemoteTrack {
        RemoteTrack {
            id: id.into(),
            stream_id: "s".into(),
            kind: MediaKind::Video,
            label: label.into(),
        }
    }

    #[test]
    fn keywords_mark_screen_tracks() {
        let classifier = KeywordClassifier::default();
        assert_eq!(
            classifier.classify(&track("1", "Screen 1")),
            StreamClass::Screen
        );
        assert_eq!(
            classifier.classify(&track("2", "Entire Display")),
            StreamClass::Screen
        );
        assert_eq!(
            classifier.classify(&track("3", "window: editor")),
            StreamClass::Screen
        );
    }

    #[test]
    fn unmatched_labels_default_to_camera() {
        let classifier = KeywordClassifier::default();
        assert_eq!(
            classifier.classify(&track("1", "FaceTime HD Camera")),
            StreamClass::Camera
        );
        assert_eq!(classifier.classify(&track("2", "")), StreamClass::Camera);
    }

    #[test]
    fn custom_keywords_replace_defaults() {
        let classifier = KeywordClassifier::new(["share"]);
        assert_eq!(
            classifier.classify(&track("1", "Screen 1")),
            StreamClass::Camera
        );
        assert_eq!(
            classifier.classify(&track("2", "SHARE-tab")),
            StreamClass::Screen
        );
    }

    #[test]
    fn remote_streams_ignore_duplicate_ids() {
        let mut streams = RemoteStreams::default();
        assert!(streams.add(track("1", "cam"), StreamClass::Camera));
        assert!(!streams.add(track("1", "cam"), StreamClass::Screen));
        assert_eq!(streams.camera.len(), 1);
        assert!(streams.screen.is_empty());
    }
}
