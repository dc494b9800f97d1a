//! Device, stream and recorder seams
//!
//! Implementations live behind these traits so sessions can run against a
//! real platform backend or a replayed file.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{CaptureError, Constraints};

/// Recording types in order of preference
pub const MIME_PREFERENCES: [&str; 4] = [
    "video/webm;codecs=vp9,opus",
    "video/webm;codecs=vp8,opus",
    "video/webm",
    "video/mp4",
];

/// Emitted by a recorder while it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    /// One timesliced chunk of encoded media
    Data(Vec<u8>),
    /// The recorder finalized; no more chunks follow
    Stopped,
    Error(String),
}

/// Entry point for device access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Ask for a stream satisfying `constraints`
    async fn get_user_media(
        &self,
        constraints: &Constraints,
    ) -> Result<Box<dyn MediaStream>, CaptureError>;

    fn is_type_supported(&self, mime_type: &str) -> bool;
}

/// A live device stream
pub trait MediaStream: Send + Sync {
    /// Whether at least one track is still live
    fn is_active(&self) -> bool;

    fn stop_tracks(&self);

    /// Create a recorder bound to this stream. `None` leaves the type to
    /// the recorder.
    fn create_recorder(
        &self,
        mime_type: Option<&str>,
    ) -> Result<Box<dyn MediaRecorder>, CaptureError>;
}

pub trait MediaRecorder: Send + Sync {
    /// The type the recorder actually produces
    fn mime_type(&self) -> String;

    /// Begin recording, delivering a chunk every `timeslice`
    fn start(
        &mut self,
        timeslice: Duration,
        events: mpsc::UnboundedSender<RecorderEvent>,
    ) -> Result<(), CaptureError>;

    /// Request finalization. The remaining data and `Stopped` follow
    /// asynchronously.
    fn stop(&mut self);
}

/// First preferred type the devices can record, if any
pub fn negotiate_mime_type(devices: &dyn MediaDevices) -> Option<&'static str> {
    MIME_PREFERENCES
        .iter()
        .copied()
        .find(|mime| devices.is_type_supported(mime))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Supports(&'static [&'static str]);

    #[async_trait]
    impl MediaDevices for Supports {
        async fn get_user_media(
            &self,
            _constraints: &Constraints,
        ) -> Result<Box<dyn MediaStream>, CaptureError> {
            Err(CaptureError::Unsupported)
        }

        fn is_type_supported(&self, mime_type: &str) -> bool {
            self.0.contains(&mime_type)
        }
    }

    #[test]
    fn test_negotiation_prefers_vp9() {
        let devices = Supports(&["video/webm", "video/webm;codecs=vp9,opus", "video/mp4"]);
        assert_eq!(
            negotiate_mime_type(&devices),
            Some("video/webm;codecs=vp9,opus")
        );
    }

    #[test]
    fn test_negotiation_falls_back_to_mp4() {
        assert_eq!(negotiate_mime_type(&Supports(&["video/mp4"])), Some("video/mp4"));
        assert_eq!(negotiate_mime_type(&Supports(&["audio/ogg"])), None);
    }
}
