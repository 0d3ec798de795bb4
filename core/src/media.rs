//! Local capture tracks and the device boundary
//!
//! Capturing and encoding frames is the host platform's job. This module
//! only models what the call logic needs: which tracks exist, whether each
//! is enabled, and whether it has been stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::CallType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Why capture could not start, phrased for the end user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Camera or microphone access was denied. Allow access in your settings and try again.")]
    PermissionDenied,

    #[error("No camera or microphone was found on this device.")]
    DeviceNotFound,

    #[error("Your camera or microphone is being used by another application.")]
    DeviceInUse,

    #[error("Media capture is not supported on this device.")]
    Unsupported,

    #[error("Could not access camera or microphone: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Audio always, video only for video calls.
    pub fn for_call(call_type: CallType) -> Self {
        Self {
            audio: true,
            video: call_type == CallType::Video,
        }
    }
}

/// Handle to one captured track. Clones share state.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        let prefix = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        Self {
            id: format!("{}-{}", prefix, uuid::Uuid::new_v4()),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stop capture for good; a stopped track never produces samples again.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Tracks acquired for one call.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Flip the enabled flag of the `kind` track. Returns the new state,
    /// `false` when there is no such track.
    pub fn toggle(&self, kind: TrackKind) -> bool {
        match self.track(kind) {
            Some(track) if track.is_live() => {
                let enabled = !track.is_enabled();
                track.set_enabled(enabled);
                enabled
            }
            _ => false,
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Capture devices of the host platform.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Whether the platform can capture media at all.
    fn capture_supported(&self) -> bool;

    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaAccessError>;
}
