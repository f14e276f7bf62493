//! Audio backend seam.
//!
//! The engine only needs pull-style status from the underlying media
//! primitive, so that is all the traits expose. `did_just_finish` is allowed
//! to be level-triggered (true on every read once the end is reached); the
//! engine does the edge detection.

use std::path::PathBuf;

use async_trait::async_trait;
use tilawa_proto::model::SourceKind;

use crate::error::MediaError;

pub mod mpv;

/// Where a track is played from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    Local(PathBuf),
    Remote(String),
}

impl PlaybackSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Local(_) => SourceKind::Local,
            Self::Remote(_) => SourceKind::Remote,
        }
    }

    /// Path or URL as handed to the player.
    pub fn uri(&self) -> String {
        match self {
            Self::Local(path) => path.display().to_string(),
            Self::Remote(url) => url.clone(),
        }
    }
}

/// One sample of the backend's transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaStatus {
    pub position_ms: u64,
    /// `None` until the asset has been decoded far enough to know.
    pub duration_ms: Option<u64>,
    pub is_playing: bool,
    pub did_just_finish: bool,
}

/// Opens audio resources. Each returned handle is one open resource.
#[async_trait]
pub trait AudioBackend: Send + Sync + 'static {
    type Handle: AudioHandle;

    /// Open `source` paused at position 0.
    async fn open(&self, source: &PlaybackSource) -> Result<Self::Handle, MediaError>;
}

#[async_trait]
pub trait AudioHandle: Send + 'static {
    async fn play(&mut self) -> Result<(), MediaError>;
    async fn pause(&mut self) -> Result<(), MediaError>;
    async fn seek(&mut self, position_ms: u64) -> Result<(), MediaError>;
    async fn status(&mut self) -> Result<MediaStatus, MediaError>;
    /// Release the resource. Further calls may fail with `MediaError::Closed`.
    async fn close(&mut self) -> Result<(), MediaError>;
}
