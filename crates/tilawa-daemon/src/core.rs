//! DaemonCore owns the catalogue, the download manager and the player, and
//! runs the event loop that applies the track-advance policy.
//!
//! HTTP handlers call into [`App`] directly so load failures come back to the
//! caller synchronously. Notifications that must not run under the engine
//! lock (track finished) are funnelled through the event channel instead.

use std::sync::Arc;

use tilawa_core::error::PlaybackError;
use tilawa_core::media::AudioBackend;
use tilawa_core::{DownloadManager, Player};
use tilawa_proto::catalogue::Catalogue;
use tilawa_proto::config::Config;
use tilawa_proto::model::Track;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum DaemonEvent {
    /// The engine reached the end of `Track`.
    TrackFinished(Track),
    /// Shutdown requested.
    Shutdown,
}

// ── App ───────────────────────────────────────────────────────────────────────

/// Shared handle used by the HTTP API and the event loop.
pub struct App<B: AudioBackend> {
    pub catalogue: Catalogue,
    pub downloads: Arc<DownloadManager>,
    pub player: Player<B>,
}

impl<B: AudioBackend> App<B> {
    pub fn new(catalogue: Catalogue, downloads: Arc<DownloadManager>, player: Player<B>) -> Self {
        Self {
            catalogue,
            downloads,
            player,
        }
    }

    /// Load `track_id` and start playing it.
    pub async fn play_track(&self, track_id: &str) -> Result<Track, PlayError> {
        let track = self
            .catalogue
            .get(track_id)
            .cloned()
            .ok_or_else(|| PlayError::UnknownTrack(track_id.to_string()))?;
        self.player.load_track(&track).await?;
        self.player.play().await?;
        Ok(track)
    }

    pub async fn next(&self) -> Result<Track, PlayError> {
        let target = match self.player.current_track().await {
            Some(current) => self.catalogue.next_after(&current.id),
            None => self.catalogue.tracks().first(),
        };
        let id = target.map(|t| t.id.clone()).ok_or(PlayError::EmptyCatalogue)?;
        self.play_track(&id).await
    }

    pub async fn prev(&self) -> Result<Track, PlayError> {
        let target = match self.player.current_track().await {
            Some(current) => self.catalogue.previous_before(&current.id),
            None => self.catalogue.tracks().last(),
        };
        let id = target.map(|t| t.id.clone()).ok_or(PlayError::EmptyCatalogue)?;
        self.play_track(&id).await
    }
}

#[derive(Debug)]
pub enum PlayError {
    UnknownTrack(String),
    EmptyCatalogue,
    Playback(PlaybackError),
}

impl From<PlaybackError> for PlayError {
    fn from(e: PlaybackError) -> Self {
        PlayError::Playback(e)
    }
}

impl std::fmt::Display for PlayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayError::UnknownTrack(id) => write!(f, "unknown track {}", id),
            PlayError::EmptyCatalogue => write!(f, "catalogue is empty"),
            PlayError::Playback(e) => write!(f, "{}", e),
        }
    }
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore<B: AudioBackend> {
    config: Config,
    app: Arc<App<B>>,
}

impl<B: AudioBackend> DaemonCore<B> {
    pub fn new(config: Config, app: Arc<App<B>>) -> Self {
        Self { config, app }
    }

    /// Route finished notifications from the engine into `event_tx`. The
    /// callback runs under the engine lock, so it only enqueues.
    pub async fn wire_finished(&self, event_tx: mpsc::Sender<DaemonEvent>) {
        self.app
            .player
            .on_track_finished(move |track| {
                if event_tx
                    .try_send(DaemonEvent::TrackFinished(track.clone()))
                    .is_err()
                {
                    warn!("DaemonCore: event channel full, dropped finished notification");
                }
            })
            .await;
    }

    pub async fn run(self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");

        loop {
            match event_rx.recv().await {
                None => {
                    info!("DaemonCore: event channel closed, shutting down");
                    break;
                }
                Some(DaemonEvent::Shutdown) => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }
                Some(DaemonEvent::TrackFinished(track)) => {
                    self.handle_finished(&track).await;
                }
            }
        }

        self.app.downloads.cancel();
        self.app.player.dispose().await;
        info!("DaemonCore: stopped");
        Ok(())
    }

    async fn handle_finished(&self, track: &Track) {
        if !self.config.playback.auto_advance {
            debug!("DaemonCore: {} finished, auto-advance off", track.id);
            return;
        }
        let Some(next) = self.app.catalogue.next_after(&track.id) else {
            return;
        };
        if next.id == track.id {
            debug!("DaemonCore: single-track catalogue, not advancing");
            return;
        }
        info!("DaemonCore: {} finished, advancing to {}", track.id, next.id);
        let next_id = next.id.clone();
        if let Err(e) = self.app.play_track(&next_id).await {
            error!("DaemonCore: auto-advance to {} failed: {}", next_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_app;
    use tilawa_proto::model::PlayerState;

    #[tokio::test]
    async fn test_next_and_prev_wrap_around() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());

        assert_eq!(app.next().await.unwrap().id, "001");
        assert_eq!(app.next().await.unwrap().id, "002");
        assert_eq!(app.prev().await.unwrap().id, "001");
        assert_eq!(app.prev().await.unwrap().id, "003");
        assert_eq!(app.player.snapshot().state, PlayerState::Playing);
    }

    #[tokio::test]
    async fn test_unknown_track_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        assert!(matches!(
            app.play_track("999").await,
            Err(PlayError::UnknownTrack(_))
        ));
    }

    #[tokio::test]
    async fn test_finished_event_advances_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        app.play_track("002").await.unwrap();

        let core = DaemonCore::new(Config::default(), app.clone());
        let finished = app.catalogue.get("002").cloned().unwrap();
        core.handle_finished(&finished).await;
        assert_eq!(app.player.current_track().await.unwrap().id, "003");

        let mut config = Config::default();
        config.playback.auto_advance = false;
        let core = DaemonCore::new(config, app.clone());
        let finished = app.catalogue.get("003").cloned().unwrap();
        core.handle_finished(&finished).await;
        assert_eq!(app.player.current_track().await.unwrap().id, "003");
    }

    #[tokio::test]
    async fn test_run_disposes_player_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        app.play_track("001").await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let core = DaemonCore::new(Config::default(), app.clone());
        tx.send(DaemonEvent::Shutdown).await.unwrap();
        core.run(rx).await.unwrap();

        assert_eq!(app.player.snapshot().state, PlayerState::Idle);
    }
}
