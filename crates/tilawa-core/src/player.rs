//! Player facade and state projector.
//!
//! ```text
//!   Player::load_track ──► engine.lock().load_track()
//!          │
//!          └── start_projector()   one task per session
//!                 loop every poll_interval:
//!                     engine.lock().poll() ──► watch::Sender<PlayerSnapshot>
//! ```
//!
//! Loading a new track cancels the previous projector before the new one
//! starts; `stop` and `dispose` cancel it outright.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tilawa_proto::model::{PlayerSnapshot, PlayerState, Track};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::engine::PlaybackEngine;
use crate::error::{MediaError, PlaybackError};
use crate::media::AudioBackend;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Consecutive lost-connection polls before the session is released.
pub const MAX_LOST_POLLS: u32 = 3;

pub struct Player<B: AudioBackend> {
    engine: Arc<Mutex<PlaybackEngine<B>>>,
    poll_interval: Duration,
    loading: AtomicBool,
    snapshot_tx: Arc<watch::Sender<PlayerSnapshot>>,
    projector: StdMutex<Option<CancellationToken>>,
}

/// Clears the loading flag however the load future ends.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<B: AudioBackend> Player<B> {
    pub fn new(engine: PlaybackEngine<B>, poll_interval: Duration) -> Self {
        let (snapshot_tx, _) = watch::channel(PlayerSnapshot::default());
        Self {
            engine: Arc::new(Mutex::new(engine)),
            poll_interval,
            loading: AtomicBool::new(false),
            snapshot_tx: Arc::new(snapshot_tx),
            projector: StdMutex::new(None),
        }
    }

    /// Load `track` paused at 0. Fails fast with `AlreadyInProgress` while
    /// another load is still running.
    pub async fn load_track(&self, track: &Track) -> Result<(), PlaybackError> {
        if self.loading.swap(true, Ordering::AcqRel) {
            debug!("player: load of {} rejected, another load in flight", track.id);
            return Err(PlaybackError::AlreadyInProgress);
        }
        let _guard = LoadingGuard(&self.loading);

        self.stop_projector();
        self.snapshot_tx.send_replace(PlayerSnapshot {
            track: Some(track.clone()),
            state: PlayerState::Loading,
            ..Default::default()
        });

        let mut engine = self.engine.lock().await;
        let result = engine.load_track(track).await;
        self.snapshot_tx.send_replace(engine.snapshot());
        drop(engine);

        result?;
        self.start_projector();
        Ok(())
    }

    pub async fn play(&self) -> Result<(), PlaybackError> {
        let mut engine = self.engine.lock().await;
        engine.play().await?;
        self.snapshot_tx.send_replace(engine.snapshot());
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), PlaybackError> {
        let mut engine = self.engine.lock().await;
        engine.pause().await?;
        self.snapshot_tx.send_replace(engine.snapshot());
        Ok(())
    }

    /// Pause when playing, play otherwise.
    pub async fn toggle(&self) -> Result<(), PlaybackError> {
        let mut engine = self.engine.lock().await;
        if engine.state() == PlayerState::Playing {
            engine.pause().await?;
        } else {
            engine.play().await?;
        }
        self.snapshot_tx.send_replace(engine.snapshot());
        Ok(())
    }

    pub async fn seek_to(&self, position_ms: i64) -> Result<(), PlaybackError> {
        let mut engine = self.engine.lock().await;
        engine.seek_to(position_ms).await?;
        self.snapshot_tx.send_replace(engine.snapshot());
        Ok(())
    }

    pub async fn stop(&self) {
        self.stop_projector();
        let mut engine = self.engine.lock().await;
        engine.stop().await;
        self.snapshot_tx.send_replace(engine.snapshot());
    }

    /// Stop and drop the finished callback. Used at shutdown.
    pub async fn dispose(&self) {
        self.stop_projector();
        let mut engine = self.engine.lock().await;
        engine.dispose().await;
        self.snapshot_tx.send_replace(engine.snapshot());
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub async fn current_track(&self) -> Option<Track> {
        self.engine.lock().await.current_track().cloned()
    }

    /// See [`PlaybackEngine::on_track_finished`]: the callback must not call
    /// back into the player.
    pub async fn on_track_finished<F>(&self, callback: F)
    where
        F: Fn(&Track) + Send + Sync + 'static,
    {
        self.engine.lock().await.on_track_finished(callback);
    }

    pub fn is_projecting(&self) -> bool {
        self.projector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    fn stop_projector(&self) {
        let previous = self
            .projector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = previous {
            token.cancel();
        }
    }

    fn start_projector(&self) {
        let token = CancellationToken::new();
        let previous = self
            .projector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let engine = Arc::clone(&self.engine);
        let tx = Arc::clone(&self.snapshot_tx);
        let interval = self.poll_interval;
        tokio::spawn(project(engine, tx, interval, token));
    }
}

/// Sample the engine until cancelled or until the session is gone.
async fn project<B: AudioBackend>(
    engine: Arc<Mutex<PlaybackEngine<B>>>,
    tx: Arc<watch::Sender<PlayerSnapshot>>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!("projector: started");
    let mut lost_polls = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut engine = engine.lock().await;
        // Superseded while waiting for the lock
        if token.is_cancelled() {
            break;
        }
        match engine.poll().await {
            Ok(snapshot) => {
                lost_polls = 0;
                tx.send_replace(snapshot);
            }
            Err(PlaybackError::Media(e @ (MediaError::Ipc(_) | MediaError::Closed))) => {
                lost_polls += 1;
                warn!(
                    "projector: lost the media backend ({}/{}): {}",
                    lost_polls, MAX_LOST_POLLS, e
                );
                if lost_polls >= MAX_LOST_POLLS {
                    error!("projector: media backend gone, releasing the session");
                    engine.stop().await;
                    tx.send_replace(engine.snapshot());
                }
            }
            Err(e) => warn!("projector: poll failed: {}", e),
        }
        if !engine.state().has_session() {
            break;
        }
    }
    token.cancel();
    debug!("projector: stopped");
}
