//! Playback engine
//!
//! Owns at most one open audio handle. A load always releases the previous
//! session before opening the next asset, and a failed load leaves the
//! engine `Idle` with nothing open.

use std::sync::Arc;

use tilawa_proto::model::{PlayerSnapshot, PlayerState, Track};
use tracing::{debug, info, warn};

use crate::error::PlaybackError;
use crate::ledger::Ledger;
use crate::media::{AudioBackend, AudioHandle, PlaybackSource};

pub type FinishedCallback = Box<dyn Fn(&Track) + Send + Sync>;

struct Session<H> {
    track: Track,
    source: PlaybackSource,
    handle: H,
    position_ms: u64,
    duration_ms: u64,
    playing: bool,
}

pub struct PlaybackEngine<B: AudioBackend> {
    ledger: Arc<Ledger>,
    backend: B,
    session: Option<Session<B::Handle>>,
    state: PlayerState,
    /// `did_just_finish` from the previous sample, for edge detection.
    last_finished: bool,
    on_finished: Option<FinishedCallback>,
}

impl<B: AudioBackend> PlaybackEngine<B> {
    pub fn new(ledger: Arc<Ledger>, backend: B) -> Self {
        Self {
            ledger,
            backend,
            session: None,
            state: PlayerState::Idle,
            last_finished: false,
            on_finished: None,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.session.as_ref().map(|s| &s.track)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Register the callback fired once per playthrough. It runs while the
    /// engine is borrowed, so it must not call back into the engine.
    pub fn on_track_finished<F>(&mut self, callback: F)
    where
        F: Fn(&Track) + Send + Sync + 'static,
    {
        self.on_finished = Some(Box::new(callback));
    }

    pub async fn load_track(&mut self, track: &Track) -> Result<(), PlaybackError> {
        self.release().await;
        self.state = PlayerState::Loading;

        let source = match resolve_source(&self.ledger, track).await {
            Ok(s) => s,
            Err(e) => {
                self.state = PlayerState::Idle;
                return Err(e);
            }
        };
        info!("engine: loading {} from {}", track.id, source.uri());

        let mut handle = match self.backend.open(&source).await {
            Ok(h) => h,
            Err(e) => {
                warn!("engine: open {} failed: {}", track.id, e);
                self.state = PlayerState::Idle;
                return Err(e.into());
            }
        };

        let status = match handle.status().await {
            Ok(s) => s,
            Err(e) => {
                warn!("engine: initial status for {} failed: {}", track.id, e);
                if let Err(close_err) = handle.close().await {
                    debug!("engine: close after failed load: {}", close_err);
                }
                self.state = PlayerState::Idle;
                return Err(e.into());
            }
        };

        self.session = Some(Session {
            track: track.clone(),
            source,
            handle,
            position_ms: status.position_ms,
            duration_ms: status.duration_ms.unwrap_or(0),
            playing: false,
        });
        self.last_finished = false;
        self.state = PlayerState::Ready;
        debug!(
            "engine: {} ready, duration={}ms",
            track.id,
            status.duration_ms.unwrap_or(0)
        );
        Ok(())
    }

    pub async fn play(&mut self) -> Result<(), PlaybackError> {
        let session = self.session.as_mut().ok_or(PlaybackError::NoTrackLoaded)?;
        if self.state == PlayerState::Finished {
            session.handle.seek(0).await?;
            session.position_ms = 0;
        }
        session.handle.play().await?;
        session.playing = true;
        self.state = PlayerState::Playing;
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<(), PlaybackError> {
        let session = self.session.as_mut().ok_or(PlaybackError::NoTrackLoaded)?;
        session.handle.pause().await?;
        session.playing = false;
        if self.state == PlayerState::Playing {
            self.state = PlayerState::Ready;
        }
        Ok(())
    }

    /// Seek without touching play/pause. Out-of-range targets are clamped.
    pub async fn seek_to(&mut self, position_ms: i64) -> Result<(), PlaybackError> {
        let session = self.session.as_mut().ok_or(PlaybackError::NoTrackLoaded)?;
        let target = clamp_position(position_ms, session.duration_ms);
        session.handle.seek(target).await?;
        session.position_ms = target;
        if self.state == PlayerState::Finished && target < session.duration_ms {
            self.state = PlayerState::Ready;
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.release().await;
    }

    pub async fn dispose(&mut self) {
        self.release().await;
        self.on_finished = None;
    }

    /// Sample the backend and fold the result into the session. Fires the
    /// finished callback on the rising edge of `did_just_finish` only.
    pub async fn poll(&mut self) -> Result<PlayerSnapshot, PlaybackError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(self.snapshot());
        };
        let status = session.handle.status().await?;

        session.position_ms = status.position_ms;
        if let Some(duration) = status.duration_ms {
            session.duration_ms = duration;
        }

        let rising = status.did_just_finish && !self.last_finished;
        self.last_finished = status.did_just_finish;

        if status.did_just_finish {
            session.playing = false;
            if session.duration_ms > 0 {
                session.position_ms = session.duration_ms;
            }
            self.state = PlayerState::Finished;
        } else {
            session.playing = status.is_playing;
            self.state = if status.is_playing {
                PlayerState::Playing
            } else {
                PlayerState::Ready
            };
        }

        if rising {
            info!("engine: {} finished", session.track.id);
            if let Some(callback) = &self.on_finished {
                callback(&session.track);
            }
        }
        Ok(self.snapshot())
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        match &self.session {
            Some(s) => PlayerSnapshot {
                track: Some(s.track.clone()),
                state: self.state,
                source_kind: Some(s.source.kind()),
                position_ms: s.position_ms,
                duration_ms: s.duration_ms,
                playing: s.playing,
            },
            None => PlayerSnapshot {
                state: self.state,
                ..Default::default()
            },
        }
    }

    async fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!("engine: releasing {}", session.track.id);
            if let Err(e) = session.handle.close().await {
                warn!("engine: close {} failed: {}", session.track.id, e);
            }
        }
        self.last_finished = false;
        self.state = PlayerState::Idle;
    }
}

/// Local file when the ledger has a live one, otherwise the remote URL.
pub async fn resolve_source(
    ledger: &Ledger,
    track: &Track,
) -> Result<PlaybackSource, PlaybackError> {
    if let Some(path) = ledger.resolve_local_path(&track.id).await {
        return Ok(PlaybackSource::Local(path));
    }
    match &track.remote_audio_url {
        Some(url) if !url.is_empty() => Ok(PlaybackSource::Remote(url.clone())),
        _ => Err(PlaybackError::NoPlayableSource(track.id.clone())),
    }
}

/// Clamp a signed target into `[0, duration_ms]`. An unknown (zero)
/// duration only clamps from below.
pub fn clamp_position(position_ms: i64, duration_ms: u64) -> u64 {
    let lower = position_ms.max(0) as u64;
    if duration_ms > 0 {
        lower.min(duration_ms)
    } else {
        lower
    }
}
