//! Download orchestrator
//!
//! Pulls tracks into the ledger one at a time with per-track and batch
//! progress. A failed track never aborts the batch, and a re-run resumes
//! from whatever the ledger already holds.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tilawa_proto::model::{BatchProgress, DownloadRecord, DownloadStatus, Track};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DownloadError, FetchError};
use crate::fetcher::Fetcher;
use crate::ledger::{file_name_for, Ledger};

/// Capacity of the progress channel handed out by `spawn_download_all`.
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

pub struct DownloadManager {
    ledger: Arc<Ledger>,
    fetcher: Fetcher,
    /// One orchestrator run at a time; later requests wait for the
    /// in-flight fetch to finish or fail.
    run_lock: tokio::sync::Mutex<()>,
    /// Token for the current run; replaced after every `cancel()`.
    cancel: Mutex<CancellationToken>,
    /// Most recent batch state, for status views that poll.
    last_batch: Mutex<Option<BatchProgress>>,
}

impl DownloadManager {
    pub fn new(ledger: Arc<Ledger>, fetcher: Fetcher) -> Self {
        Self {
            ledger,
            fetcher,
            run_lock: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            last_batch: Mutex::new(None),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Download a single track. `true` when it ends up in the ledger.
    pub async fn download_one<F>(&self, track: &Track, on_progress: F) -> bool
    where
        F: FnMut(f32) + Send,
    {
        let _run = self.run_lock.lock().await;
        let cancel = self.current_token();
        match self.process_track(track, on_progress, &cancel).await {
            Ok(()) => true,
            Err(e) => {
                error!("downloads: {} failed: {}", track.id, e);
                false
            }
        }
    }

    /// Download every track in order. `true` only if all of them end up
    /// `completed`.
    pub async fn download_all<F>(&self, tracks: &[Track], mut on_batch_progress: F) -> bool
    where
        F: FnMut(&BatchProgress) + Send,
    {
        let _run = self.run_lock.lock().await;
        let cancel = self.current_token();
        let mut batch = BatchProgress::new(tracks.iter().map(|t| t.id.as_str()));
        self.publish(&batch, &mut on_batch_progress);

        info!("downloads: starting batch of {} tracks", tracks.len());

        for track in tracks {
            if cancel.is_cancelled() {
                info!("downloads: batch cancelled before {}", track.id);
                break;
            }

            batch.update(&track.id, 0.0, DownloadStatus::Downloading);
            self.publish(&batch, &mut on_batch_progress);

            let result = {
                let batch = &mut batch;
                let on_batch_progress = &mut on_batch_progress;
                let id = track.id.as_str();
                self.process_track(
                    track,
                    |fraction| {
                        batch.update(id, fraction, DownloadStatus::Downloading);
                        self.publish(&*batch, &mut *on_batch_progress);
                    },
                    &cancel,
                )
                .await
            };

            match result {
                Ok(()) => batch.update(&track.id, 1.0, DownloadStatus::Completed),
                Err(e) => {
                    warn!("downloads: {} failed: {}", track.id, e);
                    batch.update(&track.id, 0.0, DownloadStatus::Error);
                }
            }
            self.publish(&batch, &mut on_batch_progress);
        }

        info!("downloads: batch finished, {}", batch.summary());
        batch.all_completed()
    }

    /// Run `download_all` on the runtime. Progress snapshots arrive on the
    /// returned channel; the last message is always the final batch state.
    pub fn spawn_download_all(
        self: &Arc<Self>,
        tracks: Vec<Track>,
    ) -> (tokio::task::JoinHandle<bool>, mpsc::Receiver<BatchProgress>) {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let progress_tx = tx.clone();
            let ok = manager
                .download_all(&tracks, move |batch| {
                    // Intermediate snapshots may be dropped when the
                    // receiver lags; the final one below is not.
                    let _ = progress_tx.try_send(batch.clone());
                })
                .await;
            if let Some(final_batch) = manager.last_batch() {
                let _ = tx.send(final_batch).await;
            }
            ok
        });
        (handle, rx)
    }

    /// Abort the in-flight run. The fetch being transferred is torn down
    /// and its track marked `error`; tracks not started stay `pending`.
    pub fn cancel(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
        info!("downloads: cancellation requested");
    }

    pub fn last_batch(&self) -> Option<BatchProgress> {
        self.last_batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn are_all_downloaded(&self, tracks: &[Track]) -> bool {
        for track in tracks {
            if !self.ledger.is_downloaded(&track.id).await {
                return false;
            }
        }
        true
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish<F>(&self, batch: &BatchProgress, on_batch_progress: &mut F)
    where
        F: FnMut(&BatchProgress),
    {
        *self.last_batch.lock().unwrap_or_else(PoisonError::into_inner) = Some(batch.clone());
        on_batch_progress(batch);
    }

    /// Ledger check, fetch, record. The record is written only after the
    /// file is complete under its canonical path.
    async fn process_track<F>(
        &self,
        track: &Track,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError>
    where
        F: FnMut(f32) + Send,
    {
        if self.ledger.is_downloaded(&track.id).await {
            debug!("downloads: {} already downloaded", track.id);
            on_progress(1.0);
            return Ok(());
        }

        let remote_url = track
            .remote_audio_url
            .as_deref()
            .ok_or_else(|| DownloadError::NoRemoteUrl(track.id.clone()))?;
        let destination = self.ledger.local_path_for(&track.id);

        // No live record, so whatever sits at the destination was not
        // downloaded for this track and cannot be trusted.
        match tokio::fs::remove_file(&destination).await {
            Ok(()) => warn!(
                "downloads: {} had an unrecorded file at {}, fetching again",
                track.id,
                destination.display()
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FetchError::from_io(e).into()),
        }

        let outcome = self
            .fetcher
            .fetch(remote_url, &destination, &mut on_progress, cancel)
            .await?;
        if outcome.skipped {
            return Err(DownloadError::UntrustedFile(track.id.clone()));
        }

        let size_bytes = tokio::fs::metadata(&destination)
            .await
            .map(|m| m.len())
            .map_err(|e| DownloadError::Fetch(FetchError::DiskWriteFailure(e)))?;

        let record = DownloadRecord {
            track_id: track.id.clone(),
            file_name: file_name_for(&track.id),
            local_path: destination,
            remote_url: remote_url.to_string(),
            size_bytes,
            downloaded_at: Utc::now(),
        };
        if !self.ledger.record_download(record).await {
            return Err(DownloadError::LedgerWrite(track.id.clone()));
        }
        Ok(())
    }
}
