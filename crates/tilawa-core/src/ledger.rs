//! Storage ledger: which tracks have a verified local copy, and where.
//!
//! The ledger is a JSON array of `DownloadRecord` stored under one key of
//! the `JsonStore`. A record only counts as "downloaded" while its file is
//! still on disk; the check is repeated on every read because the OS may
//! evict files behind our back.
//!
//! Nothing here returns an error to the caller. A broken or unreadable
//! ledger degrades to "nothing downloaded" so streaming keeps working.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tilawa_proto::model::{DownloadRecord, OnboardingStatus, UsageSummary};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::store::JsonStore;

pub const LEDGER_KEY: &str = "downloaded_files";
pub const ONBOARDING_KEY: &str = "download_status";

const AUDIO_EXTENSION: &str = "mp3";

pub struct Ledger {
    store: JsonStore,
    download_dir: PathBuf,
    /// Single-writer guard for ledger read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl Ledger {
    pub fn new(store: JsonStore, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            download_dir: download_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Create the download directory. Failure is logged, not fatal.
    pub async fn initialize(&self) {
        if let Err(e) = tokio::fs::create_dir_all(&self.download_dir).await {
            error!(
                "ledger: failed to create download dir {}: {}",
                self.download_dir.display(),
                e
            );
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Canonical on-disk location for a track, see [`file_name_for`].
    pub fn local_path_for(&self, track_id: &str) -> PathBuf {
        self.download_dir.join(file_name_for(track_id))
    }

    pub async fn is_downloaded(&self, track_id: &str) -> bool {
        self.resolve_local_path(track_id).await.is_some()
    }

    /// Verified local path, or `None` when there is no record or the file
    /// has disappeared.
    pub async fn resolve_local_path(&self, track_id: &str) -> Option<PathBuf> {
        let records = self.records().await;
        let record = records.into_iter().find(|r| r.track_id == track_id)?;
        if is_live_file(&record.local_path).await {
            Some(record.local_path)
        } else {
            debug!(
                "ledger: stale record for {} ({} missing)",
                track_id,
                record.local_path.display()
            );
            None
        }
    }

    /// All records as persisted, stale ones included.
    pub async fn records(&self) -> Vec<DownloadRecord> {
        match self.store.get(LEDGER_KEY).await {
            Ok(Some(blob)) => match serde_json::from_str(&blob) {
                Ok(records) => records,
                Err(e) => {
                    warn!("ledger: corrupt ledger blob, treating as empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(StoreError::Corrupt(e)) => {
                warn!("ledger: corrupt store document, treating as empty: {}", e);
                Vec::new()
            }
            Err(e) => {
                error!("ledger: failed to read store: {}", e);
                Vec::new()
            }
        }
    }

    /// Insert or replace the record for `record.track_id`.
    pub async fn record_download(&self, record: DownloadRecord) -> bool {
        let _guard = self.write_lock.lock().await;
        let mut records = self.records().await;
        match records.iter_mut().find(|r| r.track_id == record.track_id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.persist(&records).await
    }

    /// Remove the file, then the record. If the file cannot be removed the
    /// record stays so the ledger never forgets a file that still exists.
    pub async fn delete_record(&self, track_id: &str) -> bool {
        let _guard = self.write_lock.lock().await;
        let mut records = self.records().await;
        let Some(record) = records.iter().find(|r| r.track_id == track_id) else {
            debug!("ledger: delete of unknown track {}", track_id);
            return false;
        };

        if let Err(e) = remove_file_if_present(&record.local_path).await {
            error!(
                "ledger: failed to delete {}: {}",
                record.local_path.display(),
                e
            );
            return false;
        }

        records.retain(|r| r.track_id != track_id);
        let ok = self.persist(&records).await;
        if ok {
            info!("ledger: deleted {}", track_id);
        }
        ok
    }

    /// Best-effort removal of every file, then one write of the empty
    /// ledger. Returns how many files were actually removed.
    pub async fn clear_all(&self) -> usize {
        let _guard = self.write_lock.lock().await;
        let records = self.records().await;
        let mut removed = 0;
        for record in &records {
            match remove_file_if_present(&record.local_path).await {
                Ok(true) => removed += 1,
                Ok(false) => debug!(
                    "ledger: {} already gone",
                    record.local_path.display()
                ),
                Err(e) => warn!(
                    "ledger: failed to delete {}: {}",
                    record.local_path.display(),
                    e
                ),
            }
        }
        if self.persist(&[]).await {
            info!(
                "ledger: cleared {} records, {} files removed",
                records.len(),
                removed
            );
        } else {
            error!(
                "ledger: removed {} files but the empty ledger was not saved",
                removed
            );
        }
        removed
    }

    /// Sizes are measured from disk, not taken from the records.
    pub async fn usage_summary(&self) -> UsageSummary {
        let mut summary = UsageSummary::default();
        for record in self.records().await {
            if let Ok(meta) = tokio::fs::metadata(&record.local_path).await {
                if meta.is_file() {
                    summary.total_size_bytes += meta.len();
                    summary.file_count += 1;
                }
            }
        }
        summary
    }

    pub async fn onboarding_status(&self) -> OnboardingStatus {
        match self.store.get(ONBOARDING_KEY).await {
            Ok(Some(value)) => OnboardingStatus::parse(&value),
            Ok(None) => OnboardingStatus::default(),
            Err(e) => {
                warn!("ledger: failed to read onboarding status: {}", e);
                OnboardingStatus::default()
            }
        }
    }

    pub async fn set_onboarding_status(&self, status: OnboardingStatus) -> bool {
        match self
            .store
            .set(ONBOARDING_KEY, status.as_str().to_string())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("ledger: failed to save onboarding status: {}", e);
                false
            }
        }
    }

    async fn persist(&self, records: &[DownloadRecord]) -> bool {
        let blob = match serde_json::to_string(records) {
            Ok(b) => b,
            Err(e) => {
                error!("ledger: failed to serialize records: {}", e);
                return false;
            }
        };
        match self.store.set(LEDGER_KEY, blob).await {
            Ok(()) => true,
            Err(e) => {
                error!("ledger: failed to persist records: {}", e);
                false
            }
        }
    }
}

/// Deterministic file name for a track id. Characters outside
/// `[A-Za-z0-9._-]` become `_`; when that changes the id, a digest of the raw
/// id is appended after `~` so distinct ids never share a file.
pub fn file_name_for(track_id: &str) -> String {
    let safe: String = track_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = safe.trim_start_matches('.');
    if safe == track_id && !safe.is_empty() {
        return format!("{}.{}", safe, AUDIO_EXTENSION);
    }
    format!("{}~{}.{}", safe, id_digest(track_id), AUDIO_EXTENSION)
}

fn id_digest(track_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(track_id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

async fn is_live_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// `Ok(false)` when the file was already absent.
async fn remove_file_if_present(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
