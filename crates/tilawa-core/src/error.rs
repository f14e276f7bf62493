//! Error taxonomy for the offline playback core.
//!
//! Download and disk errors are caught at the single-file boundary and
//! turned into batch status entries; only playback errors reach callers.

use thiserror::Error;

/// Failure of one network-to-disk transfer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("remote returned {status} for {url}")]
    RemoteNotFound { url: String, status: u16 },
    #[error("disk write failed: {0}")]
    DiskWriteFailure(std::io::Error),
    #[error("disk full: {0}")]
    DiskFull(std::io::Error),
    #[error("download cancelled")]
    Cancelled,
}

impl FetchError {
    pub(crate) fn from_io(e: std::io::Error) -> Self {
        if is_disk_full(&e) {
            FetchError::DiskFull(e)
        } else {
            FetchError::DiskWriteFailure(e)
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::NetworkUnavailable(e.to_string())
    }
}

#[cfg(unix)]
fn is_disk_full(e: &std::io::Error) -> bool {
    // ENOSPC / EDQUOT
    matches!(e.raw_os_error(), Some(28) | Some(122))
}

#[cfg(windows)]
fn is_disk_full(e: &std::io::Error) -> bool {
    // ERROR_HANDLE_DISK_FULL / ERROR_DISK_FULL
    matches!(e.raw_os_error(), Some(39) | Some(112))
}

/// Why one track of a batch ended in `error`.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("track {0} has no remote audio url")]
    NoRemoteUrl(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("downloaded {0} but could not record it in the ledger")]
    LedgerWrite(String),
    /// A file reappeared at the destination between clearing it and fetching.
    #[error("refusing to record unverified file for {0}")]
    UntrustedFile(String),
}

/// Failure of the persisted key-value document.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The document exists but cannot be parsed.
    #[error("store document is corrupt: {0}")]
    Corrupt(serde_json::Error),
    #[error("failed to serialize store value: {0}")]
    Serialize(serde_json::Error),
}

/// Failure reported by an audio backend.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("mpv binary not found")]
    BinaryNotFound,
    #[error("failed to start player process: {0}")]
    Spawn(std::io::Error),
    #[error("player IPC error: {0}")]
    Ipc(String),
    #[error("timed out opening {0}")]
    LoadTimeout(String),
    #[error("audio resource already closed")]
    Closed,
}

/// Failure surfaced synchronously by the playback engine.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no playable source for track {0}")]
    NoPlayableSource(String),
    #[error("a track load is already in progress")]
    AlreadyInProgress,
    #[error("no track loaded")]
    NoTrackLoaded,
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_enospc_maps_to_disk_full() {
        let err = FetchError::from_io(std::io::Error::from_raw_os_error(28));
        assert!(matches!(err, FetchError::DiskFull(_)));
    }

    #[test]
    fn test_other_io_maps_to_write_failure() {
        let err = FetchError::from_io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(matches!(err, FetchError::DiskWriteFailure(_)));
    }

    #[test]
    fn test_error_messages() {
        let err = FetchError::RemoteNotFound {
            url: "https://host/songs/002.mp3".into(),
            status: 404,
        };
        assert_eq!(err.to_string(), "remote returned 404 for https://host/songs/002.mp3");
        assert_eq!(
            PlaybackError::NoPlayableSource("001".into()).to_string(),
            "no playable source for track 001"
        );
    }
}
