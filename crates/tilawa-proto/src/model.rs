use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One playable recitation and its display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Track {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album_art_url: String,
    /// `None` means the track cannot be streamed.
    #[serde(default)]
    pub remote_audio_url: Option<String>,
    #[serde(default)]
    pub genre: String,
    /// Nominal duration for display only ("0:00" until the asset is decoded).
    #[serde(default = "default_nominal_duration")]
    pub duration: String,
}

fn default_nominal_duration() -> String {
    "0:00".to_string()
}

/// One entry in the ledger of downloaded files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRecord {
    pub track_id: String,
    pub file_name: String,
    pub local_path: PathBuf,
    /// Where the file came from, kept for re-download / validation.
    pub remote_url: String,
    pub size_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
}

/// Persisted flag for the first-run download prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStatus {
    #[default]
    NeverShown,
    Skipped,
    Downloaded,
}

impl OnboardingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeverShown => "never_shown",
            Self::Skipped => "skipped",
            Self::Downloaded => "downloaded",
        }
    }

    /// Unknown values fall back to `NeverShown`.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "skipped" => Self::Skipped,
            "downloaded" => Self::Downloaded,
            _ => Self::NeverShown,
        }
    }
}

// ── playback ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    Remote,
}

/// Engine lifecycle.
///
/// Transitions:
///   Idle -> Loading -> Ready <-> Playing -> Finished
///   Loading -> Idle (load failed)
///   any -> Idle (stop)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    #[default]
    Idle,
    Loading,
    /// Loaded and paused.
    Ready,
    Playing,
    /// End of stream reached for the current track.
    Finished,
}

impl PlayerState {
    pub fn has_session(&self) -> bool {
        matches!(self, Self::Ready | Self::Playing | Self::Finished)
    }
}

/// Read-only view of the player published by the state projector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlayerSnapshot {
    pub track: Option<Track>,
    pub state: PlayerState,
    pub source_kind: Option<SourceKind>,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub playing: bool,
}

impl PlayerSnapshot {
    pub fn progress(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        (self.position_ms as f64 / self.duration_ms as f64).clamp(0.0, 1.0)
    }

    pub fn position_label(&self) -> String {
        format_millis(self.position_ms)
    }

    pub fn duration_label(&self) -> String {
        format_millis(self.duration_ms)
    }
}

/// `m:ss`, minutes unbounded.
pub fn format_millis(millis: u64) -> String {
    let seconds = millis / 1000;
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

// ── downloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Downloading,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackProgress {
    pub track_id: String,
    /// 0.0 - 1.0
    pub fraction: f32,
    pub status: DownloadStatus,
}

/// Aggregated status of one batch run, in catalogue order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BatchProgress {
    pub entries: Vec<TrackProgress>,
}

impl BatchProgress {
    pub fn new<'a>(track_ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            entries: track_ids
                .into_iter()
                .map(|id| TrackProgress {
                    track_id: id.to_string(),
                    fraction: 0.0,
                    status: DownloadStatus::Pending,
                })
                .collect(),
        }
    }

    pub fn get(&self, track_id: &str) -> Option<&TrackProgress> {
        self.entries.iter().find(|e| e.track_id == track_id)
    }

    pub fn update(&mut self, track_id: &str, fraction: f32, status: DownloadStatus) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.track_id == track_id) {
            entry.fraction = fraction.clamp(0.0, 1.0);
            entry.status = status;
        }
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn completed(&self) -> usize {
        self.count(DownloadStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(DownloadStatus::Error)
    }

    pub fn all_completed(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.status == DownloadStatus::Completed)
    }

    /// Mean of per-track fractions, completed tracks counting as 1.0.
    pub fn overall_fraction(&self) -> f32 {
        if self.entries.is_empty() {
            return 1.0;
        }
        let sum: f32 = self
            .entries
            .iter()
            .map(|e| match e.status {
                DownloadStatus::Completed => 1.0,
                _ => e.fraction,
            })
            .sum();
        sum / self.entries.len() as f32
    }

    pub fn summary(&self) -> String {
        format!(
            "{} of {} downloaded, {} failed",
            self.completed(),
            self.total(),
            self.failed()
        )
    }

    fn count(&self, status: DownloadStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }
}

/// Disk usage of the download directory as seen through the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UsageSummary {
    pub total_size_bytes: u64,
    pub file_count: usize,
}

impl UsageSummary {
    pub fn formatted_size(&self) -> String {
        format_file_size(self.total_size_bytes)
    }
}

/// Base-1024 size with at most two decimals, e.g. `1.5 MB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}
