//! Catalogue resolver: turns a static manifest or a bucket file listing into
//! `Track` records.
//!
//! The bucket is publicly readable but cannot be listed without credentials,
//! so the list of objects is always supplied by configuration.

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use crate::model::Track;

const SONGS_FOLDER: &str = "songs";
const COVERS_FOLDER: &str = "covers";
const DEFAULT_ARTIST: &str = "Unknown Artist";
const DEFAULT_GENRE: &str = "Quran";

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("duplicate track id: {0}")]
    DuplicateId(String),
    #[error("empty track id")]
    EmptyId,
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Layout of a bucket that follows the `songs/<id>.mp3`, `covers/<id>.jpg`
/// convention.
#[derive(Debug, Clone)]
pub struct Bucket {
    base_url: String,
}

impl Bucket {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    pub fn url(&self, object: &str) -> String {
        format!("{}/{}", self.base_url, object.trim_start_matches('/'))
    }

    pub fn audio_url(&self, file_name: &str) -> String {
        self.url(&format!("{}/{}", SONGS_FOLDER, file_name))
    }

    pub fn album_art_url(&self, track_id: &str) -> String {
        self.url(&format!("{}/{}.jpg", COVERS_FOLDER, track_id))
    }
}

/// The authoritative, ordered track list.
#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    tracks: Vec<Track>,
}

impl Catalogue {
    pub fn new(tracks: Vec<Track>) -> Result<Self, CatalogueError> {
        let mut seen = HashSet::new();
        for track in &tracks {
            if track.id.trim().is_empty() {
                return Err(CatalogueError::EmptyId);
            }
            if !seen.insert(track.id.as_str()) {
                return Err(CatalogueError::DuplicateId(track.id.clone()));
            }
        }
        Ok(Self { tracks })
    }

    /// Build tracks from object names under `songs/`.
    pub fn from_file_names<S: AsRef<str>>(
        bucket: &Bucket,
        file_names: &[S],
    ) -> Result<Self, CatalogueError> {
        let tracks = file_names
            .iter()
            .map(|name| track_from_file_name(bucket, name.as_ref()))
            .collect();
        Self::new(tracks)
    }

    pub fn from_manifest_str(content: &str) -> Result<Self, CatalogueError> {
        let file: ManifestFile = toml::from_str(content)?;
        Self::new(file.track)
    }

    pub fn load_manifest(path: &Path) -> Result<Self, CatalogueError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_manifest_str(&content)
    }

    /// Manifest when present and valid, otherwise the bucket file list.
    pub fn resolve<S: AsRef<str>>(
        manifest: &Path,
        bucket: &Bucket,
        file_names: &[S],
    ) -> Result<Self, CatalogueError> {
        if manifest.exists() {
            match Self::load_manifest(manifest) {
                Ok(catalogue) => {
                    debug!(
                        "catalogue: {} tracks from {}",
                        catalogue.len(),
                        manifest.display()
                    );
                    return Ok(catalogue);
                }
                Err(e) => warn!(
                    "catalogue: ignoring manifest {}: {}",
                    manifest.display(),
                    e
                ),
            }
        }
        Self::from_file_names(bucket, file_names)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Next track, wrapping to the start. `None` for unknown ids.
    pub fn next_after(&self, id: &str) -> Option<&Track> {
        let idx = self.position(id)?;
        self.tracks.get((idx + 1) % self.tracks.len())
    }

    /// Previous track, wrapping to the end. `None` for unknown ids.
    pub fn previous_before(&self, id: &str) -> Option<&Track> {
        let idx = self.position(id)?;
        let prev = if idx == 0 { self.tracks.len() - 1 } else { idx - 1 };
        self.tracks.get(prev)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.tracks.iter().position(|t| t.id == id)
    }
}

#[derive(Debug, serde::Deserialize)]
struct ManifestFile {
    #[serde(default)]
    track: Vec<Track>,
}

fn track_from_file_name(bucket: &Bucket, file_name: &str) -> Track {
    let id = file_stem(file_name).to_string();
    Track {
        title: display_title(file_name),
        artist: DEFAULT_ARTIST.to_string(),
        album_art_url: bucket.album_art_url(&id),
        remote_audio_url: Some(bucket.audio_url(file_name)),
        genre: DEFAULT_GENRE.to_string(),
        duration: "0:00".to_string(),
        id,
    }
}

fn file_stem(file_name: &str) -> &str {
    file_name.strip_suffix(".mp3").unwrap_or(file_name)
}

/// "al_fatiha-recital.mp3" -> "Al Fatiha Recital"
pub fn display_title(file_name: &str) -> String {
    file_stem(file_name)
        .split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET: &str = "https://host/quran/";

    #[test]
    fn test_from_file_names_follows_bucket_layout() {
        let catalogue =
            Catalogue::from_file_names(&Bucket::new(BUCKET), &["001.mp3", "002.mp3"]).unwrap();
        let first = catalogue.get("001").unwrap();
        assert_eq!(
            first.remote_audio_url.as_deref(),
            Some("https://host/quran/songs/001.mp3")
        );
        assert_eq!(first.album_art_url, "https://host/quran/covers/001.jpg");
        assert_eq!(first.title, "001");
        assert_eq!(first.duration, "0:00");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = Catalogue::from_file_names(&Bucket::new(BUCKET), &["001.mp3", "001"]).unwrap_err();
        assert!(matches!(err, CatalogueError::DuplicateId(id) if id == "001"));
    }

    #[test]
    fn test_display_title() {
        assert_eq!(display_title("al_fatiha-recital.mp3"), "Al Fatiha Recital");
        assert_eq!(display_title("YASEEN.mp3"), "Yaseen");
    }

    #[test]
    fn test_manifest_parsing() {
        let catalogue = Catalogue::from_manifest_str(
            r#"
            [[track]]
            id = "001"
            title = "Al-Fatiha"
            remote_audio_url = "https://host/songs/001.mp3"

            [[track]]
            id = "114"
            title = "An-Nas"
            "#,
        )
        .unwrap();
        assert_eq!(catalogue.len(), 2);
        assert_eq!(catalogue.get("114").unwrap().remote_audio_url, None);
        assert_eq!(catalogue.get("001").unwrap().duration, "0:00");
    }

    #[test]
    fn test_next_and_previous_wrap() {
        let catalogue =
            Catalogue::from_file_names(&Bucket::new(BUCKET), &["a.mp3", "b.mp3", "c.mp3"]).unwrap();
        assert_eq!(catalogue.next_after("c").unwrap().id, "a");
        assert_eq!(catalogue.next_after("a").unwrap().id, "b");
        assert_eq!(catalogue.previous_before("a").unwrap().id, "c");
        assert!(catalogue.next_after("zzz").is_none());
    }

    #[test]
    fn test_resolve_falls_back_to_file_list() {
        let dir = std::env::temp_dir().join("tilawa-catalogue-missing.toml");
        let catalogue = Catalogue::resolve(&dir, &Bucket::new(BUCKET), &["001.mp3"]).unwrap();
        assert_eq!(catalogue.len(), 1);
    }
}
