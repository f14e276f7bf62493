use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub catalogue: CatalogueConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub downloads: DownloadsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where the track list comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogueConfig {
    /// Public base URL of the bucket, without trailing slash.
    #[serde(default = "default_bucket_url")]
    pub bucket_url: String,
    /// Optional TOML manifest of `[[track]]` tables (highest priority).
    /// Defaults to `$XDG_CONFIG_HOME/tilawa/catalogue.toml`.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    /// Object names under `songs/`, used when the manifest does not exist.
    #[serde(default = "default_files")]
    pub files: Vec<String>,
}

/// User-configurable paths for downloads and persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "platform::downloads_dir")]
    pub downloads_dir: PathBuf,
    #[serde(default = "platform::store_file")]
    pub store_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// State projector sampling interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long to wait for mpv to report a duration after `loadfile`.
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
    /// Play the next catalogue entry when a track finishes.
    #[serde(default = "default_auto_advance")]
    pub auto_advance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadsConfig {
    /// Minimum spacing between progress callbacks for one file.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for CatalogueConfig {
    fn default() -> Self {
        Self {
            bucket_url: default_bucket_url(),
            manifest: default_manifest(),
            files: default_files(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            downloads_dir: platform::downloads_dir(),
            store_file: platform::store_file(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            load_timeout_secs: default_load_timeout_secs(),
            auto_advance: default_auto_advance(),
        }
    }
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8788
}

fn default_bucket_url() -> String {
    "https://4842142376ec4be9e187834dd7e0d2fa.r2.cloudflarestorage.com/quran".to_string()
}

fn default_manifest() -> PathBuf {
    platform::config_dir().join("catalogue.toml")
}

fn default_files() -> Vec<String> {
    vec!["001.mp3".to_string()]
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_load_timeout_secs() -> u64 {
    15
}

fn default_auto_advance() -> bool {
    true
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8788);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.playback.poll_interval_ms, 1000);
        assert!(config.catalogue.bucket_url.starts_with("https://"));
        assert!(config.paths.downloads_dir.ends_with("tilawa/music"));
        assert!(config.catalogue.manifest.ends_with("tilawa/catalogue.toml"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [playback]
            auto_advance = false

            [catalogue]
            files = ["001.mp3", "002.mp3"]
            "#,
        )
        .unwrap();
        assert!(!config.playback.auto_advance);
        assert_eq!(config.playback.load_timeout_secs, 15);
        assert_eq!(config.catalogue.files.len(), 2);
        assert_eq!(config.downloads.progress_interval_ms, 250);
        assert_eq!(config.http.port, 8788);
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml_str(&text).unwrap();
        assert_eq!(parsed.catalogue.files, config.catalogue.files);
        assert_eq!(parsed.paths.store_file, config.paths.store_file);
    }
}
