use std::sync::Arc;

use async_trait::async_trait;
use tilawa_core::error::MediaError;
use tilawa_core::media::{AudioBackend, AudioHandle, MediaStatus, PlaybackSource};
use tilawa_core::{DownloadManager, Fetcher, JsonStore, Ledger, PlaybackEngine, Player};
use tilawa_proto::catalogue::{Bucket, Catalogue};

use crate::core::App;

/// Backend that accepts every source and plays nothing.
pub struct SilentBackend;

pub struct SilentHandle {
    position_ms: u64,
    playing: bool,
}

#[async_trait]
impl AudioBackend for SilentBackend {
    type Handle = SilentHandle;

    async fn open(&self, _source: &PlaybackSource) -> Result<SilentHandle, MediaError> {
        Ok(SilentHandle {
            position_ms: 0,
            playing: false,
        })
    }
}

#[async_trait]
impl AudioHandle for SilentHandle {
    async fn play(&mut self) -> Result<(), MediaError> {
        self.playing = true;
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), MediaError> {
        self.playing = false;
        Ok(())
    }

    async fn seek(&mut self, position_ms: u64) -> Result<(), MediaError> {
        self.position_ms = position_ms;
        Ok(())
    }

    async fn status(&mut self) -> Result<MediaStatus, MediaError> {
        Ok(MediaStatus {
            position_ms: self.position_ms,
            duration_ms: Some(180_000),
            is_playing: self.playing,
            did_just_finish: false,
        })
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        Ok(())
    }
}

/// Three-track catalogue on an unreachable bucket, state under `dir`.
pub fn test_app(dir: &std::path::Path) -> Arc<App<SilentBackend>> {
    let bucket = Bucket::new("http://127.0.0.1:9");
    let catalogue = Catalogue::from_file_names(&bucket, &["001.mp3", "002.mp3", "003.mp3"])
        .expect("valid catalogue");
    let store = JsonStore::open(dir.join("store.json"));
    let ledger = Arc::new(Ledger::new(store, dir.join("music")));
    let downloads = Arc::new(DownloadManager::new(ledger.clone(), Fetcher::default()));
    let engine = PlaybackEngine::new(ledger, SilentBackend);
    let player = Player::new(engine, std::time::Duration::from_millis(50));
    Arc::new(App::new(catalogue, downloads, player))
}
