//! Offline playback and download core.
//!
//! The ledger records which tracks have a verified local copy, the download
//! manager fills it, and the playback engine prefers those local copies over
//! the network whenever it loads a track.

pub mod download_manager;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod ledger;
pub mod media;
pub mod player;
pub mod store;

pub use download_manager::DownloadManager;
pub use engine::PlaybackEngine;
pub use fetcher::Fetcher;
pub use ledger::Ledger;
pub use player::Player;
pub use store::JsonStore;
