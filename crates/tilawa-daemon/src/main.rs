mod core;
mod http;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use tilawa_core::media::mpv::MpvBackend;
use tilawa_core::{DownloadManager, Fetcher, JsonStore, Ledger, PlaybackEngine, Player};
use tilawa_proto::catalogue::{Bucket, Catalogue};
use tilawa_proto::config::Config;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup file logging
    let data_dir = tilawa_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,tilawa_core=debug,tilawa_daemon=debug,hyper=warn,reqwest=warn",
                )
            }),
        )
        .init();

    eprintln!("tilawa-daemon: logging to {}", log_path.display());
    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let bucket = Bucket::new(config.catalogue.bucket_url.clone());
    let catalogue = Catalogue::resolve(&config.catalogue.manifest, &bucket, &config.catalogue.files)?;
    info!("Catalogue: {} tracks", catalogue.len());

    let store = JsonStore::open(config.paths.store_file.clone());
    let ledger = Arc::new(Ledger::new(store, config.paths.downloads_dir.clone()));
    ledger.initialize().await;

    let fetcher = Fetcher::with_connect_timeout(Duration::from_secs(
        config.downloads.connect_timeout_secs,
    ))
    .with_progress_interval(Duration::from_millis(config.downloads.progress_interval_ms));
    let downloads = Arc::new(DownloadManager::new(ledger.clone(), fetcher));

    let backend = MpvBackend::new(Duration::from_secs(config.playback.load_timeout_secs));
    let engine = PlaybackEngine::new(ledger, backend);
    let player = Player::new(
        engine,
        Duration::from_millis(config.playback.poll_interval_ms),
    );

    let app = Arc::new(core::App::new(catalogue, downloads, player));

    // Event channel: finished notifications and shutdown funnel into DaemonCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::DaemonEvent>(64);

    let daemon_core = core::DaemonCore::new(config.clone(), app.clone());
    daemon_core.wire_finished(event_tx.clone()).await;

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            app.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
            }
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    info!("Daemon initialised, running event loop");
    daemon_core.run(event_rx).await?;

    Ok(())
}
