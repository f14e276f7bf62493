use crate::core::{App, PlayError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tilawa_core::error::PlaybackError;
use tilawa_core::media::AudioBackend;
use tilawa_proto::model::{
    BatchProgress, DownloadRecord, OnboardingStatus, PlayerSnapshot, Track,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

struct HttpState<B: AudioBackend> {
    app: Arc<App<B>>,
}

impl<B: AudioBackend> Clone for HttpState<B> {
    fn clone(&self) -> Self {
        Self {
            app: Arc::clone(&self.app),
        }
    }
}

#[derive(Serialize)]
struct TrackInfo {
    #[serde(flatten)]
    track: Track,
    downloaded: bool,
}

#[derive(Serialize)]
struct RemoteStatus {
    available: bool,
    size_bytes: Option<u64>,
    last_modified: Option<String>,
}

#[derive(Serialize)]
struct ApiState {
    #[serde(flatten)]
    snapshot: PlayerSnapshot,
    progress: f64,
    position: String,
    duration: String,
}

impl From<PlayerSnapshot> for ApiState {
    fn from(snapshot: PlayerSnapshot) -> Self {
        Self {
            progress: snapshot.progress(),
            position: snapshot.position_label(),
            duration: snapshot.duration_label(),
            snapshot,
        }
    }
}

#[derive(Serialize)]
struct Usage {
    total_size_bytes: u64,
    file_count: usize,
    formatted_size: String,
}

#[derive(Serialize)]
struct DownloadsView {
    records: Vec<DownloadRecord>,
    usage: Usage,
    batch: Option<BatchProgress>,
    all_downloaded: bool,
}

#[derive(Serialize)]
struct DownloadResult {
    track_id: String,
    downloaded: bool,
}

#[derive(Serialize)]
struct DeleteResult {
    track_id: String,
    deleted: bool,
}

#[derive(Serialize)]
struct ClearResult {
    files_removed: usize,
}

#[derive(Serialize, Deserialize)]
struct OnboardingBody {
    status: OnboardingStatus,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
}

fn play_error(e: PlayError) -> (StatusCode, Json<ApiError>) {
    let status = match &e {
        PlayError::UnknownTrack(_) | PlayError::EmptyCatalogue => StatusCode::NOT_FOUND,
        PlayError::Playback(p) => return playback_error(p),
    };
    api_error(status, e.to_string())
}

fn playback_error(e: &PlaybackError) -> (StatusCode, Json<ApiError>) {
    let status = match e {
        PlaybackError::NoPlayableSource(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PlaybackError::AlreadyInProgress | PlaybackError::NoTrackLoaded => StatusCode::CONFLICT,
        PlaybackError::Media(_) => StatusCode::BAD_GATEWAY,
    };
    api_error(status, e.to_string())
}

pub fn router<B: AudioBackend>(app: Arc<App<B>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/tracks", get(list_tracks::<B>))
        .route("/api/tracks/:id/remote", get(remote_status::<B>))
        .route("/api/state", get(get_state::<B>))
        .route("/api/play/:id", post(play_track::<B>))
        .route("/api/pause", post(pause::<B>))
        .route("/api/resume", post(resume::<B>))
        .route("/api/toggle", post(toggle::<B>))
        .route("/api/stop", post(stop::<B>))
        .route("/api/next", post(next_track::<B>))
        .route("/api/prev", post(prev_track::<B>))
        .route("/api/seek/:ms", post(seek::<B>))
        .route(
            "/api/downloads",
            get(list_downloads::<B>)
                .post(start_downloads::<B>)
                .delete(clear_downloads::<B>),
        )
        .route("/api/downloads/cancel", post(cancel_downloads::<B>))
        .route(
            "/api/downloads/:id",
            post(download_track::<B>).delete(delete_download::<B>),
        )
        .route(
            "/api/onboarding",
            get(get_onboarding::<B>).put(set_onboarding::<B>),
        )
        .layer(cors)
        .with_state(HttpState { app })
}

pub fn start_server<B: AudioBackend>(
    bind_address: String,
    port: u16,
    app: Arc<App<B>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let router = router(app);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, router).await {
            error!("HTTP server error: {}", e);
        }
    })
}

// ── catalogue ─────────────────────────────────────────────────────────────────

async fn list_tracks<B: AudioBackend>(State(state): State<HttpState<B>>) -> Json<Vec<TrackInfo>> {
    let ledger = state.app.downloads.ledger();
    let mut tracks = Vec::with_capacity(state.app.catalogue.len());
    for track in state.app.catalogue.tracks() {
        tracks.push(TrackInfo {
            downloaded: ledger.is_downloaded(&track.id).await,
            track: track.clone(),
        });
    }
    Json(tracks)
}

async fn remote_status<B: AudioBackend>(
    State(state): State<HttpState<B>>,
    Path(id): Path<String>,
) -> ApiResult<RemoteStatus> {
    let track = state
        .app
        .catalogue
        .get(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown track {}", id)))?;
    let Some(url) = track.remote_audio_url.as_deref() else {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("track {} has no remote audio url", id),
        ));
    };

    let status = match state.app.downloads.fetcher().probe(url).await {
        Some(info) => RemoteStatus {
            available: true,
            size_bytes: info.size_bytes,
            last_modified: info.last_modified,
        },
        None => RemoteStatus {
            available: false,
            size_bytes: None,
            last_modified: None,
        },
    };
    Ok(Json(status))
}

// ── playback ──────────────────────────────────────────────────────────────────

async fn get_state<B: AudioBackend>(State(state): State<HttpState<B>>) -> Json<ApiState> {
    Json(state.app.player.snapshot().into())
}

async fn play_track<B: AudioBackend>(
    State(state): State<HttpState<B>>,
    Path(id): Path<String>,
) -> ApiResult<ApiState> {
    info!("HTTP API: Play {}", id);
    state.app.play_track(&id).await.map_err(play_error)?;
    Ok(Json(state.app.player.snapshot().into()))
}

async fn pause<B: AudioBackend>(State(state): State<HttpState<B>>) -> ApiResult<ApiState> {
    info!("HTTP API: Pause");
    state
        .app
        .player
        .pause()
        .await
        .map_err(|e| playback_error(&e))?;
    Ok(Json(state.app.player.snapshot().into()))
}

async fn resume<B: AudioBackend>(State(state): State<HttpState<B>>) -> ApiResult<ApiState> {
    info!("HTTP API: Resume");
    state
        .app
        .player
        .play()
        .await
        .map_err(|e| playback_error(&e))?;
    Ok(Json(state.app.player.snapshot().into()))
}

async fn toggle<B: AudioBackend>(State(state): State<HttpState<B>>) -> ApiResult<ApiState> {
    info!("HTTP API: Toggle");
    state
        .app
        .player
        .toggle()
        .await
        .map_err(|e| playback_error(&e))?;
    Ok(Json(state.app.player.snapshot().into()))
}

async fn stop<B: AudioBackend>(State(state): State<HttpState<B>>) -> Json<ApiState> {
    info!("HTTP API: Stop");
    state.app.player.stop().await;
    Json(state.app.player.snapshot().into())
}

async fn next_track<B: AudioBackend>(State(state): State<HttpState<B>>) -> ApiResult<ApiState> {
    info!("HTTP API: Next track");
    state.app.next().await.map_err(play_error)?;
    Ok(Json(state.app.player.snapshot().into()))
}

async fn prev_track<B: AudioBackend>(State(state): State<HttpState<B>>) -> ApiResult<ApiState> {
    info!("HTTP API: Previous track");
    state.app.prev().await.map_err(play_error)?;
    Ok(Json(state.app.player.snapshot().into()))
}

async fn seek<B: AudioBackend>(
    State(state): State<HttpState<B>>,
    Path(ms): Path<i64>,
) -> ApiResult<ApiState> {
    info!("HTTP API: Seek to {}ms", ms);
    state
        .app
        .player
        .seek_to(ms)
        .await
        .map_err(|e| playback_error(&e))?;
    Ok(Json(state.app.player.snapshot().into()))
}

// ── downloads ─────────────────────────────────────────────────────────────────

async fn list_downloads<B: AudioBackend>(State(state): State<HttpState<B>>) -> Json<DownloadsView> {
    let downloads = &state.app.downloads;
    let ledger = downloads.ledger();
    let usage = ledger.usage_summary().await;
    Json(DownloadsView {
        records: ledger.records().await,
        usage: Usage {
            total_size_bytes: usage.total_size_bytes,
            file_count: usage.file_count,
            formatted_size: usage.formatted_size(),
        },
        batch: downloads.last_batch(),
        all_downloaded: downloads
            .are_all_downloaded(state.app.catalogue.tracks())
            .await,
    })
}

async fn start_downloads<B: AudioBackend>(State(state): State<HttpState<B>>) -> StatusCode {
    info!("HTTP API: Download all ({} tracks)", state.app.catalogue.len());
    let downloads = Arc::clone(&state.app.downloads);
    let (handle, mut progress_rx) =
        downloads.spawn_download_all(state.app.catalogue.tracks().to_vec());

    tokio::spawn(async move {
        let mut last_summary = String::new();
        while let Some(batch) = progress_rx.recv().await {
            let summary = batch.summary();
            if summary != last_summary {
                info!("downloads: {}", summary);
                last_summary = summary;
            }
        }
        match handle.await {
            Ok(true) => {
                downloads
                    .ledger()
                    .set_onboarding_status(OnboardingStatus::Downloaded)
                    .await;
            }
            Ok(false) => warn!("downloads: batch finished with failures"),
            Err(e) => error!("downloads: batch task failed: {}", e),
        }
    });

    StatusCode::ACCEPTED
}

async fn cancel_downloads<B: AudioBackend>(State(state): State<HttpState<B>>) -> StatusCode {
    info!("HTTP API: Cancel downloads");
    state.app.downloads.cancel();
    StatusCode::OK
}

async fn download_track<B: AudioBackend>(
    State(state): State<HttpState<B>>,
    Path(id): Path<String>,
) -> ApiResult<DownloadResult> {
    info!("HTTP API: Download {}", id);
    let track = state
        .app
        .catalogue
        .get(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown track {}", id)))?;
    let downloaded = state.app.downloads.download_one(track, |_| {}).await;
    Ok(Json(DownloadResult {
        track_id: id,
        downloaded,
    }))
}

async fn delete_download<B: AudioBackend>(
    State(state): State<HttpState<B>>,
    Path(id): Path<String>,
) -> Json<DeleteResult> {
    info!("HTTP API: Delete download {}", id);
    let deleted = state.app.downloads.ledger().delete_record(&id).await;
    Json(DeleteResult {
        track_id: id,
        deleted,
    })
}

async fn clear_downloads<B: AudioBackend>(State(state): State<HttpState<B>>) -> Json<ClearResult> {
    info!("HTTP API: Clear all downloads");
    let files_removed = state.app.downloads.ledger().clear_all().await;
    Json(ClearResult { files_removed })
}

// ── onboarding ────────────────────────────────────────────────────────────────

async fn get_onboarding<B: AudioBackend>(State(state): State<HttpState<B>>) -> Json<OnboardingBody> {
    let status = state.app.downloads.ledger().onboarding_status().await;
    Json(OnboardingBody { status })
}

async fn set_onboarding<B: AudioBackend>(
    State(state): State<HttpState<B>>,
    Json(body): Json<OnboardingBody>,
) -> ApiResult<OnboardingBody> {
    info!("HTTP API: Onboarding -> {}", body.status.as_str());
    if !state
        .app
        .downloads
        .ledger()
        .set_onboarding_status(body.status)
        .await
    {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to save onboarding status",
        ));
    }
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_app;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(router: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = router.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_tracks_list_reports_download_flags() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_app(dir.path()));

        let (status, body) = call(router, "GET", "/api/tracks", None).await;
        assert_eq!(status, StatusCode::OK);
        let tracks = body.as_array().unwrap();
        assert_eq!(tracks.len(), 3);
        assert_eq!(tracks[0]["id"], "001");
        assert_eq!(tracks[0]["downloaded"], false);
    }

    #[tokio::test]
    async fn test_play_then_seek_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_app(dir.path()));

        let (status, body) = call(router.clone(), "POST", "/api/play/002", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "playing");
        assert_eq!(body["track"]["id"], "002");
        assert_eq!(body["source_kind"], "remote");

        let (status, body) = call(router.clone(), "POST", "/api/seek/-100", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["position_ms"], 0);

        let (_, body) = call(router, "POST", "/api/seek/999999999", None).await;
        assert_eq!(body["position_ms"], 180_000);
        assert_eq!(body["duration"], "3:00");
    }

    #[tokio::test]
    async fn test_playback_errors_map_to_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_app(dir.path()));

        let (status, body) = call(router.clone(), "POST", "/api/play/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown track 999");

        let (status, _) = call(router, "POST", "/api/pause", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_onboarding_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_app(dir.path()));

        let (_, body) = call(router.clone(), "GET", "/api/onboarding", None).await;
        assert_eq!(body["status"], "never_shown");

        let (status, _) = call(
            router.clone(),
            "PUT",
            "/api/onboarding",
            Some(serde_json::json!({ "status": "skipped" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(router, "GET", "/api/onboarding", None).await;
        assert_eq!(body["status"], "skipped");
    }

    #[tokio::test]
    async fn test_downloads_view_and_clear_on_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(test_app(dir.path()));

        let (status, body) = call(router.clone(), "GET", "/api/downloads", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["usage"]["formatted_size"], "0 Bytes");
        assert_eq!(body["all_downloaded"], false);
        assert!(body["batch"].is_null());

        let (_, body) = call(router.clone(), "DELETE", "/api/downloads", None).await;
        assert_eq!(body["files_removed"], 0);

        let (_, body) = call(router, "DELETE", "/api/downloads/001", None).await;
        assert_eq!(body["deleted"], false);
    }
}
