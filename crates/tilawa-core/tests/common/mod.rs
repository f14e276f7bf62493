#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, StreamExt};
use tilawa_core::error::MediaError;
use tilawa_core::media::{AudioBackend, AudioHandle, MediaStatus, PlaybackSource};
use tilawa_core::{JsonStore, Ledger};
use tilawa_proto::model::Track;

// ── catalogue + ledger helpers ────────────────────────────────────────────────

pub fn track(id: &str, base_url: &str) -> Track {
    Track {
        id: id.to_string(),
        title: format!("Track {id}"),
        artist: "Unknown Artist".to_string(),
        album_art_url: format!("{base_url}/covers/{id}.jpg"),
        remote_audio_url: Some(format!("{base_url}/songs/{id}.mp3")),
        genre: "Quran".to_string(),
        duration: "0:00".to_string(),
    }
}

pub fn offline_track(id: &str) -> Track {
    Track {
        remote_audio_url: None,
        ..track(id, "http://127.0.0.1:9")
    }
}

pub fn ledger_in(dir: &Path) -> Arc<Ledger> {
    let store = JsonStore::open(dir.join("store.json"));
    Arc::new(Ledger::new(store, dir.join("music")))
}

pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

// ── HTTP fixture ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct FixtureState {
    files: HashMap<String, Vec<u8>>,
    /// Names whose body errors out after the first chunk.
    broken: HashSet<String>,
    /// Names whose body stalls forever after the first chunk.
    stalled: HashSet<String>,
    hits: Mutex<HashMap<String, usize>>,
}

/// Local bucket serving `/songs/<name>`.
pub struct Bucket {
    pub base_url: String,
    state: Arc<FixtureState>,
}

impl Bucket {
    pub fn url_for(&self, name: &str) -> String {
        format!("{}/songs/{}", self.base_url, name)
    }

    pub fn hits(&self, name: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Default)]
pub struct BucketBuilder {
    state: FixtureState,
}

impl BucketBuilder {
    pub fn file(mut self, name: &str, body: Vec<u8>) -> Self {
        self.state.files.insert(name.to_string(), body);
        self
    }

    pub fn broken(mut self, name: &str, body: Vec<u8>) -> Self {
        self.state.broken.insert(name.to_string());
        self.file(name, body)
    }

    pub fn stalled(mut self, name: &str, body: Vec<u8>) -> Self {
        self.state.stalled.insert(name.to_string());
        self.file(name, body)
    }

    pub async fn serve(self) -> Bucket {
        let state = Arc::new(self.state);
        let app = Router::new()
            .route("/songs/:name", get(serve_song))
            .with_state(state.clone());
        let base_url = serve(app).await;
        Bucket { base_url, state }
    }
}

async fn serve_song(
    State(state): State<Arc<FixtureState>>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    *state.hits.lock().unwrap().entry(name.clone()).or_default() += 1;

    let Some(body) = state.files.get(&name).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let len = body.len();
    let half = len / 2;

    if state.broken.contains(&name) {
        let first = Bytes::copy_from_slice(&body[..half]);
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(first),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection dropped",
            )),
        ];
        return Body::from_stream(stream::iter(chunks)).into_response();
    }

    if state.stalled.contains(&name) {
        let first = Bytes::copy_from_slice(&body[..half]);
        let chunks = stream::iter(vec![Ok::<_, std::io::Error>(first)]).chain(stream::pending());
        return (
            [(header::CONTENT_LENGTH, len.to_string())],
            Body::from_stream(chunks),
        )
            .into_response();
    }

    ([(header::CONTENT_LENGTH, len.to_string())], body).into_response()
}

/// Bind an ephemeral port and serve `app` on it. Returns the base URL.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ── scripted audio backend ────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeMedia {
    open_handles: AtomicUsize,
    max_open: AtomicUsize,
    opened: Mutex<Vec<PlaybackSource>>,
    duration_ms: AtomicU64,
    open_delay_ms: AtomicU64,
    fail_open: AtomicBool,
    fail_status: AtomicBool,
    /// Level-triggered end-of-stream flag, like mpv's `eof-reached`.
    at_end: AtomicBool,
    /// Position every open handle reports, driven by the test.
    position_ms: AtomicU64,
    playing: AtomicBool,
}

#[derive(Clone)]
pub struct FakeBackend {
    pub media: Arc<FakeMedia>,
}

impl FakeBackend {
    pub fn new(duration_ms: u64) -> Self {
        let media = FakeMedia::default();
        media.duration_ms.store(duration_ms, Ordering::SeqCst);
        Self {
            media: Arc::new(media),
        }
    }

    pub fn open_handles(&self) -> usize {
        self.media.open_handles.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.media.max_open.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<PlaybackSource> {
        self.media.opened.lock().unwrap().clone()
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.media
            .open_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_open(&self, fail: bool) {
        self.media.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status(&self, fail: bool) {
        self.media.fail_status.store(fail, Ordering::SeqCst);
    }

    pub fn set_position(&self, position_ms: u64) {
        self.media.position_ms.store(position_ms, Ordering::SeqCst);
    }

    pub fn position(&self) -> u64 {
        self.media.position_ms.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.media.playing.load(Ordering::SeqCst)
    }

    /// Jump to the end of the asset; `did_just_finish` stays true until a
    /// seek moves the position back.
    pub fn reach_end(&self) {
        let duration = self.media.duration_ms.load(Ordering::SeqCst);
        self.media.position_ms.store(duration, Ordering::SeqCst);
        self.media.playing.store(false, Ordering::SeqCst);
        self.media.at_end.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioBackend for FakeBackend {
    type Handle = FakeHandle;

    async fn open(&self, source: &PlaybackSource) -> Result<FakeHandle, MediaError> {
        let delay = self.media.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.media.fail_open.load(Ordering::SeqCst) {
            return Err(MediaError::LoadTimeout(source.uri()));
        }
        self.media.opened.lock().unwrap().push(source.clone());
        let now_open = self.media.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.media.max_open.fetch_max(now_open, Ordering::SeqCst);
        self.media.position_ms.store(0, Ordering::SeqCst);
        self.media.playing.store(false, Ordering::SeqCst);
        self.media.at_end.store(false, Ordering::SeqCst);
        Ok(FakeHandle {
            media: self.media.clone(),
            closed: false,
        })
    }
}

pub struct FakeHandle {
    media: Arc<FakeMedia>,
    closed: bool,
}

impl FakeHandle {
    fn check(&self) -> Result<(), MediaError> {
        if self.closed {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AudioHandle for FakeHandle {
    async fn play(&mut self) -> Result<(), MediaError> {
        self.check()?;
        self.media.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), MediaError> {
        self.check()?;
        self.media.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn seek(&mut self, position_ms: u64) -> Result<(), MediaError> {
        self.check()?;
        self.media.position_ms.store(position_ms, Ordering::SeqCst);
        if position_ms < self.media.duration_ms.load(Ordering::SeqCst) {
            self.media.at_end.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn status(&mut self) -> Result<MediaStatus, MediaError> {
        self.check()?;
        if self.media.fail_status.load(Ordering::SeqCst) {
            return Err(MediaError::Ipc("scripted status failure".into()));
        }
        let at_end = self.media.at_end.load(Ordering::SeqCst);
        Ok(MediaStatus {
            position_ms: self.media.position_ms.load(Ordering::SeqCst),
            duration_ms: Some(self.media.duration_ms.load(Ordering::SeqCst)),
            is_playing: self.media.playing.load(Ordering::SeqCst) && !at_end,
            did_just_finish: at_end,
        })
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        if !self.closed {
            self.closed = true;
            self.media.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
