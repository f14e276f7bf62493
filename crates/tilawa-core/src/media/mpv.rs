//! mpv-backed audio resources.
//!
//! Every session is its own mpv process, so "one open resource" is literally
//! one child process:
//!
//! ```text
//!   MpvBackend::open(source)
//!         │
//!         ├── spawn mpv --idle --pause --keep-open --input-ipc-server=<sock>
//!         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
//!         ├── reader_task   ← reads JSON lines, resolves the matching oneshot
//!         └── loadfile + wait for `duration`
//! ```
//!
//! `--keep-open=yes` keeps the file loaded at its end, which makes
//! `eof-reached` a level-triggered flag the engine can edge-detect.
//!
//! Platform notes:
//! - Unix:   Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::{AudioBackend, AudioHandle, MediaStatus, PlaybackSource};
use crate::error::MediaError;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const IPC_TIMEOUT: Duration = Duration::from_secs(5);
const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(100);

type Reply = oneshot::Sender<Result<Value, MediaError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Reply>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: Reply,
}

// ── IPC handle ────────────────────────────────────────────────────────────────

/// Handle to the writer task of one mpv connection.
#[derive(Clone)]
struct MpvIpc {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvIpc {
    async fn send(&self, command: Value) -> Result<Value, MediaError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg).map_err(|e| MediaError::Ipc(e.to_string()))?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| MediaError::Closed)?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| MediaError::Ipc(format!("timeout for req={}", req_id)))?
            .map_err(|_| MediaError::Ipc(format!("reply channel dropped req={}", req_id)))?
    }

    async fn get_f64(&self, property: &str) -> Option<f64> {
        match self.send(json!(["get_property", property])).await {
            Ok(resp) => resp["data"].as_f64(),
            Err(_) => None,
        }
    }

    async fn get_bool(&self, property: &str) -> Option<bool> {
        match self.send(json!(["get_property", property])).await {
            Ok(resp) => resp["data"].as_bool(),
            Err(_) => None,
        }
    }

    async fn set_pause(&self, paused: bool) -> Result<(), MediaError> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }
}

// ── backend ───────────────────────────────────────────────────────────────────

pub struct MpvBackend {
    binary: Option<PathBuf>,
    load_timeout: Duration,
    next_session: AtomicU64,
}

impl MpvBackend {
    /// Locate mpv via `MPV_PATH`, beside the executable, then `PATH`.
    pub fn new(load_timeout: Duration) -> Self {
        let binary = tilawa_proto::platform::find_mpv_binary();
        match &binary {
            Some(p) => info!("mpv: using {}", p.display()),
            None => warn!("mpv: binary not found, playback will fail"),
        }
        Self {
            binary,
            load_timeout,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn with_binary(binary: PathBuf, load_timeout: Duration) -> Self {
        Self {
            binary: Some(binary),
            load_timeout,
            next_session: AtomicU64::new(1),
        }
    }

    fn spawn(&self, socket: &std::path::Path) -> Result<Child, MediaError> {
        let binary = self.binary.as_ref().ok_or(MediaError::BinaryNotFound)?;
        tokio::process::Command::new(binary)
            .arg("--no-video")
            .arg("--no-terminal")
            .arg("--idle=yes")
            .arg("--pause")
            .arg("--keep-open=yes")
            .arg(format!("--input-ipc-server={}", socket.display()))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(MediaError::Spawn)
    }
}

#[async_trait]
impl AudioBackend for MpvBackend {
    type Handle = MpvSession;

    async fn open(&self, source: &PlaybackSource) -> Result<MpvSession, MediaError> {
        let tag = format!(
            "{}-{}",
            std::process::id(),
            self.next_session.fetch_add(1, Ordering::Relaxed)
        );
        let socket = tilawa_proto::platform::mpv_socket_path(&tag);
        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&socket).await;

        info!("mpv: spawning session {} for {}", tag, source.uri());
        let mut child = self.spawn(&socket)?;

        let ipc = match connect(&socket).await {
            Ok(ipc) => ipc,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        let mut session = MpvSession {
            child: Some(child),
            ipc,
            socket,
        };
        if let Err(e) = session.load(source, self.load_timeout).await {
            warn!("mpv: load of {} failed: {}", source.uri(), e);
            let _ = session.close().await;
            return Err(e);
        }
        Ok(session)
    }
}

// ── session ───────────────────────────────────────────────────────────────────

/// One mpv process with one loaded file.
pub struct MpvSession {
    child: Option<Child>,
    ipc: MpvIpc,
    socket: PathBuf,
}

impl MpvSession {
    async fn load(&mut self, source: &PlaybackSource, timeout: Duration) -> Result<(), MediaError> {
        self.ipc.send(json!(["loadfile", source.uri()])).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(duration) = self.ipc.get_f64("duration").await {
                debug!("mpv: loaded {} ({:.1}s)", source.uri(), duration);
                return Ok(());
            }
            if !self.process_alive() {
                return Err(MediaError::Ipc("mpv exited while loading".to_string()));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MediaError::LoadTimeout(source.uri()));
            }
            tokio::time::sleep(LOAD_POLL_INTERVAL).await;
        }
    }

    fn process_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.child.is_some() {
            Ok(())
        } else {
            Err(MediaError::Closed)
        }
    }
}

#[async_trait]
impl AudioHandle for MpvSession {
    async fn play(&mut self) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.ipc.set_pause(false).await
    }

    async fn pause(&mut self) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.ipc.set_pause(true).await
    }

    async fn seek(&mut self, position_ms: u64) -> Result<(), MediaError> {
        self.ensure_open()?;
        let secs = position_ms as f64 / 1000.0;
        self.ipc
            .send(json!(["set_property", "time-pos", secs]))
            .await?;
        Ok(())
    }

    async fn status(&mut self) -> Result<MediaStatus, MediaError> {
        self.ensure_open()?;
        if !self.process_alive() {
            return Err(MediaError::Ipc("mpv process exited".to_string()));
        }
        let position = self.ipc.get_f64("time-pos").await.unwrap_or(0.0);
        let duration = self.ipc.get_f64("duration").await;
        let paused = self.ipc.get_bool("pause").await.unwrap_or(true);
        let eof = self.ipc.get_bool("eof-reached").await.unwrap_or(false);
        Ok(MediaStatus {
            position_ms: secs_to_ms(position),
            duration_ms: duration.map(secs_to_ms),
            is_playing: !paused && !eof,
            did_just_finish: eof,
        })
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let _ = self.ipc.send(json!(["quit"])).await;
        match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
            Ok(_) => debug!("mpv: session exited"),
            Err(_) => {
                warn!("mpv: session did not quit, killing");
                let _ = child.kill().await;
            }
        }
        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&self.socket).await;
        Ok(())
    }
}

fn secs_to_ms(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1000.0).round() as u64
    } else {
        0
    }
}

// ── connection ────────────────────────────────────────────────────────────────

#[cfg(unix)]
async fn connect(socket: &std::path::Path) -> Result<MpvIpc, MediaError> {
    use tokio::net::UnixStream;

    // Wait for socket to appear
    for _ in 0..50 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if !socket.exists() {
        return Err(MediaError::Ipc("mpv IPC socket did not appear".to_string()));
    }

    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| MediaError::Ipc(e.to_string()))?;
    let (read_half, write_half) = stream.into_split();
    Ok(start_io_tasks(read_half, write_half))
}

#[cfg(windows)]
async fn connect(socket: &std::path::Path) -> Result<MpvIpc, MediaError> {
    use tokio::net::windows::named_pipe::ClientOptions;

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(client) = ClientOptions::new().open(socket) {
            let (read_half, write_half) = tokio::io::split(client);
            return Ok(start_io_tasks(read_half, write_half));
        }
    }
    Err(MediaError::Ipc("mpv named pipe did not appear".to_string()))
}

fn start_io_tasks<R, W>(read_half: R, write_half: W) -> MpvIpc
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Shared between writer (inserts) and reader (resolves).
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending));

    MpvIpc { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) else {
                    // Unsolicited event; status is pulled, so events are only logged
                    debug!("mpv reader: event {}", trimmed);
                    continue;
                };

                let mut map = pending.lock().await;
                if let Some(tx) = map.remove(&req_id) {
                    let result = if val["error"].as_str() == Some("success") {
                        Ok(val)
                    } else {
                        let err = val["error"].as_str().unwrap_or("unknown error");
                        Err(MediaError::Ipc(format!("mpv error: {}", err)))
                    };
                    let _ = tx.send(result);
                } else {
                    debug!("mpv reader: response for unknown req={}", req_id);
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(MediaError::Ipc(reason.to_string())));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(MediaError::Ipc(format!("write error: {}", e))));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_to_ms() {
        assert_eq!(secs_to_ms(1.2345), 1235);
        assert_eq!(secs_to_ms(-3.0), 0);
        assert_eq!(secs_to_ms(f64::NAN), 0);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_open() {
        let backend = MpvBackend {
            binary: None,
            load_timeout: Duration::from_secs(1),
            next_session: AtomicU64::new(1),
        };
        let err = backend
            .open(&PlaybackSource::Remote("https://host/songs/001.mp3".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MediaError::BinaryNotFound));
    }
}
