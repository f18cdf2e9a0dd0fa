//! mpv-presence 0.2.x: mpv playback state → Discord Rich Presence
//! - Polls mpv's JSON IPC socket on a fixed tick and pushes an activity frame
//!   to Discord's local IPC socket.
//! - The Discord connection dials and retries on its own timer; a broken pipe
//!   on push closes the connection and re-runs the retry procedure without
//!   stalling the tick loop.
//! - At most one push is in flight per connection; a push carrying a stale
//!   generation token (from before a reconnect) is rejected, never applied.
//!
//! Notes:
//! - mpv is the primary dependency: a broken pipe on the control socket ends
//!   the program, a broken pipe on the Discord socket only triggers a
//!   reconnect.
//! - No unsafe. The in-flight push owns the connection guard for its whole
//!   lifetime; everything else takes the lock briefly.

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery, clippy::perf)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    env,
    io::ErrorKind,
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
    signal::unix::{signal, SignalKind},
    sync::Mutex,
    task,
    time::{self, MissedTickBehavior},
};

// ------------------------- Config -------------------------

#[derive(Debug, Default, Deserialize)]
struct Config {
    #[serde(default)]
    timing: Timing,
    #[serde(default)]
    branding: Branding,
    #[serde(default)]
    discord: DiscordCfg,
}

#[derive(Debug, Deserialize)]
struct Timing {
    #[serde(default = "d1000")]
    tick_ms: u64,
    #[serde(default = "d500")]
    reconnect_ms: u64,
    #[serde(default = "d5000")]
    query_timeout_ms: u64,
}
fn d1000() -> u64 {
    1000
}
fn d500() -> u64 {
    500
}
fn d5000() -> u64 {
    5000
}
impl Default for Timing {
    fn default() -> Self {
        Self {
            tick_ms: d1000(),
            reconnect_ms: d500(),
            query_timeout_ms: d5000(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Branding {
    #[serde(default = "default_image")]
    large_image: String,
    #[serde(default = "default_image")]
    large_text: String,
    #[serde(default = "dtrue")]
    show_version: bool,
}
fn default_image() -> String {
    "mpv".into()
}
fn dtrue() -> bool {
    true
}
impl Default for Branding {
    fn default() -> Self {
        Self {
            large_image: default_image(),
            large_text: default_image(),
            show_version: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DiscordCfg {
    #[serde(default)]
    socket_path: Option<String>,
}

fn read_config() -> Result<Config> {
    let Some(cfg_dir) = dirs::config_dir() else {
        return Ok(Config::default());
    };
    let path = cfg_dir.join("mpv-presence").join("config.toml");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(e).with_context(|| format!("reading config {}", path.display())),
    };
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ------------------------- Errors -------------------------

/// Classified failure on either IPC socket. Broken pipe invalidates the
/// connection it occurred on; end-of-stream is transient and leaves it alive.
#[derive(Debug, Error)]
enum IpcError {
    #[error("connection is not open")]
    NotConnected,
    #[error("broken pipe (peer closed the connection)")]
    BrokenPipe,
    #[error("end of stream")]
    Eof,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("stale connection generation: push carries {pushed}, connection is {current}")]
    StaleGeneration { pushed: u64, current: u64 },
    #[error("property `{key}`: expected {expected}, got {got}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(std::io::Error),
}

impl IpcError {
    fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Self::BrokenPipe
            }
            ErrorKind::UnexpectedEof => Self::Eof,
            _ => Self::Io(err),
        }
    }

    fn is_broken_pipe(&self) -> bool {
        matches!(self, Self::BrokenPipe)
    }

    fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Uninitialized,
    Open,
    Closed,
}

// ------------------------- Property values -------------------------

/// Scalar answer to an mpv property query. mpv hands back JSON; anything that
/// is not a displayable scalar (null, missing property, arrays, maps) is
/// `Absent`.
#[derive(Debug, Clone, Default, PartialEq)]
enum PropertyValue {
    #[default]
    Absent,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl PropertyValue {
    fn from_json(value: Value) -> Self {
        match value {
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => n.as_f64().map_or(Self::Absent, Self::Number),
            Value::String(s) => Self::Text(s),
            _ => Self::Absent,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Text(_) => "string",
        }
    }

    fn expect_bool(&self, key: &str) -> Result<Option<bool>, IpcError> {
        match self {
            Self::Absent => Ok(None),
            Self::Bool(b) => Ok(Some(*b)),
            other => Err(IpcError::TypeMismatch {
                key: key.to_string(),
                expected: "boolean",
                got: other.kind(),
            }),
        }
    }

    fn expect_number(&self, key: &str) -> Result<Option<f64>, IpcError> {
        match self {
            Self::Absent => Ok(None),
            Self::Number(n) => Ok(Some(*n)),
            other => Err(IpcError::TypeMismatch {
                key: key.to_string(),
                expected: "number",
                got: other.kind(),
            }),
        }
    }

    fn expect_text(&self, key: &str) -> Result<Option<&str>, IpcError> {
        match self {
            Self::Absent => Ok(None),
            Self::Text(s) => Ok(Some(s)),
            other => Err(IpcError::TypeMismatch {
                key: key.to_string(),
                expected: "string",
                got: other.kind(),
            }),
        }
    }
}

// ------------------------- mpv IPC client -------------------------

/// Request/response client for mpv's `--input-ipc-server` socket.
/// Line-delimited JSON with `request_id` correlation; unsolicited event lines
/// are skipped while waiting for an answer.
struct MpvClient {
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    state: ConnectionState,
    request_id: u64,
    query_timeout: Duration,
}

impl MpvClient {
    fn new(query_timeout: Duration) -> Self {
        Self {
            reader: None,
            writer: None,
            state: ConnectionState::Uninitialized,
            request_id: 0,
            query_timeout,
        }
    }

    async fn open(&mut self, path: &Path) -> Result<(), IpcError> {
        let stream = UnixStream::connect(path).await.map_err(IpcError::from_io)?;
        let (read, write) = stream.into_split();
        self.reader = Some(BufReader::new(read));
        self.writer = Some(write);
        self.state = ConnectionState::Open;
        Ok(())
    }

    fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Open)
    }

    fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closed)
    }

    /// Idempotent; tolerates a peer that is already gone.
    async fn close(&mut self) -> Result<(), IpcError> {
        self.state = ConnectionState::Closed;
        self.reader = None;
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::NotConnected | ErrorKind::BrokenPipe) => Ok(()),
            Err(e) => Err(IpcError::Io(e)),
        }
    }

    async fn request(&mut self, command: Value) -> Result<Value, IpcError> {
        if !self.is_open() {
            return Err(IpcError::NotConnected);
        }
        self.request_id += 1;
        let id = self.request_id;
        let mut line = json!({ "command": command, "request_id": id }).to_string();
        line.push('\n');

        let timeout = self.query_timeout;
        let writer = self.writer.as_mut().ok_or(IpcError::NotConnected)?;
        time::timeout(timeout, writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| IpcError::Timeout(timeout))?
            .map_err(IpcError::from_io)?;

        let reader = self.reader.as_mut().ok_or(IpcError::NotConnected)?;
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = time::timeout(timeout, reader.read_line(&mut buf))
                .await
                .map_err(|_| IpcError::Timeout(timeout))?
                .map_err(IpcError::from_io)?;
            if n == 0 {
                return Err(IpcError::Eof);
            }
            let Ok(mut reply) = serde_json::from_str::<Value>(buf.trim()) else {
                continue;
            };
            if reply.get("request_id").and_then(Value::as_u64) != Some(id) {
                continue; // asynchronous event line, not our answer
            }
            let error = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            return match error.as_str() {
                "success" => Ok(reply.get_mut("data").map_or(Value::Null, Value::take)),
                "property unavailable" | "property not found" => Ok(Value::Null),
                other => Err(IpcError::Protocol(format!("mpv answered `{other}`"))),
            };
        }
    }

    async fn get_property(&mut self, key: &str) -> Result<PropertyValue, IpcError> {
        let data = self.request(json!(["get_property", key])).await?;
        Ok(PropertyValue::from_json(data))
    }

    /// String rendition of a property; absent maps to the empty string.
    async fn get_property_string(&mut self, key: &str) -> Result<String, IpcError> {
        let data = self.request(json!(["get_property_string", key])).await?;
        Ok(match data {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }
}

// ------------------------- Activity model -------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct Timestamps {
    start: u64,
    end: u64,
}

/// Display payload for one tick. Built fresh from the current queries,
/// handed to the presence client, then discarded.
#[derive(Debug, Clone, Default, PartialEq)]
struct Activity {
    large_image_key: String,
    large_image_text: String,
    details: String,
    state: String,
    small_image_key: String,
    small_image_text: String,
    timestamps: Option<Timestamps>,
}

// ------------------------- Discord IPC client -------------------------

const OP_HANDSHAKE: u32 = 0;
const OP_FRAME: u32 = 1;
const OP_CLOSE: u32 = 2;
const MAX_FRAME_LEN: usize = 64 * 1024;

// Wire shape of a SET_ACTIVITY push. Empty strings are omitted so Discord
// does not render blank lines.
#[derive(Debug, Serialize)]
struct SetActivity<'a> {
    cmd: &'static str,
    args: SetActivityArgs<'a>,
    nonce: String,
}

#[derive(Debug, Serialize)]
struct SetActivityArgs<'a> {
    pid: u32,
    activity: WireActivity<'a>,
}

#[derive(Debug, Serialize)]
struct WireActivity<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    details: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamps: Option<&'a Timestamps>,
    assets: WireAssets<'a>,
}

#[derive(Debug, Serialize)]
struct WireAssets<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    large_image: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    large_text: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    small_image: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    small_text: &'a str,
}

fn encode_frame(op: u32, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u32_le(op);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf
}

async fn send_frame(stream: &mut UnixStream, op: u32, payload: &Value) -> Result<(), IpcError> {
    let body = serde_json::to_vec(payload).map_err(|e| IpcError::Protocol(e.to_string()))?;
    stream
        .write_all(&encode_frame(op, &body))
        .await
        .map_err(IpcError::from_io)
}

async fn recv_frame(stream: &mut UnixStream) -> Result<(u32, Value), IpcError> {
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .await
        .map_err(IpcError::from_io)?;
    let mut header = &header[..];
    let op = header.get_u32_le();
    let len = header.get_u32_le() as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::Protocol(format!("oversized frame ({len} bytes)")));
    }
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(IpcError::from_io)?;
    let value = serde_json::from_slice(&body).map_err(|e| IpcError::Protocol(e.to_string()))?;
    Ok((op, value))
}

/// Handshake-then-push client for Discord's `discord-ipc-N` socket.
///
/// Every successful `open` bumps the connection generation; `update` carries
/// the token it was dispatched with and is rejected when the token no longer
/// matches, so a push that raced a reconnect is never applied to the new
/// connection.
struct PresenceClient {
    client_id: String,
    socket_path: Option<PathBuf>,
    stream: Option<UnixStream>,
    state: ConnectionState,
    generation: u64,
    nonce: u64,
}

impl PresenceClient {
    fn new(client_id: String, socket_path: Option<PathBuf>) -> Self {
        Self {
            client_id,
            socket_path,
            stream: None,
            state: ConnectionState::Uninitialized,
            generation: 0,
            nonce: 0,
        }
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Open)
    }

    fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closed)
    }

    fn socket_candidates(&self) -> Vec<PathBuf> {
        if let Some(path) = &self.socket_path {
            return vec![path.clone()];
        }
        let base = env::var("XDG_RUNTIME_DIR")
            .or_else(|_| env::var("TMPDIR"))
            .map_or_else(
                |_| {
                    let uid = nix::unistd::Uid::current().as_raw();
                    PathBuf::from(format!("/run/user/{uid}"))
                },
                PathBuf::from,
            );
        (0..10)
            .map(|i| base.join(format!("discord-ipc-{i}")))
            .collect()
    }

    async fn open(&mut self) -> Result<(), IpcError> {
        if self.is_open() {
            return Ok(());
        }
        let mut stream = None;
        for candidate in self.socket_candidates() {
            if let Ok(s) = UnixStream::connect(&candidate).await {
                stream = Some(s);
                break;
            }
        }
        let Some(mut stream) = stream else {
            return Err(IpcError::Io(ErrorKind::NotFound.into()));
        };

        let hello = json!({ "v": 1, "client_id": self.client_id });
        send_frame(&mut stream, OP_HANDSHAKE, &hello).await?;
        let (op, reply) = recv_frame(&mut stream).await?;
        if op == OP_CLOSE {
            return Err(IpcError::Protocol(format!("handshake rejected: {reply}")));
        }
        if reply.get("evt").and_then(Value::as_str) != Some("READY") {
            return Err(IpcError::Protocol(format!(
                "unexpected handshake reply: {reply}"
            )));
        }

        self.stream = Some(stream);
        self.state = ConnectionState::Open;
        self.generation += 1;
        Ok(())
    }

    async fn update(&mut self, token: u64, activity: &Activity) -> Result<(), IpcError> {
        if !self.is_open() {
            return Err(IpcError::NotConnected);
        }
        if token != self.generation {
            return Err(IpcError::StaleGeneration {
                pushed: token,
                current: self.generation,
            });
        }
        self.nonce += 1;
        let frame = SetActivity {
            cmd: "SET_ACTIVITY",
            args: SetActivityArgs {
                pid: process::id(),
                activity: WireActivity {
                    details: &activity.details,
                    state: &activity.state,
                    timestamps: activity.timestamps.as_ref(),
                    assets: WireAssets {
                        large_image: &activity.large_image_key,
                        large_text: &activity.large_image_text,
                        small_image: &activity.small_image_key,
                        small_text: &activity.small_image_text,
                    },
                },
            },
            nonce: self.nonce.to_string(),
        };
        let payload =
            serde_json::to_value(&frame).map_err(|e| IpcError::Protocol(e.to_string()))?;

        let stream = self.stream.as_mut().ok_or(IpcError::NotConnected)?;
        send_frame(stream, OP_FRAME, &payload).await?;
        // Discord may close its read side while still accepting writes; the
        // resulting Eof here is benign and the connection stays usable.
        let (op, reply) = recv_frame(stream).await?;
        if op == OP_CLOSE {
            return Err(IpcError::Protocol(format!(
                "discord closed the pipe: {reply}"
            )));
        }
        if reply.get("evt").and_then(Value::as_str) == Some("ERROR") {
            return Err(IpcError::Protocol(format!("activity rejected: {reply}")));
        }
        Ok(())
    }

    /// Idempotent; tolerates a peer that is already gone.
    async fn close(&mut self) -> Result<(), IpcError> {
        self.state = ConnectionState::Closed;
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        match stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::NotConnected | ErrorKind::BrokenPipe) => Ok(()),
            Err(e) => Err(IpcError::Io(e)),
        }
    }
}

// ------------------------- Snapshot -------------------------

/// What the snapshotter needs from the control connection. Split out so the
/// assembly policy is testable against an in-memory source.
trait PropertySource {
    async fn property(&mut self, key: &str) -> Result<PropertyValue, IpcError>;
    async fn property_string(&mut self, key: &str) -> Result<String, IpcError>;
}

impl PropertySource for MpvClient {
    async fn property(&mut self, key: &str) -> Result<PropertyValue, IpcError> {
        self.get_property(key).await
    }

    async fn property_string(&mut self, key: &str) -> Result<String, IpcError> {
        self.get_property_string(key).await
    }
}

/// Keep the first error, fall back to the field's zero value, carry on.
fn keep<T: Default>(result: Result<T, IpcError>, first_err: &mut Option<IpcError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            if first_err.is_none() {
                *first_err = Some(err);
            }
            T::default()
        }
    }
}

/// Assemble the activity for this tick. Individual query failures never abort
/// the snapshot; the first error is handed back so the caller can decide
/// whether it is fatal (broken pipe) or ignorable.
async fn snapshot<S: PropertySource>(
    source: &mut S,
    branding: &Branding,
) -> (Activity, Option<IpcError>) {
    let mut first_err = None;

    let mut activity = Activity {
        large_image_key: branding.large_image.clone(),
        large_image_text: branding.large_text.clone(),
        ..Activity::default()
    };
    if branding.show_version {
        let version = keep(source.property_string("mpv-version").await, &mut first_err);
        if !version.is_empty() {
            let stripped = version.strip_prefix("mpv ").unwrap_or(&version);
            activity.large_image_text = format!("{} {stripped}", activity.large_image_text);
        }
    }

    // Details: track title when tagged, plain filename otherwise.
    let title = keep(
        source.property("metadata/by-key/Title").await.and_then(|v| {
            v.expect_text("metadata/by-key/Title")
                .map(|t| t.map(str::to_owned))
        }),
        &mut first_err,
    );
    activity.details = match title {
        Some(title) if !title.is_empty() => title,
        _ => keep(source.property_string("filename").await, &mut first_err),
    };

    // State: playlist position, only worth a line when there is a playlist.
    let pcount = keep(
        source
            .property("playlist-count")
            .await
            .and_then(|v| v.expect_number("playlist-count")),
        &mut first_err,
    );
    if pcount.is_some_and(|count| count > 1.0) {
        let ppos = keep(
            source
                .property("playlist-pos-1")
                .await
                .and_then(|v| v.expect_number("playlist-pos-1")),
            &mut first_err,
        );
        if let (Some(count), Some(pos)) = (pcount, ppos) {
            activity.state = format!("[{}/{}] in playlist", pos as i64, count as i64);
        }
    }

    // Small image: one status glyph, buffering > paused > looping > playing.
    // An absent loop flag does not count as looping.
    let buffering = keep(
        source
            .property("paused-for-cache")
            .await
            .and_then(|v| v.expect_bool("paused-for-cache")),
        &mut first_err,
    );
    let paused = keep(
        source
            .property("pause")
            .await
            .and_then(|v| v.expect_bool("pause")),
        &mut first_err,
    );
    let loop_file = keep(source.property_string("loop-file").await, &mut first_err);
    let loop_playlist = keep(
        source.property_string("loop-playlist").await,
        &mut first_err,
    );
    let looping = |flag: &str| !flag.is_empty() && flag != "no";

    let (glyph, text) = if buffering == Some(true) {
        ("buffer", "Buffering")
    } else if paused == Some(true) {
        ("pause", "Paused")
    } else if looping(&loop_file) || looping(&loop_playlist) {
        ("loop", "Looping")
    } else {
        ("play", "Playing")
    };
    activity.small_image_key = glyph.to_string();
    activity.small_image_text = text.to_string();
    let percent = keep(
        source
            .property("percent-pos")
            .await
            .and_then(|v| v.expect_number("percent-pos")),
        &mut first_err,
    );
    if let Some(percent) = percent {
        activity.small_image_text = format!("{text} ({}%)", percent as i64);
    }

    // Timestamps: only while actually playing and with a known remaining
    // duration; recomputed from "now" on every tick.
    if paused == Some(false) {
        let remaining = keep(
            source.property_string("time-remaining").await,
            &mut first_err,
        );
        if let Ok(secs) = remaining.parse::<f64>() {
            if secs.is_finite() && secs >= 0.0 {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                activity.timestamps = Some(Timestamps {
                    start: now.as_secs(),
                    end: (now + Duration::from_secs_f64(secs)).as_secs(),
                });
            }
        }
    }

    (activity, first_err)
}

// ------------------------- Bridge -------------------------

/// Owns both client lifecycles. The tick loop is the only caller of the mpv
/// client; the presence client is shared with the retry task and the
/// in-flight push through its mutex.
struct Bridge {
    cfg: Config,
    mpv: MpvClient,
    presence: Arc<Mutex<PresenceClient>>,
    player_gone: Arc<AtomicBool>,
}

impl Bridge {
    fn new(cfg: Config, client_id: String) -> Self {
        let query_timeout = Duration::from_millis(cfg.timing.query_timeout_ms);
        let socket_override = cfg.discord.socket_path.as_ref().map(PathBuf::from);
        Self {
            mpv: MpvClient::new(query_timeout),
            presence: Arc::new(Mutex::new(PresenceClient::new(client_id, socket_override))),
            player_gone: Arc::new(AtomicBool::new(false)),
            cfg,
        }
    }

    async fn run(mut self, mpv_socket: &Path) -> Result<()> {
        self.mpv
            .open(mpv_socket)
            .await
            .with_context(|| format!("connecting to mpv at {}", mpv_socket.display()))?;
        println!("(mpv-ipc): connected");

        let reconnect_every = Duration::from_millis(self.cfg.timing.reconnect_ms);
        task::spawn(connect_presence(
            self.presence.clone(),
            self.player_gone.clone(),
            reconnect_every,
        ));

        let mut tick = time::interval(Duration::from_millis(self.cfg.timing.tick_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = sigint.recv() => {
                    println!("(signal): interrupt, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    println!("(signal): terminate, shutting down");
                    break;
                }
            }

            let (activity, err) = snapshot(&mut self.mpv, &self.cfg.branding).await;
            if let Some(err) = err {
                if err.is_broken_pipe() {
                    println!("(mpv-ipc): player is gone");
                    break;
                }
                if !err.is_eof() {
                    eprintln!("mpv-presence: {err}");
                }
            }
            dispatch_push(
                &self.presence,
                activity,
                &self.player_gone,
                reconnect_every,
            );
        }

        self.shutdown().await
    }

    async fn shutdown(mut self) -> Result<()> {
        self.player_gone.store(true, Ordering::SeqCst);
        if !self.mpv.is_closed() {
            self.mpv.close().await.context("closing mpv connection")?;
            println!("(mpv-ipc): disconnected");
        }
        let mut presence = self.presence.lock().await;
        if presence.is_open() {
            presence
                .close()
                .await
                .context("closing discord connection")?;
            println!("(discord-ipc): disconnected");
        } else if !presence.is_closed() {
            // Never connected; nothing to release, just mark it terminal.
            let _ = presence.close().await;
        }
        Ok(())
    }
}

/// Dial Discord until it answers, on its own timer. Stops as soon as the
/// player is gone; the flag is re-checked under the client lock so a late
/// retry cannot resurrect a connection mid-shutdown.
async fn connect_presence(
    presence: Arc<Mutex<PresenceClient>>,
    player_gone: Arc<AtomicBool>,
    every: Duration,
) {
    let mut tick = time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if player_gone.load(Ordering::SeqCst) {
            return;
        }
        let mut client = presence.lock().await;
        if player_gone.load(Ordering::SeqCst) || client.is_open() {
            return;
        }
        if client.open().await.is_ok() {
            println!("(discord-ipc): connected");
            return;
        }
    }
}

/// Hand the activity to the presence connection without blocking the tick
/// loop. The owned guard travels into the push task, so at most one push is
/// in flight per connection; while one is in flight, newer activities are
/// dropped rather than queued. Returns whether a push was dispatched.
fn dispatch_push(
    presence: &Arc<Mutex<PresenceClient>>,
    activity: Activity,
    player_gone: &Arc<AtomicBool>,
    reconnect_every: Duration,
) -> bool {
    let Ok(mut client) = presence.clone().try_lock_owned() else {
        return false;
    };
    if !client.is_open() {
        return false;
    }
    let token = client.generation();
    let handle = presence.clone();
    let player_gone = player_gone.clone();
    task::spawn(async move {
        match client.update(token, &activity).await {
            Ok(()) => {}
            Err(err) if err.is_broken_pipe() => {
                if let Err(close_err) = client.close().await {
                    eprintln!("mpv-presence: {close_err}");
                }
                drop(client);
                println!("(discord-ipc): reconnecting...");
                task::spawn(connect_presence(handle, player_gone, reconnect_every));
            }
            Err(err) => {
                // Includes the benign read-side Eof; the connection stays up.
                eprintln!("mpv-presence: {err}");
            }
        }
    });
    true
}

// ------------------------- Main -------------------------

fn usage() {
    eprintln!("Usage: mpv-presenced <mpv-ipc-socket> <discord-client-id>");
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    let (Some(socket), Some(client_id)) = (args.next(), args.next()) else {
        usage();
        process::exit(2);
    };
    let cfg = read_config()?;
    Bridge::new(cfg, client_id).run(Path::new(&socket)).await
}

// ------------------------- Tests -------------------------
