//! Server backend for a real-time collaborative text-editing room: the OT
//! engine, room manager, session/transport layer, and persistence boundary
//! described in the collab core design.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;
use tracing::info;

pub mod engine;
pub mod error;
pub mod ot;
pub mod persistence;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod room;
mod session;

use persistence::{FsPersistence, Persistence};
use registry::RoomManager;

/// Process-wide, immutable-after-startup server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum size of one inbound WebSocket frame.
    pub max_frame_bytes: usize,
    /// `OT_OP` token bucket: sustained rate.
    pub op_rate_limit: u32,
    /// `OT_OP` token bucket: burst capacity.
    pub op_burst: u32,
    /// `CURSOR_UPDATE` token bucket: sustained rate.
    pub cursor_rate_limit: u32,
    /// `CURSOR_UPDATE` token bucket: burst capacity.
    pub cursor_burst: u32,
    /// Bounded outbound queue length per session.
    pub outbound_queue_len: usize,
    /// How long a session may stay backpressured (outbound queue full) before
    /// it is forcibly terminated.
    pub backpressure_grace: Duration,
    /// Heartbeat tick interval.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before closing a session.
    pub heartbeat_miss: u32,
    /// Time a session has to complete a join before being closed.
    pub join_deadline: Duration,
    /// Number of accepted ops retained per room's history window.
    pub history_window: usize,
    /// Snapshot after this many accepted ops.
    pub snapshot_every_ops: u32,
    /// Snapshot after this much wall-clock time, regardless of op count.
    pub snapshot_every_seconds: Duration,
    /// Evict an empty room after this much idle time.
    pub room_idle_eviction: Duration,
    /// Whether `appendOp` must complete before a submitter's `ACK`.
    pub durable_ops_before_ack: bool,
    /// Directory backing the filesystem persistence store.
    pub storage: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 10 * 1024 * 1024,
            op_rate_limit: 50,
            op_burst: 100,
            cursor_rate_limit: 30,
            cursor_burst: 60,
            outbound_queue_len: 1024,
            backpressure_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_miss: 2,
            join_deadline: Duration::from_secs(10),
            history_window: 1024,
            snapshot_every_ops: 500,
            snapshot_every_seconds: Duration::from_secs(60),
            room_idle_eviction: Duration::from_secs(5 * 60),
            durable_ops_before_ack: false,
            storage: PathBuf::from("storage"),
        }
    }
}

impl ServerConfig {
    /// Construct a configuration backed by the given storage directory.
    pub fn new(storage: PathBuf) -> Self {
        Self {
            storage,
            ..Default::default()
        }
    }

    /// Construct a configuration backed by a fresh temporary directory, for tests.
    pub async fn temporary() -> anyhow::Result<Self> {
        let dir = std::env::temp_dir().join(format!("collab_server_cfg_{:x}", rand::random::<u64>()));
        Ok(Self::new(dir))
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("STORAGE") {
            config.storage = v.into();
        }
        if let Ok(v) = std::env::var("MAX_FRAME_BYTES") {
            config.max_frame_bytes = v.parse().context("Unable to parse MAX_FRAME_BYTES")?;
        }
        if let Ok(v) = std::env::var("OP_RATE_LIMIT") {
            config.op_rate_limit = v.parse().context("Unable to parse OP_RATE_LIMIT")?;
        }
        if let Ok(v) = std::env::var("OP_BURST") {
            config.op_burst = v.parse().context("Unable to parse OP_BURST")?;
        }
        if let Ok(v) = std::env::var("HISTORY_WINDOW") {
            config.history_window = v.parse().context("Unable to parse HISTORY_WINDOW")?;
        }
        if let Ok(v) = std::env::var("DURABLE_OPS_BEFORE_ACK") {
            config.durable_ops_before_ack =
                v.parse().context("Unable to parse DURABLE_OPS_BEFORE_ACK")?;
        }

        Ok(config)
    }
}

/// Shared application state, reachable from every request/WebSocket handler.
pub struct AppState {
    rooms: Arc<RoomManager>,
    config: Arc<ServerConfig>,
    next_session_id: AtomicU64,
}

impl AppState {
    /// Build application state with a filesystem persistence backend rooted
    /// at `config.storage`.
    pub async fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let persistence: Arc<dyn Persistence> = Arc::new(FsPersistence::new(config.storage.clone()).await?);
        Ok(Self::with_persistence(config, persistence))
    }

    /// Build application state with an explicit persistence backend
    /// (used by tests to inject a temporary store).
    pub fn with_persistence(config: ServerConfig, persistence: Arc<dyn Persistence>) -> Arc<Self> {
        let config = Arc::new(config);
        Arc::new(Self {
            rooms: Arc::new(RoomManager::new(persistence, config.clone())),
            config,
            next_session_id: AtomicU64::new(0),
        })
    }

    fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of rooms currently held in memory.
    pub fn active_rooms(&self) -> usize {
        self.rooms.room_count()
    }

    /// Flush every active room's snapshot and disconnect its sessions.
    pub async fn shutdown(&self) {
        self.rooms.shutdown_all().await;
    }
}

/// Statistics returned from `/stats`, for operational visibility.
#[derive(Serialize)]
struct Stats {
    start_time: u64,
    active_rooms: usize,
}

/// Build the full axum router: the collab WebSocket endpoint plus a couple
/// of small operational routes.
pub fn server(state: Arc<AppState>) -> Router {
    let start_time = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime returned before UNIX_EPOCH")
        .as_secs();

    Router::new()
        .route("/socket", get(socket_handler))
        .route("/stats", get(move |state| stats_handler(state, start_time)))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn socket_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let session_id = state.next_session_id();
    ws.max_frame_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            info!(session_id, "socket connection accepted");
            session::run(session_id, socket, state).await;
        })
}

async fn stats_handler(State(state): State<Arc<AppState>>, start_time: u64) -> impl IntoResponse {
    axum::Json(Stats {
        start_time,
        active_rooms: state.rooms.room_count(),
    })
}
