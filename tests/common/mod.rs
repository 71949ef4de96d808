use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use collab_server::{AppState, ServerConfig};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower_http::trace::TraceLayer;

/// A test WebSocket client that sends and receives JSON frames.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        let msg = self
            .0
            .next()
            .await
            .ok_or_else(|| anyhow!("websocket closed"))??;
        let msg = msg.to_text().map_err(|_| anyhow!("non-string message"))?;
        Ok(serde_json::from_str(msg)?)
    }

    /// Receive, skipping any low-level protocol frames (pings/pongs), until
    /// the first application-level JSON frame arrives.
    pub async fn recv_json(&mut self) -> Result<Value> {
        loop {
            let msg = self
                .0
                .next()
                .await
                .ok_or_else(|| anyhow!("websocket closed"))??;
            if let Message::Text(_) = &msg {
                return Ok(serde_json::from_str(msg.to_text().unwrap())?);
            }
        }
    }
}

pub struct TestServer {
    addr: SocketAddr,
    pub state: Arc<AppState>,
}

impl TestServer {
    pub async fn start() -> Self {
        let config = ServerConfig::temporary().await.unwrap();
        let state = AppState::new(config).await.unwrap();

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let router = collab_server::server(state.clone()).layer(TraceLayer::new_for_http());
        tokio::spawn(axum::serve(listener, router).into_future());

        Self { addr, state }
    }

    pub async fn connect(&self) -> JsonSocket {
        let (socket, _response) =
            tokio_tungstenite::connect_async(format!("ws://{}/socket", self.addr))
                .await
                .unwrap();
        JsonSocket(socket)
    }
}

pub fn join_room(room_id: &str, client_id: &str, user_id: &str) -> Value {
    serde_json::json!({
        "type": "JOIN_ROOM",
        "roomId": room_id,
        "clientId": client_id,
        "userId": user_id,
    })
}

pub fn ot_op(room_id: &str, client_id: &str, id: &str, version: u64, position: u64, payload: &str) -> Value {
    serde_json::json!({
        "type": "OT_OP",
        "roomId": room_id,
        "clientId": client_id,
        "operation": {
            "id": id,
            "version": version,
            "kind": "insert",
            "position": position,
            "payload": payload,
        }
    })
}

pub fn logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
