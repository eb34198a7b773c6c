//! WebSocket Game Server
//!
//! HTTP front for the [`Hub`]. An axum router upgrades `GET /dotsAndBoxes`
//! to a WebSocket, decodes invocation frames, hands them to the hub and
//! streams each connection's outbound queue back out. `GET /players`
//! returns the lobby as JSON.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::game::grid::DEFAULT_BOARD_PX;
use crate::game::player::Player;
use crate::network::channels::{ChannelGuard, DEFAULT_CHANNEL_CAPACITY};
use crate::network::hub::{ClientSession, Hub, HubConfig};
use crate::network::protocol::{
    ClientMessage, CompletionFrame, ErrorPayload, Frame, HubError, Outbound, WireTableError,
};

/// Path of the WebSocket hub endpoint.
pub const HUB_PATH: &str = "/dotsAndBoxes";

/// Path of the lobby snapshot query.
pub const PLAYER_LIST_PATH: &str = "/players";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-connection outbound queue depth.
    pub channel_capacity: usize,
    /// Square board side in pixels.
    pub board_px: u32,
    /// Unanswered challenges expire after this long. `None` disables.
    pub challenge_timeout: Option<Duration>,
    /// How often expired challenges are swept.
    pub sweep_interval: Duration,
    /// Reject moves made out of turn.
    pub enforce_turns: bool,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_connections: 1000,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            board_px: DEFAULT_BOARD_PX,
            challenge_timeout: Some(Duration::from_secs(60)),
            sweep_interval: Duration::from_secs(5),
            enforce_turns: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let challenge_timeout = match env_parse::<u64>("DOTS_CHALLENGE_TIMEOUT_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.challenge_timeout,
        };

        Self {
            bind_addr: env_parse("DOTS_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_connections: env_parse("DOTS_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            channel_capacity: env_parse("DOTS_CHANNEL_CAPACITY").unwrap_or(defaults.channel_capacity),
            board_px: env_parse("DOTS_BOARD_PX").unwrap_or(defaults.board_px),
            challenge_timeout,
            enforce_turns: env_parse("DOTS_ENFORCE_TURNS").unwrap_or(defaults.enforce_turns),
            ..defaults
        }
    }

    /// Hub settings derived from this configuration.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            board_px: self.board_px,
            enforce_turns: self.enforce_turns,
            channel_capacity: self.channel_capacity,
            challenge_timeout: self.challenge_timeout,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind or serve.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire name tables failed validation.
    #[error("Invalid wire table: {0}")]
    WireTable(#[from] WireTableError),
}

/// State shared with the axum handlers.
#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    shutdown_tx: broadcast::Sender<()>,
    max_connections: usize,
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Hub state shared with every connection.
    hub: Arc<Hub>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server. Validates the wire tables.
    pub fn new(config: ServerConfig) -> Result<Self, GameServerError> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let hub = Arc::new(Hub::new(config.hub_config())?);

        Ok(Self {
            config,
            hub,
            shutdown_tx,
        })
    }

    /// Shared hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Build the router: the hub endpoint and the player list.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            max_connections: self.config.max_connections,
        };

        Router::new()
            .route(HUB_PATH, get(ws_handler))
            .route(PLAYER_LIST_PATH, get(player_list_handler))
            .with_state(state)
    }

    /// Run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!(version = %self.config.version, "Game server listening on {}", listener.local_addr()?);

        let expiry_handle = self.config.challenge_timeout.map(|_| {
            let hub = self.hub.clone();
            let every = self.config.sweep_interval;
            tokio::spawn(async move {
                Self::run_expiry_loop(hub, every).await;
            })
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Shutdown signal received");
            })
            .await;

        if let Some(handle) = expiry_handle {
            handle.abort();
        }

        result.map_err(GameServerError::from)
    }

    /// Sweep expired challenges periodically.
    async fn run_expiry_loop(hub: Arc<Hub>, every: Duration) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;

            let expired = hub.expire_challenges();
            if expired > 0 {
                info!("Expired {} challenge(s)", expired);
            }
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get connection count.
    pub fn connection_count(&self) -> usize {
        self.hub.channels().len()
    }

    /// Get registered player count.
    pub fn player_count(&self) -> usize {
        self.hub.registry().len()
    }

    /// Get active lobby count.
    pub fn lobby_count(&self) -> usize {
        self.hub.lobbies().len()
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.hub.channels().len() >= state.max_connections {
        warn!(limit = state.max_connections, "Connection limit reached, rejecting upgrade");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Registered players as JSON.
async fn player_list_handler(State(state): State<AppState>) -> Json<Vec<Player>> {
    Json(state.hub.connected_players())
}

/// Drive one WebSocket connection until either side closes it.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let AppState { hub, shutdown_tx, .. } = state;
    let mut shutdown_rx = shutdown_tx.subscribe();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let ClientSession { guard, outbound: mut msg_rx } = hub.open_connection();
    let conn = guard.id();
    info!(%conn, "Client connected");

    // Spawn message sender task
    let names = hub.names().clone();
    let sender_task = tokio::spawn(async move {
        while let Some(out) = msg_rx.recv().await {
            let text = match out.into_frame(&names).and_then(|frame| frame.to_json()) {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            #[cfg(feature = "debug-tracing")]
            debug!(%conn, frame = %text, "Outbound frame");
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Handle incoming messages
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_frame(&hub, &guard, text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_frame(&hub, &guard, text),
                        Err(_) => debug!(%conn, "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%conn, "Client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(%conn, "WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = guard.closed() => {
                info!(%conn, "Connection closed by the hub");
                break;
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    // Cleanup
    hub.disconnect(conn);
    drop(guard);
    sender_task.abort();

    info!(%conn, "Client cleaned up");
}

/// Decode one text frame and run it.
fn handle_frame(hub: &Hub, guard: &ChannelGuard, text: &str) {
    let conn = guard.id();
    #[cfg(feature = "debug-tracing")]
    debug!(%conn, frame = %text, "Inbound frame");

    let frame = match Frame::from_json(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(%conn, "Invalid frame: {}", e);
            let err = HubError::Protocol(format!("malformed frame: {e}"));
            guard.reply(completion(None, Err(&err)));
            return;
        }
    };

    match frame {
        Frame::Invocation(invocation) => {
            let result = match ClientMessage::decode(&invocation, hub.names()) {
                Ok(msg) => hub.dispatch(conn, msg),
                Err(err) => {
                    debug!(%conn, target = %invocation.target, "Undecodable invocation: {}", err);
                    Err(err)
                }
            };

            if invocation.invocation_id.is_some() || result.is_err() {
                guard.reply(completion(invocation.invocation_id, result.as_ref().map(|_| ())));
            }
        }
        Frame::Ping => {
            guard.reply(Outbound::Pong);
        }
        Frame::Completion(_) | Frame::Pong => {
            debug!(%conn, "Ignoring unexpected frame from client");
        }
    }
}

fn completion(invocation_id: Option<String>, result: Result<(), &HubError>) -> Outbound {
    Outbound::Completion(CompletionFrame {
        invocation_id,
        error: result.err().map(ErrorPayload::from),
    })
}
