//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Frames are JSON text, shaped as hub invocations with positional
//! arguments:
//!
//! ```text
//! {"type":"invocation","target":"PlayerSendChallenge","arguments":["bob"],"invocation_id":"7"}
//! {"type":"completion","invocation_id":"7","error":null}
//! ```
//!
//! Method and event names come from one table per direction. The tables
//! are checked once, when [`WireNames::validated`] runs at server start.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::game::grid::MoveError;
use crate::game::player::{Player, PlayerSettings, PlayerStatus};
use crate::network::session::LobbyId;

// =============================================================================
// WIRE NAME TABLES
// =============================================================================

/// Operations a client may invoke on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMethod {
    /// Register as a lobby player.
    PlayerConnect,
    /// Replace own settings.
    PlayerUpdateSettings,
    /// Challenge another player by name.
    PlayerSendChallenge,
    /// Withdraw an outstanding challenge.
    PlayerCancelChallenge,
    /// Accept or reject a received challenge.
    PlayerSendChallengeAnswer,
    /// Draw an edge in the current game.
    OpponentMakeMove,
    /// Abandon the current game.
    OpponentLeaveGame,
}

impl ServerMethod {
    /// Number of methods.
    pub const COUNT: usize = 7;

    /// Every method, in declaration order.
    pub const ALL: [ServerMethod; ServerMethod::COUNT] = [
        ServerMethod::PlayerConnect,
        ServerMethod::PlayerUpdateSettings,
        ServerMethod::PlayerSendChallenge,
        ServerMethod::PlayerCancelChallenge,
        ServerMethod::PlayerSendChallengeAnswer,
        ServerMethod::OpponentMakeMove,
        ServerMethod::OpponentLeaveGame,
    ];

    /// Number of positional arguments the method takes.
    pub const fn arity(self) -> usize {
        match self {
            ServerMethod::PlayerConnect => 1,
            ServerMethod::PlayerUpdateSettings => 1,
            ServerMethod::PlayerSendChallenge => 1,
            ServerMethod::PlayerCancelChallenge => 1,
            ServerMethod::PlayerSendChallengeAnswer => 2,
            ServerMethod::OpponentMakeMove => 5,
            ServerMethod::OpponentLeaveGame => 0,
        }
    }
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubEvent {
    /// Another player joined the lobby.
    OnPlayerConnect,
    /// A player left.
    OnPlayerDisconnect,
    /// A player changed settings.
    OnPlayerUpdateSettings,
    /// A player's status changed.
    OnPlayerChangeStatus,
    /// You were challenged.
    OnChallenge,
    /// The challenge addressed to you was withdrawn.
    OnChallengeCancel,
    /// Your challenge was rejected.
    OnChallengeReject,
    /// A challenge was accepted; the game lobby is ready.
    OnChallengeAccept,
    /// Your opponent drew an edge.
    OnOpponentMakeMove,
    /// Result of your own move.
    OnGainPoints,
    /// Every box is closed.
    OnGameEnd,
    /// Your opponent left the game.
    OnOpponentLeaveGame,
}

impl HubEvent {
    /// Number of events.
    pub const COUNT: usize = 12;

    /// Every event, in declaration order.
    pub const ALL: [HubEvent; HubEvent::COUNT] = [
        HubEvent::OnPlayerConnect,
        HubEvent::OnPlayerDisconnect,
        HubEvent::OnPlayerUpdateSettings,
        HubEvent::OnPlayerChangeStatus,
        HubEvent::OnChallenge,
        HubEvent::OnChallengeCancel,
        HubEvent::OnChallengeReject,
        HubEvent::OnChallengeAccept,
        HubEvent::OnOpponentMakeMove,
        HubEvent::OnGainPoints,
        HubEvent::OnGameEnd,
        HubEvent::OnOpponentLeaveGame,
    ];
}

/// Client -> server method names.
pub const SERVER_METHOD_NAMES: &[(ServerMethod, &str)] = &[
    (ServerMethod::PlayerConnect, "PlayerConnect"),
    (ServerMethod::PlayerUpdateSettings, "PlayerUpdateSettings"),
    (ServerMethod::PlayerSendChallenge, "PlayerSendChallenge"),
    (ServerMethod::PlayerCancelChallenge, "PlayerCancelChallenge"),
    (ServerMethod::PlayerSendChallengeAnswer, "PlayerSendChallengeAnswer"),
    (ServerMethod::OpponentMakeMove, "OpponentMakeMove"),
    (ServerMethod::OpponentLeaveGame, "OpponentLeaveGame"),
];

/// Server -> client event names.
pub const HUB_EVENT_NAMES: &[(HubEvent, &str)] = &[
    (HubEvent::OnPlayerConnect, "OnPlayerConnect"),
    (HubEvent::OnPlayerDisconnect, "OnPlayerDisconnect"),
    (HubEvent::OnPlayerUpdateSettings, "OnPlayerUpdateSettings"),
    (HubEvent::OnPlayerChangeStatus, "OnPlayerChangeStatus"),
    (HubEvent::OnChallenge, "OnChallenge"),
    (HubEvent::OnChallengeCancel, "OnChallengeCancel"),
    (HubEvent::OnChallengeReject, "OnChallengeReject"),
    (HubEvent::OnChallengeAccept, "OnChallengeAccept"),
    (HubEvent::OnOpponentMakeMove, "OnOpponentMakeMove"),
    (HubEvent::OnGainPoints, "OnGainPoints"),
    (HubEvent::OnGameEnd, "OnGameEnd"),
    (HubEvent::OnOpponentLeaveGame, "OnOpponentLeaveGame"),
];

/// Problems found while checking a wire name table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireTableError {
    /// An enum member has no wire name.
    #[error("{table}: no wire name for {member}")]
    Missing {
        /// Table being checked.
        table: &'static str,
        /// Member lacking an entry.
        member: String,
    },

    /// An enum member is listed twice.
    #[error("{table}: {member} listed more than once")]
    DuplicateMember {
        /// Table being checked.
        table: &'static str,
        /// Repeated member.
        member: String,
    },

    /// Two members share a wire name.
    #[error("{table}: wire name '{name}' used more than once")]
    DuplicateName {
        /// Table being checked.
        table: &'static str,
        /// Repeated name.
        name: &'static str,
    },

    /// A wire name is blank.
    #[error("{table}: empty wire name for {member}")]
    EmptyName {
        /// Table being checked.
        table: &'static str,
        /// Member with the blank name.
        member: String,
    },
}

/// Validated lookup tables for wire names.
#[derive(Debug, Clone)]
pub struct WireNames {
    methods: [&'static str; ServerMethod::COUNT],
    events: [&'static str; HubEvent::COUNT],
    method_by_name: HashMap<&'static str, ServerMethod>,
}

impl WireNames {
    /// Build from the built-in tables.
    pub fn validated() -> Result<Self, WireTableError> {
        Self::from_tables(SERVER_METHOD_NAMES, HUB_EVENT_NAMES)
    }

    /// Build from arbitrary tables, failing on any gap or duplicate.
    pub fn from_tables(
        methods: &[(ServerMethod, &'static str)],
        events: &[(HubEvent, &'static str)],
    ) -> Result<Self, WireTableError> {
        let methods = build_table("server methods", ServerMethod::ALL, methods, |m| m as usize)?;
        let events = build_table("hub events", HubEvent::ALL, events, |e| e as usize)?;

        let method_by_name = ServerMethod::ALL
            .iter()
            .map(|m| (methods[*m as usize], *m))
            .collect();

        Ok(Self { methods, events, method_by_name })
    }

    /// Wire name of a server method.
    #[inline]
    pub fn method_name(&self, method: ServerMethod) -> &'static str {
        self.methods[method as usize]
    }

    /// Wire name of a hub event.
    #[inline]
    pub fn event_name(&self, event: HubEvent) -> &'static str {
        self.events[event as usize]
    }

    /// Resolve an inbound target name.
    pub fn method(&self, name: &str) -> Option<ServerMethod> {
        self.method_by_name.get(name).copied()
    }
}

fn build_table<K, const N: usize>(
    table: &'static str,
    all: [K; N],
    entries: &[(K, &'static str)],
    index: impl Fn(K) -> usize,
) -> Result<[&'static str; N], WireTableError>
where
    K: Copy + std::fmt::Debug,
{
    let mut slots: [Option<&'static str>; N] = [None; N];
    let mut seen_names: Vec<&'static str> = Vec::with_capacity(entries.len());

    for &(member, name) in entries {
        if name.trim().is_empty() {
            return Err(WireTableError::EmptyName { table, member: format!("{member:?}") });
        }
        if seen_names.contains(&name) {
            return Err(WireTableError::DuplicateName { table, name });
        }
        let slot = &mut slots[index(member)];
        if slot.is_some() {
            return Err(WireTableError::DuplicateMember { table, member: format!("{member:?}") });
        }
        *slot = Some(name);
        seen_names.push(name);
    }

    let mut names = [""; N];
    for member in all {
        match slots[index(member)] {
            Some(name) => names[index(member)] = name,
            None => {
                return Err(WireTableError::Missing { table, member: format!("{member:?}") });
            }
        }
    }
    Ok(names)
}

// =============================================================================
// FRAMES
// =============================================================================

/// Top-level frame in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Method call (client -> server) or event (server -> client).
    Invocation(InvocationFrame),
    /// Result of a client invocation.
    Completion(CompletionFrame),
    /// Keep-alive request.
    Ping,
    /// Keep-alive reply.
    Pong,
}

/// A named call with positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationFrame {
    /// Method or event wire name.
    pub target: String,
    /// Positional arguments.
    #[serde(default)]
    pub arguments: Vec<Value>,
    /// Present when the caller wants a completion frame back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
}

/// Outcome of a client invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionFrame {
    /// Echo of the invocation id (absent for undecodable frames).
    pub invocation_id: Option<String>,
    /// Failure details, `None` on success.
    pub error: Option<ErrorPayload>,
}

impl Frame {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Decoded client invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Register as a lobby player.
    PlayerConnect(Player),
    /// Replace own settings.
    PlayerUpdateSettings(PlayerSettings),
    /// Challenge another player.
    PlayerSendChallenge {
        /// Who to challenge.
        target_name: String,
    },
    /// Withdraw a challenge.
    PlayerCancelChallenge {
        /// Who was challenged.
        target_name: String,
    },
    /// Answer a received challenge.
    PlayerSendChallengeAnswer {
        /// Accept or reject.
        accepted: bool,
        /// Who sent the challenge.
        challenger_name: String,
    },
    /// Draw an edge.
    OpponentMakeMove {
        /// Lobby the move belongs to.
        lobby_id: LobbyId,
        /// Start x (px).
        x1: i32,
        /// Start y (px).
        y1: i32,
        /// End x (px).
        x2: i32,
        /// End y (px).
        y2: i32,
    },
    /// Abandon the current game.
    OpponentLeaveGame,
}

impl ClientMessage {
    /// Method this message invokes.
    pub fn method(&self) -> ServerMethod {
        match self {
            ClientMessage::PlayerConnect(_) => ServerMethod::PlayerConnect,
            ClientMessage::PlayerUpdateSettings(_) => ServerMethod::PlayerUpdateSettings,
            ClientMessage::PlayerSendChallenge { .. } => ServerMethod::PlayerSendChallenge,
            ClientMessage::PlayerCancelChallenge { .. } => ServerMethod::PlayerCancelChallenge,
            ClientMessage::PlayerSendChallengeAnswer { .. } => ServerMethod::PlayerSendChallengeAnswer,
            ClientMessage::OpponentMakeMove { .. } => ServerMethod::OpponentMakeMove,
            ClientMessage::OpponentLeaveGame => ServerMethod::OpponentLeaveGame,
        }
    }

    /// Decode an inbound invocation.
    pub fn decode(frame: &InvocationFrame, names: &WireNames) -> Result<Self, HubError> {
        let method = names
            .method(&frame.target)
            .ok_or_else(|| HubError::Protocol(format!("unknown method '{}'", frame.target)))?;

        let args = &frame.arguments;
        if args.len() != method.arity() {
            return Err(HubError::Protocol(format!(
                "{} expects {} argument(s), got {}",
                frame.target,
                method.arity(),
                args.len()
            )));
        }

        let msg = match method {
            ServerMethod::PlayerConnect => ClientMessage::PlayerConnect(arg(args, 0, method)?),
            ServerMethod::PlayerUpdateSettings => {
                ClientMessage::PlayerUpdateSettings(arg(args, 0, method)?)
            }
            ServerMethod::PlayerSendChallenge => ClientMessage::PlayerSendChallenge {
                target_name: arg(args, 0, method)?,
            },
            ServerMethod::PlayerCancelChallenge => ClientMessage::PlayerCancelChallenge {
                target_name: arg(args, 0, method)?,
            },
            ServerMethod::PlayerSendChallengeAnswer => ClientMessage::PlayerSendChallengeAnswer {
                accepted: arg(args, 0, method)?,
                challenger_name: arg(args, 1, method)?,
            },
            ServerMethod::OpponentMakeMove => ClientMessage::OpponentMakeMove {
                lobby_id: arg(args, 0, method)?,
                x1: arg(args, 1, method)?,
                y1: arg(args, 2, method)?,
                x2: arg(args, 3, method)?,
                y2: arg(args, 4, method)?,
            },
            ServerMethod::OpponentLeaveGame => ClientMessage::OpponentLeaveGame,
        };
        Ok(msg)
    }

    /// Encode as an invocation, as a client would send it.
    pub fn encode(
        &self,
        names: &WireNames,
        invocation_id: Option<String>,
    ) -> Result<InvocationFrame, serde_json::Error> {
        let arguments = match self {
            ClientMessage::PlayerConnect(player) => vec![serde_json::to_value(player)?],
            ClientMessage::PlayerUpdateSettings(settings) => vec![serde_json::to_value(settings)?],
            ClientMessage::PlayerSendChallenge { target_name }
            | ClientMessage::PlayerCancelChallenge { target_name } => {
                vec![Value::from(target_name.as_str())]
            }
            ClientMessage::PlayerSendChallengeAnswer { accepted, challenger_name } => {
                vec![Value::from(*accepted), Value::from(challenger_name.as_str())]
            }
            ClientMessage::OpponentMakeMove { lobby_id, x1, y1, x2, y2 } => vec![
                serde_json::to_value(lobby_id)?,
                Value::from(*x1),
                Value::from(*y1),
                Value::from(*x2),
                Value::from(*y2),
            ],
            ClientMessage::OpponentLeaveGame => Vec::new(),
        };

        Ok(InvocationFrame {
            target: names.method_name(self.method()).to_string(),
            arguments,
            invocation_id,
        })
    }
}

fn arg<T: DeserializeOwned>(args: &[Value], index: usize, method: ServerMethod) -> Result<T, HubError> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| HubError::Protocol(format!("{method:?}: missing argument {index}")))?;
    serde_json::from_value(value)
        .map_err(|e| HubError::Protocol(format!("{method:?}: bad argument {index}: {e}")))
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Events pushed to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Another player joined.
    OnPlayerConnect(Player),
    /// A player left.
    OnPlayerDisconnect {
        /// Departed player's name.
        name: String,
    },
    /// A player changed settings.
    OnPlayerUpdateSettings(Player),
    /// A player's status changed.
    OnPlayerChangeStatus {
        /// Player whose status changed.
        name: String,
        /// New status.
        status: PlayerStatus,
    },
    /// You were challenged.
    OnChallenge {
        /// Challenger's name.
        sender_name: String,
    },
    /// The challenge to you was withdrawn.
    OnChallengeCancel,
    /// Your challenge was rejected.
    OnChallengeReject,
    /// Game lobby created for both participants.
    OnChallengeAccept {
        /// Lobby to address moves to.
        lobby_id: LobbyId,
    },
    /// Opponent drew an edge.
    OnOpponentMakeMove {
        /// Start x (px).
        x1: i32,
        /// Start y (px).
        y1: i32,
        /// End x (px).
        x2: i32,
        /// End y (px).
        y2: i32,
        /// Boxes the opponent closed with it.
        points_gained: u32,
    },
    /// Boxes closed by your own move.
    OnGainPoints {
        /// Points gained.
        points: u32,
    },
    /// Game finished.
    OnGameEnd,
    /// Opponent left mid-game.
    OnOpponentLeaveGame,
}

impl ServerMessage {
    /// Event kind of this message.
    pub fn event(&self) -> HubEvent {
        match self {
            ServerMessage::OnPlayerConnect(_) => HubEvent::OnPlayerConnect,
            ServerMessage::OnPlayerDisconnect { .. } => HubEvent::OnPlayerDisconnect,
            ServerMessage::OnPlayerUpdateSettings(_) => HubEvent::OnPlayerUpdateSettings,
            ServerMessage::OnPlayerChangeStatus { .. } => HubEvent::OnPlayerChangeStatus,
            ServerMessage::OnChallenge { .. } => HubEvent::OnChallenge,
            ServerMessage::OnChallengeCancel => HubEvent::OnChallengeCancel,
            ServerMessage::OnChallengeReject => HubEvent::OnChallengeReject,
            ServerMessage::OnChallengeAccept { .. } => HubEvent::OnChallengeAccept,
            ServerMessage::OnOpponentMakeMove { .. } => HubEvent::OnOpponentMakeMove,
            ServerMessage::OnGainPoints { .. } => HubEvent::OnGainPoints,
            ServerMessage::OnGameEnd => HubEvent::OnGameEnd,
            ServerMessage::OnOpponentLeaveGame => HubEvent::OnOpponentLeaveGame,
        }
    }

    /// Positional arguments on the wire.
    pub fn arguments(&self) -> Result<Vec<Value>, serde_json::Error> {
        let args = match self {
            ServerMessage::OnPlayerConnect(player) | ServerMessage::OnPlayerUpdateSettings(player) => {
                vec![serde_json::to_value(player)?]
            }
            ServerMessage::OnPlayerDisconnect { name } => vec![Value::from(name.as_str())],
            ServerMessage::OnPlayerChangeStatus { name, status } => {
                vec![Value::from(name.as_str()), serde_json::to_value(status)?]
            }
            ServerMessage::OnChallenge { sender_name } => vec![Value::from(sender_name.as_str())],
            ServerMessage::OnChallengeAccept { lobby_id } => vec![serde_json::to_value(lobby_id)?],
            ServerMessage::OnOpponentMakeMove { x1, y1, x2, y2, points_gained } => vec![
                Value::from(*x1),
                Value::from(*y1),
                Value::from(*x2),
                Value::from(*y2),
                Value::from(*points_gained),
            ],
            ServerMessage::OnGainPoints { points } => vec![Value::from(*points)],
            ServerMessage::OnChallengeCancel
            | ServerMessage::OnChallengeReject
            | ServerMessage::OnGameEnd
            | ServerMessage::OnOpponentLeaveGame => Vec::new(),
        };
        Ok(args)
    }

    /// Encode as an invocation frame.
    pub fn encode(&self, names: &WireNames) -> Result<InvocationFrame, serde_json::Error> {
        Ok(InvocationFrame {
            target: names.event_name(self.event()).to_string(),
            arguments: self.arguments()?,
            invocation_id: None,
        })
    }
}

/// Anything queued on a client's outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Hub event.
    Event(ServerMessage),
    /// Reply to one of the client's own invocations.
    Completion(CompletionFrame),
    /// Keep-alive reply.
    Pong,
}

impl Outbound {
    /// Build the wire frame.
    pub fn into_frame(self, names: &WireNames) -> Result<Frame, serde_json::Error> {
        Ok(match self {
            Outbound::Event(msg) => Frame::Invocation(msg.encode(names)?),
            Outbound::Completion(completion) => Frame::Completion(completion),
            Outbound::Pong => Frame::Pong,
        })
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Failure of a single hub invocation. Reported to the caller only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Unknown connection, player name or lobby.
    #[error("{what} '{key}' not found")]
    NotFound {
        /// Kind of thing looked up.
        what: &'static str,
        /// Lookup key.
        key: String,
    },

    /// Re-registration or a second outstanding challenge.
    #[error("{what} '{key}' already exists")]
    DuplicateKey {
        /// Kind of thing inserted.
        what: &'static str,
        /// Conflicting key.
        key: String,
    },

    /// Move refused by the board.
    #[error("Invalid move: {0}")]
    InvalidMove(#[from] MoveError),

    /// Move made while the opponent holds the turn.
    #[error("Invalid move: not your turn")]
    OutOfTurn,

    /// Lobby or challenge already torn down.
    #[error("{what} '{key}' is no longer active")]
    StaleReference {
        /// Kind of thing referenced.
        what: &'static str,
        /// Reference key.
        key: String,
    },

    /// Target cannot take a challenge right now.
    #[error("Player '{name}' is unavailable ({status:?})")]
    PlayerUnavailable {
        /// Player asked for.
        name: String,
        /// Their status at the time.
        status: PlayerStatus,
    },

    /// Undecodable or malformed invocation.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl HubError {
    /// Shorthand for [`HubError::NotFound`].
    pub fn not_found(what: &'static str, key: impl ToString) -> Self {
        HubError::NotFound { what, key: key.to_string() }
    }

    /// Shorthand for [`HubError::StaleReference`].
    pub fn stale(what: &'static str, key: impl ToString) -> Self {
        HubError::StaleReference { what, key: key.to_string() }
    }

    /// Stable error code for the wire.
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::NotFound { .. } => ErrorCode::NotFound,
            HubError::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            HubError::InvalidMove(_) | HubError::OutOfTurn => ErrorCode::InvalidMove,
            HubError::StaleReference { .. } => ErrorCode::StaleReference,
            HubError::PlayerUnavailable { .. } => ErrorCode::PlayerUnavailable,
            HubError::Protocol(_) => ErrorCode::ProtocolError,
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown connection, player or lobby.
    NotFound,
    /// Key already present.
    DuplicateKey,
    /// Move rejected.
    InvalidMove,
    /// Referenced state already gone.
    StaleReference,
    /// Player cannot be challenged.
    PlayerUnavailable,
    /// Malformed request.
    ProtocolError,
}

/// Error as sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl From<&HubError> for ErrorPayload {
    fn from(err: &HubError) -> Self {
        Self { code: err.code(), message: err.to_string() }
    }
}
