//! Lobby Management
//!
//! Manages the lifecycle of game lobbies from an accepted challenge to the
//! last closed box (or a departure). Each lobby pairs two connections with
//! one [`GridEngine`] and routes moves between them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::game::grid::{GridEngine, DEFAULT_BOARD_PX};
use crate::game::player::GridSize;
use crate::network::protocol::HubError;
use crate::network::registry::ConnectionId;

/// Unique lobby identifier. Never reissued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LobbyId(Uuid);

impl LobbyId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LobbyId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LobbyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Configuration shared by every lobby.
#[derive(Debug, Clone, Copy)]
pub struct LobbyConfig {
    /// Square board side in pixels.
    pub board_px: u32,
    /// Reject moves made out of turn.
    pub enforce_turns: bool,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            board_px: DEFAULT_BOARD_PX,
            enforce_turns: true,
        }
    }
}

// =============================================================================
// LOBBY
// =============================================================================

/// A running game between two connections.
#[derive(Debug)]
pub struct Lobby {
    /// Lobby identifier.
    pub id: LobbyId,
    /// Challenger first, then the accepting player.
    participants: [ConnectionId; 2],
    engine: GridEngine,
    scores: [u32; 2],
    /// Seat allowed to move next. `None` until the opening move.
    turn: Option<usize>,
    moves: u32,
}

/// Outcome of one accepted move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveReport {
    /// Lobby the move was made in.
    pub lobby_id: LobbyId,
    /// The other participant.
    pub opponent: ConnectionId,
    /// Boxes closed by this move.
    pub points_gained: u32,
    /// Whether the board is now full.
    pub game_ended: bool,
    /// Scores indexed like the participants (challenger first).
    pub scores: [u32; 2],
}

impl Lobby {
    /// Create a lobby with a fresh board.
    pub fn new(challenger: ConnectionId, target: ConnectionId, size: GridSize, board_px: u32) -> Self {
        Self {
            id: LobbyId::new(),
            participants: [challenger, target],
            engine: GridEngine::new(size, board_px),
            scores: [0, 0],
            turn: None,
            moves: 0,
        }
    }

    /// Both participants, challenger first.
    pub fn participants(&self) -> [ConnectionId; 2] {
        self.participants
    }

    /// Seat index of a connection.
    pub fn seat_of(&self, conn: ConnectionId) -> Option<usize> {
        self.participants.iter().position(|p| *p == conn)
    }

    /// The other participant.
    pub fn opponent_of(&self, conn: ConnectionId) -> Option<ConnectionId> {
        self.seat_of(conn).map(|seat| self.participants[1 - seat])
    }

    /// Read-only board access.
    pub fn engine(&self) -> &GridEngine {
        &self.engine
    }

    /// Scores, challenger first.
    pub fn scores(&self) -> [u32; 2] {
        self.scores
    }

    /// Connection expected to move next, if fixed yet.
    pub fn turn(&self) -> Option<ConnectionId> {
        self.turn.map(|seat| self.participants[seat])
    }

    /// Moves accepted so far.
    pub fn move_count(&self) -> u32 {
        self.moves
    }

    /// Apply a move by `acting`. The board and turn stay untouched on error.
    pub fn apply_move(
        &mut self,
        acting: ConnectionId,
        enforce_turns: bool,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
    ) -> Result<MoveReport, HubError> {
        let seat = self
            .seat_of(acting)
            .ok_or_else(|| HubError::stale("lobby membership", self.id))?;

        if enforce_turns && self.turn.is_some_and(|t| t != seat) {
            return Err(HubError::OutOfTurn);
        }

        let points = self.engine.make_move(x1, y1, x2, y2)?;

        self.scores[seat] += points;
        self.moves += 1;
        // Closing a box earns another move
        self.turn = Some(if points > 0 { seat } else { 1 - seat });

        Ok(MoveReport {
            lobby_id: self.id,
            opponent: self.participants[1 - seat],
            points_gained: points,
            game_ended: self.engine.is_game_ended(),
            scores: self.scores,
        })
    }
}

// =============================================================================
// LOBBY MANAGER
// =============================================================================

/// Manages all active lobbies.
pub struct LobbyManager {
    /// Active lobbies.
    lobbies: DashMap<LobbyId, Lobby>,
    /// Connection to lobby mapping.
    by_connection: DashMap<ConnectionId, LobbyId>,
    config: LobbyConfig,
}

impl LobbyManager {
    /// Create new lobby manager.
    pub fn new(config: LobbyConfig) -> Self {
        Self {
            lobbies: DashMap::new(),
            by_connection: DashMap::new(),
            config,
        }
    }

    /// Pair two connections in a new lobby with a board of `size`.
    pub fn map_opponents(
        &self,
        challenger: ConnectionId,
        target: ConnectionId,
        size: GridSize,
    ) -> Result<LobbyId, HubError> {
        let lobby = Lobby::new(challenger, target, size, self.config.board_px);
        let id = lobby.id;

        // Claim both seats first; a concurrent pairing loses here
        let mut claimed = Vec::with_capacity(2);
        for conn in [challenger, target] {
            match self.by_connection.entry(conn) {
                Entry::Vacant(seat) => {
                    seat.insert(id);
                    claimed.push(conn);
                }
                Entry::Occupied(_) => {
                    for seat in claimed {
                        self.by_connection.remove_if(&seat, |_, owner| *owner == id);
                    }
                    return Err(HubError::DuplicateKey { what: "lobby member", key: conn.to_string() });
                }
            }
        }
        self.lobbies.insert(id, lobby);

        info!(lobby = %id, %challenger, %target, %size, "Lobby created");
        Ok(id)
    }

    /// Route a move to the lobby's board. Removes the lobby once the game ends.
    pub fn make_move(
        &self,
        lobby_id: LobbyId,
        acting: ConnectionId,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
    ) -> Result<MoveReport, HubError> {
        let report = {
            let mut lobby = self
                .lobbies
                .get_mut(&lobby_id)
                .ok_or_else(|| HubError::not_found("lobby", lobby_id))?;
            lobby.apply_move(acting, self.config.enforce_turns, x1, y1, x2, y2)?
        };

        debug!(
            lobby = %lobby_id,
            %acting,
            points = report.points_gained,
            "Move applied"
        );

        if report.game_ended {
            info!(lobby = %lobby_id, scores = ?report.scores, "Game ended");
            self.remove(lobby_id);
        }
        Ok(report)
    }

    /// Discard the lobby `conn` plays in and return the opponent.
    pub fn remove_lobby_for_connection(&self, conn: ConnectionId) -> Result<ConnectionId, HubError> {
        let lobby_id = self
            .lobby_of(conn)
            .ok_or_else(|| HubError::not_found("lobby for connection", conn))?;
        let lobby = self
            .remove(lobby_id)
            .ok_or_else(|| HubError::stale("lobby", lobby_id))?;

        lobby
            .opponent_of(conn)
            .ok_or_else(|| HubError::stale("lobby membership", lobby_id))
    }

    /// Lobby a connection currently plays in.
    pub fn lobby_of(&self, conn: ConnectionId) -> Option<LobbyId> {
        self.by_connection.get(&conn).map(|entry| *entry)
    }

    /// Inspect a lobby without holding the entry.
    pub fn with_lobby<R>(&self, lobby_id: LobbyId, f: impl FnOnce(&Lobby) -> R) -> Option<R> {
        self.lobbies.get(&lobby_id).map(|lobby| f(&lobby))
    }

    /// Get active lobby count.
    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    /// No active lobbies.
    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }

    fn remove(&self, lobby_id: LobbyId) -> Option<Lobby> {
        let (_, lobby) = self.lobbies.remove(&lobby_id)?;
        for conn in lobby.participants {
            self.by_connection.remove_if(&conn, |_, id| *id == lobby_id);
        }
        debug!(lobby = %lobby_id, "Lobby removed");
        Some(lobby)
    }
}

impl Default for LobbyManager {
    fn default() -> Self {
        Self::new(LobbyConfig::default())
    }
}
