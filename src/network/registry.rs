//! Player Registry
//!
//! Connected players keyed by transport connection, with a name index for
//! challenge lookups. Both maps are sharded `DashMap`s; every operation is a
//! single-key update and no guard outlives the call.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::game::player::{Player, PlayerSettings, PlayerStatus};
use crate::network::protocol::HubError;

/// Opaque id assigned to each transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Entry pushed out by a newer connection registering the same name.
pub type Evicted = (ConnectionId, Player);

/// Registry of connected players.
#[derive(Default)]
pub struct PlayerRegistry {
    players: DashMap<ConnectionId, Player>,
    names: DashMap<String, ConnectionId>,
}

impl PlayerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `player` under `conn`.
    ///
    /// If another connection already holds the name, that entry is removed
    /// and returned so the caller can run its departure cleanup.
    pub fn add_player(&self, conn: ConnectionId, player: Player) -> Result<Option<Evicted>, HubError> {
        let name = player.name.clone();

        match self.players.entry(conn) {
            Entry::Occupied(_) => {
                return Err(HubError::DuplicateKey { what: "connection", key: conn.to_string() });
            }
            Entry::Vacant(slot) => {
                slot.insert(player);
            }
        }

        let evicted = match self.names.insert(name.clone(), conn) {
            Some(stale) if stale != conn => self.players.remove(&stale),
            _ => None,
        };

        match &evicted {
            Some((stale, _)) => info!(%conn, %stale, player = %name, "Player re-registered, evicting stale connection"),
            None => debug!(%conn, player = %name, "Player registered"),
        }
        Ok(evicted)
    }

    /// Remove the player registered under `conn`.
    pub fn remove_player(&self, conn: ConnectionId) -> Result<Player, HubError> {
        let (_, player) = self
            .players
            .remove(&conn)
            .ok_or_else(|| HubError::not_found("connection", conn))?;
        self.names.remove_if(&player.name, |_, owner| *owner == conn);

        debug!(%conn, player = %player.name, "Player removed");
        Ok(player)
    }

    /// Snapshot of one player.
    pub fn get_player(&self, conn: ConnectionId) -> Result<Player, HubError> {
        self.players
            .get(&conn)
            .map(|p| p.clone())
            .ok_or_else(|| HubError::not_found("connection", conn))
    }

    /// Connection currently registered under `name`.
    pub fn get_connection_id(&self, name: &str) -> Result<ConnectionId, HubError> {
        self.names
            .get(name)
            .map(|c| *c)
            .ok_or_else(|| HubError::not_found("player", name))
    }

    /// Store new settings. A player in the lobby picks up the new
    /// do-not-disturb flag at once; an engaged player keeps their status.
    pub fn update_settings(&self, conn: ConnectionId, settings: PlayerSettings) -> Result<Player, HubError> {
        self.modify(conn, |player| {
            player.settings = settings;
            if !player.status.is_engaged() {
                player.status = PlayerStatus::idle(settings.do_not_disturb);
            }
        })
    }

    /// Overwrite the status.
    pub fn set_status(&self, conn: ConnectionId, status: PlayerStatus) -> Result<Player, HubError> {
        self.modify(conn, |player| player.status = status)
    }

    /// Move the status from `expected` to `next`, or fail with
    /// [`HubError::PlayerUnavailable`] if it is anything else.
    pub fn transition(
        &self,
        conn: ConnectionId,
        expected: PlayerStatus,
        next: PlayerStatus,
    ) -> Result<Player, HubError> {
        let mut player = self
            .players
            .get_mut(&conn)
            .ok_or_else(|| HubError::not_found("connection", conn))?;
        if player.status != expected {
            return Err(HubError::PlayerUnavailable {
                name: player.name.clone(),
                status: player.status,
            });
        }
        player.status = next;
        Ok(player.clone())
    }

    /// Return to the lobby: FreeToPlay or DoNotDisturb per settings.
    pub fn settle_status(&self, conn: ConnectionId) -> Result<Player, HubError> {
        self.modify(conn, |player| {
            player.status = PlayerStatus::idle(player.settings.do_not_disturb);
        })
    }

    /// Whether `conn` is registered.
    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.players.contains_key(&conn)
    }

    /// All players, sorted by name.
    pub fn players(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self.players.iter().map(|p| p.value().clone()).collect();
        players.sort_by(|a, b| a.name.cmp(&b.name));
        players
    }

    /// Registered player count.
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// No players registered.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    fn modify(&self, conn: ConnectionId, f: impl FnOnce(&mut Player)) -> Result<Player, HubError> {
        let mut player = self
            .players
            .get_mut(&conn)
            .ok_or_else(|| HubError::not_found("connection", conn))?;
        f(&mut player);
        Ok(player.clone())
    }
}
