//! Game Hub
//!
//! Dispatches decoded client invocations to the registry, the challenge
//! coordinator and the lobby manager, and fans the resulting events out to
//! the affected connections. Transport-agnostic: the server feeds it
//! [`ClientMessage`]s and drains each connection's [`Outbound`] queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::game::grid::DEFAULT_BOARD_PX;
use crate::game::player::{Player, PlayerSettings, PlayerStatus};
use crate::network::challenge::ChallengeCoordinator;
use crate::network::channels::{ChannelGuard, ClientChannels, DEFAULT_CHANNEL_CAPACITY};
use crate::network::protocol::{
    ClientMessage, HubError, Outbound, ServerMessage, WireNames, WireTableError,
};
use crate::network::registry::{ConnectionId, PlayerRegistry};
use crate::network::session::{LobbyConfig, LobbyId, LobbyManager};

/// Hub tuning.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Square board side in pixels.
    pub board_px: u32,
    /// Reject moves made out of turn.
    pub enforce_turns: bool,
    /// Per-connection outbound queue depth.
    pub channel_capacity: usize,
    /// Unanswered challenges expire after this long. `None` disables.
    pub challenge_timeout: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            board_px: DEFAULT_BOARD_PX,
            enforce_turns: true,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            challenge_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// A connection's end of the hub.
pub struct ClientSession {
    /// Subscription; dropping it unsubscribes the connection.
    pub guard: ChannelGuard,
    /// Events and replies for this connection.
    pub outbound: mpsc::Receiver<Outbound>,
}

impl ClientSession {
    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }
}

/// The game hub.
pub struct Hub {
    names: Arc<WireNames>,
    registry: Arc<PlayerRegistry>,
    lobbies: Arc<LobbyManager>,
    challenges: ChallengeCoordinator,
    channels: Arc<ClientChannels>,
}

impl Hub {
    /// Create a hub. Fails if the wire name tables are inconsistent.
    pub fn new(config: HubConfig) -> Result<Self, WireTableError> {
        let names = Arc::new(WireNames::validated()?);
        let registry = Arc::new(PlayerRegistry::new());
        let lobbies = Arc::new(LobbyManager::new(LobbyConfig {
            board_px: config.board_px,
            enforce_turns: config.enforce_turns,
        }));
        let channels = Arc::new(ClientChannels::new(config.channel_capacity));
        let challenges = ChallengeCoordinator::new(
            registry.clone(),
            lobbies.clone(),
            channels.clone(),
            config.challenge_timeout,
        );

        Ok(Self { names, registry, lobbies, challenges, channels })
    }

    /// Validated wire names.
    pub fn names(&self) -> &Arc<WireNames> {
        &self.names
    }

    /// Player registry.
    pub fn registry(&self) -> &PlayerRegistry {
        &self.registry
    }

    /// Lobby manager.
    pub fn lobbies(&self) -> &LobbyManager {
        &self.lobbies
    }

    /// Challenge coordinator.
    pub fn challenges(&self) -> &ChallengeCoordinator {
        &self.challenges
    }

    /// Outbound channels.
    pub fn channels(&self) -> &ClientChannels {
        &self.channels
    }

    /// Subscribe a new transport connection.
    pub fn open_connection(&self) -> ClientSession {
        let (guard, outbound) = self.channels.open();
        debug!(conn = %guard.id(), "Connection opened");
        ClientSession { guard, outbound }
    }

    /// Snapshot of registered players.
    pub fn connected_players(&self) -> Vec<Player> {
        self.registry.players()
    }

    /// Run one invocation from `conn`.
    pub fn dispatch(&self, conn: ConnectionId, msg: ClientMessage) -> Result<(), HubError> {
        let method = msg.method();
        info!(%conn, method = self.names.method_name(method), "Calling hub method");

        let result = match msg {
            ClientMessage::PlayerConnect(player) => self.player_connect(conn, player),
            ClientMessage::PlayerUpdateSettings(settings) => self.player_update_settings(conn, settings),
            ClientMessage::PlayerSendChallenge { target_name } => {
                self.challenges.send_challenge(conn, &target_name)
            }
            ClientMessage::PlayerCancelChallenge { target_name } => {
                self.challenges.cancel_challenge(conn, &target_name)
            }
            ClientMessage::PlayerSendChallengeAnswer { accepted, challenger_name } => self
                .challenges
                .answer_challenge(conn, accepted, &challenger_name)
                .map(|_| ()),
            ClientMessage::OpponentMakeMove { lobby_id, x1, y1, x2, y2 } => {
                self.opponent_make_move(conn, lobby_id, x1, y1, x2, y2)
            }
            ClientMessage::OpponentLeaveGame => self.opponent_leave_game(conn),
        };
        self.reap_overflowed();

        if let Err(err) = &result {
            match err {
                HubError::Protocol(_) | HubError::DuplicateKey { .. } => {
                    warn!(%conn, method = self.names.method_name(method), error = %err, "Hub method failed")
                }
                _ => debug!(%conn, method = self.names.method_name(method), error = %err, "Hub method failed"),
            }
        }
        result
    }

    /// Register the caller and announce them to everyone else.
    pub fn player_connect(&self, conn: ConnectionId, player: Player) -> Result<(), HubError> {
        if player.name.trim().is_empty() {
            return Err(HubError::Protocol("player name must not be empty".into()));
        }
        // Status is server-owned
        let player = Player {
            status: PlayerStatus::idle(player.settings.do_not_disturb),
            ..player
        };

        if let Some((stale, stale_player)) = self.registry.add_player(conn, player.clone())? {
            self.channels.close(stale);
            self.depart(stale, stale_player, &[conn]);
        }

        info!(%conn, player = %player.name, "Player connected");
        self.channels.broadcast_except(&[conn], ServerMessage::OnPlayerConnect(player));
        Ok(())
    }

    /// Replace the caller's settings and announce the change.
    pub fn player_update_settings(
        &self,
        conn: ConnectionId,
        settings: PlayerSettings,
    ) -> Result<(), HubError> {
        let player = self.registry.update_settings(conn, settings)?;
        self.channels.broadcast_except(&[conn], ServerMessage::OnPlayerUpdateSettings(player));
        Ok(())
    }

    /// Draw an edge and tell both participants what it scored.
    pub fn opponent_make_move(
        &self,
        conn: ConnectionId,
        lobby_id: LobbyId,
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
    ) -> Result<(), HubError> {
        let report = self.lobbies.make_move(lobby_id, conn, x1, y1, x2, y2)?;

        self.channels.send_to(
            report.opponent,
            ServerMessage::OnOpponentMakeMove { x1, y1, x2, y2, points_gained: report.points_gained },
        );
        self.channels.send_to(conn, ServerMessage::OnGainPoints { points: report.points_gained });

        if report.game_ended {
            for participant in [conn, report.opponent] {
                self.channels.send_to(participant, ServerMessage::OnGameEnd);
            }
            for participant in [conn, report.opponent] {
                self.announce_settled(participant);
            }
        }
        Ok(())
    }

    /// Abandon the caller's game.
    pub fn opponent_leave_game(&self, conn: ConnectionId) -> Result<(), HubError> {
        let opponent = self.lobbies.remove_lobby_for_connection(conn)?;
        info!(%conn, %opponent, "Player left game");

        self.channels.send_to(opponent, ServerMessage::OnOpponentLeaveGame);
        for participant in [conn, opponent] {
            self.announce_settled(participant);
        }
        Ok(())
    }

    /// Tear down everything tied to a closed connection.
    pub fn disconnect(&self, conn: ConnectionId) {
        self.teardown(conn);
        self.reap_overflowed();
    }

    /// Sweep expired challenges.
    pub fn expire_challenges(&self) -> usize {
        let expired = self.challenges.expire(Instant::now());
        self.reap_overflowed();
        expired
    }

    fn teardown(&self, conn: ConnectionId) {
        match self.registry.remove_player(conn) {
            Ok(player) => self.depart(conn, player, &[]),
            Err(_) => {
                // Never registered, or evicted by a newer connection
                self.challenges.discard_for_connection(conn);
                debug!(%conn, "Connection closed without a registered player");
            }
        }
    }

    /// Disconnect every connection dropped for a full queue. Each teardown
    /// may overflow further queues, so keep going until none are left.
    fn reap_overflowed(&self) {
        loop {
            let overflowed = self.channels.drain_overflowed();
            if overflowed.is_empty() {
                break;
            }
            for conn in overflowed {
                info!(%conn, "Disconnecting slow client");
                self.teardown(conn);
            }
        }
    }

    fn depart(&self, conn: ConnectionId, player: Player, also_skip: &[ConnectionId]) {
        self.challenges.discard_for_connection(conn);

        if let Ok(opponent) = self.lobbies.remove_lobby_for_connection(conn) {
            self.channels.send_to(opponent, ServerMessage::OnOpponentLeaveGame);
            self.announce_settled(opponent);
        }

        info!(%conn, player = %player.name, "Player disconnected");

        let mut skip = vec![conn];
        skip.extend_from_slice(also_skip);
        self.channels.broadcast_except(&skip, ServerMessage::OnPlayerDisconnect { name: player.name });
    }

    fn announce_settled(&self, conn: ConnectionId) {
        if let Ok(player) = self.registry.settle_status(conn) {
            self.channels.broadcast_except(
                &[conn],
                ServerMessage::OnPlayerChangeStatus { name: player.name, status: player.status },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::player::GridSize;

    fn hub() -> Hub {
        Hub::new(HubConfig {
            board_px: 300,
            ..Default::default()
        })
        .unwrap()
    }

    fn events(session: &mut ClientSession) -> Vec<ServerMessage> {
        let mut events = Vec::new();
        while let Ok(out) = session.outbound.try_recv() {
            if let Outbound::Event(msg) = out {
                events.push(msg);
            }
        }
        events
    }

    fn join(hub: &Hub, name: &str) -> ClientSession {
        let session = hub.open_connection();
        hub.dispatch(session.id(), ClientMessage::PlayerConnect(Player::new(name)))
            .unwrap();
        session
    }

    /// Alice challenges Bob, Bob accepts. Queues are drained.
    fn start_game(hub: &Hub, alice: &mut ClientSession, bob: &mut ClientSession) -> LobbyId {
        hub.dispatch(alice.id(), ClientMessage::PlayerSendChallenge { target_name: "bob".into() })
            .unwrap();
        hub.dispatch(
            bob.id(),
            ClientMessage::PlayerSendChallengeAnswer { accepted: true, challenger_name: "alice".into() },
        )
        .unwrap();

        let lobby = match events(alice).pop() {
            Some(ServerMessage::OnChallengeAccept { lobby_id }) => lobby_id,
            other => panic!("expected OnChallengeAccept, got {other:?}"),
        };
        events(bob);
        lobby
    }

    #[test]
    fn test_connect_broadcasts_to_others() {
        let hub = hub();
        let mut alice = join(&hub, "alice");
        let mut bob = join(&hub, "bob");

        assert_eq!(events(&mut alice), vec![ServerMessage::OnPlayerConnect(Player::new("bob"))]);
        assert!(events(&mut bob).is_empty());
        assert_eq!(hub.connected_players().len(), 2);
    }

    #[test]
    fn test_connect_normalizes_status() {
        let hub = hub();
        let session = hub.open_connection();
        let mut player = Player::new("alice");
        player.status = PlayerStatus::Playing;

        hub.dispatch(session.id(), ClientMessage::PlayerConnect(player)).unwrap();
        assert_eq!(
            hub.registry().get_player(session.id()).unwrap().status,
            PlayerStatus::FreeToPlay
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let hub = hub();
        let session = hub.open_connection();
        let err = hub
            .dispatch(session.id(), ClientMessage::PlayerConnect(Player::new("  ")))
            .unwrap_err();
        assert!(matches!(err, HubError::Protocol(_)));
        assert!(hub.registry().is_empty());
    }

    #[test]
    fn test_update_settings_broadcast() {
        let hub = hub();
        let mut alice = join(&hub, "alice");
        let bob = join(&hub, "bob");
        events(&mut alice);

        let settings = PlayerSettings { do_not_disturb: true, ..Default::default() };
        hub.dispatch(bob.id(), ClientMessage::PlayerUpdateSettings(settings)).unwrap();

        match events(&mut alice).as_slice() {
            [ServerMessage::OnPlayerUpdateSettings(player)] => {
                assert_eq!(player.name, "bob");
                assert_eq!(player.status, PlayerStatus::DoNotDisturb);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn test_accept_and_move_routes_to_opponent() {
        let hub = hub();
        let mut alice = join(&hub, "alice");
        let mut bob = join(&hub, "bob");
        let lobby_id = start_game(&hub, &mut alice, &mut bob);

        hub.dispatch(alice.id(), ClientMessage::OpponentMakeMove { lobby_id, x1: 0, y1: 0, x2: 100, y2: 0 })
            .unwrap();

        assert_eq!(events(&mut alice), vec![ServerMessage::OnGainPoints { points: 0 }]);
        assert_eq!(
            events(&mut bob),
            vec![ServerMessage::OnOpponentMakeMove { x1: 0, y1: 0, x2: 100, y2: 0, points_gained: 0 }]
        );
    }

    #[test]
    fn test_failed_move_only_affects_caller() {
        let hub = hub();
        let mut alice = join(&hub, "alice");
        let mut bob = join(&hub, "bob");
        let lobby_id = start_game(&hub, &mut alice, &mut bob);

        let err = hub
            .dispatch(alice.id(), ClientMessage::OpponentMakeMove { lobby_id, x1: 0, y1: 0, x2: 100, y2: 100 })
            .unwrap_err();
        assert_eq!(err.code(), crate::network::protocol::ErrorCode::InvalidMove);
        assert!(events(&mut alice).is_empty());
        assert!(events(&mut bob).is_empty());
        assert_eq!(hub.lobbies().len(), 1);
    }

    #[test]
    fn test_game_end_settles_both() {
        let hub = Hub::new(HubConfig { board_px: 300, enforce_turns: false, ..Default::default() })
            .unwrap();
        let mut alice = join(&hub, "alice");
        let mut bob = join(&hub, "bob");
        let mut carol = join(&hub, "carol");
        let lobby_id = start_game(&hub, &mut alice, &mut bob);
        events(&mut carol);

        let reference = crate::game::grid::GridEngine::new(GridSize::ThreeByThree, 300);
        for edge in reference.all_edges() {
            let (x1, y1, x2, y2) = reference.edge_pixels(edge);
            hub.dispatch(alice.id(), ClientMessage::OpponentMakeMove { lobby_id, x1, y1, x2, y2 })
                .unwrap();
        }

        assert!(events(&mut alice).contains(&ServerMessage::OnGameEnd));
        assert!(events(&mut bob).contains(&ServerMessage::OnGameEnd));
        assert!(hub.lobbies().is_empty());
        assert_eq!(
            events(&mut carol),
            vec![
                ServerMessage::OnPlayerChangeStatus { name: "alice".into(), status: PlayerStatus::FreeToPlay },
                ServerMessage::OnPlayerChangeStatus { name: "bob".into(), status: PlayerStatus::FreeToPlay },
            ]
        );
    }

    #[test]
    fn test_leave_game() {
        let hub = hub();
        let mut alice = join(&hub, "alice");
        let mut bob = join(&hub, "bob");
        start_game(&hub, &mut alice, &mut bob);

        hub.dispatch(bob.id(), ClientMessage::OpponentLeaveGame).unwrap();

        let alice_events = events(&mut alice);
        assert_eq!(alice_events.first(), Some(&ServerMessage::OnOpponentLeaveGame));
        assert!(hub.lobbies().is_empty());
        assert_eq!(hub.registry().get_player(alice.id()).unwrap().status, PlayerStatus::FreeToPlay);
        assert_eq!(hub.registry().get_player(bob.id()).unwrap().status, PlayerStatus::FreeToPlay);

        let err = hub.dispatch(bob.id(), ClientMessage::OpponentLeaveGame).unwrap_err();
        assert!(matches!(err, HubError::NotFound { .. }));
    }

    #[test]
    fn test_disconnect_cascade_mid_game() {
        let hub = hub();
        let mut alice = join(&hub, "alice");
        let mut bob = join(&hub, "bob");
        let mut carol = join(&hub, "carol");
        start_game(&hub, &mut alice, &mut bob);
        events(&mut carol);

        let bob_id = bob.id();
        drop(bob);
        hub.disconnect(bob_id);

        assert_eq!(
            events(&mut alice),
            vec![
                ServerMessage::OnOpponentLeaveGame,
                ServerMessage::OnPlayerDisconnect { name: "bob".into() },
            ]
        );
        assert_eq!(
            events(&mut carol),
            vec![
                ServerMessage::OnPlayerChangeStatus { name: "alice".into(), status: PlayerStatus::FreeToPlay },
                ServerMessage::OnPlayerDisconnect { name: "bob".into() },
            ]
        );
        assert!(hub.lobbies().is_empty());
        assert_eq!(hub.registry().len(), 2);
    }

    #[test]
    fn test_disconnect_with_pending_challenge() {
        let hub = hub();
        let alice = join(&hub, "alice");
        let mut bob = join(&hub, "bob");

        hub.dispatch(alice.id(), ClientMessage::PlayerSendChallenge { target_name: "bob".into() })
            .unwrap();
        events(&mut bob);

        let alice_id = alice.id();
        drop(alice);
        hub.disconnect(alice_id);

        assert_eq!(
            events(&mut bob),
            vec![
                ServerMessage::OnChallengeCancel,
                ServerMessage::OnPlayerDisconnect { name: "alice".into() },
            ]
        );
        assert_eq!(hub.registry().get_player(bob.id()).unwrap().status, PlayerStatus::FreeToPlay);
        assert!(hub.challenges().is_empty());
    }

    #[test]
    fn test_reconnect_same_name_evicts_stale() {
        let hub = hub();
        let stale = join(&hub, "alice");
        let mut bob = join(&hub, "bob");
        events(&mut bob);

        let mut fresh = join(&hub, "alice");

        assert_eq!(hub.registry().len(), 2);
        assert_eq!(hub.registry().get_connection_id("alice").unwrap(), fresh.id());
        assert_eq!(
            events(&mut bob),
            vec![
                ServerMessage::OnPlayerDisconnect { name: "alice".into() },
                ServerMessage::OnPlayerConnect(Player::new("alice")),
            ]
        );
        assert!(events(&mut fresh).is_empty());

        // Late disconnect of the stale socket is harmless
        hub.disconnect(stale.id());
        assert_eq!(hub.registry().len(), 2);
        assert!(events(&mut bob).is_empty());
    }

    #[tokio::test]
    async fn test_stalled_client_dropped_without_blocking_others() {
        let hub = Hub::new(HubConfig { channel_capacity: 1, ..Default::default() }).unwrap();
        let stalled = join(&hub, "alice");
        let mut bob = join(&hub, "bob");
        // alice's queue now holds OnPlayerConnect(bob) and is never read

        let settings = PlayerSettings { do_not_disturb: true, ..Default::default() };
        hub.dispatch(bob.id(), ClientMessage::PlayerUpdateSettings(settings)).unwrap();

        assert!(hub.registry().get_connection_id("alice").is_err());
        assert_eq!(hub.channels().len(), 1);
        assert_eq!(events(&mut bob), vec![ServerMessage::OnPlayerDisconnect { name: "alice".into() }]);
        tokio::time::timeout(Duration::from_secs(1), stalled.guard.closed())
            .await
            .expect("stalled connection was not closed");

        // The rest of the hub keeps working
        let mut carol = join(&hub, "carol");
        assert_eq!(events(&mut bob), vec![ServerMessage::OnPlayerConnect(Player::new("carol"))]);
        hub.dispatch(carol.id(), ClientMessage::PlayerSendChallenge { target_name: "bob".into() })
            .unwrap_err();
        assert!(events(&mut carol).is_empty());

        // Late transport close of the stalled socket is harmless
        hub.disconnect(stalled.id());
        assert_eq!(hub.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_closes_stale_connection() {
        let hub = hub();
        let stale = join(&hub, "alice");
        let _fresh = join(&hub, "alice");

        tokio::time::timeout(Duration::from_secs(1), stale.guard.closed())
            .await
            .expect("stale connection was not closed");
    }

    #[test]
    fn test_expire_challenges() {
        let hub = Hub::new(HubConfig {
            challenge_timeout: Some(Duration::ZERO),
            ..Default::default()
        })
        .unwrap();
        let alice = join(&hub, "alice");
        let _bob = join(&hub, "bob");

        hub.dispatch(alice.id(), ClientMessage::PlayerSendChallenge { target_name: "bob".into() })
            .unwrap();
        assert_eq!(hub.expire_challenges(), 1);
        assert!(hub.challenges().is_empty());
    }
}
