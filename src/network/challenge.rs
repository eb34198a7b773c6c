//! Challenge Coordination
//!
//! Tracks outstanding challenges (at most one per challenger) and drives the
//! target's status through `FreeToPlay -> Challenged -> {Playing | FreeToPlay}`,
//! notifying the parties and everyone watching the lobby.
//!
//! Nothing here is transactional across the send/answer round trip. A party
//! that disconnects in between simply makes the later step fail with
//! `NotFound` or `StaleReference`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::game::player::PlayerStatus;
use crate::network::channels::ClientChannels;
use crate::network::protocol::{HubError, ServerMessage};
use crate::network::registry::{ConnectionId, PlayerRegistry};
use crate::network::session::{LobbyId, LobbyManager};

/// An invitation waiting for an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    /// Challenger's connection.
    pub challenger: ConnectionId,
    /// Challenger's name at send time.
    pub challenger_name: String,
    /// Target's connection.
    pub target: ConnectionId,
    /// Target's name at send time.
    pub target_name: String,
    /// When the challenge was sent.
    pub sent_at: Instant,
}

/// Challenge state machine.
pub struct ChallengeCoordinator {
    /// Keyed by challenger.
    pending: DashMap<ConnectionId, PendingChallenge>,
    registry: Arc<PlayerRegistry>,
    lobbies: Arc<LobbyManager>,
    channels: Arc<ClientChannels>,
    timeout: Option<Duration>,
}

impl ChallengeCoordinator {
    /// Create a coordinator. `timeout` of `None` disables expiry.
    pub fn new(
        registry: Arc<PlayerRegistry>,
        lobbies: Arc<LobbyManager>,
        channels: Arc<ClientChannels>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            pending: DashMap::new(),
            registry,
            lobbies,
            channels,
            timeout,
        }
    }

    /// Challenge the player called `target_name`.
    pub fn send_challenge(&self, challenger: ConnectionId, target_name: &str) -> Result<(), HubError> {
        let pending = self.reserve(challenger, target_name)?;
        self.commit(pending)
    }

    /// Validate the pair and record the correlation.
    fn reserve(&self, challenger: ConnectionId, target_name: &str) -> Result<PendingChallenge, HubError> {
        let sender = self.registry.get_player(challenger)?;
        let target = self.registry.get_connection_id(target_name)?;

        if target == challenger || sender.status == PlayerStatus::Playing {
            return Err(HubError::PlayerUnavailable { name: sender.name, status: sender.status });
        }

        let pending = PendingChallenge {
            challenger,
            challenger_name: sender.name,
            target,
            target_name: target_name.to_string(),
            sent_at: Instant::now(),
        };
        match self.pending.entry(challenger) {
            Entry::Occupied(existing) => Err(HubError::DuplicateKey {
                what: "challenge from",
                key: existing.get().challenger_name.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(pending.clone());
                Ok(pending)
            }
        }
    }

    /// Move the target to `Challenged` and notify. The correlation must
    /// still exist afterwards; a challenger torn down in between leaves
    /// nothing to answer, so the target is put back.
    fn commit(&self, pending: PendingChallenge) -> Result<(), HubError> {
        let PendingChallenge { challenger, target, .. } = pending;

        if let Err(err) = self
            .registry
            .transition(target, PlayerStatus::FreeToPlay, PlayerStatus::Challenged)
        {
            self.pending.remove_if(&challenger, |_, p| p.target == target);
            return Err(err);
        }

        let still_pending = self
            .pending
            .get(&challenger)
            .is_some_and(|p| p.target == target);
        if !still_pending {
            debug!(challenger = %pending.challenger_name, "Challenger left before the challenge landed");
            let _ = self.registry.settle_status(target);
            return Err(HubError::stale("challenge to", &pending.target_name));
        }

        info!(challenger = %pending.challenger_name, target = %pending.target_name, "Challenge sent");

        self.channels.send_to(
            target,
            ServerMessage::OnChallenge { sender_name: pending.challenger_name },
        );
        self.channels.broadcast_except(
            &[challenger, target],
            ServerMessage::OnPlayerChangeStatus {
                name: pending.target_name,
                status: PlayerStatus::Challenged,
            },
        );
        Ok(())
    }

    /// Withdraw the challenge `challenger` sent to `target_name`.
    pub fn cancel_challenge(&self, challenger: ConnectionId, target_name: &str) -> Result<(), HubError> {
        let (_, pending) = self
            .pending
            .remove_if(&challenger, |_, p| p.target_name == target_name)
            .ok_or_else(|| HubError::stale("challenge to", target_name))?;

        info!(challenger = %pending.challenger_name, target = %target_name, "Challenge cancelled");

        self.channels.send_to(pending.target, ServerMessage::OnChallengeCancel);
        self.release_target(&pending);
        Ok(())
    }

    /// Answer the challenge `challenger_name` sent to `target`.
    ///
    /// Returns the new lobby on acceptance.
    pub fn answer_challenge(
        &self,
        target: ConnectionId,
        accepted: bool,
        challenger_name: &str,
    ) -> Result<Option<LobbyId>, HubError> {
        let challenger = self.registry.get_connection_id(challenger_name)?;
        let (_, pending) = self
            .pending
            .remove_if(&challenger, |_, p| p.target == target)
            .ok_or_else(|| HubError::stale("challenge from", challenger_name))?;

        if !accepted {
            info!(challenger = %challenger_name, target = %pending.target_name, "Challenge rejected");
            self.channels.send_to(challenger, ServerMessage::OnChallengeReject);
            self.release_target(&pending);
            return Ok(None);
        }

        let lobby_id = match self
            .registry
            .get_player(target)
            .and_then(|answering| {
                self.lobbies
                    .map_opponents(challenger, target, answering.settings.grid_size)
            }) {
            Ok(lobby_id) => lobby_id,
            Err(err) => {
                self.channels.send_to(challenger, ServerMessage::OnChallengeReject);
                self.release_target(&pending);
                return Err(err);
            }
        };

        // Either side may have left since the lookups above
        let statuses = match self.registry.set_status(challenger, PlayerStatus::Playing) {
            Ok(c) => self
                .registry
                .set_status(target, PlayerStatus::Playing)
                .map(|t| (c, t)),
            Err(err) => Err(err),
        };
        let (challenger_player, target_player) = match statuses {
            Ok(players) => players,
            Err(err) => {
                warn!(lobby = %lobby_id, error = %err, "Participant left before lobby start");
                if let Ok(remaining) = self.lobbies.remove_lobby_for_connection(challenger) {
                    self.settle(remaining);
                }
                self.settle(challenger);
                return Err(err);
            }
        };

        info!(
            lobby = %lobby_id,
            challenger = %challenger_player.name,
            target = %target_player.name,
            "Challenge accepted"
        );

        for conn in [challenger, target] {
            self.channels.send_to(conn, ServerMessage::OnChallengeAccept { lobby_id });
        }
        for player in [challenger_player, target_player] {
            self.channels.broadcast_except(
                &[challenger, target],
                ServerMessage::OnPlayerChangeStatus { name: player.name, status: player.status },
            );
        }

        // Neither player can take up another challenge now
        self.withdraw_all(challenger, Some(target));
        self.withdraw_all(target, Some(challenger));
        Ok(Some(lobby_id))
    }

    /// Drop every challenge `conn` sent or received, notifying the other party.
    pub fn discard_for_connection(&self, conn: ConnectionId) {
        self.withdraw_all(conn, None);
    }

    /// Expire challenges older than the configured timeout. Returns how many.
    pub fn expire(&self, now: Instant) -> usize {
        let Some(timeout) = self.timeout else {
            return 0;
        };
        let is_expired = |p: &PendingChallenge| now.saturating_duration_since(p.sent_at) >= timeout;

        let stale: Vec<ConnectionId> = self
            .pending
            .iter()
            .filter(|entry| is_expired(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for challenger in stale {
            let Some((_, pending)) = self.pending.remove_if(&challenger, |_, p| is_expired(p)) else {
                continue;
            };
            expired += 1;

            info!(
                challenger = %pending.challenger_name,
                target = %pending.target_name,
                "Challenge expired"
            );
            self.channels.send_to(pending.target, ServerMessage::OnChallengeCancel);
            self.channels.send_to(pending.challenger, ServerMessage::OnChallengeReject);
            self.release_target(&pending);
        }
        expired
    }

    /// Outstanding challenge sent by `challenger`.
    pub fn pending_for(&self, challenger: ConnectionId) -> Option<PendingChallenge> {
        self.pending.get(&challenger).map(|p| p.clone())
    }

    /// Outstanding challenge count.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// No outstanding challenges.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop `conn`'s outgoing and incoming challenges. The counterpart is
    /// told unless it is `partner`.
    fn withdraw_all(&self, conn: ConnectionId, partner: Option<ConnectionId>) {
        if let Some((_, outgoing)) = self.pending.remove(&conn) {
            debug!(
                challenger = %outgoing.challenger_name,
                target = %outgoing.target_name,
                "Withdrawing outgoing challenge"
            );
            if Some(outgoing.target) != partner {
                self.channels.send_to(outgoing.target, ServerMessage::OnChallengeCancel);
            }
            self.release_target(&outgoing);
        }

        let incoming: Vec<ConnectionId> = self
            .pending
            .iter()
            .filter(|entry| entry.target == conn)
            .map(|entry| *entry.key())
            .collect();

        for challenger in incoming {
            if let Some((_, pending)) = self.pending.remove_if(&challenger, |_, p| p.target == conn) {
                debug!(
                    challenger = %pending.challenger_name,
                    target = %pending.target_name,
                    "Withdrawing incoming challenge"
                );
                if Some(challenger) != partner {
                    self.channels.send_to(challenger, ServerMessage::OnChallengeReject);
                }
            }
        }
    }

    /// Return a still-challenged target to the lobby and tell the others.
    fn release_target(&self, pending: &PendingChallenge) {
        let settled = self
            .registry
            .get_player(pending.target)
            .ok()
            .filter(|p| p.status == PlayerStatus::Challenged)
            .and_then(|_| self.registry.settle_status(pending.target).ok());

        if let Some(player) = settled {
            self.channels.broadcast_except(
                &[pending.challenger, pending.target],
                ServerMessage::OnPlayerChangeStatus { name: player.name, status: player.status },
            );
        }
    }

    fn settle(&self, conn: ConnectionId) {
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
    use crate::game::player::{GridSize, Player, PlayerSettings};
    use crate::network::channels::ChannelGuard;
    use crate::network::protocol::Outbound;
    use crate::network::session::LobbyConfig;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<PlayerRegistry>,
        lobbies: Arc<LobbyManager>,
        coordinator: ChallengeCoordinator,
        channels: Arc<ClientChannels>,
    }

    struct Client {
        guard: ChannelGuard,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Client {
        fn id(&self) -> ConnectionId {
            self.guard.id()
        }

        fn events(&mut self) -> Vec<ServerMessage> {
            let mut events = Vec::new();
            while let Ok(out) = self.rx.try_recv() {
                if let Outbound::Event(msg) = out {
                    events.push(msg);
                }
            }
            events
        }
    }

    fn fixture(timeout: Option<Duration>) -> Fixture {
        let registry = Arc::new(PlayerRegistry::new());
        let lobbies = Arc::new(LobbyManager::new(LobbyConfig::default()));
        let channels = Arc::new(ClientChannels::new(32));
        let coordinator =
            ChallengeCoordinator::new(registry.clone(), lobbies.clone(), channels.clone(), timeout);
        Fixture { registry, lobbies, coordinator, channels }
    }

    impl Fixture {
        fn join(&self, player: Player) -> Client {
            let (guard, rx) = self.channels.open();
            self.registry.add_player(guard.id(), player).unwrap();
            Client { guard, rx }
        }
    }

    fn status_of(f: &Fixture, client: &Client) -> PlayerStatus {
        f.registry.get_player(client.id()).unwrap().status
    }

    #[test]
    fn test_send_then_cancel_observed_by_third_party() {
        let f = fixture(None);
        let mut alice = f.join(Player::new("alice"));
        let mut bob = f.join(Player::new("bob"));
        let mut carol = f.join(Player::new("carol"));

        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        assert_eq!(status_of(&f, &bob), PlayerStatus::Challenged);
        assert_eq!(bob.events(), vec![ServerMessage::OnChallenge { sender_name: "alice".into() }]);

        f.coordinator.cancel_challenge(alice.id(), "bob").unwrap();
        assert_eq!(status_of(&f, &bob), PlayerStatus::FreeToPlay);
        assert_eq!(bob.events(), vec![ServerMessage::OnChallengeCancel]);

        assert_eq!(
            carol.events(),
            vec![
                ServerMessage::OnPlayerChangeStatus { name: "bob".into(), status: PlayerStatus::Challenged },
                ServerMessage::OnPlayerChangeStatus { name: "bob".into(), status: PlayerStatus::FreeToPlay },
            ]
        );
        assert!(alice.events().is_empty());
        assert!(f.coordinator.is_empty());
    }

    #[test]
    fn test_send_challenge_failures() {
        let f = fixture(None);
        let alice = f.join(Player::new("alice"));
        let bob = f.join(Player::new("bob"));
        let _dnd = f.join(Player::new("dora").with_settings(PlayerSettings {
            do_not_disturb: true,
            ..Default::default()
        }));

        let err = f.coordinator.send_challenge(alice.id(), "nobody").unwrap_err();
        assert!(matches!(err, HubError::NotFound { .. }));

        let err = f.coordinator.send_challenge(alice.id(), "alice").unwrap_err();
        assert!(matches!(err, HubError::PlayerUnavailable { .. }));

        let err = f.coordinator.send_challenge(alice.id(), "dora").unwrap_err();
        assert!(matches!(err, HubError::PlayerUnavailable { status: PlayerStatus::DoNotDisturb, .. }));
        assert!(f.coordinator.is_empty());

        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        let err = f.coordinator.send_challenge(alice.id(), "bob").unwrap_err();
        assert!(matches!(err, HubError::DuplicateKey { .. }));

        // Already challenged by someone else
        let err = f.coordinator.send_challenge(bob.id(), "bob").unwrap_err();
        assert!(matches!(err, HubError::PlayerUnavailable { .. }));
    }

    #[test]
    fn test_second_challenger_sees_target_unavailable() {
        let f = fixture(None);
        let alice = f.join(Player::new("alice"));
        let _bob = f.join(Player::new("bob"));
        let carol = f.join(Player::new("carol"));

        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        let err = f.coordinator.send_challenge(carol.id(), "bob").unwrap_err();
        assert_eq!(
            err,
            HubError::PlayerUnavailable { name: "bob".into(), status: PlayerStatus::Challenged }
        );
        assert_eq!(f.coordinator.len(), 1);
    }

    #[test]
    fn test_cancel_unknown_is_stale() {
        let f = fixture(None);
        let alice = f.join(Player::new("alice"));
        let _bob = f.join(Player::new("bob"));

        let err = f.coordinator.cancel_challenge(alice.id(), "bob").unwrap_err();
        assert!(matches!(err, HubError::StaleReference { .. }));
    }

    #[test]
    fn test_accept_creates_lobby_for_both() {
        let f = fixture(None);
        let mut alice = f.join(Player::new("alice"));
        let mut bob = f.join(Player::new("bob").with_settings(PlayerSettings {
            grid_size: GridSize::FiveByFive,
            ..Default::default()
        }));
        let mut carol = f.join(Player::new("carol"));

        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        bob.events();
        carol.events();

        let lobby_id = f
            .coordinator
            .answer_challenge(bob.id(), true, "alice")
            .unwrap()
            .unwrap();

        assert_eq!(alice.events(), vec![ServerMessage::OnChallengeAccept { lobby_id }]);
        assert_eq!(bob.events(), vec![ServerMessage::OnChallengeAccept { lobby_id }]);
        assert_eq!(status_of(&f, &alice), PlayerStatus::Playing);
        assert_eq!(status_of(&f, &bob), PlayerStatus::Playing);
        assert_eq!(carol.events().len(), 2);

        // Board sized by the accepting player
        assert_eq!(
            f.lobbies.with_lobby(lobby_id, |l| l.engine().size()),
            Some(GridSize::FiveByFive)
        );
        assert_eq!(f.lobbies.lobby_of(alice.id()), Some(lobby_id));
    }

    #[test]
    fn test_reject_notifies_challenger() {
        let f = fixture(None);
        let mut alice = f.join(Player::new("alice"));
        let bob = f.join(Player::new("bob"));

        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        let lobby = f.coordinator.answer_challenge(bob.id(), false, "alice").unwrap();

        assert!(lobby.is_none());
        assert_eq!(alice.events(), vec![ServerMessage::OnChallengeReject]);
        assert_eq!(status_of(&f, &bob), PlayerStatus::FreeToPlay);
        assert!(f.lobbies.is_empty());
    }

    #[test]
    fn test_answer_after_challenger_left() {
        let f = fixture(None);
        let alice = f.join(Player::new("alice"));
        let bob = f.join(Player::new("bob"));

        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        f.coordinator.discard_for_connection(alice.id());
        f.registry.remove_player(alice.id()).unwrap();

        let err = f.coordinator.answer_challenge(bob.id(), true, "alice").unwrap_err();
        assert!(matches!(err, HubError::NotFound { .. }));
        assert_eq!(status_of(&f, &bob), PlayerStatus::FreeToPlay);
        assert!(f.lobbies.is_empty());
    }

    #[test]
    fn test_answer_without_challenge_is_stale() {
        let f = fixture(None);
        let _alice = f.join(Player::new("alice"));
        let bob = f.join(Player::new("bob"));

        let err = f.coordinator.answer_challenge(bob.id(), true, "alice").unwrap_err();
        assert!(matches!(err, HubError::StaleReference { .. }));
    }

    #[test]
    fn test_discard_incoming_rejects_challenger() {
        let f = fixture(None);
        let mut alice = f.join(Player::new("alice"));
        let bob = f.join(Player::new("bob"));

        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        f.coordinator.discard_for_connection(bob.id());

        assert_eq!(alice.events(), vec![ServerMessage::OnChallengeReject]);
        assert!(f.coordinator.is_empty());
    }

    #[test]
    fn test_accept_withdraws_other_challenges() {
        let f = fixture(None);
        let mut alice = f.join(Player::new("alice"));
        let mut bob = f.join(Player::new("bob"));
        let carol = f.join(Player::new("carol"));
        let mut dave = f.join(Player::new("dave"));
        let erin = f.join(Player::new("erin"));

        // alice waits on bob, then carol challenges alice; erin -> dave is unrelated
        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        f.coordinator.send_challenge(carol.id(), "alice").unwrap();
        f.coordinator.send_challenge(erin.id(), "dave").unwrap();
        bob.events();
        dave.events();

        f.coordinator.answer_challenge(alice.id(), true, "carol").unwrap().unwrap();

        assert_eq!(status_of(&f, &alice), PlayerStatus::Playing);
        assert_eq!(status_of(&f, &bob), PlayerStatus::FreeToPlay);
        assert!(bob.events().contains(&ServerMessage::OnChallengeCancel));
        assert_eq!(f.coordinator.pending_for(alice.id()), None);
        assert!(f.coordinator.pending_for(erin.id()).is_some());
        assert_eq!(f.coordinator.len(), 1);

        // Observers saw bob return to the lobby
        assert!(dave.events().contains(&ServerMessage::OnPlayerChangeStatus {
            name: "bob".into(),
            status: PlayerStatus::FreeToPlay,
        }));

        // bob's late answer finds nothing and alice is not disturbed
        alice.events();
        let err = f.coordinator.answer_challenge(bob.id(), true, "alice").unwrap_err();
        assert!(matches!(err, HubError::StaleReference { .. }));
        assert!(alice.events().is_empty());
        assert_eq!(f.lobbies.len(), 1);
    }

    #[test]
    fn test_accept_rejects_challenges_waiting_on_challenger() {
        let f = fixture(None);
        let mut alice = f.join(Player::new("alice"));
        let bob = f.join(Player::new("bob"));
        let mut carol = f.join(Player::new("carol"));

        // carol waits on alice, and alice has challenged bob
        f.coordinator.send_challenge(carol.id(), "alice").unwrap();
        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        alice.events();
        carol.events();

        f.coordinator.answer_challenge(bob.id(), true, "alice").unwrap().unwrap();

        let lobby_id = f.lobbies.lobby_of(alice.id()).unwrap();
        assert!(carol.events().contains(&ServerMessage::OnChallengeReject));
        assert_eq!(alice.events(), vec![ServerMessage::OnChallengeAccept { lobby_id }]);
        assert!(f.coordinator.is_empty());
    }

    #[test]
    fn test_challenger_gone_before_commit_releases_target() {
        let f = fixture(None);
        let alice = f.join(Player::new("alice"));
        let mut bob = f.join(Player::new("bob"));
        let mut carol = f.join(Player::new("carol"));

        let pending = f.coordinator.reserve(alice.id(), "bob").unwrap();
        // Torn down by another task before the target is marked
        f.coordinator.discard_for_connection(alice.id());
        f.registry.remove_player(alice.id()).unwrap();
        bob.events();

        let err = f.coordinator.commit(pending).unwrap_err();
        assert!(matches!(err, HubError::StaleReference { .. }));
        assert_eq!(status_of(&f, &bob), PlayerStatus::FreeToPlay);
        assert!(f.coordinator.is_empty());
        assert!(bob.events().is_empty());
        assert!(carol.events().is_empty());

        // bob can be challenged again
        f.coordinator.send_challenge(carol.id(), "bob").unwrap();
        assert_eq!(status_of(&f, &bob), PlayerStatus::Challenged);
    }

    #[test]
    fn test_expire_old_challenges() {
        let f = fixture(Some(Duration::from_secs(60)));
        let mut alice = f.join(Player::new("alice"));
        let mut bob = f.join(Player::new("bob"));

        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        bob.events();

        assert_eq!(f.coordinator.expire(Instant::now()), 0);
        assert_eq!(f.coordinator.len(), 1);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(f.coordinator.expire(later), 1);
        assert!(f.coordinator.is_empty());
        assert_eq!(status_of(&f, &bob), PlayerStatus::FreeToPlay);
        assert_eq!(alice.events(), vec![ServerMessage::OnChallengeReject]);
        assert_eq!(bob.events(), vec![ServerMessage::OnChallengeCancel]);
    }

    #[test]
    fn test_expiry_disabled() {
        let f = fixture(None);
        let alice = f.join(Player::new("alice"));
        let _bob = f.join(Player::new("bob"));

        f.coordinator.send_challenge(alice.id(), "bob").unwrap();
        let much_later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(f.coordinator.expire(much_later), 0);
        assert!(f.coordinator.pending_for(alice.id()).is_some());
    }
}
