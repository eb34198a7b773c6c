//! Network Layer
//!
//! WebSocket server, hub dispatch and the shared lobby state.
//! Board rules live in `game/`; everything here is about who is connected,
//! who challenged whom and which two connections share a board.

pub mod challenge;
pub mod channels;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use challenge::{ChallengeCoordinator, PendingChallenge};
pub use channels::{ChannelGuard, ClientChannels};
pub use hub::{ClientSession, Hub, HubConfig};
pub use protocol::{
    ClientMessage, ErrorCode, Frame, HubError, HubEvent, Outbound, ServerMessage,
    ServerMethod, WireNames, WireTableError,
};
pub use registry::{ConnectionId, PlayerRegistry};
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{Lobby, LobbyConfig, LobbyId, LobbyManager, MoveReport};
