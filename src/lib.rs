//! # Dots and Boxes Session Server
//!
//! Realtime lobby and game server for two-player Dots and Boxes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  DOTS AND BOXES SERVER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Board rules (no I/O)                      │
//! │  ├── grid.rs     - Edge validation and box scoring           │
//! │  └── player.rs   - Player record, status, settings           │
//! │                                                              │
//! │  network/        - Sessions and transport                    │
//! │  ├── registry.rs - Connection -> player map, name index      │
//! │  ├── challenge.rs- Challenge negotiation and expiry          │
//! │  ├── session.rs  - Lobbies pairing two connections           │
//! │  ├── channels.rs - Per-connection outbound queues            │
//! │  ├── protocol.rs - Wire frames, name tables, errors          │
//! │  ├── hub.rs      - Invocation dispatch and event fan-out     │
//! │  └── server.rs   - axum router: /dotsAndBoxes, /players      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Flow
//!
//! A client connects over WebSocket and registers with `PlayerConnect`.
//! Challenges move the target through `FreeToPlay -> Challenged`; an
//! accepted challenge creates a lobby owning one [`GridEngine`] sized by
//! the accepting player's settings. Moves are validated and scored by the
//! engine and routed to the opponent until every box is closed.
//!
//! Shared state lives in `DashMap`s. No lock is held across an `.await`,
//! and multi-step flows tolerate a disconnect at any point as an ordinary
//! `NotFound` or `StaleReference` failure.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::grid::{Edge, GridEngine, MoveError};
pub use game::player::{GridSize, GridType, Player, PlayerSettings, PlayerStatus};
pub use network::{GameServer, GameServerError, Hub, HubError, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
