//! Game Logic Module
//!
//! Board rules and player records. Nothing here knows about connections.
//!
//! ## Module Structure
//!
//! - `grid`: Edge validation and box scoring for one board
//! - `player`: Player record, status and settings

pub mod grid;
pub mod player;

// Re-export key types
pub use grid::{Edge, GridEngine, MoveError, DEFAULT_BOARD_PX};
pub use player::{GridSize, GridType, Player, PlayerSettings, PlayerStatus};
