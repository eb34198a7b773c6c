//! Player Records
//!
//! The lobby-facing view of a connected player: display name,
//! availability status and preferred game settings.

use serde::{Deserialize, Serialize};

// =============================================================================
// GRID SIZE
// =============================================================================

/// Playable board sizes (boxes per side).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub enum GridSize {
    /// 3x3 boxes.
    #[default]
    #[serde(rename = "3x3")]
    ThreeByThree,
    /// 5x5 boxes.
    #[serde(rename = "5x5")]
    FiveByFive,
    /// 6x6 boxes.
    #[serde(rename = "6x6")]
    SixBySix,
    /// 7x7 boxes.
    #[serde(rename = "7x7")]
    SevenBySeven,
}

impl GridSize {
    /// Every size, smallest first.
    pub const ALL: [GridSize; 4] = [
        GridSize::ThreeByThree,
        GridSize::FiveByFive,
        GridSize::SixBySix,
        GridSize::SevenBySeven,
    ];

    /// Number of boxes along one side.
    #[inline]
    pub const fn boxes_per_side(self) -> usize {
        match self {
            GridSize::ThreeByThree => 3,
            GridSize::FiveByFive => 5,
            GridSize::SixBySix => 6,
            GridSize::SevenBySeven => 7,
        }
    }

    /// Total boxes on the board.
    #[inline]
    pub const fn total_boxes(self) -> u32 {
        let n = self.boxes_per_side() as u32;
        n * n
    }

    /// Look up a size by its side length.
    pub fn from_boxes_per_side(n: usize) -> Option<GridSize> {
        GridSize::ALL.into_iter().find(|size| size.boxes_per_side() == n)
    }
}

impl std::fmt::Display for GridSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.boxes_per_side();
        write!(f, "{n}x{n}")
    }
}

/// Board style a player prefers. Carried through untouched by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub enum GridType {
    /// Plain square grid.
    #[default]
    Default,
}

// =============================================================================
// STATUS & SETTINGS
// =============================================================================

/// Lobby availability of a player.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub enum PlayerStatus {
    /// Accepting challenges.
    #[default]
    FreeToPlay,
    /// Opted out of challenges.
    DoNotDisturb,
    /// Has an outstanding challenge addressed to them.
    Challenged,
    /// In a game.
    Playing,
}

impl PlayerStatus {
    /// Status while in the lobby, derived from the do-not-disturb flag.
    #[inline]
    pub fn idle(do_not_disturb: bool) -> Self {
        if do_not_disturb {
            PlayerStatus::DoNotDisturb
        } else {
            PlayerStatus::FreeToPlay
        }
    }

    /// Whether the player is tied up in a challenge or a game.
    #[inline]
    pub fn is_engaged(self) -> bool {
        matches!(self, PlayerStatus::Challenged | PlayerStatus::Playing)
    }
}

/// Per-player preferences.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSettings {
    /// Refuse incoming challenges.
    #[serde(default)]
    pub do_not_disturb: bool,
    /// Preferred board style.
    #[serde(default)]
    pub grid_type: GridType,
    /// Board size used when this player accepts a challenge.
    #[serde(default)]
    pub grid_size: GridSize,
}

// =============================================================================
// PLAYER
// =============================================================================

/// A connected player as seen by the lobby.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Display name (unique among connected players).
    pub name: String,
    /// Current availability.
    #[serde(default)]
    pub status: PlayerStatus,
    /// Preferences.
    #[serde(default)]
    pub settings: PlayerSettings,
}

impl Player {
    /// Create a player with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: PlayerStatus::FreeToPlay,
            settings: PlayerSettings::default(),
        }
    }

    /// Builder-style settings override. Status follows the do-not-disturb flag.
    pub fn with_settings(mut self, settings: PlayerSettings) -> Self {
        self.settings = settings;
        self.status = PlayerStatus::idle(settings.do_not_disturb);
        self
    }
}
