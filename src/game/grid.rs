//! Grid Engine
//!
//! Move validation and box scoring for one Dots and Boxes board.
//!
//! Clients address edges in board pixels. The engine converts pixels to
//! grid indices by integer division by the cell size, records the edge
//! and reports how many boxes the move closed.
//!
//! ```text
//!   (0,0)──h[0][0]──(1,0)──h[0][1]──(2,0)
//!     │               │               │
//!   v[0][0]  box    v[0][1]  box    v[0][2]
//!     │     (0,0)     │     (0,1)     │
//!   (0,1)──h[1][0]──(1,1)──h[1][1]──(2,1)
//! ```
//!
//! Horizontal edges live in `h[row][col]` with `row ∈ 0..=n`, `col ∈ 0..n`.
//! Vertical edges live in `v[row][col]` with `row ∈ 0..n`, `col ∈ 0..=n`.

use serde::{Deserialize, Serialize};

use crate::game::player::GridSize;

/// Default board width and height in pixels.
pub const DEFAULT_BOARD_PX: u32 = 400;

/// A single unit segment of the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Edge {
    /// Left-to-right segment on grid line `row`, starting at column `col`.
    Horizontal {
        /// Grid line (0..=n).
        row: usize,
        /// Leftmost point column (0..n).
        col: usize,
    },
    /// Top-to-bottom segment on grid column `col`, starting at row `row`.
    Vertical {
        /// Topmost point row (0..n).
        row: usize,
        /// Grid column (0..=n).
        col: usize,
    },
}

/// Reasons a move is refused. A refused move never changes the board.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoveError {
    /// A coordinate falls outside the board.
    #[error("Point ({x}, {y}) is outside the board [0, {limit}]")]
    OutOfRange {
        /// Offending x.
        x: i32,
        /// Offending y.
        y: i32,
        /// Board extent in pixels.
        limit: i32,
    },

    /// The segment is diagonal, empty, or longer than one cell.
    #[error("Segment ({x1}, {y1}) -> ({x2}, {y2}) is not a single grid edge")]
    NotAnEdge {
        /// Start x.
        x1: i32,
        /// Start y.
        y1: i32,
        /// End x.
        x2: i32,
        /// End y.
        y2: i32,
    },

    /// The edge has been played already.
    #[error("Edge {0:?} was already played")]
    AlreadyDrawn(Edge),

    /// Every box is already closed.
    #[error("Game already ended")]
    GameOver,
}

/// Move validator and box-completion scorer for one game.
#[derive(Clone, Debug)]
pub struct GridEngine {
    size: GridSize,
    n: usize,
    cell: i32,
    /// `[n + 1][n]`
    horizontal: Vec<Vec<bool>>,
    /// `[n][n + 1]`
    vertical: Vec<Vec<bool>>,
    completed_boxes: u32,
}

impl GridEngine {
    /// Create an engine for a board `board_px` pixels wide.
    pub fn new(size: GridSize, board_px: u32) -> Self {
        let n = size.boxes_per_side() as u32;
        Self::with_cell_size(size, (board_px / n).max(1))
    }

    /// Create an engine with an explicit cell size in pixels.
    pub fn with_cell_size(size: GridSize, cell_px: u32) -> Self {
        let n = size.boxes_per_side();
        Self {
            size,
            n,
            cell: cell_px.clamp(1, i32::MAX as u32) as i32,
            horizontal: vec![vec![false; n]; n + 1],
            vertical: vec![vec![false; n + 1]; n],
            completed_boxes: 0,
        }
    }

    /// Board size.
    #[inline]
    pub fn size(&self) -> GridSize {
        self.size
    }

    /// Boxes per side.
    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    /// Distance between adjacent points in pixels.
    #[inline]
    pub fn cell_size(&self) -> i32 {
        self.cell
    }

    /// Boxes closed so far.
    #[inline]
    pub fn completed_boxes(&self) -> u32 {
        self.completed_boxes
    }

    /// True once every box is closed.
    #[inline]
    pub fn is_game_ended(&self) -> bool {
        self.completed_boxes == self.size.total_boxes()
    }

    /// Whether an edge has been drawn. Edges off the board never are.
    pub fn is_drawn(&self, edge: Edge) -> bool {
        let (matrix, row, col) = match edge {
            Edge::Horizontal { row, col } => (&self.horizontal, row, col),
            Edge::Vertical { row, col } => (&self.vertical, row, col),
        };
        matrix.get(row).and_then(|line| line.get(col)).copied().unwrap_or(false)
    }

    /// Play the segment `(x1, y1) -> (x2, y2)` and return the boxes it closed.
    pub fn make_move(&mut self, x1: i32, y1: i32, x2: i32, y2: i32) -> Result<u32, MoveError> {
        if self.is_game_ended() {
            return Err(MoveError::GameOver);
        }

        let edge = self.edge_at(x1, y1, x2, y2)?;
        self.draw(edge)
    }

    /// Play an edge given in grid indices.
    pub fn draw(&mut self, edge: Edge) -> Result<u32, MoveError> {
        if self.is_game_ended() {
            return Err(MoveError::GameOver);
        }
        self.check_on_board(edge)?;
        if self.is_drawn(edge) {
            return Err(MoveError::AlreadyDrawn(edge));
        }

        let n = self.n;
        let mut closed = 0;

        match edge {
            Edge::Horizontal { row, col } => {
                self.horizontal[row][col] = true;
                // Box above, then box below
                if row > 0 && self.is_box_complete(row - 1, col) {
                    closed += 1;
                }
                if row < n && self.is_box_complete(row, col) {
                    closed += 1;
                }
            }
            Edge::Vertical { row, col } => {
                self.vertical[row][col] = true;
                // Box left, then box right
                if col > 0 && self.is_box_complete(row, col - 1) {
                    closed += 1;
                }
                if col < n && self.is_box_complete(row, col) {
                    closed += 1;
                }
            }
        }

        self.completed_boxes += closed;
        Ok(closed)
    }

    /// Resolve a pixel segment to the edge it names.
    pub fn edge_at(&self, x1: i32, y1: i32, x2: i32, y2: i32) -> Result<Edge, MoveError> {
        let limit = self.n as i32 * self.cell;
        for (x, y) in [(x1, y1), (x2, y2)] {
            if !(0..=limit).contains(&x) || !(0..=limit).contains(&y) {
                return Err(MoveError::OutOfRange { x, y, limit });
            }
        }

        let not_an_edge = MoveError::NotAnEdge { x1, y1, x2, y2 };
        let cell = self.cell;

        if y1 == y2 {
            let row = (y1 / cell) as usize;
            let (c1, c2) = (x1 / cell, x2 / cell);
            if (c1 - c2).abs() != 1 {
                return Err(not_an_edge);
            }
            let col = c1.min(c2) as usize;
            if row > self.n || col >= self.n {
                return Err(not_an_edge);
            }
            Ok(Edge::Horizontal { row, col })
        } else if x1 == x2 {
            let col = (x1 / cell) as usize;
            let (r1, r2) = (y1 / cell, y2 / cell);
            if (r1 - r2).abs() != 1 {
                return Err(not_an_edge);
            }
            let row = r1.min(r2) as usize;
            if row >= self.n || col > self.n {
                return Err(not_an_edge);
            }
            Ok(Edge::Vertical { row, col })
        } else {
            Err(not_an_edge)
        }
    }

    /// Pixel endpoints of an edge, start point first.
    pub fn edge_pixels(&self, edge: Edge) -> (i32, i32, i32, i32) {
        let cell = self.cell;
        match edge {
            Edge::Horizontal { row, col } => {
                let (x, y) = (col as i32 * cell, row as i32 * cell);
                (x, y, x + cell, y)
            }
            Edge::Vertical { row, col } => {
                let (x, y) = (col as i32 * cell, row as i32 * cell);
                (x, y, x, y + cell)
            }
        }
    }

    /// Every edge on the board, horizontal first.
    pub fn all_edges(&self) -> Vec<Edge> {
        let n = self.n;
        let horizontal = (0..=n).flat_map(|row| (0..n).map(move |col| Edge::Horizontal { row, col }));
        let vertical = (0..n).flat_map(|row| (0..=n).map(move |col| Edge::Vertical { row, col }));
        horizontal.chain(vertical).collect()
    }

    /// Edges not yet played.
    pub fn undrawn_edges(&self) -> Vec<Edge> {
        self.all_edges().into_iter().filter(|e| !self.is_drawn(*e)).collect()
    }

    /// Reject grid indices past the last line, reporting the far endpoint.
    fn check_on_board(&self, edge: Edge) -> Result<(), MoveError> {
        let n = self.n;
        let (on_board, row_end, col_end) = match edge {
            Edge::Horizontal { row, col } => (row <= n && col < n, row, col.saturating_add(1)),
            Edge::Vertical { row, col } => (row < n && col <= n, row.saturating_add(1), col),
        };
        if on_board {
            return Ok(());
        }

        let px = |i: usize| i32::try_from(i).unwrap_or(i32::MAX).saturating_mul(self.cell);
        Err(MoveError::OutOfRange {
            x: px(col_end),
            y: px(row_end),
            limit: n as i32 * self.cell,
        })
    }

    fn is_box_complete(&self, row: usize, col: usize) -> bool {
        self.horizontal[row][col]
            && self.horizontal[row + 1][col]
            && self.vertical[row][col]
            && self.vertical[row][col + 1]
    }
}
