//! Grid Coordinates and Facing
//!
//! Integer tile coordinates. `y` grows downward, matching the map rows.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// FACING
// =============================================================================

/// One of the four directions a player can face or move in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    /// Toward row 0.
    Up,
    /// Toward the last row.
    #[default]
    Down,
    /// Toward column 0.
    Left,
    /// Toward the last column.
    Right,
}

impl Facing {
    /// All four directions.
    pub const ALL: [Facing; 4] = [Facing::Up, Facing::Down, Facing::Left, Facing::Right];

    /// Parse the wire name (`"up"`, `"down"`, `"left"`, `"right"`).
    pub fn parse(s: &str) -> Option<Facing> {
        match s {
            "up" => Some(Facing::Up),
            "down" => Some(Facing::Down),
            "left" => Some(Facing::Left),
            "right" => Some(Facing::Right),
            _ => None,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Facing::Up => "up",
            Facing::Down => "down",
            Facing::Left => "left",
            Facing::Right => "right",
        }
    }

    /// Unit displacement for one step.
    #[inline]
    pub fn delta(self) -> (i32, i32) {
        match self {
            Facing::Up => (0, -1),
            Facing::Down => (0, 1),
            Facing::Left => (-1, 0),
            Facing::Right => (1, 0),
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// GRID POSITION
// =============================================================================

/// Tile coordinate on the map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GridPos {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl GridPos {
    /// Create a position.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The neighbouring cell in `facing`.
    #[inline]
    pub fn step(self, facing: Facing) -> Self {
        let (dx, dy) = facing.delta();
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
        }
    }

    /// Manhattan distance in cells.
    #[inline]
    pub fn manhattan(self, other: GridPos) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }

    /// Direction of travel from `self` to `to`, by the sign of dx/dy.
    ///
    /// When both axes changed (sparse updates skipped cells) the axis with the
    /// larger displacement wins; ties go to the horizontal axis.
    pub fn travel_direction(self, to: GridPos) -> Option<Facing> {
        let dx = i64::from(to.x) - i64::from(self.x);
        let dy = i64::from(to.y) - i64::from(self.y);
        if dx == 0 && dy == 0 {
            return None;
        }
        if dx.abs() >= dy.abs() {
            Some(if dx > 0 { Facing::Right } else { Facing::Left })
        } else {
            Some(if dy > 0 { Facing::Down } else { Facing::Up })
        }
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

// =============================================================================
// TESTS
// =============================================================================
