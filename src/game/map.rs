//! Tile Map
//!
//! The walkable world: a rectangular grid of tiles parsed from digit rows.
//! Only trees, water and houses block movement.

use thiserror::Error;

use crate::core::grid::GridPos;

/// Built-in meadow, one digit per tile (see [`Tile`]).
const MEADOW_ROWS: [&str; 20] = [
    "7777777777777777777777777",
    "7000000000000000000000087",
    "7050000000044400000000007",
    "7000000000040000000110007",
    "7033000000040002220000007",
    "7033000000040002220000007",
    "7000000000040000000000007",
    "7004444444444444444444007",
    "7000000000040000000000007",
    "7010000000040000860000007",
    "7000000500040000000001007",
    "7000000000040000000000007",
    "7006000000040000000000007",
    "7000000000040000022200007",
    "7000011000040000022200007",
    "7000000000040000000000007",
    "7000050000040000000005007",
    "7000000000044444000000007",
    "7800000000000000000000087",
    "7777777777777777777777777",
];

/// Kind of a single map cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tile {
    /// Open grass.
    Grass = 0,
    /// Single tree.
    Tree = 1,
    /// Water.
    Water = 2,
    /// House or cabin.
    House = 3,
    /// Dirt path.
    Path = 4,
    /// Flowers on grass.
    Flowers = 5,
    /// Rocks.
    Rock = 6,
    /// Dense forest.
    Forest = 7,
    /// Bushes.
    Bush = 8,
}

impl Tile {
    /// Tile for a map digit.
    pub fn from_digit(digit: u8) -> Option<Tile> {
        match digit {
            0 => Some(Tile::Grass),
            1 => Some(Tile::Tree),
            2 => Some(Tile::Water),
            3 => Some(Tile::House),
            4 => Some(Tile::Path),
            5 => Some(Tile::Flowers),
            6 => Some(Tile::Rock),
            7 => Some(Tile::Forest),
            8 => Some(Tile::Bush),
            _ => None,
        }
    }

    /// Whether a player may stand on this tile.
    #[inline]
    pub fn is_walkable(self) -> bool {
        !matches!(self, Tile::Tree | Tile::Water | Tile::House)
    }
}

/// Map parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    /// Map has no rows or no columns.
    #[error("map is empty")]
    Empty,
    /// A row's length differs from the first row.
    #[error("row {row} has {found} tiles, expected {expected}")]
    RaggedRow {
        /// Row index.
        row: usize,
        /// Tiles in the first row.
        expected: usize,
        /// Tiles in this row.
        found: usize,
    },
    /// Unknown tile digit.
    #[error("unknown tile {symbol:?} at ({x}, {y})")]
    UnknownTile {
        /// Offending character.
        symbol: char,
        /// Column.
        x: usize,
        /// Row.
        y: usize,
    },
}

/// Rectangular tile grid.
#[derive(Clone, Debug)]
pub struct TileMap {
    width: usize,
    height: usize,
    tiles: Vec<Tile>,
}

impl TileMap {
    /// Parse rows of tile digits. All rows must be the same length.
    pub fn from_rows<S: AsRef<str>>(rows: &[S]) -> Result<Self, MapError> {
        let width = rows.first().map(|r| r.as_ref().chars().count()).unwrap_or(0);
        if width == 0 {
            return Err(MapError::Empty);
        }

        let mut tiles = Vec::with_capacity(width * rows.len());
        for (y, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            let found = row.chars().count();
            if found != width {
                return Err(MapError::RaggedRow { row: y, expected: width, found });
            }
            for (x, symbol) in row.chars().enumerate() {
                let tile = symbol
                    .to_digit(10)
                    .and_then(|d| Tile::from_digit(d as u8))
                    .ok_or(MapError::UnknownTile { symbol, x, y })?;
                tiles.push(tile);
            }
        }

        Ok(Self {
            width,
            height: rows.len(),
            tiles,
        })
    }

    /// The built-in meadow map.
    pub fn meadow() -> Self {
        // The rows are a compile-time constant known to parse.
        match Self::from_rows(&MEADOW_ROWS) {
            Ok(map) => map,
            Err(_) => Self {
                width: 1,
                height: 1,
                tiles: vec![Tile::Grass],
            },
        }
    }

    /// Columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Tile at `pos`, or `None` when out of bounds.
    pub fn tile(&self, pos: GridPos) -> Option<Tile> {
        let x = usize::try_from(pos.x).ok()?;
        let y = usize::try_from(pos.y).ok()?;
        if x >= self.width || y >= self.height {
            return None;
        }
        self.tiles.get(y * self.width + x).copied()
    }

    /// In bounds and not an obstacle.
    #[inline]
    pub fn is_walkable(&self, pos: GridPos) -> bool {
        self.tile(pos).is_some_and(Tile::is_walkable)
    }
}

impl Default for TileMap {
    fn default() -> Self {
        Self::meadow()
    }
}
