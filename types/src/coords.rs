use serde::{Deserialize, Serialize};
use std::fmt;

/// Side length of a region in tiles.
pub const REGION_SIZE: i32 = 16;

/// Coordinate of a single tile on the world grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: i32,
    pub y: i32,
}

impl TileCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The region this tile belongs to.
    pub const fn region(&self) -> RegionCoord {
        RegionCoord {
            x: self.x.div_euclid(REGION_SIZE),
            y: self.y.div_euclid(REGION_SIZE),
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// Coordinate of a region (a `REGION_SIZE` x `REGION_SIZE` block of tiles).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionCoord {
    pub x: i32,
    pub y: i32,
}

impl RegionCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for RegionCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.x, self.y)
    }
}
