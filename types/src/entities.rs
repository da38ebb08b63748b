use crate::{coords::RegionCoord, coords::TileCoord, Address};
use serde::{Deserialize, Serialize};

pub type CreatureId = u64;

/// Structure built on top of a mined tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpgradeKind {
    GoldMine,
    SoulWell,
    Lair,
    Bastion,
}

/// A single tile of the world grid.
///
/// Tiles come into existence when first mined; all later mutations arrive as
/// ordered ledger events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub coord: TileCoord,
    pub owner: Option<Address>,
    pub upgrade: Option<UpgradeKind>,
    pub mined: bool,
    pub walled: bool,
    /// Chain time (unix seconds) of the last harvest, 0 if never harvested.
    pub last_harvest_at: u64,
}

impl Tile {
    pub fn mined(coord: TileCoord, owner: Address, at: u64) -> Self {
        Self {
            coord,
            owner: Some(owner),
            upgrade: None,
            mined: true,
            walled: false,
            last_harvest_at: at,
        }
    }
}

/// A region aggregates the tiles inside one `REGION_SIZE` square.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub coord: RegionCoord,
    /// The player whose mining first revealed the region.
    pub first_miner: Option<Address>,
    pub tiles: Vec<TileCoord>,
    pub gold: u64,
    pub souls: u64,
    pub creatures: Vec<CreatureId>,
    pub last_spawn_at: u64,
}

impl Region {
    pub fn discovered(coord: RegionCoord, first_miner: Address) -> Self {
        Self {
            coord,
            first_miner: Some(first_miner),
            tiles: Vec::new(),
            gold: 0,
            souls: 0,
            creatures: Vec::new(),
            last_spawn_at: 0,
        }
    }
}

/// Per-account game state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub address: Address,
    pub gold: u64,
    pub souls: u64,
    /// Vault ceiling; headroom (`gold_capacity - gold`) bounds harvest actions.
    pub gold_capacity: u64,
    pub joined_at: u64,
    pub last_action_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreatureSpecies {
    Skeleton,
    Golem,
    Wraith,
    Drake,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreatureKind {
    Normal,
    Blue,
    Red,
    Black,
    Unique,
}

/// A creature living on the map. Destroyed (removed from all maps) on death.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creature {
    pub id: CreatureId,
    pub species: CreatureSpecies,
    pub kind: CreatureKind,
    pub level: u8,
    pub life: u32,
    pub owner: Address,
    pub location: TileCoord,
}

/// Kind of a ledger-side delayed action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DelayedKind {
    Mine,
    RaiseWall,
    RazeWall,
}

/// Identity of a delayed action: the same initiator re-scheduling the same
/// kind at the same coordinate overwrites the previous entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DelayedKey {
    pub initiator: Address,
    pub kind: DelayedKind,
    pub coord: TileCoord,
}

/// A scheduled on-chain action that resolves at a future chain time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedAction {
    pub initiator: Address,
    pub kind: DelayedKind,
    pub coord: TileCoord,
    pub ready_at: u64,
}

impl DelayedAction {
    pub fn key(&self) -> DelayedKey {
        DelayedKey {
            initiator: self.initiator,
            kind: self.kind,
            coord: self.coord,
        }
    }
}

/// Who controls a region. Derived from influence primitives, never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionController {
    Held(Address),
    Disputed,
    Unclaimed,
}
