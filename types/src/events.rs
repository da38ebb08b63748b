use crate::{
    coords::{RegionCoord, TileCoord},
    entities::{CreatureId, CreatureKind, CreatureSpecies, DelayedKind, UpgradeKind},
    Address, TxHash,
};
use serde::{Deserialize, Serialize};

/// A 32-byte log topic.
pub type Topic = [u8; 32];

/// An undecoded event log fetched from the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: TxHash,
    pub address: Address,
    pub topics: Vec<Topic>,
    pub data: Vec<u8>,
}

impl RawLog {
    /// Ordering key for event application.
    pub fn ordering_key(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// A decoded event with its chain position preserved.
///
/// Events are applied to the world in strict `(block_number, log_index)`
/// ascending order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: TxHash,
    pub emitter: Address,
    pub body: EventBody,
}

impl DecodedEvent {
    pub fn ordering_key(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Every event kind the game contracts emit.
///
/// Reducers match on this exhaustively, so adding a variant is a compile
/// error until every consumer handles it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventBody {
    TileMined {
        coord: TileCoord,
        miner: Address,
        at: u64,
    },
    TileUpgraded {
        coord: TileCoord,
        upgrade: UpgradeKind,
    },
    WallRaised {
        coord: TileCoord,
    },
    WallRazed {
        coord: TileCoord,
    },
    TileHarvested {
        coord: TileCoord,
        player: Address,
        gold: u64,
        at: u64,
    },
    RegionEndowed {
        region: RegionCoord,
        gold: u64,
        souls: u64,
    },
    PlayerJoined {
        address: Address,
        gold_capacity: u64,
        at: u64,
    },
    /// Absolute vault balances after a ledger-side settlement.
    PlayerVaultChanged {
        address: Address,
        gold: u64,
        souls: u64,
    },
    CreatureSpawned {
        id: CreatureId,
        species: CreatureSpecies,
        kind: CreatureKind,
        level: u8,
        life: u32,
        owner: Address,
        location: TileCoord,
        at: u64,
    },
    CreatureMoved {
        id: CreatureId,
        to: TileCoord,
    },
    CreatureDied {
        id: CreatureId,
    },
    ActionScheduled {
        initiator: Address,
        kind: DelayedKind,
        coord: TileCoord,
        ready_at: u64,
    },
    ActionResolved {
        initiator: Address,
        kind: DelayedKind,
        coord: TileCoord,
    },
    ActionVoided {
        initiator: Address,
        kind: DelayedKind,
        coord: TileCoord,
    },
    /// Absolute influence of `player` over `region` after the change.
    InfluenceChanged {
        region: RegionCoord,
        player: Address,
        amount: u64,
    },
}

impl EventBody {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            EventBody::TileMined { .. } => "tile_mined",
            EventBody::TileUpgraded { .. } => "tile_upgraded",
            EventBody::WallRaised { .. } => "wall_raised",
            EventBody::WallRazed { .. } => "wall_razed",
            EventBody::TileHarvested { .. } => "tile_harvested",
            EventBody::RegionEndowed { .. } => "region_endowed",
            EventBody::PlayerJoined { .. } => "player_joined",
            EventBody::PlayerVaultChanged { .. } => "player_vault_changed",
            EventBody::CreatureSpawned { .. } => "creature_spawned",
            EventBody::CreatureMoved { .. } => "creature_moved",
            EventBody::CreatureDied { .. } => "creature_died",
            EventBody::ActionScheduled { .. } => "action_scheduled",
            EventBody::ActionResolved { .. } => "action_resolved",
            EventBody::ActionVoided { .. } => "action_voided",
            EventBody::InfluenceChanged { .. } => "influence_changed",
        }
    }
}
