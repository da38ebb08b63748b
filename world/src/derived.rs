use ember_types::{Address, RegionController, Tile, UpgradeKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tunables for time-based harvest accrual.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct YieldParams {
    #[serde(default = "default_gold_per_hour")]
    pub gold_per_hour: u64,
    /// Accrual ceiling per tile; unharvested yield stops growing here.
    #[serde(default = "default_yield_cap")]
    pub cap: u64,
}

fn default_gold_per_hour() -> u64 {
    60
}

fn default_yield_cap() -> u64 {
    600
}

impl Default for YieldParams {
    fn default() -> Self {
        Self {
            gold_per_hour: default_gold_per_hour(),
            cap: default_yield_cap(),
        }
    }
}

/// Judge who controls a region from its influence primitives.
///
/// The leader must hold at least `min_influence` and a strict majority of
/// the total; otherwise the region is disputed. Computed on demand, never
/// cached as independent truth.
pub fn region_controller(
    influence: &BTreeMap<Address, u64>,
    min_influence: u64,
) -> RegionController {
    let total: u64 = influence.values().copied().fold(0, u64::saturating_add);
    if total == 0 {
        return RegionController::Unclaimed;
    }
    let (leader, amount) = influence
        .iter()
        .max_by_key(|(_, amount)| **amount)
        .map(|(address, amount)| (*address, *amount))
        .unwrap_or((Address::default(), 0));
    if amount < min_influence {
        return RegionController::Unclaimed;
    }
    if amount.saturating_mul(2) > total {
        RegionController::Held(leader)
    } else {
        RegionController::Disputed
    }
}

/// Gold claimable from a tile at the supplied chain time.
///
/// Accrues from `last_harvest_at`; a gold mine doubles the rate. The caller
/// supplies chain time, so the result is a pure function of primitives.
pub fn harvest_yield(tile: &Tile, params: &YieldParams, chain_now: u64) -> u64 {
    if !tile.mined || tile.owner.is_none() {
        return 0;
    }
    let elapsed = chain_now.saturating_sub(tile.last_harvest_at);
    let rate = match tile.upgrade {
        Some(UpgradeKind::GoldMine) => params.gold_per_hour.saturating_mul(2),
        _ => params.gold_per_hour,
    };
    let accrued = elapsed.saturating_mul(rate) / 3_600;
    accrued.min(params.cap)
}
