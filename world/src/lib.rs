pub mod apply;
pub mod bootstrap;
pub mod derived;

pub use apply::ApplyError;
pub use bootstrap::{bootstrap, BootstrapConfig, BootstrapError, SnapshotSource};
pub use derived::{harvest_yield, region_controller, YieldParams};

use ember_types::{
    Address, Creature, CreatureId, DelayedAction, DelayedKey, Notification, Player, Region,
    RegionCoord, Tile, TileCoord,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const NOTIFICATION_CAPACITY: usize = 1024;

/// Tunables for derived aggregates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Minimum influence the leader must hold before a region counts as
    /// controlled rather than unclaimed.
    #[serde(default = "default_controller_min_influence")]
    pub controller_min_influence: u64,
}

fn default_controller_min_influence() -> u64 {
    1
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            controller_min_influence: default_controller_min_influence(),
        }
    }
}

/// The reconstructed entity graph.
///
/// Entities are created by bootstrap or by their first relevant event and
/// mutated only by ordered-event reducers (see [`apply`]).
#[derive(Clone, Debug, Default)]
pub struct World {
    pub config: WorldConfig,
    pub tiles: HashMap<TileCoord, Tile>,
    pub regions: HashMap<RegionCoord, Region>,
    pub players: HashMap<Address, Player>,
    pub creatures: HashMap<CreatureId, Creature>,
    pub delayed: HashMap<DelayedKey, DelayedAction>,
    pub influence: HashMap<RegionCoord, BTreeMap<Address, u64>>,
    revisions: HashMap<Address, u64>,
}

impl World {
    pub fn new(config: WorldConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Monotonic counter bumped whenever `address`'s player entity changes.
    /// Resource gates key their re-checks off this.
    pub fn player_revision(&self, address: &Address) -> u64 {
        self.revisions.get(address).copied().unwrap_or(0)
    }

    pub(crate) fn bump_player(&mut self, address: &Address) {
        *self.revisions.entry(*address).or_insert(0) += 1;
    }
}

/// Shared handle to the world.
///
/// Reducer application happens synchronously under the lock, so events are
/// atomic with respect to every reader; notifications fan out on a broadcast
/// channel after the lock is released.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<World>>,
    notifications: broadcast::Sender<Notification>,
}

impl Store {
    pub fn new(config: WorldConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(World::new(config))),
            notifications,
        }
    }

    /// Replace the world wholesale. Used once, after bootstrap.
    pub fn install(&self, world: World) {
        let mut guard = self.lock();
        *guard = world;
    }

    /// Apply one decoded event and publish the resulting notifications.
    pub fn apply(&self, event: &ember_types::DecodedEvent) -> Result<(), ApplyError> {
        let notifications = {
            let mut guard = self.lock();
            guard.apply(event)?
        };
        for notification in notifications {
            let _ = self.notifications.send(notification);
        }
        Ok(())
    }

    /// Read a consistent snapshot of the world.
    pub fn read<R>(&self, f: impl FnOnce(&World) -> R) -> R {
        f(&self.lock())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Publish a notification that did not originate from a reducer
    /// (bootstrap progress).
    pub fn publish(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    pub fn player_revision(&self, address: &Address) -> u64 {
        self.read(|world| world.player_revision(address))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, World> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
