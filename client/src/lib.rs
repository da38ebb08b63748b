pub mod actions;
pub mod cache;
pub mod scheduler;
pub mod semaphore;

pub use actions::{Intent, IntentSigner};
pub use cache::{scoped_key, Cache, CacheError, MemoryCache, Versioned};
pub use scheduler::{
    Action, ActionId, ActionKind, ActionState, ResourceKind, Scheduler, SchedulerConfig,
};
pub use semaphore::{GateScope, Reservation, ResourceGate, Slots};

use actions::ActionDeps;
use ember_sync::{
    ChainClock, EngineError, Executor, ExecutorConfig, Heads, Ledger, Subscription, SyncConfig,
    SyncEngine, SyncStatus,
};
use ember_types::{
    Address, CreatureId, CreatureSpecies, Notification, TileCoord, UpgradeKind,
};
use ember_world::{
    bootstrap, BootstrapConfig, SnapshotSource, Store, WorldConfig, YieldParams,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

/// Error type for client construction and startup.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("sync engine: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub world: WorldConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub yields: YieldParams,
    #[serde(default = "default_chain_time_resolution_ms")]
    pub chain_time_resolution_ms: u64,
    #[serde(default = "default_chain_time_probe_timeout_ms")]
    pub chain_time_probe_timeout_ms: u64,
    #[serde(default = "default_store_version")]
    pub store_version: u32,
}

fn default_chain_time_resolution_ms() -> u64 {
    3_000
}

fn default_chain_time_probe_timeout_ms() -> u64 {
    2_000
}

fn default_store_version() -> u32 {
    1
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            world: WorldConfig::default(),
            bootstrap: BootstrapConfig::default(),
            sync: SyncConfig::default(),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            yields: YieldParams::default(),
            chain_time_resolution_ms: default_chain_time_resolution_ms(),
            chain_time_probe_timeout_ms: default_chain_time_probe_timeout_ms(),
            store_version: default_store_version(),
        }
    }
}

/// The assembled client core: world store, sync engine, transaction
/// executor, action scheduler, chain clock, and persisted cache, wired with
/// explicit dependency injection.
pub struct GameClient<L: Ledger, C: Cache> {
    player: Address,
    config: ClientConfig,
    store: Store,
    engine: SyncEngine<L>,
    executor: Executor<L>,
    scheduler: Scheduler,
    clock: Arc<ChainClock>,
    cache: Arc<Versioned<C>>,
    signer: Arc<dyn IntentSigner>,
    next_action_id: AtomicU64,
    scheduler_listener: tokio::task::JoinHandle<()>,
}

impl<L: Ledger, C: Cache> Drop for GameClient<L, C> {
    fn drop(&mut self) {
        self.scheduler_listener.abort();
    }
}

impl<L: Ledger, C: Cache> GameClient<L, C> {
    /// Wire the core together. `ledger` is the batch channel; the push
    /// channel is supplied to [`run`].
    ///
    /// [`run`]: GameClient::run
    pub async fn new(
        ledger: L,
        player: Address,
        signer: Arc<dyn IntentSigner>,
        cache: C,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let cache = Arc::new(Versioned::open(cache, config.store_version).await?);
        let store = Store::new(config.world.clone());
        let start_height = ledger
            .chain_height()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        let engine = SyncEngine::new(
            ledger.clone(),
            store.clone(),
            config.sync.clone(),
            start_height,
        );
        let clock = Arc::new(ChainClock::spawn(
            ledger.clone(),
            Duration::from_millis(config.chain_time_resolution_ms),
            Duration::from_millis(config.chain_time_probe_timeout_ms),
        ));
        let executor = Executor::new(
            ledger,
            player,
            config.executor.clone(),
            Some(Arc::new(engine.clone())),
            None,
        );
        let scheduler = Scheduler::new(store.clone(), config.scheduler.clone());
        scheduler.register_gate(
            ResourceKind::Gold,
            ResourceGate::new(
                "gold",
                GateScope::Player(player),
                Box::new(move |world| {
                    world.players.get(&player).map(|p| p.gold).unwrap_or(0)
                }),
            ),
        );
        scheduler.register_gate(
            ResourceKind::Souls,
            ResourceGate::new(
                "souls",
                GateScope::Player(player),
                Box::new(move |world| {
                    world.players.get(&player).map(|p| p.souls).unwrap_or(0)
                }),
            ),
        );
        let scheduler_listener = scheduler.start();
        info!(%player, start_height, "client core wired");
        Ok(Self {
            player,
            config,
            store,
            engine,
            executor,
            scheduler,
            clock,
            cache,
            signer,
            next_action_id: AtomicU64::new(1),
            scheduler_listener,
        })
    }

    /// Load the world: register subscriptions first (no retroactive scan),
    /// bulk-read the snapshot, then switch the engine to live processing,
    /// draining anything buffered meanwhile.
    pub async fn bootstrap<S: SnapshotSource>(
        &self,
        snapshot: &S,
        subscriptions: Vec<Subscription>,
    ) -> Result<(), ClientError> {
        for subscription in subscriptions {
            self.engine.subscribe(subscription);
        }
        let store = self.store.clone();
        let world = bootstrap(
            snapshot,
            &self.config.bootstrap,
            self.config.world.clone(),
            |notification| store.publish(notification),
        )
        .await
        .map_err(|err| ClientError::Bootstrap(err.to_string()))?;
        self.store.install(world);
        self.engine.begin_live_processing().await?;
        info!("bootstrap complete; live processing enabled");
        Ok(())
    }

    /// Drive the engine from a push head source until terminal.
    pub fn run<H: Heads>(&self, heads: H) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            engine.run(heads).await;
        })
    }

    pub fn world(&self) -> &Store {
        &self.store
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.store.subscribe()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn cache(&self) -> &Versioned<C> {
        &self.cache
    }

    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn chain_time(&self) -> u64 {
        self.clock.now()
    }

    pub fn player(&self) -> Address {
        self.player
    }

    pub fn mine_tile(&self, coord: TileCoord) -> ActionId {
        self.enqueue(Intent::MineTile { coord })
    }

    pub fn harvest_tile(&self, coord: TileCoord) -> ActionId {
        self.enqueue(Intent::HarvestTile { coord })
    }

    pub fn upgrade_tile(&self, coord: TileCoord, upgrade: UpgradeKind) -> ActionId {
        self.enqueue(Intent::UpgradeTile { coord, upgrade })
    }

    pub fn raise_wall(&self, coord: TileCoord) -> ActionId {
        self.enqueue(Intent::RaiseWall { coord })
    }

    pub fn raze_wall(&self, coord: TileCoord) -> ActionId {
        self.enqueue(Intent::RazeWall { coord })
    }

    pub fn spawn_creature(&self, location: TileCoord, species: CreatureSpecies) -> ActionId {
        self.enqueue(Intent::SpawnCreature { location, species })
    }

    pub fn move_creature(&self, id: CreatureId, to: TileCoord) -> ActionId {
        self.enqueue(Intent::MoveCreature { id, to })
    }

    fn enqueue(&self, intent: Intent) -> ActionId {
        let id = self.next_action_id.fetch_add(1, Ordering::Relaxed);
        let deps = ActionDeps {
            executor: self.executor.clone(),
            signer: self.signer.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            yields: self.config.yields.clone(),
            player: self.player,
        };
        let action = actions::build_action(id, intent, &deps);
        self.scheduler.add(action);
        id
    }
}
