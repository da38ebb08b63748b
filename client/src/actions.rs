use crate::scheduler::{Action, ActionId, ActionKind, Requirement, ResourceKind};
use ember_sync::{
    ChainClock, Executor, GeneratorError, Ledger, TxOverrides, TxRequest,
};
use ember_types::{Address, CreatureId, CreatureSpecies, TileCoord, UpgradeKind};
use ember_world::{derived, Store, YieldParams};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Spawns beyond this are rejected ledger-side; don't spend a transaction
/// finding that out.
const MAX_CREATURES_PER_REGION: usize = 8;

/// A user intention, before it becomes a scheduled action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Intent {
    MineTile { coord: TileCoord },
    HarvestTile { coord: TileCoord },
    UpgradeTile { coord: TileCoord, upgrade: UpgradeKind },
    RaiseWall { coord: TileCoord },
    RazeWall { coord: TileCoord },
    SpawnCreature { location: TileCoord, species: CreatureSpecies },
    MoveCreature { id: CreatureId, to: TileCoord },
}

impl Intent {
    pub fn kind(&self) -> ActionKind {
        match self {
            Intent::MineTile { .. } => ActionKind::MineTile,
            Intent::HarvestTile { .. } => ActionKind::HarvestTile,
            Intent::UpgradeTile { .. } => ActionKind::UpgradeTile,
            Intent::RaiseWall { .. } => ActionKind::RaiseWall,
            Intent::RazeWall { .. } => ActionKind::RazeWall,
            Intent::SpawnCreature { .. } => ActionKind::SpawnCreature,
            Intent::MoveCreature { .. } => ActionKind::MoveCreature,
        }
    }

    /// Static resource budget each intent draws against.
    fn cost(&self) -> BTreeMap<ResourceKind, u64> {
        let pairs: &[(ResourceKind, u64)] = match self {
            Intent::MineTile { .. } => &[(ResourceKind::Gold, 10)],
            Intent::HarvestTile { .. } => &[],
            Intent::UpgradeTile { .. } => &[(ResourceKind::Gold, 50)],
            Intent::RaiseWall { .. } => &[(ResourceKind::Gold, 20)],
            Intent::RazeWall { .. } => &[(ResourceKind::Gold, 5)],
            Intent::SpawnCreature { .. } => {
                &[(ResourceKind::Gold, 20), (ResourceKind::Souls, 5)]
            }
            Intent::MoveCreature { .. } => &[],
        };
        pairs.iter().copied().collect()
    }
}

/// Signs and encodes an intent into a raw transaction.
///
/// Key management is out of scope for this crate; implementations live next
/// to the wallet. A nonce-too-low style rejection must map to
/// [`GeneratorError::NonceConflict`] so the executor can refresh.
pub trait IntentSigner: Send + Sync + 'static {
    fn sign(
        &self,
        intent: &Intent,
        nonce: u64,
        overrides: &TxOverrides,
    ) -> BoxFuture<'static, Result<Vec<u8>, GeneratorError>>;
}

pub(crate) struct ActionDeps<L: Ledger> {
    pub executor: Executor<L>,
    pub signer: Arc<dyn IntentSigner>,
    pub store: Store,
    pub clock: Arc<ChainClock>,
    pub yields: YieldParams,
    pub player: Address,
}

/// Build a schedulable action from an intent: cost from the static table,
/// a skip check where chain state can already satisfy the intent, and a
/// body that submits through the executor and waits for confirmation.
pub(crate) fn build_action<L: Ledger>(
    id: ActionId,
    intent: Intent,
    deps: &ActionDeps<L>,
) -> Action {
    let skip = skip_check(&intent, deps);
    let requirement = requirement(&intent, deps);
    let body_intent = intent.clone();
    let executor = deps.executor.clone();
    let signer = deps.signer.clone();
    let body = Box::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            let generator_intent = body_intent.clone();
            let request = TxRequest {
                tx_id: format!("action-{id}"),
                action_id: id,
                overrides: TxOverrides::default(),
                generator: Box::new(move |nonce, overrides| {
                    signer.sign(&generator_intent, nonce, &overrides)
                }),
                on_submitted: None,
                on_confirmed: None,
            };
            let handle = executor.submit(request);
            handle
                .submitted
                .await
                .map_err(|_| anyhow::anyhow!("executor dropped"))??;
            handle
                .confirmed
                .await
                .map_err(|_| anyhow::anyhow!("executor dropped"))??;
            Ok(())
        })
    });
    Action {
        id,
        kind: intent.kind(),
        cost: intent.cost(),
        requirement,
        skip,
        body,
        children: Vec::new(),
        ignore_concurrency: false,
    }
}

/// Dynamic admission predicates, re-checked after any wait that suspended.
fn requirement<L: Ledger>(intent: &Intent, deps: &ActionDeps<L>) -> Option<Requirement> {
    match intent {
        Intent::SpawnCreature { location, .. } => {
            let store = deps.store.clone();
            let region = location.region();
            Some(Arc::new(move || -> BoxFuture<'static, bool> {
                let store = store.clone();
                Box::pin(async move {
                    store.read(|world| {
                        world
                            .regions
                            .get(&region)
                            .map(|r| r.creatures.len() < MAX_CREATURES_PER_REGION)
                            .unwrap_or(false)
                    })
                })
            }))
        }
        _ => None,
    }
}

/// Intents already satisfied by reconstructed state auto-complete instead
/// of spending a transaction.
fn skip_check<L: Ledger>(
    intent: &Intent,
    deps: &ActionDeps<L>,
) -> Option<crate::scheduler::SkipCheck> {
    match intent {
        Intent::MineTile { coord } => {
            let coord = *coord;
            Some(Box::new(move |world| {
                world.tiles.get(&coord).map(|tile| tile.mined).unwrap_or(false)
            }))
        }
        Intent::HarvestTile { coord } => {
            let coord = *coord;
            let clock = deps.clock.clone();
            let yields = deps.yields.clone();
            let player = deps.player;
            Some(Box::new(move |world| {
                let Some(tile) = world.tiles.get(&coord) else {
                    return true;
                };
                if tile.owner != Some(player) {
                    return true;
                }
                derived::harvest_yield(tile, &yields, clock.now()) == 0
            }))
        }
        Intent::UpgradeTile { coord, upgrade } => {
            let coord = *coord;
            let upgrade = *upgrade;
            Some(Box::new(move |world| {
                world
                    .tiles
                    .get(&coord)
                    .map(|tile| tile.upgrade == Some(upgrade))
                    .unwrap_or(false)
            }))
        }
        Intent::RaiseWall { coord } => {
            let coord = *coord;
            Some(Box::new(move |world| {
                world.tiles.get(&coord).map(|tile| tile.walled).unwrap_or(false)
            }))
        }
        Intent::RazeWall { coord } => {
            let coord = *coord;
            Some(Box::new(move |world| {
                world
                    .tiles
                    .get(&coord)
                    .map(|tile| !tile.walled)
                    .unwrap_or(true)
            }))
        }
        Intent::SpawnCreature { .. } => None,
        Intent::MoveCreature { id, to } => {
            let id = *id;
            let to = *to;
            Some(Box::new(move |world| {
                world
                    .creatures
                    .get(&id)
                    .map(|creature| creature.location == to)
                    .unwrap_or(true)
            }))
        }
    }
}
