use crate::{World, WorldConfig};
use ember_types::{
    Address, Creature, DelayedAction, LoadingStage, Notification, Player, Region, RegionCoord,
    Tile,
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tracing::debug;

/// Paginated read access to the ledger-side snapshot of each entity kind.
///
/// This is a consumed collaborator: implementations wrap whatever view-call
/// plumbing the deployment exposes and are free to batch however they like.
pub trait SnapshotSource: Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn count(
        &self,
        stage: LoadingStage,
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send;

    fn tiles(
        &self,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Tile>, Self::Error>> + Send;

    fn regions(
        &self,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Region>, Self::Error>> + Send;

    fn players(
        &self,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Player>, Self::Error>> + Send;

    fn creatures(
        &self,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Creature>, Self::Error>> + Send;

    fn delayed_actions(
        &self,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<DelayedAction>, Self::Error>> + Send;

    fn influence(
        &self,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<(RegionCoord, Address, u64)>, Self::Error>> + Send;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Pages fetched concurrently per stage. Results are stitched back in
    /// request-index order regardless of completion order.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_page_size() -> usize {
    256
}

fn default_parallelism() -> usize {
    4
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            parallelism: default_parallelism(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BootstrapError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error("snapshot read failed: {0}")]
    Source(#[source] E),
}

async fn load_pages<T, E, Fut>(
    stage: LoadingStage,
    total: usize,
    config: &BootstrapConfig,
    fetch: impl Fn(usize, usize) -> Fut,
    progress: &mut impl FnMut(Notification),
) -> Result<Vec<T>, E>
where
    E: std::error::Error + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, E>>,
{
    let page_size = config.page_size.max(1);
    let pages = total.div_ceil(page_size);
    progress(Notification::Loading {
        stage,
        done: 0,
        total,
    });
    let mut fetches = stream::iter((0..pages).map(|page| fetch(page * page_size, page_size)))
        .buffered(config.parallelism.max(1));
    let mut items = Vec::with_capacity(total);
    while let Some(page) = fetches.next().await {
        items.extend(page?);
        progress(Notification::Loading {
            stage,
            done: items.len().min(total),
            total,
        });
    }
    debug!(?stage, loaded = items.len(), "bootstrap stage complete");
    Ok(items)
}

/// Bulk-load the world from a snapshot source.
///
/// Each entity kind loads in fixed-size pages with bounded parallelism;
/// `progress` receives a `Loading` notification per completed page.
pub async fn bootstrap<S: SnapshotSource>(
    source: &S,
    config: &BootstrapConfig,
    world_config: WorldConfig,
    mut progress: impl FnMut(Notification),
) -> Result<World, BootstrapError<S::Error>> {
    let mut world = World::new(world_config);

    let total = source
        .count(LoadingStage::Tiles)
        .await
        .map_err(BootstrapError::Source)?;
    let tiles = load_pages(
        LoadingStage::Tiles,
        total,
        config,
        |offset, limit| source.tiles(offset, limit),
        &mut progress,
    )
    .await
    .map_err(BootstrapError::Source)?;
    world.tiles = tiles.into_iter().map(|tile| (tile.coord, tile)).collect();

    let total = source
        .count(LoadingStage::Regions)
        .await
        .map_err(BootstrapError::Source)?;
    let regions = load_pages(
        LoadingStage::Regions,
        total,
        config,
        |offset, limit| source.regions(offset, limit),
        &mut progress,
    )
    .await
    .map_err(BootstrapError::Source)?;
    world.regions = regions
        .into_iter()
        .map(|region| (region.coord, region))
        .collect();

    let total = source
        .count(LoadingStage::Players)
        .await
        .map_err(BootstrapError::Source)?;
    let players = load_pages(
        LoadingStage::Players,
        total,
        config,
        |offset, limit| source.players(offset, limit),
        &mut progress,
    )
    .await
    .map_err(BootstrapError::Source)?;
    world.players = players
        .into_iter()
        .map(|player| (player.address, player))
        .collect();

    let total = source
        .count(LoadingStage::Creatures)
        .await
        .map_err(BootstrapError::Source)?;
    let creatures = load_pages(
        LoadingStage::Creatures,
        total,
        config,
        |offset, limit| source.creatures(offset, limit),
        &mut progress,
    )
    .await
    .map_err(BootstrapError::Source)?;
    world.creatures = creatures
        .into_iter()
        .map(|creature| (creature.id, creature))
        .collect();

    let total = source
        .count(LoadingStage::DelayedActions)
        .await
        .map_err(BootstrapError::Source)?;
    let delayed = load_pages(
        LoadingStage::DelayedActions,
        total,
        config,
        |offset, limit| source.delayed_actions(offset, limit),
        &mut progress,
    )
    .await
    .map_err(BootstrapError::Source)?;
    world.delayed = delayed
        .into_iter()
        .map(|action| (action.key(), action))
        .collect();

    let total = source
        .count(LoadingStage::Influence)
        .await
        .map_err(BootstrapError::Source)?;
    let influence = load_pages(
        LoadingStage::Influence,
        total,
        config,
        |offset, limit| source.influence(offset, limit),
        &mut progress,
    )
    .await
    .map_err(BootstrapError::Source)?;
    for (region, player, amount) in influence {
        world
            .influence
            .entry(region)
            .or_default()
            .insert(player, amount);
    }

    Ok(world)
}
