use crate::{derived::region_controller, World};
use ember_types::{
    Address, CreatureId, DecodedEvent, DelayedAction, DelayedKey, DelayedKind, EventBody,
    Notification, Region, RegionCoord, Tile, TileCoord,
};
use thiserror::Error;

/// A reducer referenced an entity the world has never seen: a causal gap.
///
/// The sync engine guarantees exactly-once, in-order delivery, so this is
/// never recovered from locally; it escalates to a terminal error status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("unknown tile {0}")]
    UnknownTile(TileCoord),
    #[error("unknown region {0}")]
    UnknownRegion(RegionCoord),
    #[error("unknown player {0}")]
    UnknownPlayer(Address),
    #[error("unknown creature {0}")]
    UnknownCreature(CreatureId),
    #[error("unknown delayed action by {initiator} ({kind:?}) at {coord}")]
    UnknownDelayedAction {
        initiator: Address,
        kind: DelayedKind,
        coord: TileCoord,
    },
}

impl World {
    /// Apply one decoded event.
    ///
    /// Reducers are pure state transitions: no I/O, no clock reads. They
    /// assume strict `(block_number, log_index)` order and exactly-once
    /// delivery; they are not written to tolerate duplicates or reordering.
    pub fn apply(&mut self, event: &DecodedEvent) -> Result<Vec<Notification>, ApplyError> {
        let mut out = Vec::new();
        match &event.body {
            EventBody::TileMined { coord, miner, at } => {
                self.tiles.insert(*coord, Tile::mined(*coord, *miner, *at));
                let region_coord = coord.region();
                let region = self
                    .regions
                    .entry(region_coord)
                    .or_insert_with(|| Region::discovered(region_coord, *miner));
                if !region.tiles.contains(coord) {
                    region.tiles.push(*coord);
                }
                if let Some(player) = self.players.get_mut(miner) {
                    player.last_action_at = *at;
                    self.bump_player(miner);
                    out.push(Notification::PlayerChanged(*miner));
                }
                out.push(Notification::TileChanged(*coord));
                out.push(Notification::RegionChanged(region_coord));
            }
            EventBody::TileUpgraded { coord, upgrade } => {
                let tile = self
                    .tiles
                    .get_mut(coord)
                    .ok_or(ApplyError::UnknownTile(*coord))?;
                tile.upgrade = Some(*upgrade);
                out.push(Notification::TileChanged(*coord));
            }
            EventBody::WallRaised { coord } => {
                let tile = self
                    .tiles
                    .get_mut(coord)
                    .ok_or(ApplyError::UnknownTile(*coord))?;
                tile.walled = true;
                out.push(Notification::TileChanged(*coord));
            }
            EventBody::WallRazed { coord } => {
                let tile = self
                    .tiles
                    .get_mut(coord)
                    .ok_or(ApplyError::UnknownTile(*coord))?;
                tile.walled = false;
                out.push(Notification::TileChanged(*coord));
            }
            EventBody::TileHarvested {
                coord,
                player,
                gold,
                at,
            } => {
                let tile = self
                    .tiles
                    .get_mut(coord)
                    .ok_or(ApplyError::UnknownTile(*coord))?;
                tile.last_harvest_at = *at;
                let region_coord = coord.region();
                let region = self
                    .regions
                    .get_mut(&region_coord)
                    .ok_or(ApplyError::UnknownRegion(region_coord))?;
                region.gold = region.gold.saturating_sub(*gold);
                let entry = self
                    .players
                    .get_mut(player)
                    .ok_or(ApplyError::UnknownPlayer(*player))?;
                entry.last_action_at = *at;
                self.bump_player(player);
                out.push(Notification::TileChanged(*coord));
                out.push(Notification::RegionChanged(region_coord));
                out.push(Notification::PlayerChanged(*player));
            }
            EventBody::RegionEndowed {
                region,
                gold,
                souls,
            } => {
                let entry = self
                    .regions
                    .get_mut(region)
                    .ok_or(ApplyError::UnknownRegion(*region))?;
                entry.gold = entry.gold.saturating_add(*gold);
                entry.souls = entry.souls.saturating_add(*souls);
                out.push(Notification::RegionChanged(*region));
            }
            EventBody::PlayerJoined {
                address,
                gold_capacity,
                at,
            } => {
                self.players.insert(
                    *address,
                    ember_types::Player {
                        address: *address,
                        gold: 0,
                        souls: 0,
                        gold_capacity: *gold_capacity,
                        joined_at: *at,
                        last_action_at: *at,
                    },
                );
                self.bump_player(address);
                out.push(Notification::PlayerChanged(*address));
            }
            EventBody::PlayerVaultChanged {
                address,
                gold,
                souls,
            } => {
                let player = self
                    .players
                    .get_mut(address)
                    .ok_or(ApplyError::UnknownPlayer(*address))?;
                player.gold = *gold;
                player.souls = *souls;
                self.bump_player(address);
                out.push(Notification::PlayerChanged(*address));
            }
            EventBody::CreatureSpawned {
                id,
                species,
                kind,
                level,
                life,
                owner,
                location,
                at,
            } => {
                let region_coord = location.region();
                let region = self
                    .regions
                    .get_mut(&region_coord)
                    .ok_or(ApplyError::UnknownRegion(region_coord))?;
                if !region.creatures.contains(id) {
                    region.creatures.push(*id);
                }
                region.last_spawn_at = *at;
                self.creatures.insert(
                    *id,
                    ember_types::Creature {
                        id: *id,
                        species: *species,
                        kind: *kind,
                        level: *level,
                        life: *life,
                        owner: *owner,
                        location: *location,
                    },
                );
                out.push(Notification::CreatureChanged(*id));
                out.push(Notification::RegionChanged(region_coord));
            }
            EventBody::CreatureMoved { id, to } => {
                let creature = self
                    .creatures
                    .get_mut(id)
                    .ok_or(ApplyError::UnknownCreature(*id))?;
                let from_region = creature.location.region();
                let to_region = to.region();
                creature.location = *to;
                if from_region != to_region {
                    let old = self
                        .regions
                        .get_mut(&from_region)
                        .ok_or(ApplyError::UnknownRegion(from_region))?;
                    old.creatures.retain(|c| c != id);
                    let new = self
                        .regions
                        .get_mut(&to_region)
                        .ok_or(ApplyError::UnknownRegion(to_region))?;
                    if !new.creatures.contains(id) {
                        new.creatures.push(*id);
                    }
                    out.push(Notification::RegionChanged(from_region));
                    out.push(Notification::RegionChanged(to_region));
                }
                out.push(Notification::CreatureChanged(*id));
            }
            EventBody::CreatureDied { id } => {
                let creature = self
                    .creatures
                    .remove(id)
                    .ok_or(ApplyError::UnknownCreature(*id))?;
                let region_coord = creature.location.region();
                let region = self
                    .regions
                    .get_mut(&region_coord)
                    .ok_or(ApplyError::UnknownRegion(region_coord))?;
                region.creatures.retain(|c| c != id);
                out.push(Notification::CreatureRemoved(*id));
                out.push(Notification::RegionChanged(region_coord));
            }
            EventBody::ActionScheduled {
                initiator,
                kind,
                coord,
                ready_at,
            } => {
                // Same identity re-scheduled: last write wins.
                let action = DelayedAction {
                    initiator: *initiator,
                    kind: *kind,
                    coord: *coord,
                    ready_at: *ready_at,
                };
                self.delayed.insert(action.key(), action);
            }
            EventBody::ActionResolved {
                initiator,
                kind,
                coord,
            }
            | EventBody::ActionVoided {
                initiator,
                kind,
                coord,
            } => {
                let key = DelayedKey {
                    initiator: *initiator,
                    kind: *kind,
                    coord: *coord,
                };
                self.delayed
                    .remove(&key)
                    .ok_or(ApplyError::UnknownDelayedAction {
                        initiator: *initiator,
                        kind: *kind,
                        coord: *coord,
                    })?;
            }
            EventBody::InfluenceChanged {
                region,
                player,
                amount,
            } => {
                if !self.regions.contains_key(region) {
                    return Err(ApplyError::UnknownRegion(*region));
                }
                let min = self.config.controller_min_influence;
                let map = self.influence.entry(*region).or_default();
                let before = region_controller(map, min);
                if *amount == 0 {
                    map.remove(player);
                } else {
                    map.insert(*player, *amount);
                }
                let after = region_controller(map, min);
                out.push(Notification::RegionChanged(*region));
                if before != after {
                    out.push(Notification::ControllerChanged {
                        region: *region,
                        controller: after,
                    });
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorldConfig;
    use ember_types::{CreatureKind, CreatureSpecies, RegionController, TxHash, UpgradeKind};

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    fn event(block: u64, index: u64, body: EventBody) -> DecodedEvent {
        DecodedEvent {
            block_number: block,
            log_index: index,
            tx_hash: TxHash([0; 32]),
            emitter: addr(0xee),
            body,
        }
    }

    fn base_events() -> Vec<DecodedEvent> {
        let alice = addr(1);
        let bob = addr(2);
        vec![
            event(
                1,
                0,
                EventBody::PlayerJoined {
                    address: alice,
                    gold_capacity: 100,
                    at: 10,
                },
            ),
            event(
                1,
                1,
                EventBody::PlayerJoined {
                    address: bob,
                    gold_capacity: 100,
                    at: 10,
                },
            ),
            event(
                2,
                0,
                EventBody::TileMined {
                    coord: TileCoord::new(1, 1),
                    miner: alice,
                    at: 12,
                },
            ),
            event(
                2,
                1,
                EventBody::TileMined {
                    coord: TileCoord::new(2, 1),
                    miner: bob,
                    at: 12,
                },
            ),
            event(
                3,
                0,
                EventBody::RegionEndowed {
                    region: RegionCoord::new(0, 0),
                    gold: 500,
                    souls: 50,
                },
            ),
            event(
                3,
                1,
                EventBody::InfluenceChanged {
                    region: RegionCoord::new(0, 0),
                    player: alice,
                    amount: 10,
                },
            ),
            event(
                4,
                0,
                EventBody::TileHarvested {
                    coord: TileCoord::new(1, 1),
                    player: alice,
                    gold: 40,
                    at: 20,
                },
            ),
            event(
                4,
                1,
                EventBody::PlayerVaultChanged {
                    address: alice,
                    gold: 40,
                    souls: 0,
                },
            ),
            event(
                5,
                0,
                EventBody::CreatureSpawned {
                    id: 7,
                    species: CreatureSpecies::Golem,
                    kind: CreatureKind::Normal,
                    level: 1,
                    life: 30,
                    owner: bob,
                    location: TileCoord::new(2, 1),
                    at: 25,
                },
            ),
        ]
    }

    fn apply_all(world: &mut World, events: &[DecodedEvent]) {
        for event in events {
            world.apply(event).expect("apply");
        }
    }

    #[test]
    fn batch_order_invariance() {
        // The same per-event order applied under different delivery
        // batchings must produce identical state.
        let events = base_events();

        let mut whole = World::new(WorldConfig::default());
        apply_all(&mut whole, &events);

        for split in 1..events.len() {
            let mut chunked = World::new(WorldConfig::default());
            let (head, tail) = events.split_at(split);
            apply_all(&mut chunked, head);
            apply_all(&mut chunked, tail);

            assert_eq!(chunked.tiles, whole.tiles);
            assert_eq!(chunked.regions, whole.regions);
            assert_eq!(chunked.players, whole.players);
            assert_eq!(chunked.creatures, whole.creatures);
            assert_eq!(chunked.influence, whole.influence);
        }
    }

    #[test]
    fn harvest_updates_tile_region_and_player() {
        let mut world = World::new(WorldConfig::default());
        apply_all(&mut world, &base_events());

        let tile = &world.tiles[&TileCoord::new(1, 1)];
        assert_eq!(tile.last_harvest_at, 20);
        assert_eq!(world.regions[&RegionCoord::new(0, 0)].gold, 460);
        assert_eq!(world.players[&addr(1)].gold, 40);
    }

    #[test]
    fn unknown_entity_is_a_causal_gap() {
        let mut world = World::new(WorldConfig::default());
        let err = world
            .apply(&event(
                1,
                0,
                EventBody::WallRaised {
                    coord: TileCoord::new(9, 9),
                },
            ))
            .unwrap_err();
        assert_eq!(err, ApplyError::UnknownTile(TileCoord::new(9, 9)));

        let err = world
            .apply(&event(
                1,
                1,
                EventBody::PlayerVaultChanged {
                    address: addr(3),
                    gold: 1,
                    souls: 1,
                },
            ))
            .unwrap_err();
        assert_eq!(err, ApplyError::UnknownPlayer(addr(3)));
    }

    #[test]
    fn creature_death_destroys_the_entity() {
        let mut world = World::new(WorldConfig::default());
        apply_all(&mut world, &base_events());

        let notifications = world
            .apply(&event(6, 0, EventBody::CreatureDied { id: 7 }))
            .unwrap();
        assert!(world.creatures.is_empty());
        assert!(world.regions[&RegionCoord::new(0, 0)].creatures.is_empty());
        assert!(notifications.contains(&Notification::CreatureRemoved(7)));
    }

    #[test]
    fn creature_move_across_regions_updates_both() {
        let mut world = World::new(WorldConfig::default());
        apply_all(&mut world, &base_events());

        // Discover a second region, then move the creature there.
        world
            .apply(&event(
                6,
                0,
                EventBody::TileMined {
                    coord: TileCoord::new(20, 1),
                    miner: addr(2),
                    at: 30,
                },
            ))
            .unwrap();
        world
            .apply(&event(
                6,
                1,
                EventBody::CreatureMoved {
                    id: 7,
                    to: TileCoord::new(20, 1),
                },
            ))
            .unwrap();

        assert!(world.regions[&RegionCoord::new(0, 0)].creatures.is_empty());
        assert_eq!(world.regions[&RegionCoord::new(1, 0)].creatures, vec![7]);
        assert_eq!(world.creatures[&7].location, TileCoord::new(20, 1));
    }

    #[test]
    fn delayed_action_identity_is_last_write_wins() {
        let mut world = World::new(WorldConfig::default());
        apply_all(&mut world, &base_events());

        let schedule = |ready_at| {
            EventBody::ActionScheduled {
                initiator: addr(1),
                kind: DelayedKind::RaiseWall,
                coord: TileCoord::new(1, 1),
                ready_at,
            }
        };
        world.apply(&event(6, 0, schedule(100))).unwrap();
        world.apply(&event(6, 1, schedule(200))).unwrap();
        assert_eq!(world.delayed.len(), 1);
        assert_eq!(world.delayed.values().next().unwrap().ready_at, 200);

        world
            .apply(&event(
                7,
                0,
                EventBody::ActionResolved {
                    initiator: addr(1),
                    kind: DelayedKind::RaiseWall,
                    coord: TileCoord::new(1, 1),
                },
            ))
            .unwrap();
        assert!(world.delayed.is_empty());

        // Resolving it again references a removed entity.
        let err = world
            .apply(&event(
                7,
                1,
                EventBody::ActionResolved {
                    initiator: addr(1),
                    kind: DelayedKind::RaiseWall,
                    coord: TileCoord::new(1, 1),
                },
            ))
            .unwrap_err();
        assert!(matches!(err, ApplyError::UnknownDelayedAction { .. }));
    }

    #[test]
    fn influence_majority_flip_notifies_controller_change() {
        let mut world = World::new(WorldConfig::default());
        apply_all(&mut world, &base_events());

        // Alice currently holds 10 of 10: controller.
        let notifications = world
            .apply(&event(
                6,
                0,
                EventBody::InfluenceChanged {
                    region: RegionCoord::new(0, 0),
                    player: addr(2),
                    amount: 10,
                },
            ))
            .unwrap();
        assert!(notifications.contains(&Notification::ControllerChanged {
            region: RegionCoord::new(0, 0),
            controller: RegionController::Disputed,
        }));

        let notifications = world
            .apply(&event(
                6,
                1,
                EventBody::InfluenceChanged {
                    region: RegionCoord::new(0, 0),
                    player: addr(2),
                    amount: 30,
                },
            ))
            .unwrap();
        assert!(notifications.contains(&Notification::ControllerChanged {
            region: RegionCoord::new(0, 0),
            controller: RegionController::Held(addr(2)),
        }));
    }

    #[test]
    fn player_revision_bumps_on_vault_change() {
        let mut world = World::new(WorldConfig::default());
        apply_all(&mut world, &base_events());
        let before = world.player_revision(&addr(1));
        world
            .apply(&event(
                6,
                0,
                EventBody::PlayerVaultChanged {
                    address: addr(1),
                    gold: 5,
                    souls: 0,
                },
            ))
            .unwrap();
        assert!(world.player_revision(&addr(1)) > before);
    }

    #[test]
    fn upgrade_requires_existing_tile() {
        let mut world = World::new(WorldConfig::default());
        apply_all(&mut world, &base_events());
        world
            .apply(&event(
                6,
                0,
                EventBody::TileUpgraded {
                    coord: TileCoord::new(1, 1),
                    upgrade: UpgradeKind::GoldMine,
                },
            ))
            .unwrap();
        assert_eq!(
            world.tiles[&TileCoord::new(1, 1)].upgrade,
            Some(UpgradeKind::GoldMine)
        );
    }
}
