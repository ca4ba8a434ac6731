//! Area surveys and placement helpers shared by the planner phases.

use crate::geometry::{cycle_rand_cw, MapPos};
use crate::map::{Object, Terrain};
use crate::random::RandomStream;
use crate::world::{BuildingType, GameState};
use itertools::Itertools;
use log::debug;

/// Count positions whose vertex touches terrain in `[min, max]` within the
/// spiral area.
pub fn count_terrain_near_pos(
    state: &GameState,
    center: MapPos,
    area: u32,
    min: Terrain,
    max: Terrain,
) -> u32 {
    let geom = state.map().geom();
    (0..area)
        .filter_map(|i| geom.pos_add_extended_spirally(center, i).ok())
        .filter(|&pos| state.map().has_terrain_kind(pos, min, max))
        .count() as u32
}

/// Count open positions (no object) with terrain in range; used for
/// farmable-land checks.
pub fn count_empty_terrain_near_pos(
    state: &GameState,
    center: MapPos,
    area: u32,
    min: Terrain,
    max: Terrain,
) -> u32 {
    let geom = state.map().geom();
    (0..area)
        .filter_map(|i| geom.pos_add_extended_spirally(center, i).ok())
        .filter(|&pos| {
            state.map().obj(pos) == Object::None && state.map().has_terrain_kind(pos, min, max)
        })
        .count() as u32
}

/// Open grass plus existing fields: what a farm could work with.
pub fn count_farmable_land(state: &GameState, center: MapPos, area: u32) -> u32 {
    let geom = state.map().geom();
    (0..area)
        .filter_map(|i| geom.pos_add_extended_spirally(center, i).ok())
        .filter(|&pos| {
            let obj = state.map().obj(pos);
            (obj == Object::None
                && state
                    .map()
                    .has_terrain_kind(pos, Terrain::Grass0, Terrain::Grass3))
                || obj.is_field()
        })
        .count() as u32
}

pub fn count_objects_near_pos(
    state: &GameState,
    center: MapPos,
    area: u32,
    min: Object,
    max: Object,
) -> u32 {
    let geom = state.map().geom();
    (0..area)
        .filter_map(|i| geom.pos_add_extended_spirally(center, i).ok())
        .filter(|&pos| {
            let obj = state.map().obj(pos);
            obj >= min && obj <= max
        })
        .count() as u32
}

/// Sown or growing fields. The field bands flank the resource signs, so a
/// plain band count would miscount; the object predicate knows better.
pub fn count_fields_near_pos(state: &GameState, center: MapPos, area: u32) -> u32 {
    let geom = state.map().geom();
    (0..area)
        .filter_map(|i| geom.pos_add_extended_spirally(center, i).ok())
        .filter(|&pos| state.map().obj(pos).is_field())
        .count() as u32
}

/// Stones in the area weighted by pile size.
pub fn count_stones_near_pos(state: &GameState, center: MapPos, area: u32) -> u32 {
    let geom = state.map().geom();
    (0..area)
        .filter_map(|i| geom.pos_add_extended_spirally(center, i).ok())
        .filter(|&pos| state.map().obj(pos).is_stone_pile())
        .map(|pos| state.map().obj(pos).stone_pile_amount())
        .sum()
}

/// The six hexagon corner positions around `center`, `distance` tiles out
/// in a straight line, in random rotation order.
pub fn get_corners(
    state: &GameState,
    center: MapPos,
    distance: u32,
    rng: &mut RandomStream,
) -> Vec<MapPos> {
    let geom = state.map().geom();
    let distance = distance.min(24);
    cycle_rand_cw(rng)
        .map(|dir| {
            let mut pos = center;
            for _ in 0..distance {
                pos = geom.do_move(pos, dir);
            }
            pos
        })
        .collect()
}

/// First building of the given type within the spiral area.
pub fn find_nearest_building(
    state: &GameState,
    center: MapPos,
    area: u32,
    kind: BuildingType,
) -> Option<MapPos> {
    let geom = state.map().geom();
    (0..area)
        .filter_map(|i| geom.pos_add_extended_spirally(center, i).ok())
        .find(|&pos| {
            state
                .get_building_at(pos)
                .map(|b| b.kind == kind && !b.burning)
                .unwrap_or(false)
        })
}

/// First completed building of the given type within the spiral area.
pub fn find_nearest_completed_building(
    state: &GameState,
    center: MapPos,
    area: u32,
    kind: BuildingType,
) -> Option<MapPos> {
    let geom = state.map().geom();
    (0..area)
        .filter_map(|i| geom.pos_add_extended_spirally(center, i).ok())
        .find(|&pos| {
            state
                .get_building_at(pos)
                .map(|b| b.kind == kind && b.done && !b.burning)
                .unwrap_or(false)
        })
}

pub fn building_exists_near_pos(
    state: &GameState,
    center: MapPos,
    area: u32,
    kind: BuildingType,
    player: crate::map::PlayerId,
) -> bool {
    let geom = state.map().geom();
    (0..area)
        .filter_map(|i| geom.pos_add_extended_spirally(center, i).ok())
        .any(|pos| {
            state
                .get_building_at(pos)
                .map(|b| b.kind == kind && b.owner == player)
                .unwrap_or(false)
        })
}

/// The stock (castle or warehouse) flag nearest to `pos` by straightline
/// distance.
pub fn find_nearest_stock(state: &GameState, stocks: &[MapPos], pos: MapPos) -> Option<MapPos> {
    let geom = state.map().geom();
    stocks
        .iter()
        .copied()
        .min_by_key(|&stock| geom.straightline_tile_dist(pos, stock))
}

/// Sort `(pos, value)` pairs ascending by value; position breaks ties so
/// the order is deterministic.
pub fn sort_by_val_asc(set: Vec<(MapPos, u32)>) -> Vec<MapPos> {
    set.into_iter()
        .sorted_by_key(|&(pos, val)| (val, pos))
        .map(|(pos, _)| pos)
        .collect()
}

/// Sort `(pos, value)` pairs descending by value.
pub fn sort_by_val_desc(set: Vec<(MapPos, u32)>) -> Vec<MapPos> {
    set.into_iter()
        .sorted_by_key(|&(pos, val)| (std::cmp::Reverse(val), pos))
        .map(|(pos, _)| pos)
        .collect()
}

/// Judge an area for castle placement: enough trees (weighted three-fold),
/// stones and building sites.
pub fn evaluate_castle_area(
    state: &GameState,
    center: MapPos,
    area: u32,
    near_trees_min: u32,
    near_stones_min: u32,
    near_building_sites_min: u32,
) -> bool {
    let geom = state.map().geom();
    let mut trees = 0;
    let mut stones = 0;
    let mut building_sites = 0;

    for i in 0..area {
        let Ok(pos) = geom.pos_add_extended_spirally(center, i) else {
            break;
        };
        let obj = state.map().obj(pos);
        if obj.is_tree() {
            trees += 1;
        }
        if obj.is_stone_pile() {
            stones += obj.stone_pile_amount();
        }
        if state.can_build_large(pos) {
            building_sites += 3;
        } else if state.can_build_small(pos) {
            building_sites += 1;
        }
    }

    debug!(
        "castle survey at {}: trees={}, stones={}, sites={}",
        center.packed_repr(),
        trees,
        stones,
        building_sites
    );

    trees >= near_trees_min * 3
        && stones >= near_stones_min
        && building_sites >= near_building_sites_min
}

/// Density of placed resource signs among mountain positions in the area.
/// 1.0 means every hill position carries a sign already.
pub fn sign_density(state: &GameState, center: MapPos, area: u32) -> f64 {
    let geom = state.map().geom();
    let mut hills = 0u32;
    let mut signs = 0u32;
    for i in 0..area {
        let Ok(pos) = geom.pos_add_extended_spirally(center, i) else {
            break;
        };
        if !state
            .map()
            .has_terrain_kind(pos, Terrain::Tundra0, Terrain::Snow0)
        {
            continue;
        }
        hills += 1;
        if state.map().obj(pos).is_sign() {
            signs += 1;
        }
    }
    if hills == 0 {
        return 0.0;
    }
    signs as f64 / hills as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{spiral_dist, MapGeometry};
    use crate::map::{MapStore, Minerals, PathFlags, Tile};

    fn state_with(f: impl Fn(MapPos, &mut Tile)) -> GameState {
        let geom = MapGeometry::new(3).unwrap();
        let tiles = (0..geom.tile_count())
            .map(|i| {
                let mut tile = Tile {
                    height: 10,
                    type_up: Terrain::Grass1,
                    type_down: Terrain::Grass1,
                    object: Object::None,
                    object_index: 0,
                    paths: PathFlags::empty(),
                    owner: Some(0),
                    mineral: Minerals::None,
                    mineral_amount: 0,
                    serf_index: None,
                };
                f(MapPos::from_packed(i), &mut tile);
                tile
            })
            .collect();
        GameState::new(MapStore::from_tiles(geom, tiles), 1)
    }

    #[test]
    fn object_counting_bands() {
        let state = state_with(|pos, tile| {
            if pos.packed_repr() == 5 {
                tile.object = Object::Tree3;
            }
            if pos.packed_repr() == 6 {
                tile.object = Object::Stone2;
            }
        });
        let geom = state.map().geom();
        let center = geom.pos(4, 0);
        let area = spiral_dist(4);
        assert_eq!(
            count_objects_near_pos(&state, center, area, Object::Tree0, Object::Pine7),
            1
        );
        assert_eq!(count_stones_near_pos(&state, center, area), 6);
    }

    #[test]
    fn corners_sit_on_the_ring() {
        let state = state_with(|_, _| {});
        let mut rng = RandomStream::from_words(1, 2, 3);
        let center = state.map().geom().pos(30, 30);
        let corners = get_corners(&state, center, 5, &mut rng);
        assert_eq!(corners.len(), 6);
        for corner in corners {
            assert_eq!(
                state.map().geom().straightline_tile_dist(center, corner),
                5
            );
        }
    }

    #[test]
    fn sorting_is_deterministic() {
        let geom = MapGeometry::new(3).unwrap();
        let a = geom.pos(1, 0);
        let b = geom.pos(2, 0);
        let c = geom.pos(3, 0);
        let sorted = sort_by_val_asc(vec![(c, 5), (a, 5), (b, 2)]);
        assert_eq!(sorted, vec![b, a, c]);
        let sorted = sort_by_val_desc(vec![(c, 5), (a, 5), (b, 2)]);
        assert_eq!(sorted, vec![a, c, b]);
    }

    #[test]
    fn sign_density_counts_hills_only() {
        let state = state_with(|pos, tile| {
            // A mountain stripe with signs on half of it.
            if pos.packed_repr() < 8 {
                tile.type_up = Terrain::Tundra1;
                tile.type_down = Terrain::Tundra1;
                if pos.packed_repr() % 2 == 0 {
                    tile.object = Object::SignLargeCoal;
                }
            }
        });
        let geom = state.map().geom();
        let density = sign_density(&state, geom.pos(2, 0), spiral_dist(2));
        assert!(density > 0.0 && density <= 1.0);
    }
}
