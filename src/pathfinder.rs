//! Weighted A* over tile vertices for plotting a single road.
//!
//! Search nodes live in an index arena; parent links are indices, so path
//! reconstruction is a walk over the arena. The open set is a lazy-deletion
//! binary heap: stale entries are skipped when popped.
//!
//! Besides the direct road, the search emits side solutions: whenever it
//! runs into an existing road at a spot where a new flag could be built, the
//! best known path to that spot becomes a split-road candidate.

use crate::geometry::{cycle_rand_cw, Direction, MapGeometry, MapPos};
use crate::map::{MapStore, Object};
use crate::random::RandomStream;
use crate::road::Road;
use fnv::FnvHashMap;
use log::{debug, trace};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Cost of one tile edge by absolute height difference.
const WALK_COST: [u32; 5] = [255, 319, 383, 447, 511];

/// At most this many split-road candidates per invocation; further matches
/// are discarded.
const MAX_SPLIT_CANDIDATES: usize = 10;

/// Cost estimate to the target: straightline distance priced at the average
/// climb per tile.
pub fn heuristic_cost(map: &MapStore, start: MapPos, end: MapPos) -> u32 {
    let dist = map.geom().straightline_tile_dist(start, end);
    if dist == 0 {
        return 0;
    }
    let h_diff = (map.height(start) as i32 - map.height(end) as i32).unsigned_abs();
    dist * WALK_COST[((h_diff / dist) as usize).min(4)]
}

/// Exact cost of stepping from `pos` in `dir`.
pub fn actual_cost(map: &MapStore, pos: MapPos, dir: Direction) -> u32 {
    let other_pos = map.geom().do_move(pos, dir);
    let h_diff = (map.height(pos) as i32 - map.height(other_pos) as i32).unsigned_abs();
    WALK_COST[(h_diff as usize).min(4)]
}

/// Outcome of one plot attempt.
pub struct PlotResult {
    /// The direct road from start to end, when one exists.
    pub direct: Option<Road>,
    /// Paths from start to buildable splits of existing roads that the
    /// search brushed against on the way.
    pub split_candidates: Vec<Road>,
}

struct SearchNode {
    pos: MapPos,
    g_score: u32,
    f_score: u32,
    parent: Option<u32>,
    dir: Option<Direction>,
    closed: bool,
}

struct NodeArena {
    nodes: Vec<SearchNode>,
}

impl NodeArena {
    fn new() -> NodeArena {
        NodeArena { nodes: Vec::new() }
    }

    fn alloc(&mut self, node: SearchNode) -> u32 {
        let index = self.nodes.len() as u32;
        self.nodes.push(node);
        index
    }

    #[inline]
    fn get(&self, index: u32) -> &SearchNode {
        &self.nodes[index as usize]
    }

    #[inline]
    fn get_mut(&mut self, index: u32) -> &mut SearchNode {
        &mut self.nodes[index as usize]
    }

    /// Rebuild the start-to-node direction sequence by walking parent
    /// indices.
    fn path_to(&self, geom: &MapGeometry, index: u32, start: MapPos) -> Road {
        let mut dirs = Vec::new();
        let mut current = index;
        loop {
            let node = self.get(current);
            match (node.parent, node.dir) {
                (Some(parent), Some(dir)) => {
                    dirs.push(dir);
                    current = parent;
                }
                _ => break,
            }
        }
        dirs.reverse();
        let mut road = Road::start(start);
        for dir in dirs {
            road.extend(dir);
        }
        debug_assert_eq!(road.end(geom), self.get(index).pos);
        road
    }
}

/// Plot a road from `start` to `end`.
///
/// `can_build_flag` is the caller's rule for whether a new flag could stand
/// at a position; it gates split-road discovery. `hold_pos` blocks routing
/// through a reserved position (the up-left neighbour of a planned building
/// site). Direction enumeration at every node starts from a random
/// direction so repeated attempts do not all fail on the same obstacle.
pub fn plot_road(
    map: &MapStore,
    start: MapPos,
    end: MapPos,
    can_build_flag: &dyn Fn(MapPos) -> bool,
    hold_pos: Option<MapPos>,
    rng: &mut RandomStream,
) -> PlotResult {
    let geom = map.geom();

    let mut arena = NodeArena::new();
    let mut best_node: FnvHashMap<MapPos, u32> = FnvHashMap::default();
    let mut open: BinaryHeap<(Reverse<u32>, u32)> = BinaryHeap::new();
    let mut split_candidates: Vec<Road> = Vec::new();

    let root = arena.alloc(SearchNode {
        pos: start,
        g_score: 0,
        f_score: heuristic_cost(map, start, end),
        parent: None,
        dir: None,
        closed: false,
    });
    best_node.insert(start, root);
    open.push((Reverse(arena.get(root).f_score), root));

    let mut direct = None;

    while let Some((Reverse(f), index)) = open.pop() {
        if arena.get(index).closed || f > arena.get(index).f_score {
            continue; // stale heap entry
        }

        if arena.get(index).pos == end {
            let road = arena.path_to(geom, index, start);
            if !road.is_empty() {
                direct = Some(road);
            }
            break;
        }

        arena.get_mut(index).closed = true;
        let node_pos = arena.get(index).pos;
        let node_g = arena.get(index).g_score;

        for d in cycle_rand_cw(rng) {
            let new_pos = geom.do_move(node_pos, d);
            let cost = actual_cost(map, node_pos, d);

            if hold_pos == Some(new_pos) && new_pos != end {
                continue;
            }

            if !map.is_road_segment_valid(node_pos, d)
                || (map.obj(new_pos) == Object::Flag && new_pos != end)
            {
                // A blocked step onto an existing road can still yield a
                // split-road side solution: build a new flag there and
                // connect to it along the path explored so far.
                if split_candidates.len() >= MAX_SPLIT_CANDIDATES {
                    continue;
                }
                if can_build_flag(new_pos) && !map.paths(new_pos).is_empty() {
                    let mut candidate = arena.path_to(geom, index, start);
                    candidate.extend(d);
                    trace!(
                        "split-road candidate at {} with {} segments",
                        new_pos.packed_repr(),
                        candidate.length()
                    );
                    split_candidates.push(candidate);
                }
                continue;
            }

            let tentative_g = node_g + cost;
            match best_node.get(&new_pos) {
                Some(&existing) => {
                    if arena.get(existing).closed || arena.get(existing).g_score <= tentative_g {
                        continue;
                    }
                    let f = tentative_g + heuristic_cost(map, new_pos, end);
                    let node = arena.get_mut(existing);
                    node.g_score = tentative_g;
                    node.f_score = f;
                    node.parent = Some(index);
                    node.dir = Some(d);
                    open.push((Reverse(f), existing));
                }
                None => {
                    let f = tentative_g + heuristic_cost(map, new_pos, end);
                    let new_index = arena.alloc(SearchNode {
                        pos: new_pos,
                        g_score: tentative_g,
                        f_score: f,
                        parent: Some(index),
                        dir: Some(d),
                        closed: false,
                    });
                    best_node.insert(new_pos, new_index);
                    open.push((Reverse(f), new_index));
                }
            }
        }
    }

    debug!(
        "plot_road {} -> {}: direct={}, splits={}",
        start.packed_repr(),
        end.packed_repr(),
        direct.is_some(),
        split_candidates.len()
    );

    PlotResult {
        direct,
        split_candidates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MapGeometry;
    use crate::map::{Minerals, PathFlags, Terrain, Tile};

    /// A flat all-grass map owned by player 0.
    fn flat_map() -> MapStore {
        let geom = MapGeometry::new(3).unwrap();
        let tiles = (0..geom.tile_count())
            .map(|_| Tile {
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
            })
            .collect();
        MapStore::from_tiles(geom, tiles)
    }

    fn rng() -> RandomStream {
        RandomStream::from_words(11, 22, 33)
    }

    fn open_flag_rule(map: &MapStore) -> impl Fn(MapPos) -> bool + '_ {
        |pos| map.obj(pos) == Object::None
    }

    #[test]
    fn heuristic_of_identical_positions_is_zero() {
        let map = flat_map();
        let pos = map.geom().pos(4, 4);
        assert_eq!(heuristic_cost(&map, pos, pos), 0);
    }

    #[test]
    fn plots_a_direct_road_between_flags() {
        let mut map = flat_map();
        let start = map.geom().pos(10, 10);
        let end = map.geom().pos(16, 10);
        map.set_object(start, Object::Flag, Some(0));
        map.set_object(end, Object::Flag, Some(1));

        let mut rng = rng();
        let result = plot_road(&map, start, end, &open_flag_rule(&map), None, &mut rng);
        let road = result.direct.expect("flat map must have a direct road");
        assert_eq!(road.source(), start);
        assert_eq!(road.end(map.geom()), end);
        // Flat terrain: optimal length equals the straightline distance.
        assert_eq!(
            road.length() as u32,
            map.geom().straightline_tile_dist(start, end)
        );
    }

    #[test]
    fn road_folds_back_onto_its_end_and_reverses() {
        let mut map = flat_map();
        let start = map.geom().pos(3, 20);
        let end = map.geom().pos(9, 25);
        map.set_object(start, Object::Flag, Some(0));
        map.set_object(end, Object::Flag, Some(1));

        let mut rng = rng();
        let road = plot_road(&map, start, end, &open_flag_rule(&map), None, &mut rng)
            .direct
            .unwrap();
        let reversed = road.reversed(map.geom());
        assert_eq!(reversed.source(), end);
        assert_eq!(reversed.end(map.geom()), start);
    }

    #[test]
    fn intermediate_flags_block_the_route() {
        let mut map = flat_map();
        let start = map.geom().pos(10, 10);
        let end = map.geom().pos(14, 10);
        map.set_object(start, Object::Flag, Some(0));
        map.set_object(end, Object::Flag, Some(1));
        // Flag directly on the straight line.
        map.set_object(map.geom().pos(12, 10), Object::Flag, Some(2));

        let mut rng = rng();
        let road = plot_road(&map, start, end, &open_flag_rule(&map), None, &mut rng)
            .direct
            .unwrap();
        assert!(!road.has_pos(map.geom(), map.geom().pos(12, 10)));
        assert_eq!(road.end(map.geom()), end);
    }

    #[test]
    fn existing_roads_surface_split_candidates() {
        let mut map = flat_map();
        let geom_start = map.geom().pos(10, 14);
        let geom_end = map.geom().pos(10, 6);
        map.set_object(geom_start, Object::Flag, Some(0));
        map.set_object(geom_end, Object::Flag, Some(1));

        // An existing east-west road crossing the corridor between the two
        // flags, with its own flags well out of the way.
        let road_start = map.geom().pos(4, 10);
        map.set_object(road_start, Object::Flag, Some(2));
        let mut crossing = Road::start(road_start);
        for _ in 0..12 {
            crossing.extend(Direction::Right);
        }
        let road_end = crossing.end(map.geom());
        map.set_object(road_end, Object::Flag, Some(3));
        assert!(map.place_road_segments(&crossing));

        let mut rng = rng();
        let result = plot_road(
            &map,
            geom_start,
            geom_end,
            &open_flag_rule(&map),
            None,
            &mut rng,
        );
        assert!(
            !result.split_candidates.is_empty(),
            "crossing an existing road must surface split candidates"
        );
        assert!(result.split_candidates.len() <= 10);
        for candidate in &result.split_candidates {
            assert_eq!(candidate.source(), geom_start);
            let split_pos = candidate.end(map.geom());
            assert!(!map.paths(split_pos).is_empty());
            assert_eq!(map.obj(split_pos), Object::None);
        }
    }

    #[test]
    fn hold_pos_is_never_crossed() {
        let mut map = flat_map();
        let start = map.geom().pos(10, 10);
        let end = map.geom().pos(14, 10);
        map.set_object(start, Object::Flag, Some(0));
        map.set_object(end, Object::Flag, Some(1));
        let hold = map.geom().pos(12, 10);

        let mut rng = rng();
        let road = plot_road(&map, start, end, &open_flag_rule(&map), Some(hold), &mut rng)
            .direct
            .unwrap();
        assert!(!road.has_pos(map.geom(), hold));
    }

    #[test]
    fn unreachable_target_has_no_direct_road() {
        let mut map = flat_map();
        let start = map.geom().pos(10, 10);
        let end = map.geom().pos(20, 20);
        map.set_object(start, Object::Flag, Some(0));
        map.set_object(end, Object::Flag, Some(1));
        // The end flag's owner differs, so no segment into it is valid.
        for pos in map.geom().iter().collect::<Vec<_>>() {
            if map.geom().straightline_tile_dist(pos, end) <= 2 {
                map.set_owner(pos, Some(1));
            }
        }

        let mut rng = rng();
        let result = plot_road(&map, start, end, &open_flag_rule(&map), None, &mut rng);
        assert!(result.direct.is_none());
    }
}
