//! Flag-graph search: scoring the remainder of a route beyond a candidate
//! end flag.
//!
//! Neighbours of a flag are discovered by walking the tile paths leaving it
//! until the next flag. The search itself is a unit-cost Dijkstra over that
//! graph; tile lengths are accumulated afterwards by re-tracing each edge of
//! the winning flag path.

use crate::geometry::{cycle_cw, Direction, MapPos};
use crate::map::MapStore;
use crate::road::Road;
use crate::roadbuilder::{FlagScore, RoadBuilder, RoadOptions, BAD_SCORE, CASTLE_FLAG_PENALTY};
use log::{debug, trace};
use pathfinding::directed::dijkstra::dijkstra;

/// Follow the tile path leaving `start_pos` in `dir` until the next flag.
///
/// At each tile past the first the walk takes the unique non-reverse
/// direction carrying a path bit. Returns `None` when no path leaves in
/// `dir` or the walk dead-ends (a path stub toward a building has no
/// continuation and no flag).
pub fn trace_road(map: &MapStore, start_pos: MapPos, mut dir: Direction) -> Option<Road> {
    if !map.has_path(start_pos, dir) {
        return None;
    }

    let geom = map.geom();
    let mut road = Road::start(start_pos);
    let mut pos = start_pos;

    loop {
        road.extend(dir);
        pos = geom.do_move(pos, dir);

        if map.has_flag(pos) && pos != start_pos {
            return Some(road);
        }

        match cycle_cw().find(|&d| map.has_path(pos, d) && d != dir.reverse()) {
            Some(next) => dir = next,
            None => return None,
        }
    }
}

/// Result of a flag-graph search.
#[derive(Copy, Clone, Debug)]
pub struct FlagSearchResult {
    /// Number of flag-to-flag hops.
    pub flag_dist: u32,
    /// Total tile length along the hops.
    pub tile_dist: u32,
    /// Whether an intermediate flag (neither endpoint) is the castle flag.
    pub contains_castle_flag: bool,
}

/// Find the best flag path from `start_flag` to `target_flag`.
///
/// Priority is the flag count. After the target is reached each edge of the
/// winning path is re-traced to accumulate tile distance and to test the
/// intermediate flags against the castle flag position.
pub fn flag_search(
    map: &MapStore,
    start_flag: MapPos,
    target_flag: MapPos,
    castle_flag_pos: Option<MapPos>,
) -> Option<FlagSearchResult> {
    let geom = map.geom();

    let (flag_path, flag_dist) = dijkstra(
        &start_flag,
        |&pos| {
            cycle_cw()
                .filter_map(|d| trace_road(map, pos, d))
                .map(|road| (road.end(geom), 1u32))
                .collect::<Vec<_>>()
        },
        |&pos| pos == target_flag,
    )?;

    let mut tile_dist = 0u32;
    for window in flag_path.windows(2) {
        let (from, to) = (window[0], window[1]);
        let edge = cycle_cw()
            .filter_map(|d| trace_road(map, from, d))
            .find(|road| road.end(geom) == to);
        match edge {
            Some(road) => tile_dist += road.length() as u32,
            None => {
                // The road network changed under the search.
                debug!(
                    "flag path edge {} -> {} vanished during retrace",
                    from.packed_repr(),
                    to.packed_repr()
                );
                return None;
            }
        }
    }

    let contains_castle_flag = match castle_flag_pos {
        Some(castle) if flag_path.len() >= 2 => flag_path[1..flag_path.len() - 1]
            .iter()
            .any(|&pos| pos == castle),
        _ => false,
    };

    trace!(
        "flag_search {} -> {}: flag_dist={}, tile_dist={}, castle={}",
        start_flag.packed_repr(),
        target_flag.packed_repr(),
        flag_dist,
        tile_dist,
        contains_castle_flag
    );

    Some(FlagSearchResult {
        flag_dist,
        tile_dist,
        contains_castle_flag,
    })
}

/// Search from `flag_pos` to the builder's target and record the score.
/// Returns false when no flag path exists.
pub fn find_flag_and_tile_dist(
    map: &MapStore,
    rb: &mut RoadBuilder,
    flag_pos: MapPos,
    castle_flag_pos: Option<MapPos>,
) -> bool {
    match flag_search(map, flag_pos, rb.target_pos(), castle_flag_pos) {
        Some(result) => {
            rb.set_score(
                flag_pos,
                FlagScore {
                    flag_dist: result.flag_dist,
                    tile_dist: result.tile_dist,
                    contains_castle_flag: result.contains_castle_flag,
                },
            );
            true
        }
        None => false,
    }
}

/// Score a candidate end flag for the builder, handling three shapes:
///
/// * the candidate is the target itself: perfect score;
/// * a real flag: plain flag search;
/// * a fake flag (a split of an existing road where no flag stands yet):
///   flag search from each of the two real flags adjacent along the road,
///   taking the better-scoring side plus the traced tile distance to it.
pub fn score_flag(
    map: &MapStore,
    rb: &mut RoadBuilder,
    road_options: RoadOptions,
    flag_pos: MapPos,
    castle_flag_pos: Option<MapPos>,
) -> bool {
    let geom = map.geom();

    if !map.has_flag(flag_pos) {
        // Fake flag. Its own serf-path bookkeeping does not exist yet, so
        // the score is borrowed from the better adjacent flag.
        let splitting_flag_pos = flag_pos;
        let mut best_adjusted_score = BAD_SCORE;

        for dir in cycle_cw() {
            let Some(split_road) = trace_road(map, splitting_flag_pos, dir) else {
                continue;
            };
            let adjacent_flag_pos = split_road.end(geom);
            let tiles_to_adjacent = split_road.length() as u32;

            if !rb.has_score(adjacent_flag_pos)
                && !find_flag_and_tile_dist(map, rb, adjacent_flag_pos, castle_flag_pos)
            {
                trace!(
                    "no flag path from adjacent flag {}, leaving sentinel score",
                    adjacent_flag_pos.packed_repr()
                );
            }

            let score = rb.get_score(adjacent_flag_pos);
            let tile_dist = score.tile_dist + tiles_to_adjacent;
            let flag_dist = score.flag_dist + 1;
            let contains_castle_flag = score.contains_castle_flag;

            // The comparison score counts the split-to-adjacent stretch a
            // second time; candidate selection keys on this adjusted value.
            let mut adjusted_score = tile_dist + tiles_to_adjacent + flag_dist;
            if road_options.contains(RoadOptions::PENALIZE_CASTLE_FLAG) && contains_castle_flag
            {
                adjusted_score += CASTLE_FLAG_PENALTY;
            }

            if adjusted_score < best_adjusted_score {
                best_adjusted_score = adjusted_score;
                rb.set_score(
                    splitting_flag_pos,
                    FlagScore {
                        flag_dist,
                        tile_dist,
                        contains_castle_flag,
                    },
                );
            }
        }
        return true;
    }

    if flag_pos == rb.target_pos() {
        // A direct route; only the new segment's length will count.
        rb.set_score(
            flag_pos,
            FlagScore {
                flag_dist: 0,
                tile_dist: 0,
                contains_castle_flag: false,
            },
        );
        return true;
    }

    find_flag_and_tile_dist(map, rb, flag_pos, castle_flag_pos)
}
