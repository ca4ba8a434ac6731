//! Road-network construction: affinity targets, candidate plotting and
//! scoring, and the build-or-keep decision against existing roads.

use super::AiPlanner;
use crate::error::Error;
use crate::flag_search::{find_flag_and_tile_dist, score_flag, trace_road};
use crate::geometry::{cycle_ccw, cycle_cw, spiral_dist, MapPos};
use crate::pathfinder::plot_road;
use crate::roadbuilder::{RoadBuilder, RoadEnds, RoadOptions, CASTLE_FLAG_PENALTY};
use crate::world::{BuildingType, GameState};
use itertools::Itertools;
use log::{debug, info, trace};

/// Preferred connection targets per building type, strongest first.
/// Anything absent here connects to the nearest stock.
pub fn affinity(kind: BuildingType) -> [Option<BuildingType>; 2] {
    use BuildingType::*;
    match kind {
        Lumberjack => [Some(Sawmill), None],
        StoneMine => [Some(Baker), None],
        CoalMine => [Some(WeaponSmith), Some(SteelSmelter)],
        IronMine => [Some(Baker), Some(SteelSmelter)],
        GoldMine => [Some(Baker), Some(GoldSmelter)],
        Farm => [Some(Mill), None],
        Butcher => [Some(GoldMine), Some(IronMine)],
        PigFarm => [Some(Butcher), Some(CoalMine)],
        Mill => [Some(Farm), None],
        Baker => [Some(Mill), Some(CoalMine)],
        SteelSmelter => [Some(IronMine), Some(CoalMine)],
        WeaponSmith => [Some(SteelSmelter), Some(CoalMine)],
        GoldSmelter => [Some(GoldMine), Some(CoalMine)],
        _ => [None, None],
    }
}

/// Score of a potential new road: tiles beyond the end flag, the new
/// segment priced by the length penalty, flags beyond the end flag, and
/// the castle-flag surcharge.
pub fn proad_score(
    tile_dist: u32,
    flag_dist: u32,
    new_length: u32,
    options: RoadOptions,
    contains_castle_flag: bool,
) -> u32 {
    let mut score = (tile_dist as f64
        + new_length as f64 * options.new_length_penalty()
        + flag_dist as f64) as u32;
    if options.contains(RoadOptions::PENALIZE_CASTLE_FLAG) && contains_castle_flag {
        score += CASTLE_FLAG_PENALTY;
    }
    score
}

/// Score of an existing road; no new length is paid.
pub fn eroad_score(
    tile_dist: u32,
    flag_dist: u32,
    options: RoadOptions,
    contains_castle_flag: bool,
) -> u32 {
    let mut score = tile_dist + flag_dist;
    if options.contains(RoadOptions::PENALIZE_CASTLE_FLAG) && contains_castle_flag {
        score += CASTLE_FLAG_PENALTY;
    }
    score
}

/// A new road must beat the existing one decisively, not marginally.
pub fn significantly_better(proad: u32, best_eroad: u32) -> bool {
    (proad as f64) * 1.5 + 2.0 < best_eroad as f64
}

struct ScoredCandidate {
    proad_index: u32,
    end_pos: MapPos,
    score: u32,
}

impl AiPlanner {
    /// Flag positions this flag wants to connect to: its building's
    /// affinity targets, falling back to the nearest stock.
    pub(super) fn get_affinity(&self, state: &GameState, flag_pos: MapPos) -> Vec<MapPos> {
        let geom = state.map().geom();
        let nearest_stock = self.find_nearest_stock(state, flag_pos);

        let building_kind = state
            .get_flag_at(flag_pos)
            .and_then(|flag| flag.building)
            .and_then(|index| state.building(index))
            .map(|building| building.kind);

        let Some(kind) = building_kind else {
            return nearest_stock.into_iter().collect();
        };

        let pair = affinity(kind);
        if pair == [None, None] {
            return nearest_stock.into_iter().collect();
        }

        let mut targets = Vec::new();
        let mut missing = 0;
        for wanted in pair.into_iter().flatten() {
            if self.completed_count(wanted) == 0 {
                missing += 1;
                continue;
            }
            match super::util::find_nearest_building(
                state,
                flag_pos,
                spiral_dist(9),
                wanted,
            ) {
                Some(pos) => targets.push(geom.move_down_right(pos)),
                None => {
                    // Not nearby; take any completed, connected one in the
                    // realm.
                    let fallback = state
                        .player_buildings(self.player)
                        .into_iter()
                        .filter_map(|i| state.building(i))
                        .find(|b| b.kind == wanted && b.done && !b.burning)
                        .map(|b| geom.move_down_right(b.pos));
                    match fallback {
                        Some(pos) => targets.push(pos),
                        None => missing += 1,
                    }
                }
            }
        }

        if targets.is_empty() && missing > 0 {
            return nearest_stock.into_iter().collect();
        }
        targets
    }

    /// Connect `start_pos` to the road network, aiming at its affinity
    /// targets (or the given override). Returns whether any road was built.
    pub fn build_best_road(
        &mut self,
        state: &mut GameState,
        start_pos: MapPos,
        road_options: RoadOptions,
        optional_affinity: Option<BuildingType>,
        optional_target: Option<MapPos>,
    ) -> Result<bool, Error> {
        let geom = state.map().geom().clone();

        if state.get_flag_at(start_pos).is_none() {
            return Err(Error::InvalidArgument(format!(
                "no flag at road start {}",
                start_pos.packed_repr()
            )));
        }
        if state.map().owner(start_pos) != Some(self.player) {
            return Err(Error::InvalidArgument(format!(
                "road start {} not owned by player {}",
                start_pos.packed_repr(),
                self.player
            )));
        }

        let start_connected = state
            .get_flag_at(start_pos)
            .map(|f| f.is_connected())
            .unwrap_or(false);

        if start_connected {
            // Skip when no further path can leave the flag at all.
            let start_flag = state.get_flag_at(start_pos).expect("checked above");
            let can_extend = cycle_ccw().any(|d| {
                !start_flag.has_path(d) && state.map().is_road_segment_valid(start_pos, d)
            });
            if !can_extend {
                debug!(
                    "flag {} has no free buildable direction",
                    start_pos.packed_repr()
                );
                return Ok(false);
            }
        }

        // Decide the targets to aim for.
        let targets: Vec<MapPos> = if let Some(kind) = optional_affinity {
            match super::util::find_nearest_completed_building(
                state,
                start_pos,
                spiral_dist(15),
                kind,
            )
            .map(|pos| geom.move_down_right(pos))
            .or_else(|| {
                state
                    .player_buildings(self.player)
                    .into_iter()
                    .filter_map(|i| state.building(i))
                    .find(|b| b.kind == kind && b.done && !b.burning)
                    .map(|b| geom.move_down_right(b.pos))
            }) {
                Some(pos) => vec![pos],
                None => return Ok(false),
            }
        } else if let Some(target) = optional_target {
            if state.map().has_flag(target) {
                vec![target]
            } else if state.map().has_building(target) {
                vec![geom.move_down_right(target)]
            } else {
                return Err(Error::InvalidArgument(
                    "target position has neither flag nor building".into(),
                ));
            }
        } else {
            self.get_affinity(state, start_pos)
        };

        let mut roads_built = 0usize;
        let target_count = targets.len();

        for target_pos in targets {
            if target_pos == start_pos {
                continue;
            }
            debug!(
                "road target {} for start {}",
                target_pos.packed_repr(),
                start_pos.packed_repr()
            );

            if road_options.contains(RoadOptions::DIRECT) {
                // One straight connection, no comparisons.
                let player = self.player;
                let plot = plot_road(
                    state.map(),
                    start_pos,
                    target_pos,
                    &|pos| state.can_build_flag(pos, player),
                    None,
                    &mut self.rng,
                );
                match plot.direct {
                    Some(road) => {
                        state.build_road(&road, self.player)?;
                        roads_built += 1;
                        continue;
                    }
                    None => return Ok(roads_built > 0),
                }
            }

            if self.build_scored_road(state, start_pos, target_pos, road_options)? {
                roads_built += 1;
            }
        }

        debug!(
            "build_best_road from {}: built {} of {} targets",
            start_pos.packed_repr(),
            roads_built,
            target_count
        );
        Ok(roads_built > 0)
    }

    /// The non-direct path: gather nearby flags, plot and score candidate
    /// roads (including splits), compare against existing roads, build the
    /// best acceptable one.
    fn build_scored_road(
        &mut self,
        state: &mut GameState,
        start_pos: MapPos,
        target_pos: MapPos,
        road_options: RoadOptions,
    ) -> Result<bool, Error> {
        let geom = state.map().geom().clone();
        let improve = road_options.contains(RoadOptions::IMPROVE);
        let start_connected = state
            .get_flag_at(start_pos)
            .map(|f| f.is_connected())
            .unwrap_or(false);

        let mut rb = RoadBuilder::new(start_pos, target_pos);
        let mut nearby_flags: Vec<MapPos> = Vec::new();

        // Existing roads from the start flag are improvement baselines.
        if start_connected && improve {
            for dir in cycle_cw() {
                let Some(existing) = trace_road(state.map(), start_pos, dir) else {
                    continue;
                };
                let end_pos = existing.end(&geom);
                if let Some(ends) = RoadEnds::of_road(&geom, &existing) {
                    rb.new_eroad(ends, existing);
                    nearby_flags.push(end_pos);
                }
            }
        }

        // Candidate end flags around the midpoint of the route. The target
        // itself is always a candidate. Out to ring 6 normally; the search
        // widens to ring 15 while fewer than two flags are known.
        let halfway_pos = geom.halfway_pos(start_pos, target_pos);
        nearby_flags.push(target_pos);
        for i in 0..spiral_dist(15) {
            let Ok(pos) = geom.pos_add_extended_spirally(halfway_pos, i) else {
                break;
            };
            if !state.map().has_flag(pos) || state.map().owner(pos) != Some(self.player) {
                continue;
            }
            if pos == start_pos {
                continue;
            }
            let connected = state
                .get_flag_at(pos)
                .map(|f| f.is_connected())
                .unwrap_or(false);
            if !connected && Some(pos) != self.castle_flag_pos {
                continue;
            }
            if !nearby_flags.contains(&pos) {
                nearby_flags.push(pos);
            }
            if i >= spiral_dist(6) && nearby_flags.len() >= 2 {
                break;
            }
        }

        let ideal_length = geom.straightline_tile_dist(start_pos, target_pos).max(1);
        let hold_pos = road_options
            .contains(RoadOptions::HOLD_BUILDING_POS)
            .then(|| geom.move_up_left(target_pos));

        // Plot a road to every candidate, keeping those whose new length
        // alone stays under the convolution cap.
        let player = self.player;
        for end_pos in nearby_flags {
            let plot = plot_road(
                state.map(),
                start_pos,
                end_pos,
                &|pos| state.can_build_flag(pos, player),
                hold_pos,
                &mut self.rng,
            );

            if let Some(road) = plot.direct {
                let convolution = road.length() as f64 / ideal_length as f64;
                if convolution < self.config.max_convolution {
                    if let Some(ends) = RoadEnds::of_road(&geom, &road) {
                        rb.new_proad(ends, road, false);
                    }
                } else {
                    trace!(
                        "candidate to {} too convoluted ({:.2})",
                        end_pos.packed_repr(),
                        convolution
                    );
                }
            }

            if !road_options.contains(RoadOptions::SPLIT_ROADS) {
                continue;
            }
            for split in plot.split_candidates {
                if split.is_empty() {
                    continue;
                }
                let convolution = split.length() as f64 / ideal_length as f64;
                if convolution >= self.config.max_convolution {
                    continue;
                }
                if let Some(ends) = RoadEnds::of_road(&geom, &split) {
                    rb.new_proad(ends, split, true);
                }
            }
        }

        // Baseline: the best complete existing solution from start to
        // target, when improvement was requested.
        let mut best_eroad_score: Option<u32> = None;
        if start_connected && improve {
            let eroad_ends: Vec<MapPos> = rb.eroads().map(|er| er.ends.pos_b).collect();
            for end_pos in eroad_ends {
                if !find_flag_and_tile_dist(state.map(), &mut rb, end_pos, self.castle_flag_pos) {
                    continue;
                }
                let flag_score = rb.get_score(end_pos);
                let score = eroad_score(
                    flag_score.tile_dist,
                    flag_score.flag_dist,
                    road_options,
                    flag_score.contains_castle_flag,
                );
                if best_eroad_score.map_or(true, |best| score < best) {
                    best_eroad_score = Some(score);
                }
            }
        }

        // Score the potential roads.
        let proad_list: Vec<(u32, MapPos, u32)> = rb
            .proads()
            .map(|p| (p.index, p.ends.pos_b, p.road.length() as u32))
            .collect();
        let mut scored: Vec<ScoredCandidate> = Vec::new();
        for (proad_index, end_pos, new_length) in proad_list {
            if !score_flag(
                state.map(),
                &mut rb,
                road_options,
                end_pos,
                self.castle_flag_pos,
            ) {
                continue;
            }
            let flag_score = rb.get_score(end_pos);
            let score = proad_score(
                flag_score.tile_dist,
                flag_score.flag_dist,
                new_length,
                road_options,
                flag_score.contains_castle_flag,
            );
            scored.push(ScoredCandidate {
                proad_index,
                end_pos,
                score,
            });
        }

        // Best first; the monotonic index keeps ties deterministic.
        let scored: Vec<ScoredCandidate> = scored
            .into_iter()
            .sorted_by_key(|c| (c.score, c.proad_index))
            .collect();

        for candidate in scored {
            if let Some(best_eroad) = best_eroad_score {
                if !significantly_better(candidate.score, best_eroad) {
                    debug!(
                        "candidate score {} not significantly better than existing {}; keeping the road network as is",
                        candidate.score, best_eroad
                    );
                    break;
                }
            }

            let road = match rb.get_proad(candidate.proad_index) {
                Some(proad) => proad.road.clone(),
                None => continue,
            };

            // Split solutions end where no flag exists yet.
            let mut created_new_flag = false;
            if state.get_flag_at(candidate.end_pos).is_none() {
                match state.build_flag(candidate.end_pos, self.player) {
                    Ok(_) => created_new_flag = true,
                    Err(_) => {
                        debug!(
                            "could not create split flag at {}",
                            candidate.end_pos.packed_repr()
                        );
                        continue;
                    }
                }
            }

            match state.build_road(&road, self.player) {
                Ok(()) => {
                    info!(
                        "connected {} to {} (score {})",
                        start_pos.packed_repr(),
                        candidate.end_pos.packed_repr(),
                        candidate.score
                    );
                    return Ok(true);
                }
                Err(_) => {
                    // Revert the flag we just created and try the next
                    // candidate.
                    if created_new_flag {
                        let _ = state.demolish_flag(candidate.end_pos, self.player);
                    }
                }
            }
        }

        Ok(false)
    }

    /// Reconnect own flags that lost their road network.
    pub(super) fn do_connect_disconnected_flags(&mut self, state: &mut GameState) {
        let flag_info: Vec<(MapPos, bool)> = state
            .player_flags(self.player)
            .into_iter()
            .filter_map(|i| state.flag(i))
            .map(|f| (f.pos, f.is_connected() || f.accepts_serfs))
            .collect();

        for (pos, connected) in flag_info {
            if connected || Some(pos) == self.castle_flag_pos {
                continue;
            }
            debug!("reconnecting isolated flag at {}", pos.packed_repr());
            let _ = self.build_best_road(state, pos, RoadOptions::standard(), None, None);
        }
    }
}
