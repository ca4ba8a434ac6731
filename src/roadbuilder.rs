//! Per-attempt cache of explored roads and flag scores.
//!
//! One `RoadBuilder` lives for a single build-best-road invocation. It holds
//! the existing roads traced from the start flag (eroads), the potential new
//! roads plotted by the pathfinder (proads) and the flag scores computed by
//! the flag-graph search.

use crate::geometry::{Direction, MapGeometry, MapPos};
use crate::road::Road;
use bitflags::bitflags;
use fnv::FnvHashMap;

/// Sentinel score for unknown flags. Deliberately far below integer max:
/// penalties and lengths are added on top of scores, and an integer-max
/// sentinel would wrap around into a winning score.
pub const BAD_SCORE: u32 = 123_123_123;

/// Score penalty when a candidate's flag path runs through the castle flag.
pub const CASTLE_FLAG_PENALTY: u32 = 10;

bitflags! {
    /// Behaviour switches for one road-building attempt.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct RoadOptions: u16 {
        /// Build the single straight A* result; skip split-road discovery
        /// and build even when a path already exists.
        const DIRECT = 1 << 0;
        /// Consider split-road candidates as targets.
        const SPLIT_ROADS = 1 << 1;
        /// Multiply new-segment length by 2.5 when scoring.
        const PENALIZE_NEW_LENGTH = 1 << 2;
        /// Lower the new-length multiplier to 1.75.
        const REDUCED_NEW_LENGTH_PENALTY = 1 << 3;
        /// Add [`CASTLE_FLAG_PENALTY`] when the flag path crosses the
        /// castle flag without either endpoint being it.
        const PENALIZE_CASTLE_FLAG = 1 << 4;
        /// Allow extending from a flag that already has paths, comparing
        /// new solutions against the existing ones.
        const IMPROVE = 1 << 5;
        /// Keep roads out of the up-left neighbour of a planned building
        /// site.
        const HOLD_BUILDING_POS = 1 << 6;
        /// Recognised but without effect.
        const AVOID_CASTLE_AREA = 1 << 7;
    }
}

impl RoadOptions {
    /// The usual mix for connecting a new building.
    pub fn standard() -> RoadOptions {
        RoadOptions::SPLIT_ROADS
            | RoadOptions::PENALIZE_NEW_LENGTH
            | RoadOptions::PENALIZE_CASTLE_FLAG
    }

    /// New-segment length multiplier in effect.
    pub fn new_length_penalty(self) -> f64 {
        if self.contains(RoadOptions::REDUCED_NEW_LENGTH_PENALTY) {
            1.75
        } else if self.contains(RoadOptions::PENALIZE_NEW_LENGTH) {
            2.5
        } else {
            1.0
        }
    }
}

/// Identity of a traced road: both end positions with the direction each
/// end leaves by.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct RoadEnds {
    pub pos_a: MapPos,
    pub dir_a: Direction,
    pub pos_b: MapPos,
    pub dir_b: Direction,
}

impl RoadEnds {
    /// Derive the ends of a non-empty road. The direction at the far end is
    /// the reverse of the road's last step, the one leading back along it.
    pub fn of_road(geom: &MapGeometry, road: &Road) -> Option<RoadEnds> {
        let first = road.first()?;
        let last = road.last()?;
        Some(RoadEnds {
            pos_a: road.source(),
            dir_a: first,
            pos_b: road.end(geom),
            dir_b: last.reverse(),
        })
    }

    /// The same road seen from the other end.
    pub fn flipped(self) -> RoadEnds {
        RoadEnds {
            pos_a: self.pos_b,
            dir_a: self.dir_b,
            pos_b: self.pos_a,
            dir_b: self.dir_a,
        }
    }
}

/// Distance of a flag to the attempt's target, as found by flag search.
#[derive(Copy, Clone, Debug)]
pub struct FlagScore {
    pub flag_dist: u32,
    pub tile_dist: u32,
    pub contains_castle_flag: bool,
}

impl FlagScore {
    pub fn bad() -> FlagScore {
        FlagScore {
            flag_dist: BAD_SCORE,
            tile_dist: BAD_SCORE,
            contains_castle_flag: false,
        }
    }
}

/// A road known to the builder, existing or potential.
#[derive(Clone, Debug)]
pub struct CachedRoad {
    pub index: u32,
    pub ends: RoadEnds,
    pub road: Road,
    /// Set on potential roads that end on a split of an existing road
    /// where a new flag would have to be created.
    pub is_split_solution: bool,
}

/// Short-lived state for one road-building attempt.
///
/// Potential roads are identified by a monotonic index, never by their
/// endpoints: distinct split solutions can share both ends.
pub struct RoadBuilder {
    start_pos: MapPos,
    target_pos: MapPos,
    eroads: FnvHashMap<RoadEnds, CachedRoad>,
    proads: Vec<CachedRoad>,
    scores: FnvHashMap<MapPos, FlagScore>,
    next_index: u32,
}

impl RoadBuilder {
    pub fn new(start_pos: MapPos, target_pos: MapPos) -> RoadBuilder {
        RoadBuilder {
            start_pos,
            target_pos,
            eroads: FnvHashMap::default(),
            proads: Vec::new(),
            scores: FnvHashMap::default(),
            next_index: 0,
        }
    }

    #[inline]
    pub fn start_pos(&self) -> MapPos {
        self.start_pos
    }

    #[inline]
    pub fn target_pos(&self) -> MapPos {
        self.target_pos
    }

    fn take_index(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    pub fn new_eroad(&mut self, ends: RoadEnds, road: Road) {
        let index = self.take_index();
        self.eroads.insert(
            ends,
            CachedRoad {
                index,
                ends,
                road,
                is_split_solution: false,
            },
        );
    }

    /// Register a potential road and return its index.
    pub fn new_proad(&mut self, ends: RoadEnds, road: Road, is_split_solution: bool) -> u32 {
        let index = self.take_index();
        self.proads.push(CachedRoad {
            index,
            ends,
            road,
            is_split_solution,
        });
        index
    }

    pub fn eroads(&self) -> impl Iterator<Item = &CachedRoad> {
        self.eroads.values()
    }

    pub fn proads(&self) -> impl Iterator<Item = &CachedRoad> {
        self.proads.iter()
    }

    pub fn get_eroad(&self, ends: RoadEnds) -> Option<&CachedRoad> {
        self.eroads
            .get(&ends)
            .or_else(|| self.eroads.get(&ends.flipped()))
    }

    pub fn get_proad(&self, index: u32) -> Option<&CachedRoad> {
        self.proads.iter().find(|road| road.index == index)
    }

    pub fn has_score(&self, pos: MapPos) -> bool {
        self.scores.contains_key(&pos)
    }

    /// Overwrites any earlier score for the position.
    pub fn set_score(&mut self, pos: MapPos, score: FlagScore) {
        self.scores.insert(pos, score);
    }

    /// The score of a flag, or the bad sentinel when the flag was never
    /// scored.
    pub fn get_score(&self, pos: MapPos) -> FlagScore {
        self.scores.get(&pos).copied().unwrap_or_else(FlagScore::bad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MapGeometry;

    fn sample_road(geom: &MapGeometry) -> Road {
        let mut road = Road::start(geom.pos(4, 4));
        road.extend(Direction::Right);
        road.extend(Direction::DownRight);
        road
    }

    #[test]
    fn road_ends_of_road() {
        let geom = MapGeometry::new(3).unwrap();
        let road = sample_road(&geom);
        let ends = RoadEnds::of_road(&geom, &road).unwrap();
        assert_eq!(ends.pos_a, geom.pos(4, 4));
        assert_eq!(ends.dir_a, Direction::Right);
        assert_eq!(ends.pos_b, geom.pos(6, 5));
        assert_eq!(ends.dir_b, Direction::UpLeft);

        assert!(RoadEnds::of_road(&geom, &Road::start(geom.pos(0, 0))).is_none());
    }

    #[test]
    fn proad_indices_are_unique_even_for_equal_ends() {
        let geom = MapGeometry::new(3).unwrap();
        let road = sample_road(&geom);
        let ends = RoadEnds::of_road(&geom, &road).unwrap();

        let mut rb = RoadBuilder::new(geom.pos(4, 4), geom.pos(20, 20));
        let a = rb.new_proad(ends, road.clone(), false);
        let b = rb.new_proad(ends, road, true);
        assert_ne!(a, b);
        assert_eq!(rb.proads().count(), 2);
        assert!(rb.get_proad(a).is_some());
        assert!(!rb.get_proad(a).unwrap().is_split_solution);
        assert!(rb.get_proad(b).unwrap().is_split_solution);
    }

    #[test]
    fn eroad_lookup_accepts_either_orientation() {
        let geom = MapGeometry::new(3).unwrap();
        let road = sample_road(&geom);
        let ends = RoadEnds::of_road(&geom, &road).unwrap();

        let mut rb = RoadBuilder::new(geom.pos(4, 4), geom.pos(20, 20));
        rb.new_eroad(ends, road);
        assert!(rb.get_eroad(ends).is_some());
        assert!(rb.get_eroad(ends.flipped()).is_some());
    }

    #[test]
    fn missing_score_is_the_bad_sentinel() {
        let geom = MapGeometry::new(3).unwrap();
        let rb = RoadBuilder::new(geom.pos(0, 0), geom.pos(1, 1));
        let score = rb.get_score(geom.pos(9, 9));
        assert_eq!(score.flag_dist, BAD_SCORE);
        assert_eq!(score.tile_dist, BAD_SCORE);
        // Twice the sentinel plus penalties must not wrap.
        assert!(BAD_SCORE.checked_mul(2).is_some());
    }

    #[test]
    fn set_score_overwrites() {
        let geom = MapGeometry::new(3).unwrap();
        let mut rb = RoadBuilder::new(geom.pos(0, 0), geom.pos(1, 1));
        let pos = geom.pos(5, 5);
        rb.set_score(
            pos,
            FlagScore {
                flag_dist: 3,
                tile_dist: 12,
                contains_castle_flag: false,
            },
        );
        rb.set_score(
            pos,
            FlagScore {
                flag_dist: 1,
                tile_dist: 4,
                contains_castle_flag: true,
            },
        );
        let score = rb.get_score(pos);
        assert_eq!(score.flag_dist, 1);
        assert_eq!(score.tile_dist, 4);
        assert!(score.contains_castle_flag);
    }
}
