//! A road: a source position plus an ordered list of directions.

use crate::geometry::{Direction, MapGeometry, MapPos};
use serde::{Deserialize, Serialize};

/// An ordered walk over tile edges. Roads are plotted by the pathfinder,
/// traced from existing path bits, and handed to the world to be built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Road {
    source: MapPos,
    dirs: Vec<Direction>,
}

impl Road {
    pub fn start(source: MapPos) -> Road {
        Road {
            source,
            dirs: Vec::new(),
        }
    }

    #[inline]
    pub fn source(&self) -> MapPos {
        self.source
    }

    #[inline]
    pub fn dirs(&self) -> &[Direction] {
        &self.dirs
    }

    /// Number of tile edges.
    #[inline]
    pub fn length(&self) -> usize {
        self.dirs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn extend(&mut self, dir: Direction) {
        self.dirs.push(dir);
    }

    /// First direction out of the source. Empty roads have none.
    pub fn first(&self) -> Option<Direction> {
        self.dirs.first().copied()
    }

    /// Last direction, the one arriving at the end position.
    pub fn last(&self) -> Option<Direction> {
        self.dirs.last().copied()
    }

    /// End position, computed by folding the directions from the source.
    pub fn end(&self, geom: &MapGeometry) -> MapPos {
        self.dirs
            .iter()
            .fold(self.source, |pos, &dir| geom.do_move(pos, dir))
    }

    /// The reversed road: end becomes source and every direction inverts.
    pub fn reversed(&self, geom: &MapGeometry) -> Road {
        let mut reversed = Road::start(self.end(geom));
        for &dir in self.dirs.iter().rev() {
            reversed.extend(dir.reverse());
        }
        reversed
    }

    /// Whether the walk visits `pos` (source and end included).
    pub fn has_pos(&self, geom: &MapGeometry, pos: MapPos) -> bool {
        let mut current = self.source;
        if current == pos {
            return true;
        }
        for &dir in &self.dirs {
            current = geom.do_move(current, dir);
            if current == pos {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> MapGeometry {
        MapGeometry::new(3).unwrap()
    }

    #[test]
    fn end_folds_directions() {
        let geom = geom();
        let mut road = Road::start(geom.pos(5, 5));
        road.extend(Direction::Right);
        road.extend(Direction::DownRight);
        road.extend(Direction::Down);
        assert_eq!(road.length(), 3);
        assert_eq!(road.end(&geom), geom.pos(7, 7));
    }

    #[test]
    fn reverse_swaps_ends() {
        let geom = geom();
        let mut road = Road::start(geom.pos(5, 5));
        road.extend(Direction::Right);
        road.extend(Direction::Up);
        road.extend(Direction::Right);

        let reversed = road.reversed(&geom);
        assert_eq!(reversed.source(), road.end(&geom));
        assert_eq!(reversed.end(&geom), road.source());
        assert_eq!(reversed.length(), road.length());
        assert_eq!(reversed.first(), Some(Direction::Left));
    }

    #[test]
    fn double_reverse_is_identity() {
        let geom = geom();
        let mut road = Road::start(geom.pos(0, 63));
        for dir in [
            Direction::Down,
            Direction::Down,
            Direction::Right,
            Direction::UpLeft,
        ] {
            road.extend(dir);
        }
        assert_eq!(road.reversed(&geom).reversed(&geom), road);
    }

    #[test]
    fn has_pos_walks_the_road() {
        let geom = geom();
        let mut road = Road::start(geom.pos(5, 5));
        road.extend(Direction::Right);
        road.extend(Direction::Right);
        assert!(road.has_pos(&geom, geom.pos(5, 5)));
        assert!(road.has_pos(&geom, geom.pos(6, 5)));
        assert!(road.has_pos(&geom, geom.pos(7, 5)));
        assert!(!road.has_pos(&geom, geom.pos(8, 5)));
    }
}
