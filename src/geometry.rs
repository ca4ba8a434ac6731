//! Hex-grid geometry: directions, packed map positions and spiral patterns.
//!
//! The grid is a sheared hexagonal torus. Three of the six directions carry a
//! +1 column step and the opposing three a -1 column step; likewise for rows.
//! Column and row counts are powers of two so all wrap arithmetic is masking.

use crate::error::Error;
use crate::random::RandomStream;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::OnceLock;

/// The six map directions in clockwise order.
///
/// ```text
///    A ______ B
///     /\    /
///    /  \  /
/// C /____\/ D
/// ```
///
/// Right: A to B, DownRight: A to D, Down: A to C,
/// Left: D to C, UpLeft: D to A, Up: D to B.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    Right = 0,
    DownRight = 1,
    Down = 2,
    Left = 3,
    UpLeft = 4,
    Up = 5,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::Right,
        Direction::DownRight,
        Direction::Down,
        Direction::Left,
        Direction::UpLeft,
        Direction::Up,
    ];

    #[inline]
    pub fn from_index(index: usize) -> Direction {
        Self::ALL[index % 6]
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Turn clockwise in 60 degree increments. Negative turns
    /// counter-clockwise.
    #[inline]
    pub fn turn_cw(self, times: i32) -> Direction {
        let td = (self as i32 + times).rem_euclid(6);
        Self::ALL[td as usize]
    }

    #[inline]
    pub fn reverse(self) -> Direction {
        self.turn_cw(3)
    }
}

/// Iterate the six directions clockwise starting from `start`.
pub fn cycle_directions_cw(start: Direction, length: usize) -> impl Iterator<Item = Direction> {
    (0..length).map(move |offset| start.turn_cw(offset as i32))
}

/// Iterate the six directions counter-clockwise starting from `start`.
pub fn cycle_directions_ccw(start: Direction, length: usize) -> impl Iterator<Item = Direction> {
    (0..length).map(move |offset| start.turn_cw(-(offset as i32)))
}

/// Full clockwise cycle from Right.
pub fn cycle_cw() -> impl Iterator<Item = Direction> {
    cycle_directions_cw(Direction::Right, 6)
}

/// Full counter-clockwise cycle from Up.
pub fn cycle_ccw() -> impl Iterator<Item = Direction> {
    cycle_directions_ccw(Direction::Up, 6)
}

/// Full clockwise cycle from a uniformly random start direction.
///
/// Placement and search loops use this to defeat directional bias: a road
/// that cannot be plotted leaving in one fixed first direction may still be
/// plotted when another direction is tried first.
pub fn cycle_rand_cw(rng: &mut RandomStream) -> impl Iterator<Item = Direction> {
    let start = Direction::from_index((rng.next() % 6) as usize);
    cycle_directions_cw(start, 6)
}

/// A compact composition of column and row uniquely identifying a vertex.
/// Also used directly as an index into map data arrays.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
#[repr(transparent)]
pub struct MapPos(u32);

impl MapPos {
    #[inline]
    pub fn packed_repr(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_packed(packed: u32) -> Self {
        MapPos(packed)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl Serialize for MapPos {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.packed_repr().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MapPos {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        u32::deserialize(deserializer).map(MapPos::from_packed)
    }
}

pub const MIN_MAP_SIZE: u32 = 3;
pub const MAX_MAP_SIZE: u32 = 10;

/// Maximum ring supported by the extended spiral pattern.
pub const MAX_SPIRAL_RING: u32 = 24;

/// Number of positions within ring `k` inclusive: `1 + 3k(k+1)`.
#[inline]
pub fn spiral_dist(ring: u32) -> u32 {
    debug_assert!(ring <= MAX_SPIRAL_RING);
    1 + 3 * ring * (ring + 1)
}

/// Grid dimensions and wrap arithmetic for one map size.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MapGeometry {
    size: u32,
    col_size: u32,
    row_size: u32,
    cols: u32,
    rows: u32,
    col_mask: u32,
    row_mask: u32,
    row_shift: u32,
}

impl MapGeometry {
    pub fn new(size: u32) -> Result<MapGeometry, Error> {
        if !(MIN_MAP_SIZE..=MAX_MAP_SIZE).contains(&size) {
            return Err(Error::InvalidArgument(format!(
                "map size {} outside supported range {}..={}",
                size, MIN_MAP_SIZE, MAX_MAP_SIZE
            )));
        }

        let col_size = 5 + size / 2;
        let row_size = 5 + (size - 1) / 2;

        Ok(MapGeometry {
            size,
            col_size,
            row_size,
            cols: 1 << col_size,
            rows: 1 << row_size,
            col_mask: (1 << col_size) - 1,
            row_mask: (1 << row_size) - 1,
            row_shift: col_size,
        })
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn cols(&self) -> u32 {
        self.cols
    }

    #[inline]
    pub fn rows(&self) -> u32 {
        self.rows
    }

    #[inline]
    pub fn col_mask(&self) -> u32 {
        self.col_mask
    }

    #[inline]
    pub fn row_mask(&self) -> u32 {
        self.row_mask
    }

    #[inline]
    pub fn tile_count(&self) -> u32 {
        self.cols * self.rows
    }

    /// Number of 32x32 regions; cluster counts in the generator scale
    /// from this.
    #[inline]
    pub fn region_count(&self) -> u32 {
        (self.cols >> 5) * (self.rows >> 5)
    }

    #[inline]
    pub fn pos(&self, col: u32, row: u32) -> MapPos {
        MapPos((row << self.row_shift) | col)
    }

    #[inline]
    pub fn pos_col(&self, pos: MapPos) -> u32 {
        pos.0 & self.col_mask
    }

    #[inline]
    pub fn pos_row(&self, pos: MapPos) -> u32 {
        (pos.0 >> self.row_shift) & self.row_mask
    }

    /// Add signed column/row offsets with wrap.
    #[inline]
    pub fn pos_add(&self, pos: MapPos, dcol: i32, drow: i32) -> MapPos {
        let col = (self.pos_col(pos) as i32 + dcol) as u32 & self.col_mask;
        let row = (self.pos_row(pos) as i32 + drow) as u32 & self.row_mask;
        self.pos(col, row)
    }

    #[inline]
    pub fn do_move(&self, pos: MapPos, dir: Direction) -> MapPos {
        let (dcol, drow) = DIRECTION_OFFSETS[dir.index()];
        self.pos_add(pos, dcol, drow)
    }

    #[inline]
    pub fn move_right(&self, pos: MapPos) -> MapPos {
        self.do_move(pos, Direction::Right)
    }

    #[inline]
    pub fn move_down_right(&self, pos: MapPos) -> MapPos {
        self.do_move(pos, Direction::DownRight)
    }

    #[inline]
    pub fn move_down(&self, pos: MapPos) -> MapPos {
        self.do_move(pos, Direction::Down)
    }

    #[inline]
    pub fn move_left(&self, pos: MapPos) -> MapPos {
        self.do_move(pos, Direction::Left)
    }

    #[inline]
    pub fn move_up_left(&self, pos: MapPos) -> MapPos {
        self.do_move(pos, Direction::UpLeft)
    }

    #[inline]
    pub fn move_up(&self, pos: MapPos) -> MapPos {
        self.do_move(pos, Direction::Up)
    }

    /// The two non-standard diagonals, needed by terrain seeding.
    #[inline]
    pub fn move_up_right(&self, pos: MapPos) -> MapPos {
        self.pos_add(pos, 1, -1)
    }

    #[inline]
    pub fn move_down_left(&self, pos: MapPos) -> MapPos {
        self.pos_add(pos, -1, 1)
    }

    #[inline]
    pub fn move_right_n(&self, pos: MapPos, n: i32) -> MapPos {
        self.pos_add(pos, n, 0)
    }

    #[inline]
    pub fn move_down_n(&self, pos: MapPos, n: i32) -> MapPos {
        self.pos_add(pos, 0, n)
    }

    /// Shortest signed column travel from `pos1` to `pos2` on the torus.
    #[inline]
    pub fn dist_x(&self, pos1: MapPos, pos2: MapPos) -> i32 {
        let half = self.cols / 2;
        let wrapped = half
            .wrapping_add(self.pos_col(pos1))
            .wrapping_sub(self.pos_col(pos2))
            & self.col_mask;
        half as i32 - wrapped as i32
    }

    /// Shortest signed row travel from `pos1` to `pos2` on the torus.
    #[inline]
    pub fn dist_y(&self, pos1: MapPos, pos2: MapPos) -> i32 {
        let half = self.rows / 2;
        let wrapped = half
            .wrapping_add(self.pos_row(pos1))
            .wrapping_sub(self.pos_row(pos2))
            & self.row_mask;
        half as i32 - wrapped as i32
    }

    /// Midpoint of the shortest torus walk from `start` to `end`; AI flag
    /// searches center on it.
    #[inline]
    pub fn halfway_pos(&self, start: MapPos, end: MapPos) -> MapPos {
        self.pos_add(
            start,
            self.dist_x(start, end) / 2,
            self.dist_y(start, end) / 2,
        )
    }

    /// Tile distance along the straightest possible walk between two
    /// positions. When column and row deltas agree in sign the walk can use
    /// the diagonal directions, otherwise each axis must be covered
    /// separately.
    pub fn straightline_tile_dist(&self, start: MapPos, end: MapPos) -> u32 {
        let dist_col = self.dist_x(start, end);
        let dist_row = self.dist_y(start, end);
        if (dist_col > 0 && dist_row > 0) || (dist_col < 0 && dist_row < 0) {
            dist_col.abs().max(dist_row.abs()) as u32
        } else {
            (dist_col.abs() + dist_row.abs()) as u32
        }
    }

    /// Look up a position in the classic spiral pattern. Only indices below
    /// 295 are defined; the terrain generator never asks for more.
    #[inline]
    pub fn pos_add_spirally(&self, pos: MapPos, index: usize) -> MapPos {
        let (dcol, drow) = classic_spiral_pattern()[index];
        self.pos_add(pos, dcol, drow)
    }

    /// Look up a position in the extended spiral pattern, which has complete
    /// rings out to [`MAX_SPIRAL_RING`]. AI searches use this one.
    pub fn pos_add_extended_spirally(&self, pos: MapPos, index: u32) -> Result<MapPos, Error> {
        let pattern = extended_spiral_pattern();
        let (dcol, drow) = *pattern.get(index as usize).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "spiral index {} beyond ring {}",
                index, MAX_SPIRAL_RING
            ))
        })?;
        Ok(self.pos_add(pos, dcol, drow))
    }

    /// A random map position.
    pub fn rnd_coord(&self, rng: &mut RandomStream) -> MapPos {
        let col = rng.next() as u32 & self.col_mask;
        let row = rng.next() as u32 & self.row_mask;
        self.pos(col, row)
    }

    /// Iterate every position in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = MapPos> {
        (0..self.tile_count()).map(MapPos)
    }
}

/// Per-direction (column, row) steps.
pub const DIRECTION_OFFSETS: [(i32, i32); 6] = [
    (1, 0),  // Right
    (1, 1),  // DownRight
    (0, 1),  // Down
    (-1, 0), // Left
    (-1, -1), // UpLeft
    (0, -1), // Up
];

/// Rotation matrix mapping a base offset into each of the six sextants.
const SPIRAL_MATRIX: [[i32; 4]; 6] = [
    [1, 0, 0, 1],
    [1, 1, -1, 0],
    [0, 1, -1, -1],
    [-1, 0, 0, -1],
    [-1, -1, 1, 0],
    [0, -1, 1, 1],
];

/// Base offsets of the classic spiral pattern, one row per six rotations.
/// The order is load-bearing: terrain generation indexes this sequence and
/// changing it changes every generated map. Ring 9 is truncated (the (9,8)
/// row is absent) and the trailing rows jump to distances 16 and 24; both
/// quirks are inherited from the classic data.
const CLASSIC_SPIRAL_BASE: [(i32, i32); 49] = [
    (1, 0),
    (2, 1),
    (2, 0),
    (3, 1),
    (3, 2),
    (3, 0),
    (4, 2),
    (4, 1),
    (4, 3),
    (4, 0),
    (5, 2),
    (5, 3),
    (5, 1),
    (5, 4),
    (5, 0),
    (6, 3),
    (6, 2),
    (6, 4),
    (6, 1),
    (6, 5),
    (6, 0),
    (7, 3),
    (7, 4),
    (7, 2),
    (7, 5),
    (7, 1),
    (7, 6),
    (7, 0),
    (8, 4),
    (8, 3),
    (8, 5),
    (8, 2),
    (8, 6),
    (8, 1),
    (8, 7),
    (8, 0),
    (9, 4),
    (9, 5),
    (9, 3),
    (9, 6),
    (9, 2),
    (9, 7),
    (9, 1),
    (9, 0),
    (16, 0),
    (16, 8),
    (24, 0),
    (24, 8),
    (24, 16),
];

fn expand_base_rows(base: &[(i32, i32)]) -> Vec<(i32, i32)> {
    let mut pattern = Vec::with_capacity(1 + base.len() * 6);
    pattern.push((0, 0));
    for &(x, y) in base {
        for m in &SPIRAL_MATRIX {
            pattern.push((x * m[0] + y * m[2], x * m[1] + y * m[3]));
        }
    }
    pattern
}

/// The classic 295-entry spiral pattern used by terrain generation and the
/// classic game rules.
pub fn classic_spiral_pattern() -> &'static [(i32, i32)] {
    static PATTERN: OnceLock<Vec<(i32, i32)>> = OnceLock::new();
    PATTERN.get_or_init(|| expand_base_rows(&CLASSIC_SPIRAL_BASE))
}

/// The extended spiral pattern with complete rings 0..=24 (1801 positions).
///
/// Base rows per ring follow the same zig-zag the classic table uses, but
/// without the ring-9 truncation or the distance jumps, so AI area searches
/// see every position of every ring.
pub fn extended_spiral_pattern() -> &'static [(i32, i32)] {
    static PATTERN: OnceLock<Vec<(i32, i32)>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut base = Vec::new();
        for k in 1..=MAX_SPIRAL_RING as i32 {
            base.extend(zigzag_row_order(k).into_iter().map(|j| (k, j)));
        }
        expand_base_rows(&base)
    })
}

/// Row order within ring `k`: start at the middle offset and fan outward,
/// finishing at 0. Matches the classic table on the rings it covers.
fn zigzag_row_order(k: i32) -> Vec<i32> {
    let mut order = Vec::with_capacity(k as usize);
    let start = k / 2;
    order.push(start);
    let first_step = if k % 2 == 0 { -1 } else { 1 };
    let mut magnitude = 1;
    while order.len() < k as usize {
        for sign in [first_step, -first_step] {
            let j = start + sign * magnitude;
            if (0..k).contains(&j) && order.len() < k as usize {
                order.push(j);
            }
        }
        magnitude += 1;
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_direction_cycle() {
        let dirs: Vec<Direction> = cycle_cw().collect();
        assert_eq!(
            dirs,
            vec![
                Direction::Right,
                Direction::DownRight,
                Direction::Down,
                Direction::Left,
                Direction::UpLeft,
                Direction::Up
            ]
        );
    }

    #[test]
    fn standard_ccw_direction_cycle() {
        let dirs: Vec<Direction> = cycle_ccw().collect();
        assert_eq!(
            dirs,
            vec![
                Direction::Up,
                Direction::UpLeft,
                Direction::Left,
                Direction::Down,
                Direction::DownRight,
                Direction::Right
            ]
        );
    }

    #[test]
    fn shorter_cw_direction_cycle() {
        let dirs: Vec<Direction> = cycle_directions_cw(Direction::Left, 4).collect();
        assert_eq!(
            dirs,
            vec![
                Direction::Left,
                Direction::UpLeft,
                Direction::Up,
                Direction::Right
            ]
        );
    }

    #[test]
    fn longer_ccw_direction_cycle() {
        let dirs: Vec<Direction> = cycle_directions_ccw(Direction::Left, 10).collect();
        assert_eq!(
            dirs,
            vec![
                Direction::Left,
                Direction::Down,
                Direction::DownRight,
                Direction::Right,
                Direction::Up,
                Direction::UpLeft,
                Direction::Left,
                Direction::Down,
                Direction::DownRight,
                Direction::Right
            ]
        );
    }

    #[test]
    fn reverse_is_involution() {
        for d in Direction::ALL {
            assert_eq!(d.reverse().reverse(), d);
            assert_eq!(d.reverse(), d.turn_cw(3));
        }
    }

    #[test]
    fn geometry_dimensions() {
        let geom = MapGeometry::new(3).unwrap();
        assert_eq!(geom.cols(), 64);
        assert_eq!(geom.rows(), 64);
        assert_eq!(geom.tile_count(), 4096);
        assert_eq!(geom.region_count(), 4);

        let geom = MapGeometry::new(4).unwrap();
        assert_eq!(geom.cols(), 128);
        assert_eq!(geom.rows(), 64);

        assert!(MapGeometry::new(2).is_err());
        assert!(MapGeometry::new(11).is_err());
    }

    #[test]
    fn moves_wrap_and_reverse() {
        let geom = MapGeometry::new(3).unwrap();
        let origin = geom.pos(0, 0);
        for d in Direction::ALL {
            let there = geom.do_move(origin, d);
            assert_eq!(geom.do_move(there, d.reverse()), origin);
        }
        // Wrapping across the seam.
        assert_eq!(geom.move_left(origin), geom.pos(63, 0));
        assert_eq!(geom.move_up(origin), geom.pos(0, 63));
    }

    #[test]
    fn signed_distances_wrap() {
        let geom = MapGeometry::new(3).unwrap();
        let a = geom.pos(2, 2);
        let b = geom.pos(62, 62);
        // Travelling from a to b is 4 steps left/up across the seam.
        assert_eq!(geom.dist_x(a, b), -4);
        assert_eq!(geom.dist_y(a, b), -4);
        assert_eq!(geom.dist_x(b, a), 4);
        // Non-wrapping case.
        assert_eq!(geom.dist_x(geom.pos(3, 0), geom.pos(8, 0)), 5);
    }

    #[test]
    fn halfway_pos_is_midpoint() {
        let geom = MapGeometry::new(3).unwrap();
        let start = geom.pos(10, 10);
        let end = geom.pos(20, 14);
        assert_eq!(geom.halfway_pos(start, end), geom.pos(15, 12));
        // Across the wrap seam.
        let start = geom.pos(62, 0);
        let end = geom.pos(2, 0);
        assert_eq!(geom.halfway_pos(start, end), geom.pos(0, 0));
    }

    #[test]
    fn straightline_distance_cases() {
        let geom = MapGeometry::new(3).unwrap();
        let origin = geom.pos(10, 10);
        // Same-sign deltas walk the diagonal: max(|dc|, |dr|).
        assert_eq!(
            geom.straightline_tile_dist(geom.pos(13, 12), origin),
            3
        );
        // Opposite signs: |dc| + |dr|.
        assert_eq!(
            geom.straightline_tile_dist(geom.pos(8, 13), origin),
            5
        );
        assert_eq!(
            geom.straightline_tile_dist(geom.pos(7, 6), origin),
            4
        );
        assert_eq!(geom.straightline_tile_dist(origin, origin), 0);
    }

    #[test]
    fn classic_spiral_shape() {
        let pattern = classic_spiral_pattern();
        assert_eq!(pattern.len(), 295);
        assert_eq!(pattern[0], (0, 0));
        // First ring, first rotation of (1, 0).
        assert_eq!(pattern[1], (1, 0));
        assert_eq!(pattern[2], (1, 1));
        assert_eq!(pattern[3], (0, 1));
        assert_eq!(pattern[4], (-1, 0));
        assert_eq!(pattern[5], (-1, -1));
        assert_eq!(pattern[6], (0, -1));
    }

    #[test]
    fn extended_spiral_counts() {
        let pattern = extended_spiral_pattern();
        assert_eq!(pattern.len(), spiral_dist(MAX_SPIRAL_RING) as usize);
        assert_eq!(spiral_dist(0), 1);
        assert_eq!(spiral_dist(4), 61);
        assert_eq!(spiral_dist(24), 1801);

        // Every entry of ring k sits at hex distance exactly k.
        let geom = MapGeometry::new(5).unwrap();
        let center = geom.pos(32, 32);
        assert_eq!(geom.pos_add_extended_spirally(center, 0).unwrap(), center);
        for k in 1..=6u32 {
            for i in spiral_dist(k - 1)..spiral_dist(k) {
                let pos = geom.pos_add_extended_spirally(center, i).unwrap();
                assert_eq!(geom.straightline_tile_dist(center, pos), k);
            }
        }
    }

    #[test]
    fn extended_spiral_matches_classic_prefix() {
        // The extended pattern reproduces the classic order up to the
        // ring-9 truncation point.
        let classic = classic_spiral_pattern();
        let extended = extended_spiral_pattern();
        for i in 0..spiral_dist(8) as usize {
            assert_eq!(classic[i], extended[i], "mismatch at index {}", i);
        }
    }

    #[test]
    fn spiral_index_out_of_range_is_rejected() {
        let geom = MapGeometry::new(3).unwrap();
        let center = geom.pos(0, 0);
        assert!(geom.pos_add_extended_spirally(center, 1800).is_ok());
        assert!(geom.pos_add_extended_spirally(center, 1801).is_err());
    }
}
