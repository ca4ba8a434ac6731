//! Dense tile storage and the vocabulary types stored per tile.
//!
//! Each logical tile owns two terrain triangles (up and down), an object, an
//! optional owner, a six-direction path mask, a mineral deposit and an
//! optional serf occupant. All mutation goes through methods here so change
//! listeners fire and the gold counter stays true.

use crate::geometry::{cycle_cw, Direction, MapGeometry, MapPos};
use crate::road::Road;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Terrain types on a 16-value ordinal scale. Water grading (0..3) reflects
/// distance to the nearest grass and is never set directly.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum Terrain {
    Water0 = 0,
    Water1 = 1,
    Water2 = 2,
    Water3 = 3,
    Grass0 = 4,
    Grass1 = 5,
    Grass2 = 6,
    Grass3 = 7,
    Desert0 = 8,
    Desert1 = 9,
    Desert2 = 10,
    Tundra0 = 11,
    Tundra1 = 12,
    Tundra2 = 13,
    Snow0 = 14,
    Snow1 = 15,
}

impl Terrain {
    pub fn is_water(self) -> bool {
        self <= Terrain::Water3
    }
}

/// Mineral deposit kinds. Water tiles repurpose the amount field for fish.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum Minerals {
    None,
    Gold,
    Iron,
    Coal,
    Stone,
}

/// Passability class of an object, ordered from most to least walkable.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum Space {
    Open,
    Semipassable,
    Impassable,
    Filled,
}

/// Map objects. Discriminants are contiguous within each semantic band so
/// band arithmetic (tree subtype draws, stone pile amounts) stays valid.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum Object {
    None = 0,
    Flag = 1,
    SmallBuilding = 2,
    LargeBuilding = 3,
    Castle = 4,

    Tree0 = 8,
    Tree1 = 9,
    Tree2 = 10,
    Tree3 = 11,
    Tree4 = 12,
    Tree5 = 13,
    Tree6 = 14,
    Tree7 = 15,

    Pine0 = 16,
    Pine1 = 17,
    Pine2 = 18,
    Pine3 = 19,
    Pine4 = 20,
    Pine5 = 21,
    Pine6 = 22,
    Pine7 = 23,

    Palm0 = 24,
    Palm1 = 25,
    Palm2 = 26,
    Palm3 = 27,

    WaterTree0 = 28,
    WaterTree1 = 29,
    WaterTree2 = 30,
    WaterTree3 = 31,

    Stone0 = 72,
    Stone1 = 73,
    Stone2 = 74,
    Stone3 = 75,
    Stone4 = 76,
    Stone5 = 77,
    Stone6 = 78,
    Stone7 = 79,

    Sandstone0 = 80,
    Sandstone1 = 81,

    Cross = 82,
    Stub = 83,

    Stone = 84,
    Sandstone3 = 85,

    Cadaver0 = 86,
    Cadaver1 = 87,

    WaterStone0 = 88,
    WaterStone1 = 89,

    Cactus0 = 90,
    Cactus1 = 91,

    DeadTree = 92,

    FelledPine0 = 93,
    FelledPine1 = 94,
    FelledPine2 = 95,
    FelledPine3 = 96,
    FelledPine4 = 97,

    FelledTree0 = 98,
    FelledTree1 = 99,
    FelledTree2 = 100,
    FelledTree3 = 101,
    FelledTree4 = 102,

    NewPine = 103,
    NewTree = 104,

    Seeds0 = 105,
    Seeds1 = 106,
    Seeds2 = 107,
    Seeds3 = 108,
    Seeds4 = 109,
    Seeds5 = 110,
    FieldExpired = 111,

    SignLargeGold = 112,
    SignSmallGold = 113,
    SignLargeIron = 114,
    SignSmallIron = 115,
    SignLargeCoal = 116,
    SignSmallCoal = 117,
    SignLargeStone = 118,
    SignSmallStone = 119,
    SignEmpty = 120,

    Field0 = 121,
    Field1 = 122,
    Field2 = 123,
    Field3 = 124,
    Field4 = 125,
    Field5 = 126,
}

impl Object {
    const ALL: [Object; 84] = [
        Object::None,
        Object::Flag,
        Object::SmallBuilding,
        Object::LargeBuilding,
        Object::Castle,
        Object::Tree0,
        Object::Tree1,
        Object::Tree2,
        Object::Tree3,
        Object::Tree4,
        Object::Tree5,
        Object::Tree6,
        Object::Tree7,
        Object::Pine0,
        Object::Pine1,
        Object::Pine2,
        Object::Pine3,
        Object::Pine4,
        Object::Pine5,
        Object::Pine6,
        Object::Pine7,
        Object::Palm0,
        Object::Palm1,
        Object::Palm2,
        Object::Palm3,
        Object::WaterTree0,
        Object::WaterTree1,
        Object::WaterTree2,
        Object::WaterTree3,
        Object::Stone0,
        Object::Stone1,
        Object::Stone2,
        Object::Stone3,
        Object::Stone4,
        Object::Stone5,
        Object::Stone6,
        Object::Stone7,
        Object::Sandstone0,
        Object::Sandstone1,
        Object::Cross,
        Object::Stub,
        Object::Stone,
        Object::Sandstone3,
        Object::Cadaver0,
        Object::Cadaver1,
        Object::WaterStone0,
        Object::WaterStone1,
        Object::Cactus0,
        Object::Cactus1,
        Object::DeadTree,
        Object::FelledPine0,
        Object::FelledPine1,
        Object::FelledPine2,
        Object::FelledPine3,
        Object::FelledPine4,
        Object::FelledTree0,
        Object::FelledTree1,
        Object::FelledTree2,
        Object::FelledTree3,
        Object::FelledTree4,
        Object::NewPine,
        Object::NewTree,
        Object::Seeds0,
        Object::Seeds1,
        Object::Seeds2,
        Object::Seeds3,
        Object::Seeds4,
        Object::Seeds5,
        Object::FieldExpired,
        Object::SignLargeGold,
        Object::SignSmallGold,
        Object::SignLargeIron,
        Object::SignSmallIron,
        Object::SignLargeCoal,
        Object::SignSmallCoal,
        Object::SignLargeStone,
        Object::SignSmallStone,
        Object::SignEmpty,
        Object::Field0,
        Object::Field1,
        Object::Field2,
        Object::Field3,
        Object::Field4,
        Object::Field5,
    ];

    /// Recover an object from its band value. Returns `None` for the gaps
    /// between bands.
    pub fn from_u8(value: u8) -> Option<Object> {
        Self::ALL.iter().copied().find(|obj| *obj as u8 == value)
    }

    /// Passability class.
    pub fn space(self) -> Space {
        use Object::*;
        match self {
            None | Stub | Stone | Sandstone3 | Cadaver0 | Cadaver1 | FelledPine4
            | FelledTree4 | FieldExpired | SignLargeGold | SignSmallGold | SignLargeIron
            | SignSmallIron | SignLargeCoal | SignSmallCoal | SignLargeStone
            | SignSmallStone | SignEmpty => Space::Open,

            Seeds0 | Seeds1 | Seeds2 | Seeds3 | Seeds4 | Seeds5 | Field0 | Field1
            | Field2 | Field3 | Field4 | Field5 => Space::Semipassable,

            SmallBuilding | LargeBuilding | Castle | WaterTree0 | WaterTree1
            | WaterTree2 | WaterTree3 | Stone0 | Stone1 | Stone2 | Stone3 | Stone4
            | Stone5 | Stone6 | Stone7 | Sandstone0 | Sandstone1 | WaterStone0
            | WaterStone1 => Space::Impassable,

            Flag | Tree0 | Tree1 | Tree2 | Tree3 | Tree4 | Tree5 | Tree6 | Tree7
            | Pine0 | Pine1 | Pine2 | Pine3 | Pine4 | Pine5 | Pine6 | Pine7 | Palm0
            | Palm1 | Palm2 | Palm3 | Cross | Cactus0 | Cactus1 | DeadTree
            | FelledPine0 | FelledPine1 | FelledPine2 | FelledPine3 | FelledTree0
            | FelledTree1 | FelledTree2 | FelledTree3 | NewPine | NewTree => Space::Filled,
        }
    }

    pub fn is_tree(self) -> bool {
        self >= Object::Tree0 && self <= Object::Pine7
    }

    pub fn is_stone_pile(self) -> bool {
        self >= Object::Stone0 && self <= Object::Stone7
    }

    /// Remaining stone in a pile: amount = 1 + (Stone7 - index).
    pub fn stone_pile_amount(self) -> u32 {
        debug_assert!(self.is_stone_pile());
        1 + (Object::Stone7 as u32 - self as u32)
    }

    pub fn is_field(self) -> bool {
        (self >= Object::Seeds0 && self <= Object::FieldExpired)
            || (self >= Object::Field0 && self <= Object::Field5)
    }

    pub fn is_sign(self) -> bool {
        self >= Object::SignLargeGold && self <= Object::SignEmpty
    }
}

bitflags! {
    /// Per-tile path bits, one per direction.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    pub struct PathFlags: u8 {
        const RIGHT = 1 << 0;
        const DOWN_RIGHT = 1 << 1;
        const DOWN = 1 << 2;
        const LEFT = 1 << 3;
        const UP_LEFT = 1 << 4;
        const UP = 1 << 5;
    }
}

impl PathFlags {
    #[inline]
    pub fn of(dir: Direction) -> PathFlags {
        PathFlags::from_bits_truncate(1 << dir.index())
    }
}

impl serde::Serialize for PathFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for PathFlags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u8::deserialize(deserializer).map(PathFlags::from_bits_truncate)
    }
}

pub type PlayerId = u8;

/// One logical tile.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct Tile {
    #[serde(rename = "h")]
    pub height: u8,
    #[serde(rename = "u")]
    pub type_up: Terrain,
    #[serde(rename = "d")]
    pub type_down: Terrain,
    #[serde(rename = "o")]
    pub object: Object,
    /// Index of the flag or building occupying this tile, when the object is
    /// one of those bands.
    #[serde(rename = "i")]
    pub object_index: u32,
    #[serde(rename = "p")]
    pub paths: PathFlags,
    #[serde(rename = "w")]
    pub owner: Option<PlayerId>,
    #[serde(rename = "m")]
    pub mineral: Minerals,
    #[serde(rename = "a")]
    pub mineral_amount: u8,
    #[serde(rename = "s")]
    pub serf_index: Option<u32>,
}

impl Default for Tile {
    fn default() -> Tile {
        Tile {
            height: 0,
            type_up: Terrain::Water0,
            type_down: Terrain::Water0,
            object: Object::None,
            object_index: 0,
            paths: PathFlags::empty(),
            owner: None,
            mineral: Minerals::None,
            mineral_amount: 0,
            serf_index: None,
        }
    }
}

/// Receives a notification for every mutated position. Viewport-like
/// collaborators register these; they must tolerate rapid notifications.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, pos: MapPos);
}

/// Row-major dense tile storage for one map.
#[derive(Serialize, Deserialize)]
pub struct MapStore {
    geom: MapGeometry,
    tiles: Vec<Tile>,
    gold_deposit: u32,
    #[serde(skip)]
    listeners: Vec<Box<dyn ChangeListener>>,
}

impl MapStore {
    pub fn new(geom: MapGeometry) -> MapStore {
        let tile_count = geom.tile_count() as usize;
        MapStore {
            geom,
            tiles: vec![Tile::default(); tile_count],
            gold_deposit: 0,
            listeners: Vec::new(),
        }
    }

    /// Adopt a fully generated tile array and take ownership of it.
    /// Recomputes the gold counter so the invariant starts true.
    pub fn from_tiles(geom: MapGeometry, tiles: Vec<Tile>) -> MapStore {
        debug_assert_eq!(tiles.len(), geom.tile_count() as usize);
        let mut map = MapStore {
            geom,
            tiles,
            gold_deposit: 0,
            listeners: Vec::new(),
        };
        map.gold_deposit = map
            .geom
            .iter()
            .filter(|&pos| map.mineral(pos) == Minerals::Gold)
            .map(|pos| map.mineral_amount(pos) as u32)
            .sum();
        map
    }

    #[inline]
    pub fn geom(&self) -> &MapGeometry {
        &self.geom
    }

    pub fn add_change_listener(&mut self, listener: Box<dyn ChangeListener>) {
        self.listeners.push(listener);
    }

    fn notify(&self, pos: MapPos) {
        for listener in &self.listeners {
            listener.on_change(pos);
        }
    }

    #[inline]
    fn tile(&self, pos: MapPos) -> &Tile {
        &self.tiles[pos.index()]
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn height(&self, pos: MapPos) -> u8 {
        self.tile(pos).height
    }

    #[inline]
    pub fn type_up(&self, pos: MapPos) -> Terrain {
        self.tile(pos).type_up
    }

    #[inline]
    pub fn type_down(&self, pos: MapPos) -> Terrain {
        self.tile(pos).type_down
    }

    #[inline]
    pub fn obj(&self, pos: MapPos) -> Object {
        self.tile(pos).object
    }

    #[inline]
    pub fn obj_index(&self, pos: MapPos) -> u32 {
        self.tile(pos).object_index
    }

    #[inline]
    pub fn owner(&self, pos: MapPos) -> Option<PlayerId> {
        self.tile(pos).owner
    }

    #[inline]
    pub fn paths(&self, pos: MapPos) -> PathFlags {
        self.tile(pos).paths
    }

    #[inline]
    pub fn has_path(&self, pos: MapPos, dir: Direction) -> bool {
        self.tile(pos).paths.contains(PathFlags::of(dir))
    }

    #[inline]
    pub fn mineral(&self, pos: MapPos) -> Minerals {
        self.tile(pos).mineral
    }

    #[inline]
    pub fn mineral_amount(&self, pos: MapPos) -> u8 {
        self.tile(pos).mineral_amount
    }

    /// Fish stock of a water tile; the amount field is shared.
    #[inline]
    pub fn fish_amount(&self, pos: MapPos) -> u8 {
        self.tile(pos).mineral_amount
    }

    #[inline]
    pub fn serf_index(&self, pos: MapPos) -> Option<u32> {
        self.tile(pos).serf_index
    }

    #[inline]
    pub fn gold_deposit(&self) -> u32 {
        self.gold_deposit
    }

    #[inline]
    pub fn has_flag(&self, pos: MapPos) -> bool {
        self.obj(pos) == Object::Flag
    }

    #[inline]
    pub fn has_building(&self, pos: MapPos) -> bool {
        let obj = self.obj(pos);
        obj >= Object::SmallBuilding && obj <= Object::Castle
    }

    /// Whether both triangles of the tile are water.
    pub fn is_water_tile(&self, pos: MapPos) -> bool {
        self.type_down(pos).is_water() && self.type_up(pos).is_water()
    }

    /// Whether the vertex is completely surrounded by water.
    pub fn is_in_water(&self, pos: MapPos) -> bool {
        self.is_water_tile(pos)
            && self.is_water_tile(self.geom.move_up_left(pos))
            && self.type_down(self.geom.move_left(pos)).is_water()
            && self.type_up(self.geom.move_up(pos)).is_water()
    }

    /// True when any of the four triangles touching the vertex lies in
    /// `[min, max]`.
    pub fn has_terrain_kind(&self, pos: MapPos, min: Terrain, max: Terrain) -> bool {
        let up_left = self.geom.move_up_left(pos);
        [
            self.type_down(pos),
            self.type_up(pos),
            self.type_down(up_left),
            self.type_up(up_left),
        ]
        .into_iter()
        .any(|t| t >= min && t <= max)
    }

    /// True when all six triangles around the vertex lie in `[low, high]`.
    pub fn types_within(&self, pos: MapPos, low: Terrain, high: Terrain) -> bool {
        let left = self.geom.move_left(pos);
        let up_left = self.geom.move_up_left(pos);
        let up = self.geom.move_up(pos);
        [
            self.type_up(pos),
            self.type_down(pos),
            self.type_down(left),
            self.type_up(up_left),
            self.type_down(up_left),
            self.type_up(up),
        ]
        .into_iter()
        .all(|t| t >= low && t <= high)
    }

    // ------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------

    pub fn set_height(&mut self, pos: MapPos, height: u8) {
        self.tiles[pos.index()].height = height & 0x1f;
        for d in cycle_cw() {
            self.notify(self.geom.do_move(pos, d));
        }
        self.notify(pos);
    }

    /// Change the object at a position. A flag or building index accompanies
    /// objects of those bands; it should be `None` when the object carries
    /// no index.
    pub fn set_object(&mut self, pos: MapPos, obj: Object, index: Option<u32>) {
        let tile = &mut self.tiles[pos.index()];
        tile.object = obj;
        if let Some(index) = index {
            tile.object_index = index;
        }
        self.notify(pos);
    }

    pub fn set_owner(&mut self, pos: MapPos, owner: Option<PlayerId>) {
        self.tiles[pos.index()].owner = owner;
        self.notify(pos);
    }

    pub fn set_serf_index(&mut self, pos: MapPos, index: Option<u32>) {
        self.tiles[pos.index()].serf_index = index;
    }

    /// Set a mineral deposit, keeping the realm gold counter true.
    pub fn set_mineral(&mut self, pos: MapPos, kind: Minerals, amount: u8) {
        let tile = &mut self.tiles[pos.index()];
        if tile.mineral == Minerals::Gold {
            self.gold_deposit -= tile.mineral_amount as u32;
        }
        tile.mineral = kind;
        tile.mineral_amount = amount & 0x1f;
        if kind == Minerals::Gold {
            self.gold_deposit += (amount & 0x1f) as u32;
        }
    }

    /// Remove mined resources from the ground. Clears the deposit kind when
    /// it runs out.
    pub fn remove_ground_deposit(&mut self, pos: MapPos, amount: u8) {
        let kind = self.tile(pos).mineral;
        let current = self.tile(pos).mineral_amount;
        let remaining = current.saturating_sub(amount);
        if remaining == 0 {
            self.set_mineral(pos, Minerals::None, 0);
        } else {
            self.set_mineral(pos, kind, remaining);
        }
    }

    // ------------------------------------------------------------------
    // Road segments
    // ------------------------------------------------------------------

    /// Whether a road segment from `pos` in `dir` could be built right now.
    /// A flag is a legal segment end; every other occupied or semipassable
    /// object blocks.
    pub fn is_road_segment_valid(&self, pos: MapPos, dir: Direction) -> bool {
        let other_pos = self.geom.do_move(pos, dir);

        let obj = self.obj(other_pos);
        if (!self.paths(other_pos).is_empty() && obj != Object::Flag)
            || (obj != Object::Flag && obj.space() >= Space::Semipassable)
        {
            return false;
        }

        if self.owner(other_pos).is_none() || self.owner(other_pos) != self.owner(pos) {
            return false;
        }

        if self.is_in_water(pos) != self.is_in_water(other_pos)
            && !(self.has_flag(pos) || self.has_flag(other_pos))
        {
            return false;
        }

        true
    }

    /// Whether the edge from `pos` in `dir` crosses water, judged by the two
    /// triangles flanking the edge.
    pub fn road_segment_in_water(&self, pos: MapPos, dir: Direction) -> bool {
        let (pos, dir) = if dir > Direction::Down {
            (self.geom.do_move(pos, dir), dir.reverse())
        } else {
            (pos, dir)
        };

        match dir {
            Direction::Right => {
                self.type_down(pos).is_water()
                    && self.type_up(self.geom.move_up(pos)).is_water()
            }
            Direction::DownRight => {
                self.type_up(pos).is_water() && self.type_down(pos).is_water()
            }
            Direction::Down => {
                self.type_up(pos).is_water()
                    && self.type_down(self.geom.move_left(pos)).is_water()
            }
            _ => unreachable!("normalized to a forward direction"),
        }
    }

    /// Set one path segment together with its reverse counterpart. Roads go
    /// through [`MapStore::place_road_segments`]; this is for the
    /// flag-to-building link.
    pub fn add_path(&mut self, pos: MapPos, dir: Direction) {
        self.tiles[pos.index()].paths |= PathFlags::of(dir);
        let other = self.geom.do_move(pos, dir);
        self.tiles[other.index()].paths |= PathFlags::of(dir.reverse());
        self.notify(pos);
        self.notify(other);
    }

    /// Clear one path segment together with its reverse counterpart.
    pub fn del_path(&mut self, pos: MapPos, dir: Direction) {
        self.tiles[pos.index()].paths &= !PathFlags::of(dir);
        let other = self.geom.do_move(pos, dir);
        self.tiles[other.index()].paths &= !PathFlags::of(dir.reverse());
        self.notify(pos);
        self.notify(other);
    }

    /// Place all segments of a road. On a mid-road validity failure the
    /// already placed bits are backtracked, so the map is unchanged.
    pub fn place_road_segments(&mut self, road: &Road) -> bool {
        let mut pos = road.source();
        for (i, &dir) in road.dirs().iter().enumerate() {
            if !self.is_road_segment_valid(pos, dir) {
                // Backtrack. Needed so a road cannot cross itself.
                for &dir in road.dirs()[..i].iter().rev() {
                    let rev = dir.reverse();
                    self.tiles[pos.index()].paths &= !PathFlags::of(rev);
                    let prev = self.geom.do_move(pos, rev);
                    self.tiles[prev.index()].paths &= !PathFlags::of(dir);
                    pos = prev;
                }
                return false;
            }

            self.tiles[pos.index()].paths |= PathFlags::of(dir);
            let next = self.geom.do_move(pos, dir);
            self.tiles[next.index()].paths |= PathFlags::of(dir.reverse());
            self.notify(pos);
            pos = next;
        }
        self.notify(pos);
        true
    }

    /// Remove the segment leaving `pos` in `dir` and return the direction
    /// the path continues in from the next position, if any.
    pub fn remove_road_segment(&mut self, pos: &mut MapPos, dir: Direction) -> Option<Direction> {
        self.tiles[pos.index()].paths &= !PathFlags::of(dir);
        self.notify(*pos);
        *pos = self.geom.do_move(*pos, dir);
        self.tiles[pos.index()].paths &= !PathFlags::of(dir.reverse());
        self.notify(*pos);

        cycle_cw().find(|&d| self.has_path(*pos, d))
    }

    fn remove_road_backref_until_flag(&mut self, mut pos: MapPos, mut dir: Direction) -> bool {
        loop {
            pos = self.geom.do_move(pos, dir);
            self.tiles[pos.index()].paths &= !PathFlags::of(dir.reverse());

            if self.obj(pos) == Object::Flag {
                return true;
            }

            match cycle_cw().find(|&d| self.has_path(pos, d)) {
                Some(d) => dir = d,
                None => return false,
            }
        }
    }

    /// Clear the back-references of the two half-paths meeting at `pos`.
    /// Returns false when the path structure is inconsistent; callers treat
    /// that as a fatal invariant violation.
    pub fn remove_road_backrefs(&mut self, pos: MapPos) -> bool {
        if self.paths(pos).is_empty() {
            return false;
        }

        let path_1_dir = cycle_cw().find(|&d| self.has_path(pos, d));
        let path_2_dir = path_1_dir.and_then(|first| {
            cycle_cw()
                .skip(first.index() + 1)
                .find(|&d| self.has_path(pos, d))
        });

        let (path_1_dir, path_2_dir) = match (path_1_dir, path_2_dir) {
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };

        self.remove_road_backref_until_flag(pos, path_1_dir)
            && self.remove_road_backref_until_flag(pos, path_2_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MapGeometry;

    fn grass_map() -> MapStore {
        let geom = MapGeometry::new(3).unwrap();
        let mut map = MapStore::new(geom);
        for pos in map.geom().iter().collect::<Vec<_>>() {
            let tile = &mut map.tiles[pos.index()];
            tile.type_up = Terrain::Grass1;
            tile.type_down = Terrain::Grass1;
            tile.owner = Some(0);
        }
        map
    }

    fn road(source: MapPos, dirs: &[Direction]) -> Road {
        let mut road = Road::start(source);
        for &d in dirs {
            road.extend(d);
        }
        road
    }

    #[test]
    fn space_lookup_bands() {
        assert_eq!(Object::None.space(), Space::Open);
        assert_eq!(Object::Flag.space(), Space::Filled);
        assert_eq!(Object::Castle.space(), Space::Impassable);
        assert_eq!(Object::Tree3.space(), Space::Filled);
        assert_eq!(Object::WaterTree1.space(), Space::Impassable);
        assert_eq!(Object::Stone5.space(), Space::Impassable);
        assert_eq!(Object::Stub.space(), Space::Open);
        assert_eq!(Object::Seeds2.space(), Space::Semipassable);
        assert_eq!(Object::Field4.space(), Space::Semipassable);
        assert_eq!(Object::SignSmallCoal.space(), Space::Open);
        assert_eq!(Object::FelledPine4.space(), Space::Open);
        assert_eq!(Object::FelledPine3.space(), Space::Filled);
    }

    #[test]
    fn object_from_u8_round_trips_bands() {
        for value in 0..=126u8 {
            if let Some(obj) = Object::from_u8(value) {
                assert_eq!(obj as u8, value);
            }
        }
        // Gaps between bands stay unrepresentable.
        assert_eq!(Object::from_u8(5), None);
        assert_eq!(Object::from_u8(40), None);
        assert_eq!(Object::from_u8(71), None);
        assert_eq!(Object::from_u8(127), None);
    }

    #[test]
    fn stone_pile_amounts() {
        assert_eq!(Object::Stone7.stone_pile_amount(), 1);
        assert_eq!(Object::Stone0.stone_pile_amount(), 8);
    }

    #[test]
    fn path_bits_stay_symmetric() {
        let mut map = grass_map();
        let source = map.geom().pos(10, 10);
        // A flag must exist at both ends for road placement to make sense,
        // but path symmetry holds regardless.
        let r = road(source, &[Direction::Right, Direction::DownRight]);
        assert!(map.place_road_segments(&r));

        for pos in map.geom().iter().collect::<Vec<_>>() {
            for d in Direction::ALL {
                let other = map.geom().do_move(pos, d);
                assert_eq!(
                    map.has_path(pos, d),
                    map.has_path(other, d.reverse()),
                    "asymmetric path at {:?} dir {:?}",
                    pos,
                    d
                );
            }
        }
    }

    #[test]
    fn place_then_remove_restores_map() {
        let mut map = grass_map();
        let source = map.geom().pos(10, 10);
        let r = road(
            source,
            &[Direction::Right, Direction::Right, Direction::Down],
        );
        assert!(map.place_road_segments(&r));
        assert!(!map.paths(source).is_empty());

        // Remove forward from the source.
        let mut pos = source;
        let mut dir = Some(Direction::Right);
        while let Some(d) = dir {
            dir = map.remove_road_segment(&mut pos, d);
        }

        for pos in map.geom().iter().collect::<Vec<_>>() {
            assert!(map.paths(pos).is_empty());
        }
    }

    #[test]
    fn self_crossing_road_is_backtracked() {
        let mut map = grass_map();
        let source = map.geom().pos(10, 10);
        // Loop back onto the already laid segment.
        let r = road(
            source,
            &[
                Direction::Right,
                Direction::Down,
                Direction::Left,
                Direction::Up,
                Direction::Right,
            ],
        );
        assert!(!map.place_road_segments(&r));
        for pos in map.geom().iter().collect::<Vec<_>>() {
            assert!(map.paths(pos).is_empty(), "leftover path at {:?}", pos);
        }
    }

    #[test]
    fn gold_counter_follows_mutation() {
        let mut map = grass_map();
        let a = map.geom().pos(1, 1);
        let b = map.geom().pos(2, 2);
        map.set_mineral(a, Minerals::Gold, 10);
        map.set_mineral(b, Minerals::Gold, 5);
        assert_eq!(map.gold_deposit(), 15);
        map.set_mineral(a, Minerals::Gold, 12);
        assert_eq!(map.gold_deposit(), 17);
        map.remove_ground_deposit(b, 2);
        assert_eq!(map.gold_deposit(), 15);
        map.remove_ground_deposit(b, 200);
        assert_eq!(map.gold_deposit(), 12);
        map.set_mineral(a, Minerals::Coal, 12);
        assert_eq!(map.gold_deposit(), 0);
    }

    #[test]
    fn vertex_terrain_kinds() {
        let mut map = grass_map();
        let pos = map.geom().pos(5, 5);
        let up_left = map.geom().move_up_left(pos);
        map.tiles[up_left.index()].type_down = Terrain::Tundra1;
        assert!(map.has_terrain_kind(pos, Terrain::Tundra0, Terrain::Snow0));
        assert!(!map.has_terrain_kind(pos, Terrain::Water0, Terrain::Water3));
        assert!(!map.types_within(pos, Terrain::Grass0, Terrain::Grass3));
        assert!(map.types_within(map.geom().pos(20, 20), Terrain::Grass0, Terrain::Grass3));
    }

    #[test]
    fn serde_round_trip_preserves_tiles() {
        let mut map = grass_map();
        let pos = map.geom().pos(3, 4);
        map.set_mineral(pos, Minerals::Gold, 7);
        map.set_object(pos, Object::SignLargeGold, None);
        map.set_owner(pos, Some(2));

        let bytes = serde_json::to_vec(&map).unwrap();
        let restored: MapStore = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored.gold_deposit(), map.gold_deposit());
        assert_eq!(restored.obj(pos), Object::SignLargeGold);
        assert_eq!(restored.owner(pos), Some(2));
        assert_eq!(restored.mineral(pos), Minerals::Gold);
        assert_eq!(restored.mineral_amount(pos), 7);
    }
}
