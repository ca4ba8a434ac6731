//! The narrow game-state surface the planner works against.
//!
//! All flags, buildings, players and the map live inside one [`World`],
//! guarded by a single read-write lock. Mutation happens through
//! [`World::mutate`], which holds the write lock for the whole closure;
//! readers take the read lock through [`World::read`]. The lock is not
//! reentrant: helpers below never re-enter it, and callers must take it
//! exactly once per logical operation.
//!
//! Flag and building storage is slot-based: indices stay stable across
//! allocation and removal, so handles held across a lock release remain
//! valid (or dead), never silently retargeted.

use crate::error::Error;
use crate::flag_search::trace_road;
use crate::geometry::{cycle_cw, spiral_dist, Direction, MapGeometry, MapPos};
use crate::map::{MapStore, Object, PlayerId, Space, Terrain};
use crate::road::Road;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Building kinds. Economy recipes stay outside this crate; the planner
/// only needs identity, size class and the military predicate.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum BuildingType {
    Fisher,
    Lumberjack,
    Boatbuilder,
    Stonecutter,
    StoneMine,
    CoalMine,
    IronMine,
    GoldMine,
    Forester,
    Stock,
    Hut,
    Farm,
    Butcher,
    PigFarm,
    Mill,
    Baker,
    Sawmill,
    SteelSmelter,
    ToolMaker,
    WeaponSmith,
    Tower,
    Fortress,
    GoldSmelter,
    Castle,
}

impl BuildingType {
    pub fn is_military(self) -> bool {
        matches!(
            self,
            BuildingType::Hut | BuildingType::Tower | BuildingType::Fortress | BuildingType::Castle
        )
    }

    pub fn is_mine(self) -> bool {
        matches!(
            self,
            BuildingType::StoneMine
                | BuildingType::CoalMine
                | BuildingType::IronMine
                | BuildingType::GoldMine
        )
    }

    /// Map object band the construction occupies.
    fn map_object(self) -> Object {
        match self {
            BuildingType::Castle => Object::Castle,
            BuildingType::Fisher
            | BuildingType::Lumberjack
            | BuildingType::Boatbuilder
            | BuildingType::Stonecutter
            | BuildingType::Forester
            | BuildingType::Hut
            | BuildingType::Mill
            | BuildingType::StoneMine
            | BuildingType::CoalMine
            | BuildingType::IronMine
            | BuildingType::GoldMine => Object::SmallBuilding,
            _ => Object::LargeBuilding,
        }
    }

    /// Knights that can assault a building of this type at once.
    pub fn max_attackers(self) -> u32 {
        match self {
            BuildingType::Hut => 3,
            BuildingType::Tower => 6,
            BuildingType::Fortress => 12,
            BuildingType::Castle => 20,
            _ => 0,
        }
    }
}

/// One path slot of a flag: where the road in that direction ends up.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct FlagPath {
    pub other_flag: u32,
    /// Direction slot at the far flag leading back along the same road.
    pub other_dir: Direction,
    pub length: u32,
    pub serf_requested: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flag {
    pub pos: MapPos,
    pub owner: PlayerId,
    pub building: Option<u32>,
    pub accepts_serfs: bool,
    pub paths: [Option<FlagPath>; 6],
}

impl Flag {
    fn new(pos: MapPos, owner: PlayerId) -> Flag {
        Flag {
            pos,
            owner,
            building: None,
            accepts_serfs: false,
            paths: [None; 6],
        }
    }

    pub fn has_building(&self) -> bool {
        self.building.is_some()
    }

    pub fn has_path(&self, dir: Direction) -> bool {
        self.paths[dir.index()].is_some()
    }

    /// Whether any road (not counting an attached building) leaves here.
    pub fn is_connected(&self) -> bool {
        self.paths.iter().any(|p| p.is_some())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Building {
    pub pos: MapPos,
    pub kind: BuildingType,
    pub owner: PlayerId,
    pub flag: Option<u32>,
    pub done: bool,
    pub burning: bool,
    /// Military buildings: knights are stationed.
    pub active: bool,
    /// 0..=3; 3 means on a contested border.
    pub threat_level: u8,
    pub knights: u32,
    /// Recent output in percent, for productivity culling.
    pub productivity: u32,
    pub under_attack: bool,
}

/// Countable goods a player holds across stocks. Only the kinds the
/// planner's policies read are tracked.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct Inventory {
    pub planks: u32,
    pub stones: u32,
    pub steel: u32,
    pub coal: u32,
    pub iron_ore: u32,
    pub gold_ore: u32,
    pub gold_bars: u32,
    pub fish: u32,
    pub bread: u32,
    pub meat: u32,
    pub hammers: u32,
    pub swords: u32,
    pub shields: u32,
}

impl Inventory {
    /// Supplies a fresh castle starts with.
    pub fn castle_start() -> Inventory {
        Inventory {
            planks: 40,
            stones: 30,
            steel: 4,
            coal: 10,
            iron_ore: 4,
            gold_ore: 0,
            gold_bars: 2,
            fish: 10,
            bread: 15,
            meat: 10,
            hammers: 8,
            swords: 6,
            shields: 6,
        }
    }

    pub fn food(&self) -> u32 {
        self.fish + self.bread + self.meat
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub castle_pos: Option<MapPos>,
    pub inventory: Inventory,
    /// Combat willingness; baseline 1024, raised by gold reserves.
    pub morale: u32,
    pub score: u32,
    pub military_score: u32,
    pub serfs_idle: u32,
    pub serfs_total: u32,
    pub knights_total: u32,
    pub geologists: u32,
    /// Attack issue protocol: target, then count, then `start_attack`.
    pub target_building_index: Option<u32>,
    pub attacker_count: u32,
}

impl Player {
    fn new(id: PlayerId) -> Player {
        Player {
            id,
            castle_pos: None,
            inventory: Inventory::default(),
            morale: 1024,
            score: 0,
            military_score: 0,
            serfs_idle: 0,
            serfs_total: 0,
            knights_total: 0,
            geologists: 0,
            target_building_index: None,
            attacker_count: 0,
        }
    }
}

/// Everything behind the lock.
#[derive(Serialize, Deserialize)]
pub struct GameState {
    map: MapStore,
    flags: Vec<Option<Flag>>,
    buildings: Vec<Option<Building>>,
    players: Vec<Player>,
}

/// Ownership claim radius of a military building, in rings. Kept under
/// the planner's ten-tile border walk so borders are always reachable
/// from the buildings that hold them.
fn military_radius(kind: BuildingType) -> u32 {
    match kind {
        BuildingType::Hut => 6,
        BuildingType::Tower => 7,
        BuildingType::Fortress | BuildingType::Castle => 8,
        _ => 0,
    }
}

impl GameState {
    pub fn new(map: MapStore, player_count: u8) -> GameState {
        GameState {
            map,
            flags: Vec::new(),
            buildings: Vec::new(),
            players: (0..player_count).map(Player::new).collect(),
        }
    }

    #[inline]
    pub fn map(&self) -> &MapStore {
        &self.map
    }

    #[inline]
    pub fn map_mut(&mut self) -> &mut MapStore {
        &mut self.map
    }

    #[inline]
    fn geom(&self) -> &MapGeometry {
        self.map.geom()
    }

    pub fn player(&self, id: PlayerId) -> &Player {
        &self.players[id as usize]
    }

    pub fn player_mut(&mut self, id: PlayerId) -> &mut Player {
        &mut self.players[id as usize]
    }

    fn alloc_flag(&mut self, flag: Flag) -> u32 {
        match self.flags.iter_mut().enumerate().find(|(_, f)| f.is_none()) {
            Some((i, slot)) => {
                *slot = Some(flag);
                i as u32
            }
            None => {
                self.flags.push(Some(flag));
                (self.flags.len() - 1) as u32
            }
        }
    }

    fn alloc_building(&mut self, building: Building) -> u32 {
        match self
            .buildings
            .iter_mut()
            .enumerate()
            .find(|(_, b)| b.is_none())
        {
            Some((i, slot)) => {
                *slot = Some(building);
                i as u32
            }
            None => {
                self.buildings.push(Some(building));
                (self.buildings.len() - 1) as u32
            }
        }
    }

    pub fn flag(&self, index: u32) -> Option<&Flag> {
        self.flags.get(index as usize)?.as_ref()
    }

    pub fn flag_mut(&mut self, index: u32) -> Option<&mut Flag> {
        self.flags.get_mut(index as usize)?.as_mut()
    }

    pub fn building(&self, index: u32) -> Option<&Building> {
        self.buildings.get(index as usize)?.as_ref()
    }

    pub fn building_mut(&mut self, index: u32) -> Option<&mut Building> {
        self.buildings.get_mut(index as usize)?.as_mut()
    }

    /// Test-only direct insertion, bypassing the build rules.
    #[cfg(test)]
    pub(crate) fn insert_building_for_tests(&mut self, building: Building) -> u32 {
        self.alloc_building(building)
    }

    pub fn get_flag_at(&self, pos: MapPos) -> Option<&Flag> {
        if !self.map.has_flag(pos) {
            return None;
        }
        let flag = self.flag(self.map.obj_index(pos));
        debug_assert!(flag.is_some(), "flag object without a flag record");
        flag
    }

    pub fn flag_index_at(&self, pos: MapPos) -> Option<u32> {
        self.map.has_flag(pos).then(|| self.map.obj_index(pos))
    }

    pub fn get_building_at(&self, pos: MapPos) -> Option<&Building> {
        if !self.map.has_building(pos) {
            return None;
        }
        self.building(self.map.obj_index(pos))
    }

    /// Snapshot of a player's building indices. Taken under the lock so
    /// later iteration never races allocation.
    pub fn player_buildings(&self, player: PlayerId) -> Vec<u32> {
        self.buildings
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                b.as_ref()
                    .filter(|b| b.owner == player)
                    .map(|_| i as u32)
            })
            .collect()
    }

    pub fn player_flags(&self, player: PlayerId) -> Vec<u32> {
        self.flags
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.as_ref().filter(|f| f.owner == player).map(|_| i as u32))
            .collect()
    }

    // ------------------------------------------------------------------
    // Build predicates
    // ------------------------------------------------------------------

    pub fn can_build_flag(&self, pos: MapPos, player: PlayerId) -> bool {
        if self.map.owner(pos) != Some(player) {
            return false;
        }

        if self.map.obj(pos).space() != Space::Open {
            return false;
        }

        // Not fully in water.
        if self.map.types_within(pos, Terrain::Water0, Terrain::Water3) {
            return false;
        }

        // No adjacent flags.
        !cycle_cw().any(|d| self.map.obj(self.geom().do_move(pos, d)) == Object::Flag)
    }

    pub fn can_build_small(&self, pos: MapPos) -> bool {
        self.map.types_within(pos, Terrain::Grass0, Terrain::Grass3)
    }

    /// A mine needs at least one mountain triangle at the vertex, and no
    /// triangle outside mountain or grass.
    pub fn can_build_mine(&self, pos: MapPos) -> bool {
        let geom = self.geom();
        let types = [
            self.map.type_down(pos),
            self.map.type_up(pos),
            self.map.type_down(geom.move_left(pos)),
            self.map.type_up(geom.move_up_left(pos)),
            self.map.type_down(geom.move_up_left(pos)),
            self.map.type_up(geom.move_up(pos)),
        ];

        let mut can_build = false;
        for t in types {
            if (Terrain::Tundra0..=Terrain::Snow0).contains(&t) {
                can_build = true;
            } else if !(Terrain::Grass0..=Terrain::Grass3).contains(&t) {
                return false;
            }
        }
        can_build
    }

    /// Height that leveling would give a large building site, or `None`
    /// when the surroundings are too steep.
    pub fn get_leveling_height(&self, pos: MapPos) -> Option<u8> {
        let geom = self.geom();
        let mut h_min = 31i32;
        let mut h_max = 0i32;
        for i in 7..19 {
            let p = geom.pos_add_spirally(pos, i);
            let h = self.map.height(p) as i32;
            h_min = h_min.min(h);
            h_max = h_max.max(h);
        }

        if h_max - h_min >= 9 {
            return None;
        }

        // Mean height; the centre counts twice.
        let mut h_mean = self.map.height(pos) as i32;
        for i in 0..7 {
            h_mean += self.map.height(geom.pos_add_spirally(pos, i)) as i32;
        }
        h_mean >>= 3;

        let h_new_min = (h_max - 4).max(1);
        let h_new_max = h_min + 4;
        Some(h_mean.clamp(h_new_min, h_new_max) as u8)
    }

    pub fn can_build_large(&self, pos: MapPos) -> bool {
        let geom = self.geom();

        // Surroundings must be walkable.
        for i in 1..7 {
            let p = geom.pos_add_spirally(pos, i);
            if self.map.obj(p).space() >= Space::Semipassable {
                return false;
            }
        }

        // No large buildings or castles in the second shell.
        for i in 7..19 {
            let p = geom.pos_add_spirally(pos, i);
            let obj = self.map.obj(p);
            if obj >= Object::LargeBuilding && obj <= Object::Castle {
                return false;
            }
        }

        // Centre hexagon must be plain grass.
        if !self.map.types_within(pos, Terrain::Grass1, Terrain::Grass1) {
            return false;
        }

        self.get_leveling_height(pos).is_some()
    }

    /// No other military building within the two inner rings.
    pub fn can_build_military(&self, pos: MapPos) -> bool {
        let geom = self.geom();
        for i in 0..spiral_dist(2) as usize {
            let p = geom.pos_add_spirally(pos, i);
            if let Some(building) = self.get_building_at(p) {
                if building.kind.is_military() {
                    return false;
                }
            }
        }
        true
    }

    pub fn can_player_build(&self, pos: MapPos, player: PlayerId) -> bool {
        if self.players[player as usize].castle_pos.is_none() {
            return false;
        }

        let geom = self.geom();
        for i in 0..7 {
            let p = geom.pos_add_spirally(pos, i);
            if self.map.owner(p) != Some(player) {
                return false;
            }
        }

        if self.map.types_within(pos, Terrain::Water0, Terrain::Water3) {
            return false;
        }

        self.map.paths(pos).is_empty()
    }

    pub fn can_build_building(&self, pos: MapPos, kind: BuildingType, player: PlayerId) -> bool {
        if !self.can_player_build(pos, player) {
            return false;
        }

        if self.map.obj(pos).space() != Space::Open {
            return false;
        }

        let flag_pos = self.geom().move_down_right(pos);
        if !self.map.has_flag(flag_pos) && !self.can_build_flag(flag_pos, player) {
            return false;
        }

        let size_ok = match kind {
            BuildingType::Fisher
            | BuildingType::Lumberjack
            | BuildingType::Boatbuilder
            | BuildingType::Stonecutter
            | BuildingType::Forester
            | BuildingType::Hut
            | BuildingType::Mill => self.can_build_small(pos),
            BuildingType::StoneMine
            | BuildingType::CoalMine
            | BuildingType::IronMine
            | BuildingType::GoldMine => self.can_build_mine(pos),
            BuildingType::Castle => return false,
            _ => self.can_build_large(pos),
        };
        if !size_ok {
            return false;
        }

        if kind.is_military() && !self.can_build_military(pos) {
            return false;
        }

        true
    }

    pub fn can_build_castle(&self, pos: MapPos, player: PlayerId) -> bool {
        if self.players[player as usize].castle_pos.is_some() {
            return false;
        }

        let geom = self.geom();
        for i in 0..7 {
            let p = geom.pos_add_spirally(pos, i);
            if self.map.owner(p).is_some() {
                return false;
            }
        }

        if self.map.obj(pos).space() != Space::Open || !self.map.paths(pos).is_empty() {
            return false;
        }

        let flag_pos = geom.move_down_right(pos);
        if self.map.obj(flag_pos).space() != Space::Open || !self.map.paths(flag_pos).is_empty() {
            return false;
        }

        self.can_build_large(pos)
    }

    /// Validate a road for a player: every segment valid, interior free of
    /// flags, ground and water never mixed. Returns the destination.
    pub fn can_build_road(&self, road: &Road, player: PlayerId) -> Option<MapPos> {
        let geom = self.geom();
        let mut pos = road.source();

        if road.is_empty() {
            return None;
        }
        if self.map.owner(pos) != Some(player) || !self.map.has_flag(pos) {
            return None;
        }

        let mut ground = false;
        let mut water = false;
        for (i, &dir) in road.dirs().iter().enumerate() {
            if !self.map.is_road_segment_valid(pos, dir) {
                return None;
            }
            if self.map.road_segment_in_water(pos, dir) {
                water = true;
            } else {
                ground = true;
            }

            pos = geom.do_move(pos, dir);

            if self.map.owner(pos) != Some(player) {
                return None;
            }
            if self.map.has_flag(pos) && i != road.length() - 1 {
                return None;
            }
        }

        if water && ground {
            return None;
        }

        Some(pos)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Build a flag. On an existing road the road is split in two.
    pub fn build_flag(&mut self, pos: MapPos, player: PlayerId) -> Result<u32, Error> {
        if !self.can_build_flag(pos, player) {
            return Err(Error::Unbuildable(pos));
        }

        let index = self.alloc_flag(Flag::new(pos, player));
        self.map.set_object(pos, Object::Flag, Some(index));

        if !self.map.paths(pos).is_empty() {
            self.build_flag_split_path(pos);
        }

        debug!("player {} built flag {} at {}", player, index, pos.packed_repr());
        Ok(index)
    }

    /// Split the road running through a freshly placed flag into two
    /// linked halves.
    fn build_flag_split_path(&mut self, pos: MapPos) {
        let path_1_dir = cycle_cw()
            .find(|&d| self.map.has_path(pos, d))
            .expect("split flag without a path");
        let mut path_2_dir = cycle_cw()
            .skip(path_1_dir.index() + 1)
            .find(|&d| self.map.has_path(pos, d))
            .expect("split flag with a single half-path");

        // The last direction can point at a building; the real road
        // continues at Up.
        if path_2_dir == Direction::UpLeft && self.map.has_path(pos, Direction::Up) {
            path_2_dir = Direction::Up;
        }

        let index = self.map.obj_index(pos);
        for dir in [path_1_dir, path_2_dir] {
            let road = trace_road(&self.map, pos, dir)
                .expect("split flag path does not reach a flag");
            let other_pos = road.end(self.geom());
            let other_dir = road.last().expect("non-empty road").reverse();
            let length = road.length() as u32;
            let other_index = self.map.obj_index(other_pos);

            if let Some(other_flag) = self.flag_mut(other_index) {
                other_flag.paths[other_dir.index()] = Some(FlagPath {
                    other_flag: index,
                    other_dir: dir,
                    length,
                    serf_requested: false,
                });
            }
            if let Some(flag) = self.flag_mut(index) {
                flag.paths[dir.index()] = Some(FlagPath {
                    other_flag: other_index,
                    other_dir,
                    length,
                    serf_requested: false,
                });
            }
        }
    }

    /// Build a road between two flags.
    pub fn build_road(&mut self, road: &Road, player: PlayerId) -> Result<(), Error> {
        if road.is_empty() {
            return Err(Error::InvalidArgument("empty road".into()));
        }

        let dest = self
            .can_build_road(road, player)
            .ok_or(Error::Unbuildable(road.source()))?;
        if !self.map.has_flag(dest) {
            return Err(Error::Unbuildable(dest));
        }

        let out_dir = road.first().expect("non-empty road");
        let in_dir = road.last().expect("non-empty road").reverse();

        if !self.map.place_road_segments(road) {
            return Err(Error::Unbuildable(road.source()));
        }

        let src_index = self.map.obj_index(road.source());
        let dest_index = self.map.obj_index(dest);
        let length = road.length() as u32;

        if let Some(src) = self.flag_mut(src_index) {
            src.paths[out_dir.index()] = Some(FlagPath {
                other_flag: dest_index,
                other_dir: in_dir,
                length,
                serf_requested: false,
            });
        }
        if let Some(dst) = self.flag_mut(dest_index) {
            dst.paths[in_dir.index()] = Some(FlagPath {
                other_flag: src_index,
                other_dir: out_dir,
                length,
                serf_requested: false,
            });
        }

        info!(
            "player {} built road {} -> {} ({} tiles)",
            player,
            road.source().packed_repr(),
            dest.packed_repr(),
            length
        );
        Ok(())
    }

    pub fn can_demolish_road(&self, pos: MapPos, player: PlayerId) -> bool {
        self.map.owner(pos) == Some(player)
            && !self.map.paths(pos).is_empty()
            && !self.map.has_flag(pos)
            && !self.map.has_building(pos)
    }

    /// Demolish the road passing through `pos` (not a flag position).
    pub fn demolish_road(&mut self, pos: MapPos, player: PlayerId) -> Result<(), Error> {
        if !self.can_demolish_road(pos, player) {
            return Err(Error::Unbuildable(pos));
        }

        let path_1_dir = cycle_cw()
            .find(|&d| self.map.has_path(pos, d))
            .expect("checked above");
        let mut path_2_dir = cycle_cw()
            .skip(path_1_dir.index() + 1)
            .find(|&d| self.map.has_path(pos, d));

        if path_2_dir == Some(Direction::UpLeft) && self.map.has_path(pos, Direction::Up) {
            path_2_dir = Some(Direction::Up);
        }
        let path_2_dir = match path_2_dir {
            Some(d) => d,
            // A dangling half-path cannot be demolished consistently.
            None => panic!("road at {} has a single half-path", pos.packed_repr()),
        };

        // Clearing the back-references doubles as a consistency check of
        // the whole road before anything is torn down.
        if !self.map.remove_road_backrefs(pos) {
            panic!(
                "road demolition left dangling back-references at {}",
                pos.packed_repr()
            );
        }

        self.remove_road_forwards(pos, path_1_dir);
        self.remove_road_forwards(pos, path_2_dir);
        Ok(())
    }

    /// Clear path bits from `pos` walking in `dir` to the terminating
    /// flag, and drop that flag's slot for the road.
    fn remove_road_forwards(&mut self, mut pos: MapPos, mut dir: Direction) {
        loop {
            let next_pos = self.geom().do_move(pos, dir);
            if self.map.has_flag(next_pos) {
                // Reached the terminal flag; clear the final segment and
                // its slot.
                let arrival = dir.reverse();
                self.map.del_path(pos, dir);
                let flag_index = self.map.obj_index(next_pos);
                if let Some(flag) = self.flag_mut(flag_index) {
                    flag.paths[arrival.index()] = None;
                }
                return;
            }

            let mut walk_pos = pos;
            match self.map.remove_road_segment(&mut walk_pos, dir) {
                Some(next_dir) => {
                    pos = walk_pos;
                    dir = next_dir;
                }
                None => panic!(
                    "road demolition left a dangling path at {}",
                    walk_pos.packed_repr()
                ),
            }
        }
    }

    pub fn can_demolish_flag(&self, pos: MapPos, player: PlayerId) -> bool {
        match self.get_flag_at(pos) {
            Some(flag) => flag.owner == player && flag.building.is_none(),
            None => false,
        }
    }

    /// Remove a flag. A flag in the middle of a road merges the two halves
    /// back into one road; path bits stay.
    pub fn demolish_flag(&mut self, pos: MapPos, player: PlayerId) -> Result<(), Error> {
        if !self.can_demolish_flag(pos, player) {
            return Err(Error::Unbuildable(pos));
        }

        let index = self.map.obj_index(pos);
        let connected_dirs: Vec<Direction> = cycle_cw()
            .filter(|&d| {
                self.flag(index)
                    .map(|f| f.has_path(d))
                    .unwrap_or(false)
            })
            .collect();

        match connected_dirs.len() {
            0 => {}
            2 => self.merge_paths(pos, connected_dirs[0], connected_dirs[1]),
            _ => {
                // A junction flag cannot be removed without tearing roads.
                return Err(Error::Unbuildable(pos));
            }
        }

        self.map.set_object(pos, Object::None, Some(0));
        self.flags[index as usize] = None;
        debug!("player {} demolished flag at {}", player, pos.packed_repr());
        Ok(())
    }

    /// Join the two roads meeting at a removed mid-road flag.
    fn merge_paths(&mut self, pos: MapPos, dir_1: Direction, dir_2: Direction) {
        let geom = self.geom();
        let side_1 = trace_road(&self.map, pos, dir_1).expect("flag path must reach a flag");
        let side_2 = trace_road(&self.map, pos, dir_2).expect("flag path must reach a flag");

        let end_1 = side_1.end(geom);
        let end_2 = side_2.end(geom);
        let dir_at_1 = side_1.last().expect("non-empty").reverse();
        let dir_at_2 = side_2.last().expect("non-empty").reverse();
        let total = (side_1.length() + side_2.length()) as u32;

        let index_1 = self.map.obj_index(end_1);
        let index_2 = self.map.obj_index(end_2);

        if let Some(flag) = self.flag_mut(index_1) {
            flag.paths[dir_at_1.index()] = Some(FlagPath {
                other_flag: index_2,
                other_dir: dir_at_2,
                length: total,
                serf_requested: false,
            });
        }
        if let Some(flag) = self.flag_mut(index_2) {
            flag.paths[dir_at_2.index()] = Some(FlagPath {
                other_flag: index_1,
                other_dir: dir_at_1,
                length: total,
                serf_requested: false,
            });
        }
    }

    /// Build a building, creating (or adopting) the flag down-right of it.
    pub fn build_building(
        &mut self,
        pos: MapPos,
        kind: BuildingType,
        player: PlayerId,
    ) -> Result<u32, Error> {
        if !self.can_build_building(pos, kind, player) {
            return Err(Error::Unbuildable(pos));
        }

        let flag_pos = self.geom().move_down_right(pos);
        let flag_index = match self.flag_index_at(flag_pos) {
            Some(index) => index,
            None => self.build_flag(flag_pos, player)?,
        };

        let building_index = self.alloc_building(Building {
            pos,
            kind,
            owner: player,
            flag: Some(flag_index),
            done: false,
            burning: false,
            active: false,
            threat_level: 0,
            knights: 0,
            productivity: 0,
            under_attack: false,
        });

        if let Some(flag) = self.flag_mut(flag_index) {
            flag.building = Some(building_index);
        }

        self.map
            .set_object(pos, kind.map_object(), Some(building_index));
        self.map.add_path(pos, Direction::DownRight);

        info!(
            "player {} built {:?} at {}",
            player,
            kind,
            pos.packed_repr()
        );
        Ok(building_index)
    }

    /// Build the player's castle: the one building allowed on unowned
    /// land. Claims the surrounding territory and seeds the inventory.
    pub fn build_castle(&mut self, pos: MapPos, player: PlayerId) -> Result<u32, Error> {
        if !self.can_build_castle(pos, player) {
            return Err(Error::Unbuildable(pos));
        }

        let flag_pos = self.geom().move_down_right(pos);

        let flag_index = self.alloc_flag(Flag::new(flag_pos, player));
        let building_index = self.alloc_building(Building {
            pos,
            kind: BuildingType::Castle,
            owner: player,
            flag: Some(flag_index),
            done: true,
            burning: false,
            active: true,
            threat_level: 0,
            knights: 3,
            productivity: 0,
            under_attack: false,
        });

        if let Some(flag) = self.flag_mut(flag_index) {
            flag.building = Some(building_index);
            flag.accepts_serfs = true;
        }

        self.map.set_object(pos, Object::Castle, Some(building_index));
        self.map
            .set_object(flag_pos, Object::Flag, Some(flag_index));
        self.map.add_path(pos, Direction::DownRight);

        // Level the hexagon under the castle.
        if let Some(h) = self.get_leveling_height(pos) {
            self.map.set_height(pos, h);
            for d in Direction::ALL {
                let p = self.geom().do_move(pos, d);
                self.map.set_height(p, h);
            }
        }

        {
            let player_state = &mut self.players[player as usize];
            player_state.castle_pos = Some(pos);
            player_state.inventory = Inventory::castle_start();
            player_state.serfs_total = 20;
            player_state.serfs_idle = 12;
            player_state.knights_total = 5;
        }

        self.update_land_ownership();

        info!("player {} founded castle at {}", player, pos.packed_repr());
        Ok(building_index)
    }

    /// Burn a building down. The attached flag stays; the building link
    /// path is removed.
    pub fn demolish_building(&mut self, pos: MapPos, player: PlayerId) -> Result<(), Error> {
        let index = match self.get_building_at(pos) {
            Some(building) if building.owner == player => self.map.obj_index(pos),
            _ => return Err(Error::Unbuildable(pos)),
        };

        let flag_index = self.building(index).and_then(|b| b.flag);
        let kind = self.building(index).map(|b| b.kind);

        self.map.del_path(pos, Direction::DownRight);
        self.map.set_object(pos, Object::None, Some(0));
        self.buildings[index as usize] = None;

        if let Some(flag_index) = flag_index {
            if let Some(flag) = self.flag_mut(flag_index) {
                flag.building = None;
            }
        }

        if kind.map(|k| k.is_military()).unwrap_or(false) {
            self.update_land_ownership();
        }

        info!(
            "player {} demolished building at {}",
            player,
            pos.packed_repr()
        );
        Ok(())
    }

    /// Recompute tile ownership from military buildings: each tile goes to
    /// the owner of the closest occupied military building whose claim
    /// radius covers it.
    pub fn update_land_ownership(&mut self) {
        struct Claim {
            pos: MapPos,
            owner: PlayerId,
            radius: u32,
        }

        let claims: Vec<Claim> = self
            .buildings
            .iter()
            .flatten()
            .filter(|b| b.kind.is_military() && b.active && !b.burning)
            .map(|b| Claim {
                pos: b.pos,
                owner: b.owner,
                radius: military_radius(b.kind),
            })
            .collect();

        let positions: Vec<MapPos> = self.geom().iter().collect();
        for pos in positions {
            let mut best: Option<(u32, PlayerId)> = None;
            for claim in &claims {
                let dist = self.geom().straightline_tile_dist(claim.pos, pos);
                if dist <= claim.radius && best.map_or(true, |(d, _)| dist < d) {
                    best = Some((dist, claim.owner));
                }
            }
            self.map.set_owner(pos, best.map(|(_, owner)| owner));
        }
    }

    // ------------------------------------------------------------------
    // Military
    // ------------------------------------------------------------------

    /// Knights the player can send against a target, summed over their
    /// own occupied military buildings in range; each keeps one defender.
    pub fn knights_available_for_attack(&self, player: PlayerId, target: MapPos) -> u32 {
        self.buildings
            .iter()
            .flatten()
            .filter(|b| {
                b.owner == player
                    && b.kind.is_military()
                    && b.active
                    && !b.burning
                    && self.geom().straightline_tile_dist(b.pos, target) <= 13
            })
            .map(|b| b.knights.saturating_sub(1))
            .sum()
    }

    /// Execute the attack prepared on the player record: target building
    /// index and attacker count must be set first.
    pub fn start_attack(&mut self, player: PlayerId) -> Result<(), Error> {
        let (target_index, attackers) = {
            let p = self.player(player);
            (
                p.target_building_index
                    .ok_or_else(|| Error::InvalidArgument("no attack target set".into()))?,
                p.attacker_count,
            )
        };

        let target = self
            .building(target_index)
            .ok_or_else(|| Error::InvalidArgument("attack target vanished".into()))?;
        if target.owner == player || !target.kind.is_military() {
            return Err(Error::InvalidArgument(
                "attack target is not an enemy military building".into(),
            ));
        }
        let target_pos = target.pos;

        if attackers == 0 {
            return Err(Error::InvalidArgument("no attackers assigned".into()));
        }

        if let Some(b) = self.building_mut(target_index) {
            b.under_attack = true;
        }

        let p = self.player_mut(player);
        p.target_building_index = None;
        p.attacker_count = 0;

        info!(
            "player {} attacks building {} at {} with {} knights",
            player,
            target_index,
            target_pos.packed_repr(),
            attackers
        );
        Ok(())
    }
}

/// The façade: one lock around the whole game state.
pub struct World {
    state: RwLock<GameState>,
}

impl World {
    pub fn new(map: MapStore, player_count: u8) -> World {
        World {
            state: RwLock::new(GameState::new(map, player_count)),
        }
    }

    /// Run a closure under the write lock. Every externally visible
    /// mutation goes through here, exactly once per logical operation.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut GameState) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(|e| {
            warn!("world lock poisoned; continuing with inner state");
            e.into_inner()
        });
        f(&mut state)
    }

    /// Run a closure under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&GameState) -> R) -> R {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MapGeometry;
    use crate::map::{Minerals, PathFlags, Tile};

    fn flat_state() -> GameState {
        let geom = MapGeometry::new(3).unwrap();
        let tiles = (0..geom.tile_count())
            .map(|_| Tile {
                height: 10,
                type_up: Terrain::Grass1,
                type_down: Terrain::Grass1,
                object: Object::None,
                object_index: 0,
                paths: PathFlags::empty(),
                owner: None,
                mineral: Minerals::None,
                mineral_amount: 0,
                serf_index: None,
            })
            .collect();
        GameState::new(MapStore::from_tiles(geom, tiles), 2)
    }

    /// Give player 0 a castle and return its flag position.
    fn with_castle(state: &mut GameState) -> MapPos {
        let pos = state.map().geom().pos(20, 20);
        state.build_castle(pos, 0).unwrap();
        state.map().geom().move_down_right(pos)
    }

    fn straight_road(from: MapPos, dir: Direction, len: usize) -> Road {
        let mut road = Road::start(from);
        for _ in 0..len {
            road.extend(dir);
        }
        road
    }

    #[test]
    fn castle_claims_land_and_links_its_flag() {
        let mut state = flat_state();
        let castle_flag = with_castle(&mut state);
        let castle_pos = state.player(0).castle_pos.unwrap();

        assert_eq!(state.map().obj(castle_pos), Object::Castle);
        let flag = state.get_flag_at(castle_flag).unwrap();
        assert!(flag.has_building());
        assert!(flag.accepts_serfs);
        assert_eq!(state.map().owner(castle_pos), Some(0));
        // Building link path exists both ways.
        assert!(state.map().has_path(castle_pos, Direction::DownRight));
        assert!(state.map().has_path(castle_flag, Direction::UpLeft));
    }

    #[test]
    fn build_and_demolish_road_round_trips() {
        let mut state = flat_state();
        let castle_flag = with_castle(&mut state);

        let geom = state.map().geom().clone();
        let other_pos = geom.pos(geom.pos_col(castle_flag) + 5, geom.pos_row(castle_flag));
        state.build_flag(other_pos, 0).unwrap();

        let before: Vec<PathFlags> = geom.iter().map(|p| state.map().paths(p)).collect();

        let road = straight_road(castle_flag, Direction::Right, 5);
        state.build_road(&road, 0).unwrap();
        assert!(state.get_flag_at(castle_flag).unwrap().has_path(Direction::Right));
        assert!(state.get_flag_at(other_pos).unwrap().has_path(Direction::Left));
        assert_eq!(
            state.get_flag_at(castle_flag).unwrap().paths[Direction::Right.index()]
                .unwrap()
                .length,
            5
        );

        // Demolish from a mid-road tile.
        let mid = geom.do_move(castle_flag, Direction::Right);
        state.demolish_road(mid, 0).unwrap();

        let after: Vec<PathFlags> = geom.iter().map(|p| state.map().paths(p)).collect();
        assert_eq!(before, after);
        assert!(!state.get_flag_at(castle_flag).unwrap().has_path(Direction::Right));
        assert!(!state.get_flag_at(other_pos).unwrap().has_path(Direction::Left));
    }

    #[test]
    fn splitting_flag_divides_the_road() {
        let mut state = flat_state();
        let castle_flag = with_castle(&mut state);
        let geom = state.map().geom().clone();

        let far = geom.pos(geom.pos_col(castle_flag) + 6, geom.pos_row(castle_flag));
        state.build_flag(far, 0).unwrap();
        let road = straight_road(castle_flag, Direction::Right, 6);
        state.build_road(&road, 0).unwrap();

        // Drop a flag in the middle.
        let mid = geom.pos(geom.pos_col(castle_flag) + 3, geom.pos_row(castle_flag));
        state.build_flag(mid, 0).unwrap();

        let mid_flag = state.get_flag_at(mid).unwrap();
        assert_eq!(mid_flag.paths[Direction::Right.index()].unwrap().length, 3);
        assert_eq!(mid_flag.paths[Direction::Left.index()].unwrap().length, 3);

        let castle_side = state.get_flag_at(castle_flag).unwrap();
        assert_eq!(
            castle_side.paths[Direction::Right.index()]
                .unwrap()
                .other_flag,
            state.flag_index_at(mid).unwrap()
        );

        // Removing the middle flag merges the halves again.
        state.demolish_flag(mid, 0).unwrap();
        let castle_side = state.get_flag_at(castle_flag).unwrap();
        let merged = castle_side.paths[Direction::Right.index()].unwrap();
        assert_eq!(merged.length, 6);
        assert_eq!(merged.other_flag, state.flag_index_at(far).unwrap());
        // The road itself survives.
        assert!(state.map().has_path(mid, Direction::Right));
        assert!(state.map().has_path(mid, Direction::Left));
    }

    #[test]
    fn building_gets_a_flag_and_link() {
        let mut state = flat_state();
        let _castle_flag = with_castle(&mut state);
        let geom = state.map().geom().clone();

        let site = geom.pos(24, 20);
        assert!(state.can_build_building(site, BuildingType::Hut, 0));
        let index = state.build_building(site, BuildingType::Hut, 0).unwrap();

        let building = state.building(index).unwrap();
        let flag_pos = geom.move_down_right(site);
        assert_eq!(building.flag, state.flag_index_at(flag_pos));
        assert!(state.get_flag_at(flag_pos).unwrap().has_building());
        assert!(state.map().has_path(site, Direction::DownRight));

        // Demolition frees the site but keeps the flag.
        state.demolish_building(site, 0).unwrap();
        assert_eq!(state.map().obj(site), Object::None);
        assert!(state.get_flag_at(flag_pos).is_some());
        assert!(!state.get_flag_at(flag_pos).unwrap().has_building());
        assert!(!state.map().has_path(site, Direction::DownRight));
    }

    #[test]
    fn flags_must_not_touch() {
        let mut state = flat_state();
        let castle_flag = with_castle(&mut state);
        let geom = state.map().geom().clone();
        let next_to = geom.do_move(castle_flag, Direction::Right);
        assert!(!state.can_build_flag(next_to, 0));
        assert!(state.build_flag(next_to, 0).is_err());
    }

    #[test]
    fn cannot_build_on_foreign_or_unowned_land() {
        let mut state = flat_state();
        let _ = with_castle(&mut state);
        let geom = state.map().geom().clone();
        // Far corner is unowned.
        let far = geom.pos(60, 60);
        assert!(!state.can_build_flag(far, 0));
        assert!(!state.can_build_building(far, BuildingType::Hut, 0));
    }

    #[test]
    fn attack_protocol_requires_setup() {
        let mut state = flat_state();
        let _ = with_castle(&mut state);
        assert!(state.start_attack(0).is_err());

        // Give player 1 a military hut owned by force (bypassing castle
        // requirements) to attack.
        let geom = state.map().geom().clone();
        let hut_pos = geom.pos(40, 40);
        let hut = state.alloc_building(Building {
            pos: hut_pos,
            kind: BuildingType::Hut,
            owner: 1,
            flag: None,
            done: true,
            burning: false,
            active: true,
            threat_level: 3,
            knights: 2,
            productivity: 0,
            under_attack: false,
        });

        state.player_mut(0).target_building_index = Some(hut);
        state.player_mut(0).attacker_count = 6;
        state.start_attack(0).unwrap();
        assert!(state.building(hut).unwrap().under_attack);
        assert_eq!(state.player(0).target_building_index, None);
    }

    #[test]
    fn world_lock_round_trip() {
        let geom = MapGeometry::new(3).unwrap();
        let map = MapStore::new(geom);
        let world = World::new(map, 1);
        let count = world.read(|state| state.map().geom().tile_count());
        assert_eq!(count, 4096);
        world.mutate(|state| {
            let pos = state.map().geom().pos(1, 1);
            state.map_mut().set_owner(pos, Some(0));
        });
        let owner = world.read(|state| {
            let pos = state.map().geom().pos(1, 1);
            state.map().owner(pos)
        });
        assert_eq!(owner, Some(0));
    }
}
