//! Border expansion: walking to the territory edge and scoring what lies
//! beyond it.

use super::util;
use super::{AiPlanner, ExpansionGoal};
use crate::geometry::{cycle_rand_cw, spiral_dist, MapPos};
use crate::map::{Object, Terrain};
use crate::world::{BuildingType, GameState};
use log::{debug, info};

impl AiPlanner {
    /// Value of the area around `center` in terms of the current
    /// expansion goals. Also used for attack-target valuation, where the
    /// extra enemy-building weights apply.
    pub(super) fn score_area(&self, state: &GameState, center: MapPos, area: u32) -> u32 {
        let geom = state.map().geom();
        let cfg = &self.config;
        let mut total: u32 = 0;

        let goal = |goal: ExpansionGoal| -> u32 { u32::from(self.expand_towards.contains(&goal)) };

        for i in 0..area {
            let Ok(pos) = geom.pos_add_extended_spirally(center, i) else {
                break;
            };
            let obj = state.map().obj(pos);
            let mut pos_value: u32 = 0;

            // Open ground (or water) that could feed someone, and sown
            // fields.
            let farmable = obj == Object::None
                && (state
                    .map()
                    .has_terrain_kind(pos, Terrain::Grass0, Terrain::Grass3)
                    || state
                        .map()
                        .has_terrain_kind(pos, Terrain::Water0, Terrain::Water3));
            if farmable || obj.is_field() {
                pos_value += goal(ExpansionGoal::Foods) * cfg.foods_weight;
            }

            if obj.is_tree() {
                pos_value += goal(ExpansionGoal::Trees) * cfg.trees_weight;
            }

            if obj.is_stone_pile() {
                pos_value +=
                    goal(ExpansionGoal::Stones) * cfg.stones_weight * obj.stone_pile_amount();
            }

            if state
                .map()
                .has_terrain_kind(pos, Terrain::Tundra0, Terrain::Snow0)
            {
                // A sign means the hill is already evaluated; count only
                // virgin hills.
                if !obj.is_sign() {
                    pos_value += goal(ExpansionGoal::Hills) * cfg.hills_weight;
                }
            }

            let gold_signs = match obj {
                Object::SignLargeGold => 3,
                Object::SignSmallGold => 1,
                _ => 0,
            };
            pos_value += goal(ExpansionGoal::GoldOre) * cfg.gold_ore_weight * gold_signs;

            let iron_signs = match obj {
                Object::SignLargeIron => 3,
                Object::SignSmallIron => 1,
                _ => 0,
            };
            pos_value += goal(ExpansionGoal::IronOre) * cfg.iron_ore_weight * iron_signs;

            let coal_signs = match obj {
                Object::SignLargeCoal => 3,
                Object::SignSmallCoal => 1,
                _ => 0,
            };
            pos_value += goal(ExpansionGoal::Coal) * cfg.coal_weight * coal_signs;

            let stone_signs = match obj {
                Object::SignLargeStone => 3,
                Object::SignSmallStone => 1,
                _ => 0,
            };
            pos_value += goal(ExpansionGoal::Stones) * cfg.stone_signs_weight * stone_signs;

            // Defensive buffering: own civilian buildings are worth
            // shielding; enemy territory nearby raises urgency.
            let owner = state.map().owner(pos);
            if owner == Some(self.player) {
                if let Some(building) = state.get_building_at(pos) {
                    if !building.kind.is_military() {
                        let value = match obj {
                            Object::LargeBuilding => 3,
                            Object::SmallBuilding => 1,
                            _ => 0,
                        };
                        pos_value += goal(ExpansionGoal::CreateBuffer) * value;
                    }
                }
            }
            if owner.is_some() && owner != Some(self.player) {
                pos_value += goal(ExpansionGoal::CreateBuffer);

                // Attack valuation: enemy production is worth crippling,
                // mines most of all.
                if self.scoring_attack {
                    if let Some(building) = state.get_building_at(pos) {
                        if !building.kind.is_military() {
                            pos_value += match obj {
                                Object::LargeBuilding => 3,
                                Object::SmallBuilding => 1,
                                _ => 0,
                            };
                        }
                        pos_value += match building.kind {
                            BuildingType::CoalMine => 2,
                            BuildingType::IronMine => 4,
                            BuildingType::GoldMine => 6,
                            _ => 0,
                        };
                    }
                }
            }

            total += pos_value;
        }

        total
    }

    /// Walk outward from every occupied military building to the border
    /// and score the areas beyond; then try to place a knight hut at the
    /// best corner. Returns the built position, if any.
    pub(super) fn expand_borders(&mut self, state: &mut GameState) -> Option<MapPos> {
        debug!(
            "expanding borders for player {} towards {:?}",
            self.player, self.expand_towards
        );

        let geom = state.map().geom().clone();
        let mut count_by_corner: Vec<(MapPos, u32)> = Vec::new();

        let centers = self.occupied_military_pos.clone();
        for center in centers {
            for dir in cycle_rand_cw(&mut self.rng) {
                let mut pos = center;
                let mut tiles_moved = 0;
                // Only border huts matter; an interior hut is at most a
                // few tiles from its border in some direction.
                while state.map().owner(pos) == Some(self.player) {
                    pos = geom.do_move(pos, dir);
                    tiles_moved += 1;
                    if tiles_moved >= 10 {
                        break;
                    }
                }
                if tiles_moved >= 10 {
                    continue;
                }
                let score = self.score_area(state, pos, spiral_dist(6));
                // Keep zero scores too: expanding somewhere beats
                // expanding nowhere, and the sort still prefers resources.
                count_by_corner.push((pos, score));
            }
        }

        let search_positions = util::sort_by_val_desc(count_by_corner);
        for corner_pos in search_positions {
            if let Some(built) =
                self.build_near_pos(state, corner_pos, spiral_dist(4), BuildingType::Hut)
            {
                info!(
                    "border expansion: knight hut at {}",
                    built.packed_repr()
                );
                return Some(built);
            }
        }

        debug!("couldn't place a border knight hut anywhere");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MapGeometry;
    use crate::map::{MapStore, Minerals, PathFlags, Tile};
    use crate::planner::PlannerConfig;
    use crate::random::RandomStream;

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

    fn planner() -> AiPlanner {
        AiPlanner::new(0, PlannerConfig::default(), RandomStream::from_words(7, 8, 9))
    }

    #[test]
    fn goal_weights_gate_the_score() {
        let mut state = flat_state();
        let geom = state.map().geom().clone();
        let center = geom.pos(30, 30);
        // Sprinkle trees around the centre.
        for i in 1..7 {
            let pos = geom.pos_add_extended_spirally(center, i).unwrap();
            state.map_mut().set_object(pos, Object::Tree0, None);
        }

        let mut ai = planner();
        // Without the goal the trees are worthless.
        assert_eq!(ai.score_area(&state, center, spiral_dist(2)), 0);

        ai.expand_towards.insert(ExpansionGoal::Trees);
        let score = ai.score_area(&state, center, spiral_dist(2));
        assert_eq!(score, 6 * ai.config.trees_weight);
    }

    #[test]
    fn gold_signs_outweigh_coal_signs() {
        let mut state = flat_state();
        let geom = state.map().geom().clone();
        let gold_center = geom.pos(10, 10);
        let coal_center = geom.pos(40, 40);
        state
            .map_mut()
            .set_object(gold_center, Object::SignLargeGold, None);
        state
            .map_mut()
            .set_object(coal_center, Object::SignLargeCoal, None);

        let mut ai = planner();
        ai.expand_towards.insert(ExpansionGoal::GoldOre);
        ai.expand_towards.insert(ExpansionGoal::Coal);

        let gold_score = ai.score_area(&state, gold_center, spiral_dist(1));
        let coal_score = ai.score_area(&state, coal_center, spiral_dist(1));
        assert!(gold_score > coal_score);
        assert_eq!(gold_score, 3 * ai.config.gold_ore_weight);
        assert_eq!(coal_score, 3 * ai.config.coal_weight);
    }
}
