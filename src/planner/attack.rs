//! Attack-target selection and the attack decision.

use super::AiPlanner;
use crate::geometry::{spiral_dist, MapPos};
use crate::world::GameState;
use log::{debug, info};

impl AiPlanner {
    /// Collect enemy military buildings our threatened border buildings
    /// could reach, scored by the value of the area they hold.
    pub(super) fn score_enemy_targets(&mut self, state: &GameState) -> Vec<(MapPos, u32)> {
        let geom = state.map().geom().clone();

        // Attack scoring runs before this loop's expansion goals are
        // rebuilt; the previous loop's goals stand in for them.
        self.expand_towards = self.last_expand_towards.clone();

        let mut unique_targets: Vec<MapPos> = Vec::new();
        for index in state.player_buildings(self.player) {
            let Some(building) = state.building(index) else {
                continue;
            };
            if !building.done
                || !building.kind.is_military()
                || !building.active
                || building.threat_level != 3
            {
                continue;
            }
            let attacker_pos = building.pos;

            // Targets beyond ring 13 are out of reach of the knights.
            for i in 0..spiral_dist(13) {
                let Ok(pos) = geom.pos_add_extended_spirally(attacker_pos, i) else {
                    break;
                };
                if state.map().owner(pos) == Some(self.player) {
                    continue;
                }
                let Some(target) = state.get_building_at(pos) else {
                    continue;
                };
                if !target.kind.is_military() || !target.active {
                    continue;
                }

                let max_attackers = target.kind.max_attackers();
                let available = state.knights_available_for_attack(self.player, pos);
                let attacking = available.min(max_attackers);
                if attacking == 0 {
                    debug!(
                        "no knights can reach enemy building at {}",
                        pos.packed_repr()
                    );
                    continue;
                }
                if !unique_targets.contains(&pos) {
                    unique_targets.push(pos);
                }
            }
        }

        self.scoring_attack = true;
        let scored = unique_targets
            .into_iter()
            .map(|pos| (pos, self.score_area(state, pos, spiral_dist(8))))
            .collect();
        self.scoring_attack = false;
        self.expand_towards.clear();
        scored
    }

    /// Issue an attack on each qualifying target: enough morale and a
    /// decisive knight advantage, through the three-step attack protocol.
    pub(super) fn attack_targets(&mut self, state: &mut GameState, targets: &[(MapPos, u32)]) {
        for &(target_pos, target_score) in targets {
            let Some(target) = state.get_building_at(target_pos) else {
                continue;
            };
            let target_index = state.map().obj_index(target_pos);
            let defenders = target.knights.max(1);
            let max_attackers = target.kind.max_attackers();

            let available = state.knights_available_for_attack(self.player, target_pos);
            let attacking = available.min(max_attackers);
            if attacking == 0 {
                continue;
            }

            let morale = state.player(self.player).morale;
            if morale <= self.config.min_knight_morale_attack {
                debug!(
                    "morale {} too low to attack (needs > {})",
                    morale, self.config.min_knight_morale_attack
                );
                continue;
            }

            let attack_ratio = available as f64 / defenders as f64;
            if attack_ratio < self.config.min_knight_ratio_attack {
                debug!(
                    "attack ratio {:.2} below required {:.2} at {}",
                    attack_ratio,
                    self.config.min_knight_ratio_attack,
                    target_pos.packed_repr()
                );
                continue;
            }

            info!(
                "attacking building at {} (score {}, {} knights vs {})",
                target_pos.packed_repr(),
                target_score,
                attacking,
                defenders
            );
            {
                let player = state.player_mut(self.player);
                player.target_building_index = Some(target_index);
                player.attacker_count = attacking;
            }
            if state.start_attack(self.player).is_err() {
                debug!("attack on {} was refused", target_pos.packed_repr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MapGeometry;
    use crate::map::{MapStore, Minerals, Object, PathFlags, Terrain, Tile};
    use crate::planner::PlannerConfig;
    use crate::random::RandomStream;
    use crate::world::{Building, BuildingType};

    fn state_with_armies() -> (GameState, MapPos) {
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
        let mut state = GameState::new(MapStore::from_tiles(geom.clone(), tiles), 2);

        // Own fortress with plenty of knights near the enemy hut.
        let own_pos = geom.pos(20, 20);
        state.insert_building_for_tests(Building {
            pos: own_pos,
            kind: BuildingType::Fortress,
            owner: 0,
            flag: None,
            done: true,
            burning: false,
            active: true,
            threat_level: 3,
            knights: 9,
            productivity: 0,
            under_attack: false,
        });

        // Enemy hut with two defenders within attack range.
        let enemy_pos = geom.pos(26, 20);
        let enemy_index = state.insert_building_for_tests(Building {
            pos: enemy_pos,
            kind: BuildingType::Hut,
            owner: 1,
            flag: None,
            done: true,
            burning: false,
            active: true,
            threat_level: 0,
            knights: 2,
            productivity: 0,
            under_attack: false,
        });
        state
            .map_mut()
            .set_object(enemy_pos, Object::SmallBuilding, Some(enemy_index));
        state.map_mut().set_owner(enemy_pos, Some(1));

        (state, enemy_pos)
    }

    fn planner() -> AiPlanner {
        AiPlanner::new(0, PlannerConfig::default(), RandomStream::from_words(4, 5, 6))
    }

    #[test]
    fn high_morale_and_ratio_attacks() {
        let (mut state, enemy_pos) = state_with_armies();
        state.player_mut(0).morale = 1400;

        let mut ai = planner();
        let targets = ai.score_enemy_targets(&state);
        assert!(targets.iter().any(|&(pos, _)| pos == enemy_pos));

        ai.attack_targets(&mut state, &targets);
        let enemy_index = state.map().obj_index(enemy_pos);
        assert!(state.building(enemy_index).unwrap().under_attack);
    }

    #[test]
    fn low_morale_stays_home() {
        let (mut state, enemy_pos) = state_with_armies();
        state.player_mut(0).morale = 1100;

        let mut ai = planner();
        let targets = ai.score_enemy_targets(&state);
        ai.attack_targets(&mut state, &targets);
        let enemy_index = state.map().obj_index(enemy_pos);
        assert!(!state.building(enemy_index).unwrap().under_attack);
    }

    #[test]
    fn weak_advantage_stays_home() {
        let (mut state, enemy_pos) = state_with_armies();
        state.player_mut(0).morale = 1400;
        // Starve our fortress: 4 knights, 3 can leave; 3/2 < 2.5.
        let own_index = state
            .player_buildings(0)
            .into_iter()
            .next()
            .unwrap();
        state.building_mut(own_index).unwrap().knights = 4;

        let mut ai = planner();
        let targets = ai.score_enemy_targets(&state);
        ai.attack_targets(&mut state, &targets);
        let enemy_index = state.map().obj_index(enemy_pos);
        assert!(!state.building(enemy_index).unwrap().under_attack);
    }
}
