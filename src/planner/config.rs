//! Planner thresholds and weights.
//!
//! Every value is a compile-time default here; hosts may deserialize an
//! override. Changing a value never breaks an invariant, only policy.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Keep this many generic serfs; never promote below it.
    pub serfs_min: u32,
    pub knights_min: u32,
    pub knights_med: u32,
    pub knights_max: u32,
    /// Hysteresis so knight occupation levels do not flap.
    pub knight_occupation_change_buffer: u32,

    /// Castle placement: minimum building-site value nearby
    /// (small site = 1, large site = 3).
    pub near_building_sites_min: u32,

    pub gold_bars_max: u32,
    pub steel_min: u32,
    pub steel_max: u32,
    pub planks_crit: u32,
    pub planks_min: u32,
    pub planks_max: u32,
    /// Sawmills want at least this many trees around; castle placement
    /// weights it three-fold.
    pub near_trees_min: u32,
    pub stones_min: u32,
    pub stones_max: u32,
    pub near_stones_min: u32,
    pub food_max: u32,
    pub min_openspace_farm: u32,
    pub near_fields_min: u32,
    pub coal_min: u32,
    pub coal_max: u32,
    pub iron_ore_min: u32,
    pub iron_ore_max: u32,
    pub gold_ore_min: u32,
    pub gold_ore_max: u32,
    pub hills_min: u32,
    pub waters_min: u32,
    pub hammers_min: u32,
    pub geologists_max: u32,

    /// Above this sign density an area is considered evaluated and new
    /// geologists go elsewhere.
    pub geologist_sign_density_min: f64,
    /// Small-sign density floors before mines are started on small signs;
    /// until then only large signs qualify.
    pub coal_sign_density_min: f64,
    pub iron_sign_density_min: f64,
    pub gold_sign_density_min: f64,

    /// Burn a producing mine under this output percentage.
    pub mine_output_min: u32,

    pub foods_weight: u32,
    pub trees_weight: u32,
    pub stones_weight: u32,
    pub stone_signs_weight: u32,
    pub hills_weight: u32,
    pub iron_ore_weight: u32,
    pub coal_weight: u32,
    pub gold_ore_weight: u32,

    pub max_unfinished_buildings: u32,
    pub max_unfinished_huts: u32,

    pub max_coalmines: u32,
    pub max_ironmines: u32,
    pub max_goldmines: u32,

    /// Maximum actual-to-ideal road length ratio, penalties included.
    pub max_convolution: f64,

    /// Attack only above this morale (baseline morale is 1024).
    pub min_knight_morale_attack: u32,
    /// Attack only when attackers-to-defenders reaches this ratio.
    pub min_knight_ratio_attack: f64,
}

impl Default for PlannerConfig {
    fn default() -> PlannerConfig {
        PlannerConfig {
            serfs_min: 5,
            knights_min: 3,
            knights_med: 18,
            knights_max: 50,
            knight_occupation_change_buffer: 4,
            near_building_sites_min: 35,
            gold_bars_max: 50,
            steel_min: 8,
            steel_max: 60,
            planks_crit: 5,
            planks_min: 24,
            planks_max: 50,
            near_trees_min: 4,
            stones_min: 10,
            stones_max: 25,
            near_stones_min: 5,
            food_max: 25,
            min_openspace_farm: 25,
            near_fields_min: 3,
            coal_min: 12,
            coal_max: 80,
            iron_ore_min: 8,
            iron_ore_max: 40,
            gold_ore_min: 8,
            gold_ore_max: 50,
            hills_min: 9,
            waters_min: 24,
            hammers_min: 6,
            geologists_max: 4,
            geologist_sign_density_min: 0.50,
            coal_sign_density_min: 0.50,
            iron_sign_density_min: 0.50,
            gold_sign_density_min: 0.30,
            mine_output_min: 8,
            foods_weight: 2,
            trees_weight: 2,
            stones_weight: 2,
            stone_signs_weight: 1,
            hills_weight: 2,
            iron_ore_weight: 3,
            coal_weight: 2,
            gold_ore_weight: 5,
            max_unfinished_buildings: 2,
            max_unfinished_huts: 2,
            max_coalmines: 3,
            max_ironmines: 2,
            max_goldmines: 1,
            max_convolution: 3.00,
            min_knight_morale_attack: 1300,
            min_knight_ratio_attack: 2.50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_baseline() {
        let config = PlannerConfig::default();
        assert_eq!(config.knights_max, 50);
        assert_eq!(config.near_building_sites_min, 35);
        assert_eq!(config.gold_ore_weight, 5);
        assert!((config.max_convolution - 3.0).abs() < f64::EPSILON);
        assert!((config.min_knight_ratio_attack - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn overrides_deserialize_over_defaults() {
        let config: PlannerConfig =
            serde_json::from_str(r#"{ "planks_min": 30, "max_coalmines": 5 }"#).unwrap();
        assert_eq!(config.planks_min, 30);
        assert_eq!(config.max_coalmines, 5);
        // Untouched values keep their baseline.
        assert_eq!(config.planks_max, 50);
    }
}
