pub mod error;
pub mod flag_search;
pub mod generator;
pub mod geometry;
pub mod map;
pub mod pathfinder;
pub mod planner;
pub mod random;
pub mod road;
pub mod roadbuilder;
pub mod world;

pub use error::Error;
