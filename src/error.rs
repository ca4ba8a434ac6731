//! Crate error taxonomy.
//!
//! Recoverable outcomes surface as `Err` values and the planner retries at
//! the next candidate. Invariant violations (dangling path back-references,
//! a building without its flag) are not represented here: they panic.

use crate::geometry::MapPos;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A request outside supported parameters: map size, spiral range, or a
    /// build request at a position of wrong ownership or terrain. Reported
    /// to the caller, never logged as an error.
    InvalidArgument(String),
    /// A `can_build_*` predicate rejected the position. The planner moves on
    /// to its next candidate.
    Unbuildable(MapPos),
    /// A newly built building's flag could not be connected to the road
    /// network. The planner burns the building and remembers the position.
    Disconnected(MapPos),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::Unbuildable(pos) => {
                write!(f, "position {} is not buildable", pos.packed_repr())
            }
            Error::Disconnected(pos) => write!(
                f,
                "flag of building at {} could not be connected",
                pos.packed_repr()
            ),
        }
    }
}

impl std::error::Error for Error {}
