use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way a fetch walks through calendar time.
///
/// Forward catches an existing store up toward "now". Backward starts at the
/// newest end of a range and walks toward its historical start, which is how
/// first-time backfills run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// Sort order requested from HTTP providers.
    pub fn order_param(&self) -> &'static str {
        match self {
            Direction::Forward => "asc",
            Direction::Backward => "desc",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}
