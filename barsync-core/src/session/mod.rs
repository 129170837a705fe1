//! Trading sessions and the freshness clock built on them.

pub mod clock;
pub mod definition;

pub use clock::{Freshness, SessionClock};
pub use definition::{SessionDefinition, SessionInterval, WallTime};
