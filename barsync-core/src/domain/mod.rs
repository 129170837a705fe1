//! Domain types: instruments, periods, bar records.

pub mod bar;
pub mod direction;
pub mod instrument;

pub use bar::{BarKey, BarRecord, Period};
pub use direction::Direction;
pub use instrument::{Exchange, Instrument};
