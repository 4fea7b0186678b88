//! Transport, wire records and the phase engine.

pub mod communicator;
pub mod redistribute;
pub mod size_exchange;
pub mod wire;

pub use redistribute::{PhaseCounts, Scratch, Status};
