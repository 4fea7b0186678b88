//! Node/local-rank decomposition of a communicator and the representative
//! mapping built on top of it.

pub mod locality;
pub mod neighborhood;
pub mod representative;

pub use locality::Topology;
pub use neighborhood::Neighborhood;
pub use representative::NodeSlices;
