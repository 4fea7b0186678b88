//! Public collective entry points.

pub mod alltoallv;
pub mod datatype;
pub mod neighbor;
pub mod persistent;

pub use crate::algs::redistribute::Status;
pub use alltoallv::{alltoall, alltoallv, alltoallv_init, alltoallv_with_config};
pub use datatype::Datatype;
pub use neighbor::{neighbor_alltoallv, neighbor_alltoallv_init};
pub use persistent::{PersistentRequest, RequestState};
