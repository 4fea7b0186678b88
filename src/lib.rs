#![cfg_attr(docsrs, feature(doc_cfg))]
//! # locality-coll
//!
//! locality-coll implements node-aware all-to-all-v and neighbor all-to-all-v
//! collectives for clusters whose processes are grouped into nodes with fast
//! shared memory. Instead of every process messaging every other process
//! across the network, each collective runs in three phases:
//!
//! 1. **aggregate**: processes of a node redistribute their outgoing data so
//!    that one local rank holds everything the node sends to a given node;
//! 2. **exchange**: those representatives exchange one aggregated message per
//!    (source node, destination node) pair;
//! 3. **scatter**: the receiving representatives hand the data to its final
//!    destinations on their node.
//!
//! The observable result is the same as the standard collective; the
//! inter-node message count drops from O(P²) to O(N²) for `N` nodes.
//!
//! ## Features
//! - Dense [`alltoallv`](collective::alltoallv) / [`alltoall`](collective::alltoall)
//!   and sparse [`neighbor_alltoallv`](collective::neighbor_alltoallv)
//! - Persistent requests that plan once and replay (`start` / `wait`)
//! - Pluggable transport through the [`Communicator`](algs::communicator::Communicator)
//!   trait: an in-process cluster (`LocalComm`) for tests and single-host
//!   runs, and MPI behind the `mpi-support` feature
//! - Parallel packing of outgoing messages behind the `rayon` feature
//!
//! ## Usage
//! ```toml
//! [dependencies]
//! locality-coll = "0.3"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! ## Layout assumptions
//!
//! Every node hosts the same number of processes and node-local ranks are
//! consecutive global ranks. Both are verified collectively when a
//! [`Topology`](topology::Topology) is created; violations are reported as
//! [`LocalityError::NonUniformNodes`] on every rank.
//!
//! ## Configuration
//!
//! [`LocalityConfig`](config::LocalityConfig) picks the node grouping and the
//! base message tag. `LOCALITY_COLL_PPN` forces a fixed number of processes per
//! node and `LOCALITY_COLL_TAG_BASE` moves the tag range.

pub mod algs;
pub mod collective;
pub mod config;
pub mod debug_invariants;
pub mod locality_error;
pub mod plan;
pub mod topology;

pub use debug_invariants::DebugInvariants;
pub use locality_error::LocalityError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{Communicator, LocalComm, NoComm, Wait};
    pub use crate::collective::{
        Datatype, PersistentRequest, RequestState, Status, alltoall, alltoallv, alltoallv_init,
        alltoallv_with_config, neighbor_alltoallv, neighbor_alltoallv_init,
    };
    pub use crate::config::{CommTag, LocalityConfig, NodeGrouping};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::locality_error::LocalityError;
    pub use crate::topology::{NodeSlices, Topology};
}
