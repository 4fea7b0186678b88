//! LocalityError: Unified error type for locality-coll public APIs
//!
//! Every fallible operation in the crate returns this type. Transport and
//! setup failures are fatal to the collective that observed them; nothing is
//! retried internally.

use thiserror::Error;

use crate::collective::persistent::RequestState;

/// Unified error type for locality-aware collectives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocalityError {
    /// Splitting the global communicator into node-local groups failed.
    #[error("Topology error: communicator split failed: {0}")]
    TopologySplit(String),
    /// Process count is not a multiple of the processes per node, or nodes
    /// differ in size / are not laid out in SMP order.
    #[error("Topology error: non-uniform node layout ({size} processes, {ppn} per node): {detail}")]
    NonUniformNodes {
        size: usize,
        ppn: usize,
        detail: String,
    },
    /// Caller-supplied counts, displacements or buffers are inconsistent.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    /// Sparse adjacency lists are malformed.
    #[error("Invalid adjacency: {0}")]
    InvalidAdjacency(String),
    /// A communication plan violates its structural invariants.
    #[error("Invalid communication plan: {0}")]
    InvalidPlan(String),
    /// A non-blocking send/receive/wait or collective reported a failure.
    #[error("Communication error with rank {neighbor}: {detail}")]
    CommError { neighbor: usize, detail: String },
    /// A received message did not have the length the plan expects.
    #[error("Length mismatch from rank {peer}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        peer: usize,
        expected: usize,
        actual: usize,
    },
    /// The sparse identity handshake could not pair every representative.
    #[error("Unresolved representative pairing on node {node}: {detail}")]
    UnresolvedPartner { node: usize, detail: String },
    /// Persistent request used out of sequence.
    #[error("`{op}` is not valid on a request in state {state}")]
    InvalidState {
        op: &'static str,
        state: RequestState,
    },
}

impl LocalityError {
    pub(crate) fn comm(neighbor: usize, detail: impl Into<String>) -> Self {
        LocalityError::CommError {
            neighbor,
            detail: detail.into(),
        }
    }
}
