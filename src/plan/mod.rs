//! Three-phase locality plans.
//!
//! A [`LocalityPlan`] is the full recipe for one collective: for each of the
//! aggregate, exchange and scatter phases a send and a receive [`CommPlan`],
//! plus the sizes of the two intermediate buffers the phases hand data
//! through. The aggregate phase reads the caller's send buffer and writes the
//! aggregate buffer; exchange moves the aggregate buffer into the exchange
//! buffer across nodes; scatter writes the caller's receive buffer.

pub mod comm_plan;
pub mod dense;
pub mod sparse;

use std::fmt;

pub use comm_plan::{CommPlan, CommPlanBuilder, Segment};
pub use dense::build_dense_plan;
pub use sparse::build_sparse_plan;

use crate::debug_invariants::DebugInvariants;
use crate::locality_error::LocalityError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Aggregate,
    Exchange,
    Scatter,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Aggregate, Phase::Exchange, Phase::Scatter];

    /// Aggregate and scatter stay on the node.
    pub fn is_node_local(self) -> bool {
        !matches!(self, Phase::Exchange)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Aggregate => "aggregate",
            Phase::Exchange => "exchange",
            Phase::Scatter => "scatter",
        })
    }
}

/// Which communicator carries the exchange phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
    /// All-to-all: the global communicator.
    Dense,
    /// Neighbor collective: the topology's duplicated neighbor communicator.
    Sparse,
}

/// Per-peer byte counts and byte offsets of one caller buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ByteLayout {
    pub counts: Vec<usize>,
    pub displs: Vec<usize>,
}

impl ByteLayout {
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// One past the last byte any entry touches.
    pub fn extent(&self) -> usize {
        self.counts
            .iter()
            .zip(&self.displs)
            .filter(|(c, _)| **c > 0)
            .map(|(c, d)| c + d)
            .max()
            .unwrap_or(0)
    }
}

/// Send and receive side of one phase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhasePlan {
    pub send: CommPlan,
    pub recv: CommPlan,
}

impl PhasePlan {
    /// Message indices `(send, recv)` of the exchange with `me`, if any.
    /// Both sides must agree on it, including its length.
    pub fn self_message(&self, me: usize) -> Result<Option<(usize, usize)>, LocalityError> {
        match (self.send.find(me), self.recv.find(me)) {
            (None, None) => Ok(None),
            (Some(s), Some(r)) if self.send.message_len(s) == self.recv.message_len(r) => {
                Ok(Some((s, r)))
            }
            (Some(s), Some(r)) => Err(LocalityError::LengthMismatch {
                peer: me,
                expected: self.recv.message_len(r),
                actual: self.send.message_len(s),
            }),
            (s, r) => Err(LocalityError::InvalidPlan(format!(
                "self message present on one side only (send {s:?}, recv {r:?})"
            ))),
        }
    }

    /// Messages that go through the transport.
    pub fn transport_messages(&self, me: usize) -> usize {
        let own = |p: &CommPlan| usize::from(p.find(me).is_some());
        self.send.n_msgs() - own(&self.send) + self.recv.n_msgs() - own(&self.recv)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalityPlan {
    pub pattern: Pattern,
    pub aggregate: PhasePlan,
    pub exchange: PhasePlan,
    pub scatter: PhasePlan,
    pub aggregate_len: usize,
    pub exchange_len: usize,
    /// Bytes of the caller's send buffer the plan reads.
    pub send_extent: usize,
    /// Bytes of the caller's receive buffer the plan writes.
    pub recv_extent: usize,
}

impl LocalityPlan {
    pub fn new(
        pattern: Pattern,
        aggregate: PhasePlan,
        exchange: PhasePlan,
        scatter: PhasePlan,
        aggregate_len: usize,
        exchange_len: usize,
    ) -> Result<Self, LocalityError> {
        let plan = Self {
            pattern,
            send_extent: aggregate.send.max_extent(),
            recv_extent: scatter.recv.max_extent(),
            aggregate,
            exchange,
            scatter,
            aggregate_len,
            exchange_len,
        };
        plan.validate_invariants()?;
        Ok(plan)
    }

    pub fn phase(&self, phase: Phase) -> &PhasePlan {
        match phase {
            Phase::Aggregate => &self.aggregate,
            Phase::Exchange => &self.exchange,
            Phase::Scatter => &self.scatter,
        }
    }

    /// Size of the staging buffer shared by the phases.
    pub fn staging_len(&self) -> usize {
        Phase::ALL
            .iter()
            .map(|&p| self.phase(p).send.size_msgs())
            .max()
            .unwrap_or(0)
    }

    /// Fails with `InvalidArguments` if caller buffers are too short.
    pub fn check_buffers(&self, send_len: usize, recv_len: usize) -> Result<(), LocalityError> {
        if send_len < self.send_extent {
            return Err(LocalityError::InvalidArguments(format!(
                "send buffer has {send_len} bytes, plan reads {}",
                self.send_extent
            )));
        }
        if recv_len < self.recv_extent {
            return Err(LocalityError::InvalidArguments(format!(
                "receive buffer has {recv_len} bytes, plan writes {}",
                self.recv_extent
            )));
        }
        Ok(())
    }
}

impl DebugInvariants for LocalityPlan {
    fn debug_assert_invariants(&self) {
        for phase in Phase::ALL {
            self.phase(phase).send.debug_assert_invariants();
            self.phase(phase).recv.debug_assert_invariants();
        }
        crate::debug_invariants!(self.validate_invariants(), "LocalityPlan");
    }

    fn validate_invariants(&self) -> Result<(), LocalityError> {
        for phase in Phase::ALL {
            let p = self.phase(phase);
            p.send.validate_invariants()?;
            p.recv.validate_invariants()?;
        }
        let fits = |what: &str, extent: usize, len: usize| {
            if extent <= len {
                Ok(())
            } else {
                Err(LocalityError::InvalidPlan(format!(
                    "{what} touches {extent} bytes of a {len}-byte buffer"
                )))
            }
        };
        fits("aggregate.recv", self.aggregate.recv.max_extent(), self.aggregate_len)?;
        fits("exchange.send", self.exchange.send.max_extent(), self.aggregate_len)?;
        fits("exchange.recv", self.exchange.recv.max_extent(), self.exchange_len)?;
        fits("scatter.send", self.scatter.send.max_extent(), self.exchange_len)
    }
}
