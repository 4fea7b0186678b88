//! Persistent collectives: plan once, replay many times.
//!
//! ```text
//! Initialized --start--> Started --wait--> Completed --start--> Started ...
//!                           \
//!                            +-- transport error --> Failed (terminal)
//! ```
//!
//! `start` packs the caller's send buffer and posts the aggregate phase;
//! `wait` completes it and runs the exchange and scatter phases into the
//! caller's receive buffer. A request owns its topology, plan, tags and
//! scratch buffers, so requests with distinct tag bases never interfere.

use std::fmt;

use bytemuck::Pod;
use log::{debug, warn};

use crate::algs::communicator::Communicator;
use crate::algs::redistribute::{
    PendingPhase, Scratch, Status, complete_phase, phase_comm, phase_tag, post_phase, run_phase,
};
use crate::collective::datatype::Datatype;
use crate::config::CollectiveTags;
use crate::debug_invariants::DebugInvariants;
use crate::locality_error::LocalityError;
use crate::plan::{LocalityPlan, Phase};
use crate::topology::Topology;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestState {
    Initialized,
    Started,
    Completed,
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestState::Initialized => "initialized",
            RequestState::Started => "started",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        })
    }
}

pub struct PersistentRequest<'c, C: Communicator> {
    topology: Topology<'c, C>,
    plan: LocalityPlan,
    tags: CollectiveTags,
    send_type: Datatype,
    recv_type: Datatype,
    scratch: Scratch,
    pending: Option<PendingPhase<C>>,
    state: RequestState,
    starts: u64,
}

impl<'c, C: Communicator> PersistentRequest<'c, C> {
    pub(crate) fn new(
        topology: Topology<'c, C>,
        plan: LocalityPlan,
        tags: CollectiveTags,
        send_type: Datatype,
        recv_type: Datatype,
    ) -> Self {
        plan.debug_assert_invariants();
        let scratch = Scratch::for_plan(&plan);
        debug!(
            "persistent request on rank {}: staging {} B, aggregate {} B, exchange {} B",
            topology.rank(),
            scratch.staging.len(),
            scratch.aggregate.len(),
            scratch.exchange.len()
        );
        Self {
            topology,
            plan,
            tags,
            send_type,
            recv_type,
            scratch,
            pending: None,
            state: RequestState::Initialized,
            starts: 0,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn plan(&self) -> &LocalityPlan {
        &self.plan
    }

    pub fn topology(&self) -> &Topology<'c, C> {
        &self.topology
    }

    pub fn tags(&self) -> &CollectiveTags {
        &self.tags
    }

    /// Number of successful starts so far.
    pub fn starts(&self) -> u64 {
        self.starts
    }

    /// Pack `send` and post the aggregate phase.
    pub fn start<S: Pod>(&mut self, send: &[S]) -> Result<(), LocalityError> {
        match self.state {
            RequestState::Initialized | RequestState::Completed => {}
            state => return Err(LocalityError::InvalidState { op: "start", state }),
        }
        self.send_type.check_element::<S>("send")?;
        let bytes: &[u8] = bytemuck::cast_slice(send);
        if bytes.len() < self.plan.send_extent {
            return Err(LocalityError::InvalidArguments(format!(
                "send buffer has {} bytes, plan reads {}",
                bytes.len(),
                self.plan.send_extent
            )));
        }

        let posted = phase_comm(&self.topology, &self.plan, Phase::Aggregate).and_then(|comm| {
            post_phase(
                comm,
                Phase::Aggregate,
                &self.plan.aggregate,
                phase_tag(&self.tags, Phase::Aggregate),
                bytes,
                &mut self.scratch.staging,
            )
        });
        match posted {
            Ok(pending) => {
                self.pending = Some(pending);
                self.state = RequestState::Started;
                self.starts += 1;
                Ok(())
            }
            Err(e) => {
                self.state = RequestState::Failed;
                Err(e)
            }
        }
    }

    /// Complete the collective into `recv`.
    ///
    /// Argument errors leave the request started, so `wait` can be retried
    /// with a correct buffer.
    pub fn wait<R: Pod>(&mut self, recv: &mut [R]) -> Result<Status, LocalityError> {
        if self.state != RequestState::Started {
            return Err(LocalityError::InvalidState {
                op: "wait",
                state: self.state,
            });
        }
        self.recv_type.check_element::<R>("recv")?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(recv);
        if bytes.len() < self.plan.recv_extent {
            return Err(LocalityError::InvalidArguments(format!(
                "receive buffer has {} bytes, plan writes {}",
                bytes.len(),
                self.plan.recv_extent
            )));
        }
        let Some(pending) = self.pending.take() else {
            self.state = RequestState::Failed;
            return Err(LocalityError::InvalidState {
                op: "wait",
                state: RequestState::Failed,
            });
        };

        match self.finish(pending, bytes) {
            Ok(status) => {
                self.state = RequestState::Completed;
                Ok(status)
            }
            Err(e) => {
                self.state = RequestState::Failed;
                Err(e)
            }
        }
    }

    fn finish(&mut self, pending: PendingPhase<C>, recv: &mut [u8]) -> Result<Status, LocalityError> {
        let Scratch {
            staging,
            aggregate,
            exchange,
        } = &mut self.scratch;
        let mut status = Status::default();

        let counts = complete_phase(&self.plan.aggregate, pending, staging, aggregate)?;
        status.record(Phase::Aggregate, counts);

        let counts = run_phase(
            phase_comm(&self.topology, &self.plan, Phase::Exchange)?,
            Phase::Exchange,
            &self.plan.exchange,
            phase_tag(&self.tags, Phase::Exchange),
            aggregate,
            staging,
            exchange,
        )?;
        status.record(Phase::Exchange, counts);

        let counts = run_phase(
            phase_comm(&self.topology, &self.plan, Phase::Scatter)?,
            Phase::Scatter,
            &self.plan.scatter,
            phase_tag(&self.tags, Phase::Scatter),
            exchange,
            staging,
            recv,
        )?;
        status.record(Phase::Scatter, counts);
        Ok(status)
    }

    /// Release the request together with its topology.
    ///
    /// Freeing a started request drains its outstanding operations and is
    /// reported as an error.
    pub fn free(mut self) -> Result<(), LocalityError> {
        if self.state == RequestState::Started {
            if let Some(pending) = self.pending.take() {
                let _ = pending.drain();
            }
            self.state = RequestState::Failed;
            return Err(LocalityError::InvalidState {
                op: "free",
                state: RequestState::Started,
            });
        }
        debug!(
            "persistent request on rank {} freed after {} starts",
            self.topology.rank(),
            self.starts
        );
        Ok(())
    }
}

impl<C: Communicator> Drop for PersistentRequest<'_, C> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            warn!(
                "persistent request on rank {} dropped during {}; draining {} operations",
                self.topology.rank(),
                pending.phase(),
                pending.outstanding()
            );
            let _ = pending.drain();
        }
    }
}
