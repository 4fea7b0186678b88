//! Execution of one phase of a [`LocalityPlan`].
//!
//! A phase is split in two halves so a persistent request can return between
//! them: [`post_phase`] posts every receive, packs the outgoing messages into
//! the staging buffer and posts every send; [`complete_phase`] waits for the
//! receives, unpacks them and drains the sends. The message to self never
//! touches the transport: it is copied out of the staging buffer. Both halves
//! drain every handle they hold before reporting an error.

use log::trace;

use crate::algs::communicator::{Communicator, Wait};
use crate::config::{CollectiveTags, CommTag};
use crate::locality_error::LocalityError;
use crate::plan::{LocalityPlan, Pattern, Phase, PhasePlan};
use crate::topology::Topology;

/// Handles of a posted phase.
pub struct PendingPhase<C: Communicator> {
    phase: Phase,
    recvs: Vec<(usize, C::RecvHandle)>,
    sends: Vec<C::SendHandle>,
    self_msg: Option<(usize, usize)>,
}

impl<C: Communicator> PendingPhase<C> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn outstanding(&self) -> usize {
        self.recvs.len() + self.sends.len()
    }

    /// Wait for every handle, keeping the first error.
    pub fn drain(self) -> Result<(), LocalityError> {
        let mut maybe_err = None;
        for (_, h) in self.recvs {
            if let Err(e) = h.wait() {
                maybe_err.get_or_insert(e);
            }
        }
        for h in self.sends {
            if let Err(e) = h.wait() {
                maybe_err.get_or_insert(e);
            }
        }
        maybe_err.map_or(Ok(()), Err)
    }
}

/// What a completed phase moved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseCounts {
    /// Messages that went through the transport (both directions).
    pub messages: usize,
    pub bytes_sent: usize,
    pub bytes_received: usize,
}

/// Communicator that carries `phase` of `plan`.
pub fn phase_comm<'a, C: Communicator>(
    topo: &'a Topology<'_, C>,
    plan: &LocalityPlan,
    phase: Phase,
) -> Result<&'a C, LocalityError> {
    match (phase, plan.pattern) {
        (Phase::Aggregate | Phase::Scatter, _) => Ok(topo.local()),
        (Phase::Exchange, Pattern::Dense) => Ok(topo.global()),
        (Phase::Exchange, Pattern::Sparse) => topo
            .neighborhood()
            .map(|nb| nb.comm())
            .ok_or_else(|| {
                LocalityError::InvalidArguments("sparse plan on a topology without neighborhood".into())
            }),
    }
}

pub fn phase_tag(tags: &CollectiveTags, phase: Phase) -> CommTag {
    match phase {
        Phase::Aggregate => tags.aggregate,
        Phase::Exchange => tags.exchange,
        Phase::Scatter => tags.scatter,
    }
}

/// Post the receives and sends of one phase. `src` is the buffer the send
/// segments point into; packed messages are left in `staging`, which must
/// stay untouched until [`complete_phase`] returns.
pub fn post_phase<C: Communicator>(
    comm: &C,
    phase: Phase,
    plan: &PhasePlan,
    tag: CommTag,
    src: &[u8],
    staging: &mut [u8],
) -> Result<PendingPhase<C>, LocalityError> {
    let me = comm.rank();
    let self_msg = plan.self_message(me)?;
    plan.send.pack_all(src, staging)?;

    let mut pending = PendingPhase {
        phase,
        recvs: Vec::with_capacity(plan.recv.n_msgs()),
        sends: Vec::with_capacity(plan.send.n_msgs()),
        self_msg,
    };

    // 1) receives first
    for k in 0..plan.recv.n_msgs() {
        let peer = plan.recv.peer(k);
        if peer == me {
            continue;
        }
        match comm.irecv(peer, tag.as_u16(), plan.recv.message_len(k)) {
            Ok(h) => pending.recvs.push((k, h)),
            Err(e) => return Err(drain_with(pending, e)),
        }
    }

    // 2) sends
    for k in 0..plan.send.n_msgs() {
        let peer = plan.send.peer(k);
        if peer == me {
            continue;
        }
        trace!(
            "{phase}: rank {me} -> {peer}, {} bytes (tag {})",
            plan.send.message_len(k),
            tag.as_u16()
        );
        match comm.isend(peer, tag.as_u16(), &staging[plan.send.staging_range(k)]) {
            Ok(h) => pending.sends.push(h),
            Err(e) => return Err(drain_with(pending, e)),
        }
    }
    Ok(pending)
}

/// Finish a posted phase, scattering received messages into `dst`.
pub fn complete_phase<C: Communicator>(
    plan: &PhasePlan,
    pending: PendingPhase<C>,
    staging: &[u8],
    dst: &mut [u8],
) -> Result<PhaseCounts, LocalityError> {
    let PendingPhase {
        phase,
        recvs,
        sends,
        self_msg,
    } = pending;
    let mut counts = PhaseCounts {
        messages: recvs.len() + sends.len(),
        ..PhaseCounts::default()
    };
    let mut maybe_err = None;

    if let Some((s, r)) = self_msg {
        if let Err(e) = plan
            .recv
            .unpack_message(r, &staging[plan.send.staging_range(s)], dst)
        {
            maybe_err = Some(e);
        }
    }

    for (k, h) in recvs {
        let peer = plan.recv.peer(k);
        match h.wait() {
            Ok(Some(data)) if maybe_err.is_none() => {
                counts.bytes_received += data.len();
                if let Err(e) = plan.recv.unpack_message(k, &data, dst) {
                    maybe_err = Some(e);
                }
            }
            Ok(None) if maybe_err.is_none() => {
                maybe_err = Some(LocalityError::comm(peer, "receive completed without payload"));
            }
            Err(e) if maybe_err.is_none() => maybe_err = Some(e),
            _ => {} // already failing; just drain
        }
    }

    for h in sends {
        if let Err(e) = h.wait() {
            maybe_err.get_or_insert(e);
        }
    }
    if let Some(e) = maybe_err {
        return Err(e);
    }

    counts.bytes_sent = plan.send.size_msgs()
        - self_msg.map_or(0, |(s, _)| plan.send.message_len(s));
    trace!(
        "{phase}: {} messages, {} bytes out, {} bytes in",
        counts.messages, counts.bytes_sent, counts.bytes_received
    );
    Ok(counts)
}

/// Post and complete in one go.
pub fn run_phase<C: Communicator>(
    comm: &C,
    phase: Phase,
    plan: &PhasePlan,
    tag: CommTag,
    src: &[u8],
    staging: &mut [u8],
    dst: &mut [u8],
) -> Result<PhaseCounts, LocalityError> {
    let pending = post_phase(comm, phase, plan, tag, src, staging)?;
    complete_phase(plan, pending, staging, dst)
}

/// Scratch space of a collective: the staging buffer and the two
/// intermediate buffers.
#[derive(Clone, Debug, Default)]
pub struct Scratch {
    pub staging: Vec<u8>,
    pub aggregate: Vec<u8>,
    pub exchange: Vec<u8>,
}

impl Scratch {
    pub fn for_plan(plan: &LocalityPlan) -> Self {
        Self {
            staging: vec![0u8; plan.staging_len()],
            aggregate: vec![0u8; plan.aggregate_len],
            exchange: vec![0u8; plan.exchange_len],
        }
    }
}

/// Totals of a full three-phase run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub bytes_sent: usize,
    pub bytes_received: usize,
    /// Transport messages on the node-local communicator.
    pub local_messages: usize,
    /// Transport messages of the exchange phase.
    pub global_messages: usize,
}

impl Status {
    pub fn record(&mut self, phase: Phase, counts: PhaseCounts) {
        self.bytes_sent += counts.bytes_sent;
        self.bytes_received += counts.bytes_received;
        if phase.is_node_local() {
            self.local_messages += counts.messages;
        } else {
            self.global_messages += counts.messages;
        }
    }
}

/// Run the whole plan once: `send` → aggregate → exchange → `recv`.
pub fn execute<C: Communicator>(
    topo: &Topology<'_, C>,
    plan: &LocalityPlan,
    tags: &CollectiveTags,
    scratch: &mut Scratch,
    send: &[u8],
    recv: &mut [u8],
) -> Result<Status, LocalityError> {
    plan.check_buffers(send.len(), recv.len())?;
    let mut status = Status::default();
    let Scratch {
        staging,
        aggregate,
        exchange,
    } = scratch;

    let counts = run_phase(
        phase_comm(topo, plan, Phase::Aggregate)?,
        Phase::Aggregate,
        &plan.aggregate,
        phase_tag(tags, Phase::Aggregate),
        send,
        staging,
        aggregate,
    )?;
    status.record(Phase::Aggregate, counts);

    let counts = run_phase(
        phase_comm(topo, plan, Phase::Exchange)?,
        Phase::Exchange,
        &plan.exchange,
        phase_tag(tags, Phase::Exchange),
        aggregate,
        staging,
        exchange,
    )?;
    status.record(Phase::Exchange, counts);

    let counts = run_phase(
        phase_comm(topo, plan, Phase::Scatter)?,
        Phase::Scatter,
        &plan.scatter,
        phase_tag(tags, Phase::Scatter),
        exchange,
        staging,
        recv,
    )?;
    status.record(Phase::Scatter, counts);
    Ok(status)
}

fn drain_with<C: Communicator>(pending: PendingPhase<C>, err: LocalityError) -> LocalityError {
    // the first error wins; drain errors are secondary
    let _ = pending.drain();
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{LocalComm, NoComm};
    use crate::plan::CommPlan;

    fn single(peer: usize, offset: usize, len: usize) -> CommPlan {
        let mut b = CommPlan::builder();
        b.begin_message(peer).push_segment(offset, len);
        b.build().unwrap()
    }

    #[test]
    fn self_message_is_a_local_copy() {
        let plan = PhasePlan {
            send: single(0, 2, 3),
            recv: single(0, 0, 3),
        };
        let src = [9u8, 9, 1, 2, 3];
        let mut staging = vec![0u8; 3];
        let mut dst = vec![0u8; 3];
        let counts = run_phase(
            &NoComm,
            Phase::Aggregate,
            &plan,
            CommTag::new(1),
            &src,
            &mut staging,
            &mut dst,
        )
        .unwrap();
        assert_eq!(dst, vec![1, 2, 3]);
        assert_eq!(counts.messages, 0);
        assert_eq!(counts.bytes_sent, 0);
    }

    #[test]
    fn two_ranks_swap() {
        let comms = LocalComm::cluster(1, 2);
        std::thread::scope(|s| {
            for c in &comms {
                s.spawn(move || {
                    let me = c.rank();
                    let other = 1 - me;
                    let plan = PhasePlan {
                        send: single(other, 0, 2),
                        recv: single(other, 2, 2),
                    };
                    let src = [me as u8 * 10, me as u8 * 10 + 1];
                    let mut staging = vec![0u8; 2];
                    let mut dst = vec![0u8; 4];
                    let counts = run_phase(
                        c,
                        Phase::Exchange,
                        &plan,
                        CommTag::new(3),
                        &src,
                        &mut staging,
                        &mut dst,
                    )
                    .unwrap();
                    assert_eq!(&dst[2..], &[other as u8 * 10, other as u8 * 10 + 1]);
                    assert_eq!(counts.messages, 2);
                });
            }
        });
    }
}
