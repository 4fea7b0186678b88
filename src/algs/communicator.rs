//! Thin façade over in-process (simulated cluster) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices*. Sends copy their payload when they
//! are posted, so the caller's buffer is free as soon as `isend` returns.
//! All handles are **waitable** but non-blocking; the redistribution engine
//! calls `.wait()` before it trusts that received data is ready.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::algs::wire::{decode_u64s, encode_u64s};
use crate::locality_error::LocalityError;

/// Tag reserved for the in-process reduction; user tags must stay below it.
pub const REDUCE_TAG: u16 = u16::MAX;

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (receives only).
    fn wait(self) -> Result<Option<Vec<u8>>, LocalityError>;
}

/// Non-blocking point-to-point transport plus the handful of collectives the
/// engine needs during setup.
pub trait Communicator: Sized {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<Self::SendHandle, LocalityError>;
    /// Post a receive of exactly `len` bytes; the payload comes back from `wait`.
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Result<Self::RecvHandle, LocalityError>;

    /// Block until a message carrying `tag` is available from any source.
    /// Returns `(source, byte_len)`; the message stays queued.
    fn probe_any(&self, tag: u16) -> Result<(usize, usize), LocalityError>;

    /// Element-wise sum over all ranks, in place.
    fn all_reduce_sum(&self, values: &mut [u64]) -> Result<(), LocalityError>;

    /// Collective split; ranks with equal `color` form one communicator,
    /// ordered by `key`.
    fn split(&self, color: usize, key: usize) -> Result<Self, LocalityError>;
    /// Collective split into groups of processes that share memory.
    fn split_shared(&self, key: usize) -> Result<Self, LocalityError>;
    fn duplicate(&self) -> Result<Self, LocalityError>;

    fn barrier(&self) -> Result<(), LocalityError> {
        self.all_reduce_sum(&mut [])
    }

    fn is_no_comm(&self) -> bool {
        false
    }
}

/// Single-process communicator. Every message in a one-rank collective is a
/// self-message, which the engine copies locally, so the transport is never
/// exercised.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Result<Option<Vec<u8>>, LocalityError> {
        Ok(None)
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) -> Result<(), LocalityError> {
        Ok(())
    }
    fn irecv(&self, _peer: usize, _tag: u16, _len: usize) -> Result<(), LocalityError> {
        Ok(())
    }
    fn probe_any(&self, tag: u16) -> Result<(usize, usize), LocalityError> {
        Err(LocalityError::comm(
            0,
            format!("probe for tag {tag:#x} on a serial communicator"),
        ))
    }
    fn all_reduce_sum(&self, _values: &mut [u64]) -> Result<(), LocalityError> {
        Ok(())
    }
    fn split(&self, _color: usize, _key: usize) -> Result<Self, LocalityError> {
        Ok(NoComm)
    }
    fn split_shared(&self, _key: usize) -> Result<Self, LocalityError> {
        Ok(NoComm)
    }
    fn duplicate(&self) -> Result<Self, LocalityError> {
        Ok(NoComm)
    }
    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- LocalComm: simulated cluster, one thread per rank ---

type Key = (u64, usize, usize, u16); // (context, src world, dst world, tag)

/// One transport message as seen by the fabric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrafficRecord {
    pub context: u64,
    pub src: usize,
    pub dst: usize,
    pub tag: u16,
    pub len: usize,
}

#[derive(Default)]
struct Mailbox {
    queues: HashMap<Key, VecDeque<Bytes>>,
    poisoned: Option<String>,
}

struct Fabric {
    node_of: Vec<usize>,
    mailbox: Mutex<Mailbox>,
    arrived: Condvar,
    contexts: DashMap<(u64, u64, usize), u64>,
    next_context: AtomicU64,
    traffic: Mutex<Vec<TrafficRecord>>,
    failing: DashSet<usize>,
}

impl Fabric {
    fn poison(&self, why: String) {
        let mut mb = self.mailbox.lock();
        mb.poisoned.get_or_insert(why);
        self.arrived.notify_all();
    }
}

/// In-process communicator: a handle per simulated rank sharing one fabric.
///
/// Messages are FIFO per (communicator, source, destination, tag). Nodes are
/// simulated through a world-rank → node map consulted by `split_shared`.
#[derive(Clone)]
pub struct LocalComm {
    fabric: Arc<Fabric>,
    context: u64,
    members: Arc<[usize]>,
    rank: usize,
    splits: Arc<AtomicU64>,
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("context", &self.context)
            .field("rank", &self.rank)
            .field("size", &self.members.len())
            .finish()
    }
}

impl LocalComm {
    /// `nodes * ppn` ranks, SMP ordered: rank `r` lives on node `r / ppn`.
    pub fn cluster(nodes: usize, ppn: usize) -> Vec<LocalComm> {
        let layout = (0..nodes * ppn).map(|r| r / ppn.max(1)).collect();
        Self::with_node_layout(layout)
    }

    /// Arbitrary placement: `node_of[r]` is the node of world rank `r`.
    pub fn with_node_layout(node_of: Vec<usize>) -> Vec<LocalComm> {
        let size = node_of.len();
        let fabric = Arc::new(Fabric {
            node_of,
            mailbox: Mutex::new(Mailbox::default()),
            arrived: Condvar::new(),
            contexts: DashMap::new(),
            next_context: AtomicU64::new(1),
            traffic: Mutex::new(Vec::new()),
            failing: DashSet::new(),
        });
        let members: Arc<[usize]> = (0..size).collect::<Vec<_>>().into();
        (0..size)
            .map(|rank| LocalComm {
                fabric: fabric.clone(),
                context: 0,
                members: members.clone(),
                rank,
                splits: Arc::new(AtomicU64::new(0)),
            })
            .collect()
    }

    pub fn world_rank(&self) -> usize {
        self.members[self.rank]
    }

    /// World rank of this communicator's rank `r`.
    pub fn world_rank_of(&self, r: usize) -> usize {
        self.members[r]
    }

    /// Simulated node of a world rank.
    pub fn node_of_world(&self, world: usize) -> usize {
        self.fabric.node_of[world]
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    /// Every message posted on the fabric so far, in posting order.
    pub fn traffic(&self) -> Vec<TrafficRecord> {
        self.fabric.traffic.lock().clone()
    }

    pub fn clear_traffic(&self) {
        self.fabric.traffic.lock().clear();
    }

    /// Make every later send to world rank `dst` fail. The failure poisons the
    /// fabric, so all blocked waits on every rank return an error.
    pub fn inject_send_failure(&self, dst: usize) {
        self.fabric.failing.insert(dst);
    }

    /// Poison the fabric: every blocked or later operation on any rank fails.
    pub fn abort(&self, why: impl Into<String>) {
        self.fabric.poison(why.into());
    }

    fn check_peer(&self, peer: usize) -> Result<usize, LocalityError> {
        self.members.get(peer).copied().ok_or_else(|| {
            LocalityError::comm(
                peer,
                format!("rank out of range for communicator of size {}", self.members.len()),
            )
        })
    }
}

pub struct LocalSend;

impl Wait for LocalSend {
    fn wait(self) -> Result<Option<Vec<u8>>, LocalityError> {
        Ok(None)
    }
}

pub struct LocalRecv {
    fabric: Arc<Fabric>,
    key: Key,
    peer: usize,
    len: usize,
}

impl Wait for LocalRecv {
    fn wait(self) -> Result<Option<Vec<u8>>, LocalityError> {
        let mut mb = self.fabric.mailbox.lock();
        loop {
            if let Some(why) = &mb.poisoned {
                return Err(LocalityError::comm(self.peer, format!("fabric aborted: {why}")));
            }
            if let Some(msg) = mb.queues.get_mut(&self.key).and_then(|q| q.pop_front()) {
                if msg.len() > self.len {
                    return Err(LocalityError::comm(
                        self.peer,
                        format!("message of {} bytes truncated to {}", msg.len(), self.len),
                    ));
                }
                return Ok(Some(msg.to_vec()));
            }
            self.fabric.arrived.wait(&mut mb);
        }
    }
}

impl Communicator for LocalComm {
    type SendHandle = LocalSend;
    type RecvHandle = LocalRecv;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<LocalSend, LocalityError> {
        let src = self.world_rank();
        let dst = self.check_peer(peer)?;
        if self.fabric.failing.contains(&dst) {
            let why = format!("injected send failure {src} -> {dst}");
            self.fabric.poison(why.clone());
            return Err(LocalityError::comm(peer, why));
        }
        let key = (self.context, src, dst, tag);
        {
            let mut mb = self.fabric.mailbox.lock();
            if let Some(why) = &mb.poisoned {
                return Err(LocalityError::comm(peer, format!("fabric aborted: {why}")));
            }
            mb.queues
                .entry(key)
                .or_default()
                .push_back(Bytes::copy_from_slice(buf));
        }
        self.fabric.traffic.lock().push(TrafficRecord {
            context: self.context,
            src,
            dst,
            tag,
            len: buf.len(),
        });
        self.fabric.arrived.notify_all();
        Ok(LocalSend)
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Result<LocalRecv, LocalityError> {
        let src = self.check_peer(peer)?;
        Ok(LocalRecv {
            fabric: self.fabric.clone(),
            key: (self.context, src, self.world_rank(), tag),
            peer,
            len,
        })
    }

    fn probe_any(&self, tag: u16) -> Result<(usize, usize), LocalityError> {
        let me = self.world_rank();
        let mut mb = self.fabric.mailbox.lock();
        loop {
            if let Some(why) = &mb.poisoned {
                return Err(LocalityError::comm(self.rank, format!("fabric aborted: {why}")));
            }
            let found = mb
                .queues
                .iter()
                .filter(|((ctx, _, dst, t), q)| {
                    *ctx == self.context && *dst == me && *t == tag && !q.is_empty()
                })
                .map(|((_, src, _, _), q)| (*src, q[0].len()))
                .min();
            if let Some((src_world, len)) = found {
                let src = self
                    .members
                    .iter()
                    .position(|&w| w == src_world)
                    .ok_or_else(|| {
                        LocalityError::comm(src_world, "probed source outside communicator")
                    })?;
                return Ok((src, len));
            }
            self.fabric.arrived.wait(&mut mb);
        }
    }

    fn all_reduce_sum(&self, values: &mut [u64]) -> Result<(), LocalityError> {
        let n = self.size();
        if n == 1 {
            return Ok(());
        }
        let len = values.len() * std::mem::size_of::<u64>();
        if self.rank == 0 {
            for peer in 1..n {
                let data = self
                    .irecv(peer, REDUCE_TAG, len)?
                    .wait()?
                    .ok_or_else(|| LocalityError::comm(peer, "missing reduction contribution"))?;
                for (acc, v) in values.iter_mut().zip(decode_u64s(&data)) {
                    *acc += v;
                }
            }
            let out = encode_u64s(values);
            for peer in 1..n {
                self.isend(peer, REDUCE_TAG, &out)?.wait()?;
            }
        } else {
            self.isend(0, REDUCE_TAG, &encode_u64s(values))?.wait()?;
            let data = self
                .irecv(0, REDUCE_TAG, len)?
                .wait()?
                .ok_or_else(|| LocalityError::comm(0, "missing reduction result"))?;
            for (dst, v) in values.iter_mut().zip(decode_u64s(&data)) {
                *dst = v;
            }
        }
        Ok(())
    }

    fn split(&self, color: usize, key: usize) -> Result<Self, LocalityError> {
        let n = self.size();
        let seq = self.splits.fetch_add(1, Ordering::Relaxed);
        // allgather (color, key) through the reduction
        let mut table = vec![0u64; 2 * n];
        table[2 * self.rank] = color as u64;
        table[2 * self.rank + 1] = key as u64;
        self.all_reduce_sum(&mut table)?;

        let mut group: Vec<(u64, usize)> = (0..n)
            .filter(|&r| table[2 * r] == color as u64)
            .map(|r| (table[2 * r + 1], r))
            .collect();
        group.sort_unstable();
        let members: Arc<[usize]> = group.iter().map(|&(_, r)| self.members[r]).collect();
        let rank = group
            .iter()
            .position(|&(_, r)| r == self.rank)
            .ok_or_else(|| LocalityError::TopologySplit("rank missing from its own group".into()))?;
        let context = *self
            .fabric
            .contexts
            .entry((self.context, seq, color))
            .or_insert_with(|| self.fabric.next_context.fetch_add(1, Ordering::Relaxed));
        Ok(LocalComm {
            fabric: self.fabric.clone(),
            context,
            members,
            rank,
            splits: Arc::new(AtomicU64::new(0)),
        })
    }

    fn split_shared(&self, key: usize) -> Result<Self, LocalityError> {
        let node = self.fabric.node_of[self.world_rank()];
        self.split(node, key)
    }

    fn duplicate(&self) -> Result<Self, LocalityError> {
        self.split(0, self.rank)
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use crate::locality_error::LocalityError;
    use mpi::collective::SystemOperation;
    use mpi::datatype::Equivalence;
    use mpi::ffi;
    use mpi::raw::AsRaw;
    use mpi::topology::{Color, SimpleCommunicator};
    use mpi::traits::{Communicator as _, CommunicatorCollectives as _, Source as _};
    use std::os::raw::{c_int, c_void};

    fn check(code: c_int, peer: usize, what: &str) -> Result<(), LocalityError> {
        // MPI_SUCCESS is 0 in every implementation
        if code == 0 {
            Ok(())
        } else {
            Err(LocalityError::comm(peer, format!("{what} failed with MPI error {code}")))
        }
    }

    /// MPI-backed communicator. Payload buffers are owned by the request
    /// handles until the matching wait returns.
    pub struct MpiComm {
        comm: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn world(universe: &mpi::environment::Universe) -> Self {
            Self::from_communicator(universe.world())
        }

        pub fn from_communicator(comm: SimpleCommunicator) -> Self {
            let rank = comm.rank() as usize;
            let size = comm.size() as usize;
            Self { comm, rank, size }
        }

        pub fn raw(&self) -> &SimpleCommunicator {
            &self.comm
        }
    }

    pub struct MpiRequest {
        raw: ffi::MPI_Request,
        buf: Vec<u8>,
        peer: usize,
        recv: bool,
        done: bool,
    }

    impl MpiRequest {
        fn complete(&mut self) -> Result<usize, LocalityError> {
            // SAFETY: `raw` was produced by MPI_Isend/MPI_Irecv over `buf`,
            // which this handle keeps alive until the wait returns.
            let mut status: ffi::MPI_Status = unsafe { std::mem::zeroed() };
            let code = unsafe { ffi::MPI_Wait(&mut self.raw, &mut status) };
            self.done = true;
            check(code, self.peer, "MPI_Wait")?;
            if !self.recv {
                return Ok(0);
            }
            let mut count: c_int = 0;
            let code = unsafe {
                ffi::MPI_Get_count(&status, u8::equivalent_datatype().as_raw(), &mut count)
            };
            check(code, self.peer, "MPI_Get_count")?;
            Ok(count.max(0) as usize)
        }
    }

    impl Wait for MpiRequest {
        fn wait(mut self) -> Result<Option<Vec<u8>>, LocalityError> {
            let n = self.complete()?;
            if self.recv {
                let mut buf = std::mem::take(&mut self.buf);
                buf.truncate(n);
                Ok(Some(buf))
            } else {
                Ok(None)
            }
        }
    }

    impl Drop for MpiRequest {
        fn drop(&mut self) {
            if !self.done {
                // the buffer must outlive the operation
                let _ = self.complete();
            }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiRequest;
        type RecvHandle = MpiRequest;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Result<MpiRequest, LocalityError> {
            let mut req = MpiRequest {
                raw: unsafe { std::mem::zeroed() },
                buf: buf.to_vec(),
                peer,
                recv: false,
                done: false,
            };
            let code = unsafe {
                ffi::MPI_Isend(
                    req.buf.as_ptr() as *const c_void,
                    req.buf.len() as c_int,
                    u8::equivalent_datatype().as_raw(),
                    peer as c_int,
                    tag as c_int,
                    self.comm.as_raw(),
                    &mut req.raw,
                )
            };
            if code != 0 {
                req.done = true;
            }
            check(code, peer, "MPI_Isend")?;
            Ok(req)
        }

        fn irecv(&self, peer: usize, tag: u16, len: usize) -> Result<MpiRequest, LocalityError> {
            let mut req = MpiRequest {
                raw: unsafe { std::mem::zeroed() },
                buf: vec![0u8; len],
                peer,
                recv: true,
                done: false,
            };
            let code = unsafe {
                ffi::MPI_Irecv(
                    req.buf.as_mut_ptr() as *mut c_void,
                    req.buf.len() as c_int,
                    u8::equivalent_datatype().as_raw(),
                    peer as c_int,
                    tag as c_int,
                    self.comm.as_raw(),
                    &mut req.raw,
                )
            };
            if code != 0 {
                req.done = true;
            }
            check(code, peer, "MPI_Irecv")?;
            Ok(req)
        }

        fn probe_any(&self, tag: u16) -> Result<(usize, usize), LocalityError> {
            let status = self.comm.any_process().probe_with_tag(tag as mpi::Tag);
            let len = status.count(u8::equivalent_datatype());
            Ok((status.source_rank() as usize, len.max(0) as usize))
        }

        fn all_reduce_sum(&self, values: &mut [u64]) -> Result<(), LocalityError> {
            if values.is_empty() {
                return Ok(());
            }
            let send = values.to_vec();
            self.comm
                .all_reduce_into(&send[..], values, SystemOperation::sum());
            Ok(())
        }

        fn split(&self, color: usize, key: usize) -> Result<Self, LocalityError> {
            let sub = self
                .comm
                .split_by_color_with_key(Color::with_value(color as c_int), key as c_int)
                .ok_or_else(|| LocalityError::TopologySplit("MPI_Comm_split returned MPI_COMM_NULL".into()))?;
            Ok(Self::from_communicator(sub))
        }

        fn split_shared(&self, key: usize) -> Result<Self, LocalityError> {
            Ok(Self::from_communicator(self.comm.split_shared(key as c_int)))
        }

        fn duplicate(&self) -> Result<Self, LocalityError> {
            Ok(Self::from_communicator(self.comm.duplicate()))
        }

        fn barrier(&self) -> Result<(), LocalityError> {
            self.comm.barrier();
            Ok(())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::{MpiComm, MpiRequest};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_roundtrip_two_ranks() {
        let comms = LocalComm::cluster(1, 2);
        let recv = comms[1].irecv(0, 7, 4).unwrap();
        comms[0].isend(1, 7, &[1, 2, 3, 4]).unwrap().wait().unwrap();
        let data = recv.wait().unwrap().expect("payload from rank 0");
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn truncation_is_an_error() {
        let comms = LocalComm::cluster(1, 2);
        comms[0].isend(1, 3, &[1, 2, 3, 4, 5, 6]).unwrap();
        let res = comms[1].irecv(0, 3, 4).unwrap().wait();
        assert!(matches!(res, Err(LocalityError::CommError { neighbor: 0, .. })));
    }

    #[test]
    fn no_comm_is_serial() {
        let comm = NoComm;
        assert!(comm.is_no_comm());
        assert_eq!((comm.rank(), comm.size()), (0, 1));
        assert!(comm.irecv(0, 1, 8).unwrap().wait().unwrap().is_none());
        assert!(comm.probe_any(1).is_err());
    }

    #[cfg(feature = "mpi-support")]
    #[test]
    fn mpi_comm_is_a_transport() {
        fn transport<C: Communicator>() {}
        transport::<MpiComm>();
    }

    #[test]
    fn probe_reports_source_and_length() {
        let comms = LocalComm::cluster(1, 3);
        comms[2].isend(0, 9, &[7; 5]).unwrap();
        assert_eq!(comms[0].probe_any(9).unwrap(), (2, 5));
        // probing does not consume
        let data = comms[0].irecv(2, 9, 5).unwrap().wait().unwrap().unwrap();
        assert_eq!(data, vec![7; 5]);
    }
}
