#![allow(dead_code)]
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use locality_coll::algs::communicator::{Communicator, LocalComm, TrafficRecord};
use locality_coll::config::CollectiveTags;

/// Run `f` once per rank, each on its own thread, and collect the results in
/// rank order. A panicking rank aborts the fabric so the others fail instead
/// of blocking, then the panic is re-raised.
pub fn run_ranks<T, F>(comms: &[LocalComm], f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&LocalComm) -> T + Sync,
{
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .map(|c| {
                s.spawn(move || match catch_unwind(AssertUnwindSafe(|| f(c))) {
                    Ok(v) => v,
                    Err(panic) => {
                        c.abort(format!("rank {} panicked", c.rank()));
                        resume_unwind(panic)
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(v) => v,
                Err(panic) => resume_unwind(panic),
            })
            .collect()
    })
}

/// Element `k` of the block rank `s` sends to rank `d`.
pub fn value(s: usize, d: usize, k: usize) -> u64 {
    ((s as u64) << 40) | ((d as u64) << 20) | k as u64
}

/// Sentinel for receive-buffer bytes no message should touch.
pub const UNTOUCHED: u64 = u64::MAX;

/// Counts and displacements of an all-to-all-v with element counts
/// `counts[s][d]`, each block followed by `gap` unused elements.
pub struct DenseCase {
    pub counts: Vec<Vec<usize>>,
    pub gap: usize,
}

impl DenseCase {
    pub fn size(&self) -> usize {
        self.counts.len()
    }

    fn packed(&self, sizes: impl Iterator<Item = usize>) -> (Vec<usize>, Vec<usize>, usize) {
        let mut counts = Vec::new();
        let mut displs = Vec::new();
        let mut at = 0;
        for c in sizes {
            counts.push(c);
            displs.push(at);
            at += c + self.gap;
        }
        (counts, displs, at)
    }

    /// `(counts, displs, buffer)` rank `s` sends.
    pub fn send_side(&self, s: usize) -> (Vec<usize>, Vec<usize>, Vec<u64>) {
        let (counts, displs, len) = self.packed(self.counts[s].iter().copied());
        let mut buf = vec![UNTOUCHED; len];
        for d in 0..self.size() {
            for k in 0..counts[d] {
                buf[displs[d] + k] = value(s, d, k);
            }
        }
        (counts, displs, buf)
    }

    /// `(counts, displs, expected buffer)` of rank `d`.
    pub fn recv_side(&self, d: usize) -> (Vec<usize>, Vec<usize>, Vec<u64>) {
        let (counts, displs, len) = self.packed((0..self.size()).map(|s| self.counts[s][d]));
        let mut want = vec![UNTOUCHED; len];
        for s in 0..self.size() {
            for k in 0..counts[s] {
                want[displs[s] + k] = value(s, d, k);
            }
        }
        (counts, displs, want)
    }
}

/// Transport messages of the three data phases.
pub fn data_traffic(comm: &LocalComm, tags: &CollectiveTags) -> Vec<TrafficRecord> {
    comm.traffic()
        .into_iter()
        .filter(|t| [tags.aggregate, tags.exchange, tags.scatter].iter().any(|g| g.as_u16() == t.tag))
        .collect()
}
