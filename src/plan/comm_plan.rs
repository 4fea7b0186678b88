//! Compressed-row description of one direction of one phase.
//!
//! Message `k` goes to (or comes from) `procs[k]`, occupies
//! `displs[k]..displs[k+1]` of the contiguous staging space, and is gathered
//! from (or scattered to) `segments[ptr[k]..ptr[k+1]]` of the caller-side
//! buffer. Plans are built once through [`CommPlanBuilder`] and are immutable
//! afterwards.

use std::ops::Range;

use hashbrown::HashSet;

use crate::debug_invariants::{DebugInvariants, check_offsets};
use crate::locality_error::LocalityError;

/// A contiguous byte run of a caller-side buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub offset: usize,
    pub len: usize,
}

impl Segment {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommPlan {
    procs: Vec<usize>,
    ptr: Vec<usize>,
    displs: Vec<usize>,
    segments: Vec<Segment>,
}

impl Default for CommPlan {
    fn default() -> Self {
        Self {
            procs: Vec::new(),
            ptr: vec![0],
            displs: vec![0],
            segments: Vec::new(),
        }
    }
}

impl CommPlan {
    pub fn builder() -> CommPlanBuilder {
        CommPlanBuilder::default()
    }

    pub fn n_msgs(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// Total bytes over all messages.
    pub fn size_msgs(&self) -> usize {
        self.displs[self.procs.len()]
    }

    pub fn procs(&self) -> &[usize] {
        &self.procs
    }

    pub fn ptr(&self) -> &[usize] {
        &self.ptr
    }

    pub fn displs(&self) -> &[usize] {
        &self.displs
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn peer(&self, k: usize) -> usize {
        self.procs[k]
    }

    pub fn message_len(&self, k: usize) -> usize {
        self.displs[k + 1] - self.displs[k]
    }

    /// Byte range of message `k` inside the staging space.
    pub fn staging_range(&self, k: usize) -> Range<usize> {
        self.displs[k]..self.displs[k + 1]
    }

    pub fn message_segments(&self, k: usize) -> &[Segment] {
        &self.segments[self.ptr[k]..self.ptr[k + 1]]
    }

    /// Index of the message exchanged with `peer`, if any.
    pub fn find(&self, peer: usize) -> Option<usize> {
        self.procs.iter().position(|&p| p == peer)
    }

    /// One past the highest caller-buffer byte this plan touches.
    pub fn max_extent(&self) -> usize {
        self.segments.iter().map(Segment::end).max().unwrap_or(0)
    }

    /// Gather message `k` from `src` into `out` (exactly `message_len(k)` bytes).
    pub fn pack_message(&self, k: usize, src: &[u8], out: &mut [u8]) -> Result<(), LocalityError> {
        if out.len() != self.message_len(k) {
            return Err(LocalityError::InvalidPlan(format!(
                "message {k} is {} bytes, staging slot is {}",
                self.message_len(k),
                out.len()
            )));
        }
        let mut cursor = 0;
        for seg in self.message_segments(k) {
            let from = src.get(seg.range()).ok_or_else(|| out_of_bounds(seg, src.len()))?;
            out[cursor..cursor + seg.len].copy_from_slice(from);
            cursor += seg.len;
        }
        Ok(())
    }

    /// Scatter the received bytes of message `k` into `dst`.
    pub fn unpack_message(&self, k: usize, data: &[u8], dst: &mut [u8]) -> Result<(), LocalityError> {
        if data.len() != self.message_len(k) {
            return Err(LocalityError::LengthMismatch {
                peer: self.procs[k],
                expected: self.message_len(k),
                actual: data.len(),
            });
        }
        let dst_len = dst.len();
        let mut cursor = 0;
        for seg in self.message_segments(k) {
            let to = dst
                .get_mut(seg.range())
                .ok_or_else(|| out_of_bounds(seg, dst_len))?;
            to.copy_from_slice(&data[cursor..cursor + seg.len]);
            cursor += seg.len;
        }
        Ok(())
    }

    /// Pack every message into its slot of `staging`.
    pub fn pack_all(&self, src: &[u8], staging: &mut [u8]) -> Result<(), LocalityError> {
        let total = self.size_msgs();
        if staging.len() < total {
            return Err(LocalityError::InvalidPlan(format!(
                "staging buffer holds {} bytes, plan needs {total}",
                staging.len()
            )));
        }
        let slots = self.split_staging(&mut staging[..total]);

        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            slots
                .into_par_iter()
                .enumerate()
                .try_for_each(|(k, out)| self.pack_message(k, src, out))
        }
        #[cfg(not(feature = "rayon"))]
        {
            slots
                .into_iter()
                .enumerate()
                .try_for_each(|(k, out)| self.pack_message(k, src, out))
        }
    }

    fn split_staging<'b>(&self, mut rest: &'b mut [u8]) -> Vec<&'b mut [u8]> {
        let mut slots = Vec::with_capacity(self.n_msgs());
        for k in 0..self.n_msgs() {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(self.message_len(k));
            slots.push(head);
            rest = tail;
        }
        slots
    }
}

fn out_of_bounds(seg: &Segment, len: usize) -> LocalityError {
    LocalityError::InvalidPlan(format!(
        "segment {}..{} outside a {len}-byte buffer",
        seg.offset,
        seg.end()
    ))
}

impl DebugInvariants for CommPlan {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "CommPlan");
    }

    fn validate_invariants(&self) -> Result<(), LocalityError> {
        let n = self.procs.len();
        if self.ptr.len() != n + 1 || self.displs.len() != n + 1 {
            return Err(LocalityError::InvalidPlan(format!(
                "{n} messages but ptr has {} and displs {} entries",
                self.ptr.len(),
                self.displs.len()
            )));
        }
        check_offsets("ptr", &self.ptr, self.segments.len())?;
        let total: usize = self.segments.iter().map(|s| s.len).sum();
        check_offsets("displs", &self.displs, total)?;

        let mut seen = HashSet::with_capacity(n);
        for k in 0..n {
            if !seen.insert(self.procs[k]) {
                return Err(LocalityError::InvalidPlan(format!(
                    "peer {} appears twice",
                    self.procs[k]
                )));
            }
            if self.ptr[k] == self.ptr[k + 1] || self.message_len(k) == 0 {
                return Err(LocalityError::InvalidPlan(format!("message {k} is empty")));
            }
            let seg_bytes: usize = self.message_segments(k).iter().map(|s| s.len).sum();
            if seg_bytes != self.message_len(k) {
                return Err(LocalityError::InvalidPlan(format!(
                    "message {k}: segments hold {seg_bytes} bytes, displs say {}",
                    self.message_len(k)
                )));
            }
        }
        if let Some(i) = self.segments.iter().position(|s| s.len == 0) {
            return Err(LocalityError::InvalidPlan(format!("segment {i} is empty")));
        }
        Ok(())
    }
}

/// Incremental construction of a [`CommPlan`].
///
/// Zero-length segments are skipped, a segment that starts where the
/// previous one in the same message ends is merged into it, and a message
/// that ends up with no bytes is dropped.
#[derive(Debug, Default)]
pub struct CommPlanBuilder {
    plan: CommPlan,
    open: Option<usize>,
    open_bytes: usize,
}

impl CommPlanBuilder {
    /// Start the message for `peer`, closing any open one.
    pub fn begin_message(&mut self, peer: usize) -> &mut Self {
        self.finish_message();
        self.open = Some(peer);
        self.open_bytes = 0;
        self
    }

    pub fn push_segment(&mut self, offset: usize, len: usize) -> &mut Self {
        debug_assert!(self.open.is_some(), "push_segment outside a message");
        if len == 0 {
            return self;
        }
        let first_of_message = self.plan.segments.len() == *self.plan.ptr.last().unwrap_or(&0);
        match self.plan.segments.last_mut() {
            Some(last) if !first_of_message && last.end() == offset => last.len += len,
            _ => self.plan.segments.push(Segment { offset, len }),
        }
        self.open_bytes += len;
        self
    }

    pub fn finish_message(&mut self) -> &mut Self {
        if let Some(peer) = self.open.take() {
            if self.open_bytes > 0 {
                let base = *self.plan.displs.last().unwrap_or(&0);
                self.plan.procs.push(peer);
                self.plan.ptr.push(self.plan.segments.len());
                self.plan.displs.push(base + self.open_bytes);
            }
            self.open_bytes = 0;
        }
        self
    }

    pub fn build(mut self) -> Result<CommPlan, LocalityError> {
        self.finish_message();
        self.plan.validate_invariants()?;
        Ok(self.plan)
    }
}
