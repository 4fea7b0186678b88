//! Sparse communication pattern attached to a topology.

use hashbrown::HashSet;

use crate::algs::communicator::Communicator;
use crate::locality_error::LocalityError;

/// Who-talks-to-whom for neighbor collectives, plus a duplicated
/// communicator so setup and data traffic never match the caller's messages.
pub struct Neighborhood<C: Communicator> {
    comm: C,
    sources: Vec<usize>,
    destinations: Vec<usize>,
}

impl<C: Communicator> Neighborhood<C> {
    /// `sources` are the ranks this process receives from, `destinations`
    /// the ranks it sends to; the order fixes the meaning of the per-neighbor
    /// count and displacement arrays of every neighbor collective.
    pub fn new(comm: C, sources: &[usize], destinations: &[usize]) -> Result<Self, LocalityError> {
        let size = comm.size();
        check_list("sources", sources, size)?;
        check_list("destinations", destinations, size)?;
        Ok(Self {
            comm,
            sources: sources.to_vec(),
            destinations: destinations.to_vec(),
        })
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn sources(&self) -> &[usize] {
        &self.sources
    }

    pub fn destinations(&self) -> &[usize] {
        &self.destinations
    }

    pub fn indegree(&self) -> usize {
        self.sources.len()
    }

    pub fn outdegree(&self) -> usize {
        self.destinations.len()
    }
}

fn check_list(what: &str, ranks: &[usize], size: usize) -> Result<(), LocalityError> {
    let mut seen = HashSet::with_capacity(ranks.len());
    for &r in ranks {
        if r >= size {
            return Err(LocalityError::InvalidAdjacency(format!(
                "{what} contains rank {r}, communicator size is {size}"
            )));
        }
        if !seen.insert(r) {
            return Err(LocalityError::InvalidAdjacency(format!(
                "{what} lists rank {r} more than once"
            )));
        }
    }
    Ok(())
}
