//! Three-level process model: global rank → (node, local rank).
//!
//! Assumes SMP ordering (node-local ranks are consecutive global ranks) and
//! the same number of processes on every node. Both are checked collectively
//! when the topology is built with `verify_layout`, so every process reports
//! the same error.

use log::debug;

use crate::algs::communicator::Communicator;
use crate::config::{LocalityConfig, NodeGrouping};
use crate::locality_error::LocalityError;
use crate::topology::neighborhood::Neighborhood;

/// Node decomposition of a communicator.
///
/// Owns the node-local communicator and, for neighbor collectives, a
/// [`Neighborhood`]. Both are released when the topology is freed or dropped.
pub struct Topology<'c, C: Communicator> {
    global: &'c C,
    local: C,
    neighborhood: Option<Neighborhood<C>>,
    config: LocalityConfig,
    rank: usize,
    size: usize,
    ppn: usize,
    num_nodes: usize,
    rank_node: usize,
    local_rank: usize,
}

impl<'c, C: Communicator> Topology<'c, C> {
    /// Build with the process-wide configuration.
    pub fn init(comm: &'c C) -> Result<Self, LocalityError> {
        Self::with_config(comm, LocalityConfig::global())
    }

    pub fn with_config(comm: &'c C, config: &LocalityConfig) -> Result<Self, LocalityError> {
        config.validate()?;
        let rank = comm.rank();
        let size = comm.size();

        let split = match config.grouping {
            NodeGrouping::SharedMemory => comm.split_shared(rank),
            NodeGrouping::FixedPpn(ppn) => comm.split(rank / ppn, rank),
        };
        let local = split.map_err(|e| match e {
            LocalityError::TopologySplit(_) => e,
            other => LocalityError::TopologySplit(other.to_string()),
        })?;

        let ppn = local.size();
        let local_rank = local.rank();
        if config.verify_layout {
            verify_layout(comm, ppn, local_rank)?;
        } else if ppn == 0 || size % ppn != 0 {
            return Err(LocalityError::NonUniformNodes {
                size,
                ppn,
                detail: "process count is not a multiple of the node size".into(),
            });
        }

        let num_nodes = size / ppn;
        let rank_node = rank / ppn;
        debug!(
            "topology: rank {rank}/{size} on node {rank_node}/{num_nodes} (local rank {local_rank}, ppn {ppn})"
        );
        Ok(Self {
            global: comm,
            local,
            neighborhood: None,
            config: config.clone(),
            rank,
            size,
            ppn,
            num_nodes,
            rank_node,
            local_rank,
        })
    }

    /// Topology plus a sparse neighborhood (`sources` → me → `destinations`).
    pub fn dist_graph_create_adjacent(
        comm: &'c C,
        sources: &[usize],
        destinations: &[usize],
        config: &LocalityConfig,
    ) -> Result<Self, LocalityError> {
        let mut topo = Self::with_config(comm, config)?;
        let dup = comm.duplicate()?;
        topo.neighborhood = Some(Neighborhood::new(dup, sources, destinations)?);
        Ok(topo)
    }

    /// Release the node-local and neighbor communicators.
    pub fn free(self) {
        debug!("topology: rank {} released", self.rank);
    }

    #[inline]
    pub fn node_of(&self, rank: usize) -> usize {
        rank / self.ppn
    }

    #[inline]
    pub fn local_rank_of(&self, rank: usize) -> usize {
        rank % self.ppn
    }

    #[inline]
    pub fn global_rank_of(&self, node: usize, local_rank: usize) -> usize {
        node * self.ppn + local_rank
    }

    pub fn global(&self) -> &'c C {
        self.global
    }

    pub fn local(&self) -> &C {
        &self.local
    }

    pub fn neighborhood(&self) -> Option<&Neighborhood<C>> {
        self.neighborhood.as_ref()
    }

    pub fn config(&self) -> &LocalityConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ppn(&self) -> usize {
        self.ppn
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn rank_node(&self) -> usize {
        self.rank_node
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }
}

/// Every process contributes `(ppn, local_rank)` and checks the whole table,
/// so a bad layout fails identically everywhere.
fn verify_layout<C: Communicator>(
    comm: &C,
    ppn: usize,
    local_rank: usize,
) -> Result<(), LocalityError> {
    let size = comm.size();
    let rank = comm.rank();
    let mut table = vec![0u64; 2 * size];
    table[2 * rank] = ppn as u64;
    table[2 * rank + 1] = local_rank as u64;
    comm.all_reduce_sum(&mut table)?;

    let uneven = |detail: String| LocalityError::NonUniformNodes { size, ppn, detail };
    if size % ppn != 0 {
        return Err(uneven("process count is not a multiple of the node size".into()));
    }
    for r in 0..size {
        let (their_ppn, their_local) = (table[2 * r] as usize, table[2 * r + 1] as usize);
        if their_ppn != ppn {
            return Err(uneven(format!("rank {r} is on a node with {their_ppn} processes")));
        }
        if their_local != r % ppn {
            return Err(uneven(format!(
                "rank {r} has local rank {their_local}, SMP ordering needs {}",
                r % ppn
            )));
        }
    }
    Ok(())
}
