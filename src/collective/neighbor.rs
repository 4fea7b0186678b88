//! Locality-aware neighbor all-to-all-v on a topology with a neighborhood.
//!
//! Send counts and displacements are indexed like the neighborhood's
//! destinations, receive counts and displacements like its sources, all in
//! elements. Only node pairs with at least one nonempty edge exchange
//! messages.

use bytemuck::Pod;

use crate::algs::communicator::Communicator;
use crate::algs::redistribute::{Scratch, Status, execute};
use crate::collective::datatype::{Datatype, check_extent};
use crate::collective::persistent::PersistentRequest;
use crate::locality_error::LocalityError;
use crate::plan::build_sparse_plan;
use crate::topology::Topology;

pub fn neighbor_alltoallv<C, S, R>(
    topology: &Topology<'_, C>,
    send: &[S],
    send_counts: &[usize],
    send_displs: &[usize],
    recv: &mut [R],
    recv_counts: &[usize],
    recv_displs: &[usize],
) -> Result<Status, LocalityError>
where
    C: Communicator,
    S: Pod,
    R: Pod,
{
    let send_layout = Datatype::of::<S>().byte_layout("send", send_counts, send_displs)?;
    let recv_layout = Datatype::of::<R>().byte_layout("recv", recv_counts, recv_displs)?;
    let send_bytes: &[u8] = bytemuck::cast_slice(send);
    let recv_bytes: &mut [u8] = bytemuck::cast_slice_mut(recv);
    check_extent("send", &send_layout, send_bytes.len())?;
    check_extent("recv", &recv_layout, recv_bytes.len())?;

    let tags = topology.config().tags();
    let plan = build_sparse_plan(topology, &send_layout, &recv_layout, &tags)?;
    let mut scratch = Scratch::for_plan(&plan);
    execute(topology, &plan, &tags, &mut scratch, send_bytes, recv_bytes)
}

/// Plan a persistent neighbor all-to-all-v. The request takes ownership of
/// `topology`. Collective over the topology's communicator.
pub fn neighbor_alltoallv_init<'c, C: Communicator>(
    topology: Topology<'c, C>,
    send_counts: &[usize],
    send_displs: &[usize],
    send_type: Datatype,
    recv_counts: &[usize],
    recv_displs: &[usize],
    recv_type: Datatype,
) -> Result<PersistentRequest<'c, C>, LocalityError> {
    let send_layout = send_type.byte_layout("send", send_counts, send_displs)?;
    let recv_layout = recv_type.byte_layout("recv", recv_counts, recv_displs)?;
    let tags = topology.config().tags();
    let plan = build_sparse_plan(&topology, &send_layout, &recv_layout, &tags)?;
    Ok(PersistentRequest::new(topology, plan, tags, send_type, recv_type))
}
