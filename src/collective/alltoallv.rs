//! Locality-aware all-to-all-v.
//!
//! Every entry point builds a [`Topology`] on the caller's communicator,
//! plans the three phases and runs them. The one-shot variants discard the
//! plan afterwards; [`alltoallv_init`] keeps it in a [`PersistentRequest`].
//! Counts and displacements are in elements, indexed by global rank.

use bytemuck::Pod;

use crate::algs::communicator::Communicator;
use crate::algs::redistribute::{Scratch, Status, execute};
use crate::collective::datatype::{Datatype, check_extent};
use crate::collective::persistent::PersistentRequest;
use crate::config::LocalityConfig;
use crate::locality_error::LocalityError;
use crate::plan::build_dense_plan;
use crate::topology::Topology;

/// All-to-all-v with the process-wide configuration.
pub fn alltoallv<C, S, R>(
    send: &[S],
    send_counts: &[usize],
    send_displs: &[usize],
    recv: &mut [R],
    recv_counts: &[usize],
    recv_displs: &[usize],
    comm: &C,
) -> Result<Status, LocalityError>
where
    C: Communicator,
    S: Pod,
    R: Pod,
{
    alltoallv_with_config(
        send,
        send_counts,
        send_displs,
        recv,
        recv_counts,
        recv_displs,
        comm,
        LocalityConfig::global(),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn alltoallv_with_config<C, S, R>(
    send: &[S],
    send_counts: &[usize],
    send_displs: &[usize],
    recv: &mut [R],
    recv_counts: &[usize],
    recv_displs: &[usize],
    comm: &C,
    config: &LocalityConfig,
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

    let topo = Topology::with_config(comm, config)?;
    let tags = config.tags();
    let plan = build_dense_plan(&topo, &send_layout, &recv_layout, &tags)?;
    let mut scratch = Scratch::for_plan(&plan);
    let status = execute(&topo, &plan, &tags, &mut scratch, send_bytes, recv_bytes)?;
    topo.free();
    Ok(status)
}

/// Same count to and from every rank; block `r` of each buffer belongs to
/// rank `r`.
pub fn alltoall<C, S, R>(
    send: &[S],
    send_count: usize,
    recv: &mut [R],
    recv_count: usize,
    comm: &C,
) -> Result<Status, LocalityError>
where
    C: Communicator,
    S: Pod,
    R: Pod,
{
    let size = comm.size();
    let send_counts = vec![send_count; size];
    let send_displs: Vec<usize> = (0..size).map(|r| r * send_count).collect();
    let recv_counts = vec![recv_count; size];
    let recv_displs: Vec<usize> = (0..size).map(|r| r * recv_count).collect();
    alltoallv(
        send,
        &send_counts,
        &send_displs,
        recv,
        &recv_counts,
        &recv_displs,
        comm,
    )
}

/// Plan a persistent all-to-all-v. Collective over `comm`.
#[allow(clippy::too_many_arguments)]
pub fn alltoallv_init<'c, C: Communicator>(
    comm: &'c C,
    send_counts: &[usize],
    send_displs: &[usize],
    send_type: Datatype,
    recv_counts: &[usize],
    recv_displs: &[usize],
    recv_type: Datatype,
    config: &LocalityConfig,
) -> Result<PersistentRequest<'c, C>, LocalityError> {
    let send_layout = send_type.byte_layout("send", send_counts, send_displs)?;
    let recv_layout = recv_type.byte_layout("recv", recv_counts, recv_displs)?;
    let topo = Topology::with_config(comm, config)?;
    let tags = config.tags();
    let plan = build_dense_plan(&topo, &send_layout, &recv_layout, &tags)?;
    Ok(PersistentRequest::new(topo, plan, tags, send_type, recv_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    #[test]
    fn serial_alltoall_copies() {
        let send = [1.5f64, 2.5];
        let mut recv = [0f64; 2];
        let status = alltoall(&send, 2, &mut recv, 2, &NoComm).unwrap();
        assert_eq!(recv, send);
        assert_eq!(status, Status::default());
    }

    #[test]
    fn extent_checked_before_communication() {
        let send = [0u32; 2];
        let mut recv = [0u32; 4];
        let res = alltoallv(&send, &[3], &[0], &mut recv, &[3], &[0], &NoComm);
        assert!(matches!(res, Err(LocalityError::InvalidArguments(_))));
    }
}
