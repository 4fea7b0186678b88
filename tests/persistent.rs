mod util;
use util::*;

use std::sync::Barrier;

use locality_coll::algs::communicator::{Communicator, LocalComm};
use locality_coll::collective::{Datatype, RequestState, alltoallv_init};
use locality_coll::config::{CommTag, LocalityConfig};
use locality_coll::locality_error::LocalityError;

fn full_case(size: usize) -> DenseCase {
    let counts = (0..size).map(|s| (0..size).map(|d| 1 + (s + d) % 3).collect()).collect();
    DenseCase { counts, gap: 1 }
}

#[test]
fn replay_is_idempotent() {
    let case = full_case(6);
    let comms = LocalComm::cluster(3, 2);
    let cfg = LocalityConfig::default();
    run_ranks(&comms, |c| {
        let me = c.rank();
        let (sc, sd, send) = case.send_side(me);
        let (rc, rd, want) = case.recv_side(me);
        let dt = Datatype::of::<u64>();
        let mut req = alltoallv_init(c, &sc, &sd, dt, &rc, &rd, dt, &cfg).unwrap();
        let mut first = None;
        for _ in 0..4 {
            let mut recv = vec![UNTOUCHED; want.len()];
            req.start(&send).unwrap();
            let status = req.wait(&mut recv).unwrap();
            assert_eq!(recv, want);
            // every round moves exactly the same traffic
            assert_eq!(*first.get_or_insert(status), status);
        }
        assert_eq!(req.starts(), 4);
        req.free().unwrap();
    });
}

#[test]
fn send_buffer_is_read_at_start() {
    let case = full_case(4);
    let comms = LocalComm::cluster(2, 2);
    let cfg = LocalityConfig::default();
    run_ranks(&comms, |c| {
        let me = c.rank();
        let (sc, sd, mut send) = case.send_side(me);
        let (rc, rd, want) = case.recv_side(me);
        let dt = Datatype::of::<u64>();
        let mut req = alltoallv_init(c, &sc, &sd, dt, &rc, &rd, dt, &cfg).unwrap();
        req.start(&send).unwrap();
        send.iter_mut().for_each(|v| *v = 0);
        let mut recv = vec![UNTOUCHED; want.len()];
        req.wait(&mut recv).unwrap();
        assert_eq!(recv, want);
    });
}

#[test]
fn zero_volume_start_and_wait_are_silent() {
    let comms = LocalComm::cluster(2, 2);
    let cfg = LocalityConfig::default();
    let barrier = Barrier::new(comms.len());
    run_ranks(&comms, |c| {
        let zeros = vec![0usize; 4];
        let dt = Datatype::byte();
        let mut req = alltoallv_init(c, &zeros, &zeros, dt, &zeros, &zeros, dt, &cfg).unwrap();
        if barrier.wait().is_leader() {
            c.clear_traffic();
        }
        barrier.wait();
        let mut recv = [9u8; 3];
        req.start::<u8>(&[]).unwrap();
        let status = req.wait(&mut recv).unwrap();
        assert_eq!(recv, [9u8; 3]);
        assert_eq!(status.local_messages + status.global_messages, 0);
        barrier.wait();
        assert!(c.traffic().is_empty());
    });
}

#[test]
fn out_of_sequence_calls_are_rejected() {
    let comms = LocalComm::cluster(2, 1);
    let cfg = LocalityConfig::default();
    run_ranks(&comms, |c| {
        let dt = Datatype::of::<u32>();
        let one = [1usize, 1];
        let displs = [0usize, 1];
        let mut req = alltoallv_init(c, &one, &displs, dt, &one, &displs, dt, &cfg).unwrap();
        let mut recv = [0u32; 2];
        assert!(matches!(
            req.wait(&mut recv),
            Err(LocalityError::InvalidState { op: "wait", state: RequestState::Initialized })
        ));
        req.start(&[3u32, 4]).unwrap();
        assert!(matches!(
            req.start(&[3u32, 4]),
            Err(LocalityError::InvalidState { op: "start", state: RequestState::Started })
        ));
        req.wait(&mut recv).unwrap();
        assert!(matches!(
            req.wait(&mut recv),
            Err(LocalityError::InvalidState { op: "wait", state: RequestState::Completed })
        ));
        assert_eq!(req.state(), RequestState::Completed);
        req.free().unwrap();
    });
}

#[test]
fn concurrent_requests_with_distinct_tags() {
    let case_a = full_case(4);
    let case_b = DenseCase {
        counts: vec![vec![2; 4]; 4],
        gap: 0,
    };
    let comms = LocalComm::cluster(2, 2);
    let cfg_a = LocalityConfig::default();
    let cfg_b = LocalityConfig::default().with_tag_base(CommTag::new(0x5000));
    run_ranks(&comms, |c| {
        let me = c.rank();
        let dt = Datatype::of::<u64>();
        let (sca, sda, send_a) = case_a.send_side(me);
        let (rca, rda, want_a) = case_a.recv_side(me);
        let (scb, sdb, send_b) = case_b.send_side(me);
        let (rcb, rdb, want_b) = case_b.recv_side(me);
        let mut a = alltoallv_init(c, &sca, &sda, dt, &rca, &rda, dt, &cfg_a).unwrap();
        let mut b = alltoallv_init(c, &scb, &sdb, dt, &rcb, &rdb, dt, &cfg_b).unwrap();

        let mut recv_a = vec![UNTOUCHED; want_a.len()];
        let mut recv_b = vec![UNTOUCHED; want_b.len()];
        a.start(&send_a).unwrap();
        b.start(&send_b).unwrap();
        b.wait(&mut recv_b).unwrap();
        a.wait(&mut recv_a).unwrap();
        assert_eq!(recv_a, want_a);
        assert_eq!(recv_b, want_b);
    });
}

#[test]
fn transport_failure_moves_to_failed() {
    let comms = LocalComm::cluster(2, 1);
    let cfg = LocalityConfig::default();
    let barrier = Barrier::new(comms.len());
    let states = run_ranks(&comms, |c| {
        let dt = Datatype::of::<u8>();
        let one = [1usize, 1];
        let displs = [0usize, 1];
        let mut req = alltoallv_init(c, &one, &displs, dt, &one, &displs, dt, &cfg).unwrap();
        barrier.wait();
        if c.rank() == 0 {
            c.inject_send_failure(1);
        }
        barrier.wait();
        let mut recv = [0u8; 2];
        let res = req.start(&[1u8, 2]).and_then(|()| req.wait(&mut recv).map(|_| ()));
        assert!(matches!(res, Err(LocalityError::CommError { .. })));
        let state = req.state();
        assert!(matches!(
            req.start(&[1u8, 2]),
            Err(LocalityError::InvalidState { op: "start", state: RequestState::Failed })
        ));
        state
    });
    assert!(states.iter().all(|s| *s == RequestState::Failed));
}
