mod util;
use util::*;

use locality_coll::algs::communicator::{Communicator, LocalComm, Wait};
use locality_coll::locality_error::LocalityError;

#[test]
fn fifo_order_per_tag() {
    let comms = LocalComm::cluster(1, 2);
    for i in 0..10u8 {
        comms[0].isend(1, 0x1001, &[i]).unwrap();
    }
    let out: Vec<u8> = (0..10)
        .map(|_| comms[1].irecv(0, 0x1001, 1).unwrap().wait().unwrap().unwrap()[0])
        .collect();
    assert_eq!(out, (0u8..10u8).collect::<Vec<_>>());
}

#[test]
fn tags_do_not_match_each_other() {
    let comms = LocalComm::cluster(1, 2);
    let rxa = comms[1].irecv(0, 0xA100, 1).unwrap();
    let rxb = comms[1].irecv(0, 0xB200, 1).unwrap();
    comms[0].isend(1, 0xB200, &[2]).unwrap();
    comms[0].isend(1, 0xA100, &[1]).unwrap();
    assert_eq!(rxa.wait().unwrap().unwrap(), vec![1]);
    assert_eq!(rxb.wait().unwrap().unwrap(), vec![2]);
}

#[test]
fn all_reduce_sums_across_threads() {
    let comms = LocalComm::cluster(2, 3);
    let sums = run_ranks(&comms, |c| {
        let mut v = vec![c.rank() as u64, 1];
        c.all_reduce_sum(&mut v).unwrap();
        v
    });
    assert!(sums.iter().all(|v| v == &vec![15, 6]));
}

#[test]
fn split_shared_follows_node_layout() {
    let comms = LocalComm::with_node_layout(vec![0, 0, 1, 1, 1]);
    let locals = run_ranks(&comms, |c| {
        let l = c.split_shared(c.rank()).unwrap();
        (l.rank(), l.size(), l.world_rank_of(0))
    });
    assert_eq!(locals, vec![(0, 2, 0), (1, 2, 0), (0, 3, 2), (1, 3, 2), (2, 3, 2)]);
}

#[test]
fn split_key_orders_ranks() {
    let comms = LocalComm::cluster(1, 4);
    let ranks = run_ranks(&comms, |c| {
        let sub = c.split(c.rank() % 2, 10 - c.rank()).unwrap();
        sub.rank()
    });
    assert_eq!(ranks, vec![1, 1, 0, 0]);
}

#[test]
fn duplicate_isolates_traffic() {
    let comms = LocalComm::cluster(1, 2);
    let dups = run_ranks(&comms, |c| c.duplicate().unwrap());
    assert_ne!(dups[0].context(), comms[0].context());
    assert_eq!(dups[0].context(), dups[1].context());

    comms[0].isend(1, 5, &[1]).unwrap();
    dups[0].isend(1, 5, &[2]).unwrap();
    assert_eq!(dups[1].irecv(0, 5, 1).unwrap().wait().unwrap().unwrap(), vec![2]);
    assert_eq!(comms[1].irecv(0, 5, 1).unwrap().wait().unwrap().unwrap(), vec![1]);
}

#[test]
fn injected_failure_poisons_every_rank() {
    let comms = LocalComm::cluster(1, 2);
    comms[0].inject_send_failure(1);
    let waiting = comms[0].irecv(1, 7, 4).unwrap();
    assert!(matches!(
        comms[0].isend(1, 7, &[0; 4]),
        Err(LocalityError::CommError { neighbor: 1, .. })
    ));
    assert!(waiting.wait().is_err());
    assert!(comms[1].isend(0, 7, &[0; 4]).is_err());
}

#[test]
fn traffic_log_records_sends() {
    let comms = LocalComm::cluster(2, 1);
    comms[1].isend(0, 0x33, &[0; 12]).unwrap();
    let log = comms[0].traffic();
    assert_eq!(log.len(), 1);
    assert_eq!((log[0].src, log[0].dst, log[0].tag, log[0].len), (1, 0, 0x33, 12));
    comms[0].clear_traffic();
    assert!(comms[1].traffic().is_empty());
}
