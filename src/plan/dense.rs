//! Plan construction for the all-to-all pattern.
//!
//! Nodes are dealt to local ranks with [`NodeSlices`]; local rank `owner(b)`
//! of every node carries that node's traffic to node `b`, and it talks to
//! local rank `owner(a)` of node `b` (the rank that carries `b`'s traffic
//! back to `a`). Before the plans can be written each representative must
//! learn, for the nodes it carries, what every process on its node sends to
//! and receives from every process on those nodes. One node-local exchange of
//! `2 · |slice| · ppn` byte counts per pair provides that.

use log::debug;

use crate::algs::communicator::Communicator;
use crate::algs::size_exchange::exchange_fixed;
use crate::algs::wire::WireBytes;
use crate::config::CollectiveTags;
use crate::locality_error::LocalityError;
use crate::plan::{ByteLayout, CommPlan, LocalityPlan, Pattern, PhasePlan};
use crate::topology::{NodeSlices, Topology};

/// Build the three-phase plan of an all-to-all-v on `topo`.
///
/// `send` and `recv` are indexed by global rank and given in bytes.
pub fn build_dense_plan<C: Communicator>(
    topo: &Topology<'_, C>,
    send: &ByteLayout,
    recv: &ByteLayout,
    tags: &CollectiveTags,
) -> Result<LocalityPlan, LocalityError> {
    let size = topo.size();
    for (what, layout) in [("send", send), ("recv", recv)] {
        if layout.counts.len() != size || layout.displs.len() != size {
            return Err(LocalityError::InvalidArguments(format!(
                "{what} counts/displs need {size} entries, got {}/{}",
                layout.counts.len(),
                layout.displs.len()
            )));
        }
    }

    let p = topo.ppn();
    let slices = NodeSlices::new(topo.num_nodes(), p);
    let me = topo.local_rank();
    let mine = slices.range(me);
    let l = mine.len();

    // what every local rank needs to know about the nodes in its slice
    let meta_out: Vec<Vec<WireBytes>> = (0..p)
        .map(|i| {
            let nodes = slices.range(i);
            let mut v = Vec::with_capacity(2 * nodes.len() * p);
            for m in nodes.clone() {
                v.extend((0..p).map(|ld| WireBytes::new(send.counts[m * p + ld])));
            }
            for m in nodes {
                v.extend((0..p).map(|ls| WireBytes::new(recv.counts[m * p + ls])));
            }
            v
        })
        .collect();
    let outgoing: Vec<(usize, &[WireBytes])> = meta_out
        .iter()
        .enumerate()
        .map(|(i, v)| (i, v.as_slice()))
        .collect();
    let incoming: Vec<(usize, usize)> = (0..p).map(|ls| (ls, 2 * l * p)).collect();
    let meta: Vec<Vec<usize>> = exchange_fixed(topo.local(), &outgoing, &incoming, tags.meta_data)?
        .into_iter()
        .map(|v| v.iter().map(WireBytes::get).collect())
        .collect();

    // sc(ls, mi, ld): bytes local rank ls sends to rank ld of node mine[mi]
    let sc = |ls: usize, mi: usize, ld: usize| meta[ls][mi * p + ld];
    // rc(ld, mi, ls): bytes local rank ld receives from rank ls of node mine[mi]
    let rc = |ld: usize, mi: usize, ls: usize| meta[ld][l * p + mi * p + ls];

    // aggregate buffer: one block per local sender, (mi, ld) order inside
    let mut a_off = vec![0usize; p + 1];
    let mut a_pos = vec![vec![0usize; l * p]; p];
    for ls in 0..p {
        let mut cursor = a_off[ls];
        for (j, pos) in a_pos[ls].iter_mut().enumerate() {
            *pos = cursor;
            cursor += sc(ls, j / p, j % p);
        }
        a_off[ls + 1] = cursor;
    }
    let aggregate_len = a_off[p];

    // exchange buffer: one block per carried node, (ld, ls) order inside
    let mut b_off = vec![0usize; l + 1];
    let mut b_pos = vec![0usize; l * p * p];
    for mi in 0..l {
        let mut cursor = b_off[mi];
        for ld in 0..p {
            for ls in 0..p {
                b_pos[(mi * p + ld) * p + ls] = cursor;
                cursor += rc(ld, mi, ls);
            }
        }
        b_off[mi + 1] = cursor;
    }
    let exchange_len = b_off[l];

    let aggregate = PhasePlan {
        send: {
            let mut b = CommPlan::builder();
            for i in 0..p {
                b.begin_message(i);
                for m in slices.range(i) {
                    for ld in 0..p {
                        let d = m * p + ld;
                        b.push_segment(send.displs[d], send.counts[d]);
                    }
                }
            }
            b.build()?
        },
        recv: {
            let mut b = CommPlan::builder();
            for ls in 0..p {
                b.begin_message(ls).push_segment(a_off[ls], a_off[ls + 1] - a_off[ls]);
            }
            b.build()?
        },
    };

    let partner_local = slices.owner(topo.rank_node());
    let exchange = PhasePlan {
        send: {
            let mut b = CommPlan::builder();
            for (mi, m) in mine.clone().enumerate() {
                b.begin_message(topo.global_rank_of(m, partner_local));
                for ld in 0..p {
                    for ls in 0..p {
                        b.push_segment(a_pos[ls][mi * p + ld], sc(ls, mi, ld));
                    }
                }
            }
            b.build()?
        },
        recv: {
            let mut b = CommPlan::builder();
            for (mi, m) in mine.clone().enumerate() {
                b.begin_message(topo.global_rank_of(m, partner_local))
                    .push_segment(b_off[mi], b_off[mi + 1] - b_off[mi]);
            }
            b.build()?
        },
    };

    let scatter = PhasePlan {
        send: {
            let mut b = CommPlan::builder();
            for ld in 0..p {
                b.begin_message(ld);
                for mi in 0..l {
                    for ls in 0..p {
                        b.push_segment(b_pos[(mi * p + ld) * p + ls], rc(ld, mi, ls));
                    }
                }
            }
            b.build()?
        },
        recv: {
            let mut b = CommPlan::builder();
            for i in 0..p {
                b.begin_message(i);
                for m in slices.range(i) {
                    for ls in 0..p {
                        let s = m * p + ls;
                        b.push_segment(recv.displs[s], recv.counts[s]);
                    }
                }
            }
            b.build()?
        },
    };

    let plan = LocalityPlan::new(
        Pattern::Dense,
        aggregate,
        exchange,
        scatter,
        aggregate_len,
        exchange_len,
    )?;
    debug!(
        "dense plan on rank {}: carries nodes {:?}, msgs aggregate {}/{} exchange {}/{} scatter {}/{}",
        topo.rank(),
        mine,
        plan.aggregate.send.n_msgs(),
        plan.aggregate.recv.n_msgs(),
        plan.exchange.send.n_msgs(),
        plan.exchange.recv.n_msgs(),
        plan.scatter.send.n_msgs(),
        plan.scatter.recv.n_msgs(),
    );
    Ok(plan)
}
