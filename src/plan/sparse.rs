//! Plan construction for neighbor collectives.
//!
//! Only nodes that actually exchange data are paired. On each node the
//! sorted set of destination nodes is dealt to local ranks with
//! [`NodeSlices`]; the sender rank `(a, i)` hands node `a`'s aggregate for
//! node `b` to rank `(b, i)`. Node `b` cannot compute `i` on its own (it
//! would need node `a`'s full destination set), so every sending
//! representative announces itself with an identity record. The number of
//! announcements each rank will get is known up front from one global sum,
//! which lets receivers drain exactly that many with probe + receive.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use log::{debug, trace};

use crate::algs::communicator::{Communicator, Wait};
use crate::algs::size_exchange::exchange_lists;
use crate::algs::wire::{WIRE_VERSION, WireEdge, WireIdentity, decode_records, expect_exact_len};
use crate::config::CollectiveTags;
use crate::locality_error::LocalityError;
use crate::plan::{ByteLayout, CommPlan, LocalityPlan, Pattern, PhasePlan};
use crate::topology::{NodeSlices, Topology};

/// `(src, dst, bytes)` in global ranks.
type Edge = (usize, usize, usize);

/// Build the three-phase plan of a neighbor all-to-all-v on `topo`.
///
/// `send` is indexed like the neighborhood's destinations and `recv` like its
/// sources; both are in bytes. Collective over the whole communicator.
pub fn build_sparse_plan<C: Communicator>(
    topo: &Topology<'_, C>,
    send: &ByteLayout,
    recv: &ByteLayout,
    tags: &CollectiveTags,
) -> Result<LocalityPlan, LocalityError> {
    let nb = topo.neighborhood().ok_or_else(|| {
        LocalityError::InvalidArguments("topology was created without a neighborhood".into())
    })?;
    check_layout("send", send, nb.outdegree())?;
    check_layout("recv", recv, nb.indegree())?;

    let p = topo.ppn();
    let me = topo.local_rank();
    let rank = topo.rank();
    let my_node = topo.rank_node();

    // 1) every rank of the node learns every out- and in-edge of the node
    let my_out: Vec<WireEdge> = nb
        .destinations()
        .iter()
        .zip(&send.counts)
        .filter(|(_, c)| **c > 0)
        .map(|(&d, &c)| WireEdge::new(rank, d, c))
        .collect();
    let my_in: Vec<WireEdge> = nb
        .sources()
        .iter()
        .zip(&recv.counts)
        .filter(|(_, c)| **c > 0)
        .map(|(&s, &c)| WireEdge::new(s, rank, c))
        .collect();
    let node_out = gather_node_edges(topo, &my_out, tags)?;
    let node_in = gather_node_edges(topo, &my_in, tags)?;

    // 2) destination nodes of this node and who carries them
    let dest_nodes: Vec<usize> = node_out
        .iter()
        .flatten()
        .map(|&(_, d, _)| topo.node_of(d))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let dslices = NodeSlices::new(dest_nodes.len(), p);
    let carried: &[usize] = &dest_nodes[dslices.range(me)];
    let mut bytes_to: BTreeMap<usize, usize> = BTreeMap::new();
    for &(_, d, c) in node_out.iter().flatten() {
        *bytes_to.entry(topo.node_of(d)).or_default() += c;
    }

    // 3) identity handshake with the partners of the carried nodes. A
    // failure here is held back until every rank has reached step 4, so the
    // node-local exchange below still completes.
    let (mut resolved, mut failure) = match handshake(topo, nb.comm(), carried, &bytes_to, tags) {
        Ok(ids) => (ids, None),
        Err(e) => (Vec::new(), Some(e)),
    };
    if carried.contains(&my_node) {
        resolved.push(WireIdentity::new(my_node, bytes_to[&my_node]));
    }

    // 4) share what was resolved and check it against the node's in-edges
    let peers: Vec<usize> = (0..p).collect();
    let outgoing: BTreeMap<usize, Vec<WireIdentity>> =
        peers.iter().map(|&i| (i, resolved.clone())).collect();
    let shared = exchange_lists(
        topo.local(),
        &peers,
        &outgoing,
        tags.resolved_sizes,
        tags.resolved_data,
    )?;
    let mut in_map: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (&carrier, ids) in &shared {
        for id in ids {
            if let Some((other, _)) = in_map.insert(id.node(), (carrier, id.bytes())) {
                failure.get_or_insert(LocalityError::UnresolvedPartner {
                    node: id.node(),
                    detail: format!("claimed by local ranks {other} and {carrier}"),
                });
            }
        }
    }
    let mut bytes_from: BTreeMap<usize, usize> = BTreeMap::new();
    for &(s, _, c) in node_in.iter().flatten() {
        *bytes_from.entry(topo.node_of(s)).or_default() += c;
    }
    if failure.is_none() {
        failure = verify_partners(&in_map, &bytes_from).err();
    }
    agree_on_pairing(topo, nb.comm(), failure)?;

    // 5) the plans
    let mut a_pos: HashMap<(usize, usize), usize> = HashMap::new();
    let mut a_off = vec![0usize; p + 1];
    for ls in 0..p {
        let mut cursor = a_off[ls];
        for &(s, d, c) in &node_out[ls] {
            if carried.binary_search(&topo.node_of(d)).is_ok() {
                a_pos.insert((s, d), cursor);
                cursor += c;
            }
        }
        a_off[ls + 1] = cursor;
    }
    let aggregate_len = a_off[p];

    let in_nodes: Vec<(usize, usize)> = in_map
        .iter()
        .filter(|(_, (carrier, _))| *carrier == me)
        .map(|(&a, &(_, bytes))| (a, bytes))
        .collect();
    let mut edges_in: Vec<Edge> = node_in
        .iter()
        .flatten()
        .copied()
        .filter(|&(s, _, _)| in_nodes.iter().any(|&(a, _)| a == topo.node_of(s)))
        .collect();
    // block per source node, (d, s) order inside
    edges_in.sort_by_key(|&(s, d, _)| (topo.node_of(s), d, s));
    let mut b_pos: HashMap<(usize, usize), usize> = HashMap::new();
    let mut b_off: BTreeMap<usize, usize> = BTreeMap::new();
    let mut cursor = 0;
    for &(a, _) in &in_nodes {
        b_off.insert(a, cursor);
        for &(s, d, c) in edges_in.iter().filter(|(s, _, _)| topo.node_of(*s) == a) {
            b_pos.insert((s, d), cursor);
            cursor += c;
        }
        let announced = in_map[&a].1;
        expect_exact_len(topo.global_rank_of(a, me), cursor - b_off[&a], announced)?;
    }
    let exchange_len = cursor;

    let mut my_sends: Vec<(usize, usize)> = nb
        .destinations()
        .iter()
        .copied()
        .enumerate()
        .filter(|&(k, _)| send.counts[k] > 0)
        .map(|(k, d)| (d, k))
        .collect();
    my_sends.sort_unstable();
    let mut my_recvs: Vec<(usize, usize)> = nb
        .sources()
        .iter()
        .copied()
        .enumerate()
        .filter(|&(k, _)| recv.counts[k] > 0)
        .map(|(k, s)| (s, k))
        .collect();
    my_recvs.sort_unstable();

    let aggregate = PhasePlan {
        send: {
            let mut b = CommPlan::builder();
            for i in 0..p {
                let theirs = &dest_nodes[dslices.range(i)];
                b.begin_message(i);
                for &(d, k) in &my_sends {
                    if theirs.binary_search(&topo.node_of(d)).is_ok() {
                        b.push_segment(send.displs[k], send.counts[k]);
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

    let exchange = PhasePlan {
        send: {
            let mut out: Vec<Edge> = node_out
                .iter()
                .flatten()
                .copied()
                .filter(|&(_, d, _)| carried.binary_search(&topo.node_of(d)).is_ok())
                .collect();
            out.sort_by_key(|&(s, d, _)| (d, s));
            let mut b = CommPlan::builder();
            for &node in carried {
                b.begin_message(topo.global_rank_of(node, me));
                for &(s, d, c) in out.iter().filter(|(_, d, _)| topo.node_of(*d) == node) {
                    b.push_segment(a_pos[&(s, d)], c);
                }
            }
            b.build()?
        },
        recv: {
            let mut b = CommPlan::builder();
            for &(a, bytes) in &in_nodes {
                b.begin_message(topo.global_rank_of(a, me))
                    .push_segment(b_off[&a], bytes);
            }
            b.build()?
        },
    };

    let scatter = PhasePlan {
        send: {
            let mut by_source: Vec<Edge> = edges_in.clone();
            by_source.sort_by_key(|&(s, d, _)| (d, s));
            let mut b = CommPlan::builder();
            for ld in 0..p {
                let d = topo.global_rank_of(my_node, ld);
                b.begin_message(ld);
                for &(s, _, c) in by_source.iter().filter(|e| e.1 == d) {
                    b.push_segment(b_pos[&(s, d)], c);
                }
            }
            b.build()?
        },
        recv: {
            let mut b = CommPlan::builder();
            for i in 0..p {
                b.begin_message(i);
                for &(s, k) in &my_recvs {
                    if in_map.get(&topo.node_of(s)).map(|e| e.0) == Some(i) {
                        b.push_segment(recv.displs[k], recv.counts[k]);
                    }
                }
            }
            b.build()?
        },
    };

    let plan = LocalityPlan::new(
        Pattern::Sparse,
        aggregate,
        exchange,
        scatter,
        aggregate_len,
        exchange_len,
    )?;
    debug!(
        "sparse plan on rank {rank}: carries {:?} out, {} nodes in, msgs aggregate {}/{} exchange {}/{} scatter {}/{}",
        carried,
        in_nodes.len(),
        plan.aggregate.send.n_msgs(),
        plan.aggregate.recv.n_msgs(),
        plan.exchange.send.n_msgs(),
        plan.exchange.recv.n_msgs(),
        plan.scatter.send.n_msgs(),
        plan.scatter.recv.n_msgs(),
    );
    Ok(plan)
}

fn check_layout(what: &str, layout: &ByteLayout, degree: usize) -> Result<(), LocalityError> {
    if layout.counts.len() != degree || layout.displs.len() != degree {
        return Err(LocalityError::InvalidArguments(format!(
            "{what} counts/displs need {degree} entries, got {}/{}",
            layout.counts.len(),
            layout.displs.len()
        )));
    }
    Ok(())
}

/// Edge lists of every local rank, indexed by local rank and sorted by
/// destination then source.
fn gather_node_edges<C: Communicator>(
    topo: &Topology<'_, C>,
    mine: &[WireEdge],
    tags: &CollectiveTags,
) -> Result<Vec<Vec<Edge>>, LocalityError> {
    let p = topo.ppn();
    let peers: Vec<usize> = (0..p).collect();
    let outgoing: BTreeMap<usize, Vec<WireEdge>> =
        peers.iter().map(|&i| (i, mine.to_vec())).collect();
    let got = exchange_lists(topo.local(), &peers, &outgoing, tags.meta_sizes, tags.meta_data)?;
    Ok(peers
        .iter()
        .map(|i| {
            let mut v: Vec<Edge> = got[i].iter().map(WireEdge::decode).collect();
            v.sort_unstable_by_key(|&(s, d, _)| (d, s));
            v
        })
        .collect())
}

/// Announce this rank to the partner of every carried node and collect the
/// announcements addressed to it.
fn handshake<C: Communicator>(
    topo: &Topology<'_, C>,
    comm: &C,
    carried: &[usize],
    bytes_to: &BTreeMap<usize, usize>,
    tags: &CollectiveTags,
) -> Result<Vec<WireIdentity>, LocalityError> {
    let me = topo.local_rank();
    let my_node = topo.rank_node();
    let tag = tags.identity.as_u16();

    let partners: Vec<(usize, usize)> = carried
        .iter()
        .filter(|&&b| b != my_node)
        .map(|&b| (topo.global_rank_of(b, me), bytes_to[&b]))
        .collect();

    // phase A: how many announcements each rank will receive, then send ours
    let mut counts = vec![0u64; comm.size()];
    for &(partner, _) in &partners {
        counts[partner] += 1;
    }
    comm.all_reduce_sum(&mut counts)?;
    let expected = counts[comm.rank()] as usize;

    let mut sends = Vec::with_capacity(partners.len());
    let mut maybe_err = None;
    for &(partner, bytes) in &partners {
        let id = [WireIdentity::new(my_node, bytes)];
        trace!("rank {}: identity to {partner} ({bytes} bytes)", comm.rank());
        match comm.isend(partner, tag, bytemuck::cast_slice(&id)) {
            Ok(h) => sends.push(h),
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
    }

    // phase B: drain exactly the announced number
    let mut got: Vec<WireIdentity> = Vec::with_capacity(expected);
    for _ in 0..expected {
        if maybe_err.is_some() {
            break;
        }
        match receive_identity(comm, tag) {
            Ok((src, id)) => {
                if let Err(e) = check_identity(topo, src, &id, &got) {
                    maybe_err = Some(e);
                }
                got.push(id);
            }
            Err(e) => maybe_err = Some(e),
        }
    }

    for h in sends {
        if let Err(e) = h.wait() {
            maybe_err.get_or_insert(e);
        }
    }
    match maybe_err {
        Some(e) => Err(e),
        None => Ok(got),
    }
}

fn receive_identity<C: Communicator>(comm: &C, tag: u16) -> Result<(usize, WireIdentity), LocalityError> {
    let (src, len) = comm.probe_any(tag)?;
    let data = comm
        .irecv(src, tag, len)?
        .wait()?
        .ok_or_else(|| LocalityError::comm(src, "identity receive completed without payload"))?;
    expect_exact_len(src, data.len(), WireIdentity::SIZE)?;
    let id = decode_records::<WireIdentity>(src, &data)?[0];
    Ok((src, id))
}

fn check_identity<C: Communicator>(
    topo: &Topology<'_, C>,
    src: usize,
    id: &WireIdentity,
    seen: &[WireIdentity],
) -> Result<(), LocalityError> {
    if id.version() != WIRE_VERSION {
        return Err(LocalityError::comm(
            src,
            format!("identity wire version {} (expected {WIRE_VERSION})", id.version()),
        ));
    }
    let node = id.node();
    if node != topo.node_of(src) || topo.local_rank_of(src) != topo.local_rank() {
        return Err(LocalityError::UnresolvedPartner {
            node,
            detail: format!(
                "announcement from rank {src} does not match local rank {} of node {node}",
                topo.local_rank()
            ),
        });
    }
    if seen.iter().any(|s| s.node() == node) {
        return Err(LocalityError::UnresolvedPartner {
            node,
            detail: "announced twice".into(),
        });
    }
    Ok(())
}

/// Pairing is only accepted if it succeeded everywhere: each rank flags the
/// node its failure concerns, and a rank that saw nothing wrong still fails
/// with the lowest flagged node.
fn agree_on_pairing<C: Communicator>(
    topo: &Topology<'_, C>,
    comm: &C,
    failure: Option<LocalityError>,
) -> Result<(), LocalityError> {
    let mut flags = vec![0u64; topo.num_nodes()];
    if let Some(e) = &failure {
        let node = match e {
            LocalityError::UnresolvedPartner { node, .. } => *node,
            _ => topo.rank_node(),
        };
        let last = flags.len() - 1;
        flags[node.min(last)] = 1;
    }
    let reduced = comm.all_reduce_sum(&mut flags);
    if let Some(e) = failure {
        return Err(e);
    }
    reduced?;
    match flags.iter().position(|&f| f > 0) {
        None => Ok(()),
        Some(node) => Err(LocalityError::UnresolvedPartner {
            node,
            detail: format!(
                "pairing failed on {} node(s); rank {} stops with them",
                flags.iter().filter(|&&f| f > 0).count(),
                topo.rank()
            ),
        }),
    }
}

/// Every node with in-edges into this node must be resolved exactly once
/// and announce the bytes the in-edges add up to.
fn verify_partners(
    in_map: &BTreeMap<usize, (usize, usize)>,
    bytes_from: &BTreeMap<usize, usize>,
) -> Result<(), LocalityError> {
    for (&a, &expected) in bytes_from {
        match in_map.get(&a) {
            None => {
                return Err(LocalityError::UnresolvedPartner {
                    node: a,
                    detail: format!("{expected} bytes expected but no representative announced"),
                });
            }
            Some(&(carrier, bytes)) if bytes != expected => {
                return Err(LocalityError::UnresolvedPartner {
                    node: a,
                    detail: format!(
                        "local rank {carrier} was announced {bytes} bytes, in-edges add up to {expected}"
                    ),
                });
            }
            Some(_) => {}
        }
    }
    if let Some((&a, &(carrier, _))) = in_map.iter().find(|(a, _)| !bytes_from.contains_key(*a)) {
        return Err(LocalityError::UnresolvedPartner {
            node: a,
            detail: format!("local rank {carrier} was announced data nobody here expects"),
        });
    }
    Ok(())
}
