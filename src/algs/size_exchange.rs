//! Plan-construction metadata exchange.
//!
//! Two helpers: [`exchange_fixed`] moves records whose counts both sides
//! already know; [`exchange_lists`] first exchanges counts with each peer and
//! then the records themselves. Both take typed [`CommTag`]s and guarantee
//! that every posted send/receive handle is drained before returning, even if
//! an error occurs. Messages to self are copied without touching the
//! transport, and empty payloads are never sent.

use std::collections::BTreeMap;

use bytemuck::Pod;

use crate::algs::communicator::{Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, decode_records, expect_exact_len};
use crate::config::CommTag;
use crate::locality_error::LocalityError;

/// Send `outgoing[k].1` to `outgoing[k].0` and receive `incoming[k].1`
/// records from `incoming[k].0`. Returns the received records in the order of
/// `incoming`.
pub fn exchange_fixed<C, T>(
    comm: &C,
    outgoing: &[(usize, &[T])],
    incoming: &[(usize, usize)],
    tag: CommTag,
) -> Result<Vec<Vec<T>>, LocalityError>
where
    C: Communicator,
    T: Pod,
{
    let me = comm.rank();
    let rec = std::mem::size_of::<T>();
    let own = outgoing.iter().find(|(p, _)| *p == me).map(|(_, v)| *v);

    // 1) post all receives; a failed post stops posting but not draining
    let mut recvs = Vec::with_capacity(incoming.len());
    let mut maybe_err = None;
    for (slot, &(peer, n)) in incoming.iter().enumerate() {
        if peer == me || n == 0 {
            continue;
        }
        match comm.irecv(peer, tag.as_u16(), n * rec) {
            Ok(h) => recvs.push((slot, peer, h)),
            Err(e) => {
                maybe_err = Some(e);
                break;
            }
        }
    }

    // 2) post all sends; payloads are copied at post time
    let mut sends = Vec::with_capacity(outgoing.len());
    for &(peer, items) in outgoing {
        if peer == me || items.is_empty() {
            continue;
        }
        match comm.isend(peer, tag.as_u16(), cast_slice(items)) {
            Ok(h) => sends.push(h),
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
    }

    // 3) self copy
    let mut out: Vec<Vec<T>> = vec![Vec::new(); incoming.len()];
    for (slot, &(peer, n)) in incoming.iter().enumerate() {
        if peer != me || maybe_err.is_some() {
            continue;
        }
        let items = own.unwrap_or(&[]);
        match expect_exact_len(me, items.len(), n) {
            Ok(()) => out[slot] = items.to_vec(),
            Err(e) => maybe_err = Some(e),
        }
    }

    // 4) wait for all recvs (but do not early-return)
    for (slot, peer, h) in recvs {
        match h.wait() {
            Ok(Some(data)) if maybe_err.is_none() => {
                match expect_exact_len(peer, data.len(), incoming[slot].1 * rec)
                    .and_then(|()| decode_records(peer, &data))
                {
                    Ok(v) => out[slot] = v,
                    Err(e) => maybe_err = Some(e),
                }
            }
            Ok(None) if maybe_err.is_none() => {
                maybe_err = Some(LocalityError::comm(peer, "receive completed without payload"));
            }
            Err(e) if maybe_err.is_none() => maybe_err = Some(e),
            _ => {} // already have an error; just drain
        }
    }

    // 5) always drain all send handles before returning
    for send in sends {
        if let Err(e) = send.wait() {
            maybe_err.get_or_insert(e);
        }
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

/// Symmetric list exchange with every rank in `peers` (which may include
/// this rank): counts first under `sizes_tag`, then the records under
/// `data_tag`. Peers absent from `outgoing` receive an empty list.
pub fn exchange_lists<C, T>(
    comm: &C,
    peers: &[usize],
    outgoing: &BTreeMap<usize, Vec<T>>,
    sizes_tag: CommTag,
    data_tag: CommTag,
) -> Result<BTreeMap<usize, Vec<T>>, LocalityError>
where
    C: Communicator,
    T: Pod,
{
    let sizes = exchange_sizes(comm, peers, outgoing, sizes_tag)?;

    let data_out: Vec<(usize, &[T])> = peers
        .iter()
        .map(|&p| (p, outgoing.get(&p).map_or(&[][..], Vec::as_slice)))
        .collect();
    let data_in: Vec<(usize, usize)> = peers.iter().map(|&p| (p, sizes[&p])).collect();
    let data = exchange_fixed(comm, &data_out, &data_in, data_tag)?;
    Ok(peers.iter().copied().zip(data).collect())
}

/// Stage 1 of a list exchange: tell every peer how many records follow.
pub fn exchange_sizes<C, T>(
    comm: &C,
    peers: &[usize],
    outgoing: &BTreeMap<usize, Vec<T>>,
    tag: CommTag,
) -> Result<BTreeMap<usize, usize>, LocalityError>
where
    C: Communicator,
{
    let counts: Vec<[WireCount; 1]> = peers
        .iter()
        .map(|p| [WireCount::new(outgoing.get(p).map_or(0, Vec::len))])
        .collect();
    let out: Vec<(usize, &[WireCount])> = peers
        .iter()
        .zip(&counts)
        .map(|(&p, c)| (p, &c[..]))
        .collect();
    let incoming: Vec<(usize, usize)> = peers.iter().map(|&p| (p, 1)).collect();
    let got = exchange_fixed(comm, &out, &incoming, tag)?;
    Ok(peers
        .iter()
        .zip(got)
        .map(|(&p, c)| (p, c[0].get()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    #[test]
    fn serial_self_exchange() {
        let mut out = BTreeMap::new();
        out.insert(0usize, vec![5u32, 6, 7]);
        let got = exchange_lists(&NoComm, &[0], &out, CommTag::new(1), CommTag::new(2)).unwrap();
        assert_eq!(got[&0], vec![5, 6, 7]);
    }

    #[test]
    fn self_length_mismatch_detected() {
        let mine = [1u64, 2];
        let res = exchange_fixed(&NoComm, &[(0, &mine[..])], &[(0, 3)], CommTag::new(4));
        assert!(matches!(
            res,
            Err(LocalityError::LengthMismatch { expected: 3, actual: 2, .. })
        ));
    }
}
