//! Fixed, versioned, little-endian wire types for plan construction.
//!
//! Only setup metadata travels in these records; the data phases move raw
//! caller bytes.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

use crate::locality_error::LocalityError;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

/// Decode a received byte buffer into records. Received buffers carry no
/// alignment guarantee, so records are read unaligned.
pub fn decode_records<T: Pod>(peer: usize, bytes: &[u8]) -> Result<Vec<T>, LocalityError> {
    let sz = size_of::<T>();
    if sz == 0 || bytes.len() % sz != 0 {
        return Err(LocalityError::comm(
            peer,
            format!("{} bytes is not a whole number of {sz}-byte records", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(sz)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

pub fn expect_exact_len(peer: usize, actual: usize, expected: usize) -> Result<(), LocalityError> {
    if actual == expected {
        Ok(())
    } else {
        Err(LocalityError::LengthMismatch {
            peer,
            expected,
            actual,
        })
    }
}

/// Little-endian encoding of a `u64` slice.
pub fn encode_u64s(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_u64s(bytes: &[u8]) -> impl Iterator<Item = u64> + '_ {
    bytes.chunks_exact(8).map(|c| {
        let mut le = [0u8; 8];
        le.copy_from_slice(c);
        u64::from_le_bytes(le)
    })
}

/// Number of records that follow in a list exchange.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// A byte count carried on the wire (plan metadata, identity payload).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireBytes {
    pub n_le: u64,
}
impl WireBytes {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// One edge of a sparse pattern: `src` sends `bytes` to `dst` (global ranks).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireEdge {
    pub src_le: u32,
    pub dst_le: u32,
    pub bytes_le: u64,
}
impl WireEdge {
    pub fn new(src: usize, dst: usize, bytes: usize) -> Self {
        Self {
            src_le: (src as u32).to_le(),
            dst_le: (dst as u32).to_le(),
            bytes_le: (bytes as u64).to_le(),
        }
    }
    pub fn decode(&self) -> (usize, usize, usize) {
        (
            u32::from_le(self.src_le) as usize,
            u32::from_le(self.dst_le) as usize,
            u64::from_le(self.bytes_le) as usize,
        )
    }
}

/// Announcement from a sending representative to its partner: the source
/// node and the size of the aggregate it will send every start.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireIdentity {
    pub version_le: u16,
    pub _pad: u16,
    pub node_le: u32,
    pub bytes_le: u64,
}
impl WireIdentity {
    pub const SIZE: usize = 16;
    pub fn new(node: usize, bytes: usize) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            _pad: 0,
            node_le: (node as u32).to_le(),
            bytes_le: (bytes as u64).to_le(),
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn node(&self) -> usize {
        u32::from_le(self.node_le) as usize
    }
    pub fn bytes(&self) -> usize {
        u64::from_le(self.bytes_le) as usize
    }
}

const_assert_eq!(size_of::<WireCount>(), 4);
const_assert_eq!(size_of::<WireBytes>(), 8);
const_assert_eq!(size_of::<WireEdge>(), 16);
const_assert_eq!(size_of::<WireIdentity>(), WireIdentity::SIZE);
