//! Compressed IP-to-ASN group map.
//!
//! When a group map is loaded, addresses are bucketed by the autonomous
//! system they belong to instead of by address-range prefix. This makes it
//! impossible for an adversary to gain many buckets by renting addresses
//! spread across a single AS, and generally diversifies the connections a
//! node creates across network operators.
//!
//! The map is a compressed instruction-coded trie over the 128 bits of an
//! (IPv6-mapped) address, evaluated by [`Asmap::lookup`]. Four opcodes
//! exist: `RETURN asn` terminates with a result, `JUMP offset` branches on
//! the next address bit, `MATCH bits` requires a run of address bits and
//! falls back to the current default otherwise, and `DEFAULT asn` sets that
//! fallback. Field values use a variable-length exponential encoding.

use bitcoin_hashes::{sha256d, Hash};

use crate::error::Error;
use crate::net::NetAddr;

/// Sentinel returned by field decoding when the bit stream is exhausted
/// or malformed.
const INVALID: u32 = u32::MAX;

/// Field size tables for the exponential encoding. The value of a field is
/// decoded by walking the table: each step either consumes the given number
/// of bits and terminates, or falls through to the next, larger size.
const TYPE_BIT_SIZES: &[u8] = &[0, 0, 1];
const ASN_BIT_SIZES: &[u8] = &[15, 16, 17, 18, 19, 20, 21, 22, 23, 24];
const MATCH_BIT_SIZES: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8];
const JUMP_BIT_SIZES: &[u8] = &[
    5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29,
    30,
];

const OP_RETURN: u32 = 0;
const OP_JUMP: u32 = 1;
const OP_MATCH: u32 = 2;
const OP_DEFAULT: u32 = 3;

/// A compressed IP-to-ASN mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asmap {
    bits: Vec<bool>,
}

impl Asmap {
    /// Decode a group map from its raw byte encoding. Bits are stored
    /// least-significant first within each byte.
    ///
    /// The decoded map is probed with a couple of addresses to reject inputs
    /// that are not an instruction stream at all; a malformed map would
    /// otherwise silently put every address in the unmapped group.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut bits = Vec::with_capacity(bytes.len() * 8);
        for byte in bytes {
            for bit in 0..8 {
                bits.push((byte >> bit) & 1 == 1);
            }
        }
        let asmap = Self { bits };

        if asmap.bits.is_empty() {
            return Err(Error::GroupMap("group map is empty"));
        }
        for probe in [[0x00; 16], [0xff; 16]] {
            if asmap.interpret(&probe).is_none() {
                return Err(Error::GroupMap("group map failed interpretation probe"));
            }
        }
        Ok(asmap)
    }

    /// Look up the autonomous system number an address is mapped to.
    /// Returns zero for unmapped addresses and for networks outside IP space.
    pub fn lookup(&self, addr: &NetAddr) -> u32 {
        match addr.ipv6_mapped() {
            Some(octets) => self.interpret(&octets).unwrap_or(0),
            None => 0,
        }
    }

    /// Digest of the map, persisted alongside the address database so that
    /// loaders can detect that the bucketing function changed.
    pub fn digest(&self) -> [u8; 32] {
        let mut bytes = vec![0u8; (self.bits.len() + 7) / 8];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        sha256d::Hash::hash(&bytes).into_inner()
    }

    /// Evaluate the instruction stream against an address, given as 16
    /// octets in network order. Returns `None` when the stream is malformed.
    fn interpret(&self, octets: &[u8; 16]) -> Option<u32> {
        let ip_bit = |i: usize| (octets[i / 8] >> (7 - i % 8)) & 1 == 1;

        let mut pos = 0;
        let mut consumed = 0; // address bits consumed so far
        let mut default_asn = 0;

        while pos < self.bits.len() {
            match self.decode_field(&mut pos, 0, TYPE_BIT_SIZES) {
                OP_RETURN => {
                    let asn = self.decode_field(&mut pos, 1, ASN_BIT_SIZES);
                    if asn == INVALID {
                        break;
                    }
                    return Some(asn);
                }
                OP_JUMP => {
                    let jump = self.decode_field(&mut pos, 17, JUMP_BIT_SIZES);
                    if jump == INVALID || consumed == 128 {
                        break;
                    }
                    if ip_bit(consumed) {
                        if jump as usize > self.bits.len() - pos {
                            break;
                        }
                        pos += jump as usize;
                    }
                    consumed += 1;
                }
                OP_MATCH => {
                    let matched = self.decode_field(&mut pos, 2, MATCH_BIT_SIZES);
                    if matched == INVALID {
                        break;
                    }
                    // The field encodes a 1-prefixed run of expected bits.
                    let len = 31 - matched.leading_zeros();
                    if 128 - consumed < len as usize {
                        break;
                    }
                    for bit in (0..len).rev() {
                        if ip_bit(consumed) != ((matched >> bit) & 1 == 1) {
                            return Some(default_asn);
                        }
                        consumed += 1;
                    }
                }
                OP_DEFAULT => {
                    let asn = self.decode_field(&mut pos, 1, ASN_BIT_SIZES);
                    if asn == INVALID {
                        break;
                    }
                    default_asn = asn;
                }
                _ => break,
            }
        }
        None
    }

    /// Decode a single variable-length field at `pos`, advancing it.
    /// Returns [`INVALID`] when the stream ends mid-field.
    fn decode_field(&self, pos: &mut usize, minval: u32, bit_sizes: &[u8]) -> u32 {
        let mut val = minval;

        for (i, size) in bit_sizes.iter().enumerate() {
            let has_next = i + 1 != bit_sizes.len();
            let bit = if has_next {
                if *pos >= self.bits.len() {
                    return INVALID;
                }
                let b = self.bits[*pos];
                *pos += 1;
                b
            } else {
                false
            };

            if bit {
                // Fall through to the next, larger field size.
                val += 1 << size;
            } else {
                for shift in (0..*size).rev() {
                    if *pos >= self.bits.len() {
                        return INVALID;
                    }
                    if self.bits[*pos] {
                        val += 1 << shift;
                    }
                    *pos += 1;
                }
                return val;
            }
        }
        INVALID
    }
}
