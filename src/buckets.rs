//! Keyed bucket placement.
//!
//! Every table position in the address database derives from a 256-bit
//! secret key, so that an adversary cannot predict, and therefore cannot
//! target, the buckets its addresses will land in. The functions here are
//! pure: given the same key, group map and address, they always produce the
//! same bucket and slot, which is what makes placements stable across
//! restarts as long as key and group map are unchanged.
//!
//! Addresses from one *group* (an autonomous system when a group map is
//! loaded, a /16-equivalent prefix otherwise) are confined to a small,
//! key-dependent subset of buckets: 8 of the 256 tried buckets, and 64 of
//! the 1024 new buckets per source group. This is the heart of the
//! anti-eclipse design: acquiring more addresses within one group does not
//! acquire more of the table.

use bitcoin::consensus::encode::{Encodable, VarInt};
use bitcoin_hashes::{sha256d, Hash};

use crate::asmap::Asmap;
use crate::net::{Endpoint, NetAddr};

/// Number of "new" buckets, as a power of two.
pub const NEW_BUCKET_COUNT_LOG2: u32 = 10;
/// Total number of buckets for addresses we haven't connected to.
pub const NEW_BUCKET_COUNT: usize = 1 << NEW_BUCKET_COUNT_LOG2;

/// Number of "tried" buckets, as a power of two.
pub const TRIED_BUCKET_COUNT_LOG2: u32 = 8;
/// Total number of buckets for addresses we have connected to.
pub const TRIED_BUCKET_COUNT: usize = 1 << TRIED_BUCKET_COUNT_LOG2;

/// Bucket capacity, as a power of two.
pub const BUCKET_SIZE_LOG2: u32 = 6;
/// Maximum number of entries in a single bucket.
pub const BUCKET_SIZE: usize = 1 << BUCKET_SIZE_LOG2;

/// Over how many tried buckets the entries from a single group are spread.
pub const TRIED_BUCKETS_PER_GROUP: u64 = 8;
/// Over how many new buckets the entries from a single source group are
/// spread.
pub const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 64;
/// In how many new buckets a single address may appear.
pub const NEW_BUCKETS_PER_ADDRESS: u32 = 8;

/// The secret key all placements derive from.
pub type Key = [u8; 32];

/// Compute the group an address belongs to, for anti-Sybil bucketing.
///
/// The group is the mapped autonomous system when a group map is loaded and
/// covers the address, otherwise a network-class byte followed by an
/// address-range prefix (/16 for IPv4, /32 for IPv6). Non-routable
/// addresses each form their own group.
pub fn group(addr: &NetAddr, asmap: Option<&Asmap>) -> Vec<u8> {
    // Network class bytes. IPv4 and IPv6 addresses mapped to the same AS
    // share the IPv6 class so that they land in the same group.
    const UNROUTABLE: u8 = 0;
    const IPV4: u8 = 1;
    const IPV6: u8 = 2;
    const ONION: u8 = 3;
    const I2P: u8 = 4;
    const CJDNS: u8 = 5;

    if !addr.is_routable() {
        let mut bytes = vec![UNROUTABLE];
        bytes.extend(addr.key_bytes());
        return bytes;
    }
    if let Some(asmap) = asmap {
        let asn = asmap.lookup(addr);
        if asn != 0 {
            let mut bytes = vec![IPV6];
            bytes.extend_from_slice(&asn.to_le_bytes());
            return bytes;
        }
    }
    match addr {
        NetAddr::Ipv4(ip) => {
            let octets = ip.octets();
            vec![IPV4, octets[0], octets[1]]
        }
        NetAddr::Ipv6(ip) => {
            let octets = ip.octets();
            vec![IPV6, octets[0], octets[1], octets[2], octets[3]]
        }
        NetAddr::TorV3(bytes) => vec![ONION, bytes[0] & 0xf0],
        NetAddr::I2p(bytes) => vec![I2P, bytes[0] & 0xf0],
        NetAddr::Cjdns(ip) => {
            let octets = ip.octets();
            vec![CJDNS, octets[0], octets[1]]
        }
        NetAddr::Unknown(..) => unreachable!("unknown networks are never routable"),
    }
}

/// The tried bucket an endpoint belongs to.
///
/// The bucket is drawn from the 8 buckets assigned to the endpoint's group;
/// which of the 8 is picked depends on the full endpoint, so that two
/// endpoints in one group spread over all of them.
pub fn tried_bucket(key: &Key, endpoint: &Endpoint, asmap: Option<&Asmap>) -> usize {
    let hash1 = Tuple::keyed(key).bytes(&endpoint.key_bytes()).hash();
    let hash2 = Tuple::keyed(key)
        .bytes(&group(&endpoint.addr, asmap))
        .u64(hash1 % TRIED_BUCKETS_PER_GROUP)
        .hash();

    (hash2 % TRIED_BUCKET_COUNT as u64) as usize
}

/// The new bucket an address belongs to, given the source that told us
/// about it.
///
/// The bucket is drawn from the 64 buckets assigned to the source's group;
/// which of the 64 is picked depends on the address's own group.
pub fn new_bucket(key: &Key, addr: &NetAddr, source: &NetAddr, asmap: Option<&Asmap>) -> usize {
    let source_group = group(source, asmap);
    let hash1 = Tuple::keyed(key)
        .bytes(&group(addr, asmap))
        .bytes(&source_group)
        .hash();
    let hash2 = Tuple::keyed(key)
        .bytes(&source_group)
        .u64(hash1 % NEW_BUCKETS_PER_SOURCE_GROUP)
        .hash();

    (hash2 % NEW_BUCKET_COUNT as u64) as usize
}

/// The position of an endpoint within a given bucket.
pub fn bucket_position(key: &Key, new: bool, bucket: usize, endpoint: &Endpoint) -> usize {
    let hash = Tuple::keyed(key)
        .u8(if new { b'N' } else { b'K' })
        .u32(bucket as u32)
        .bytes(&endpoint.key_bytes())
        .hash();

    (hash % BUCKET_SIZE as u64) as usize
}

/// Serialized tuple accumulator for the cheap hash. Variable-length byte
/// strings carry a compact-size length prefix so that the concatenation of
/// fields is unambiguous.
struct Tuple {
    data: Vec<u8>,
}

impl Tuple {
    fn keyed(key: &Key) -> Self {
        Self { data: key.to_vec() }
    }

    fn bytes(mut self, bytes: &[u8]) -> Self {
        VarInt(bytes.len() as u64)
            .consensus_encode(&mut self.data)
            .expect("in-memory writes are infallible");
        self.data.extend_from_slice(bytes);
        self
    }

    fn u8(mut self, value: u8) -> Self {
        self.data.push(value);
        self
    }

    fn u32(mut self, value: u32) -> Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u64(mut self, value: u64) -> Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// The low 64 bits of the double-SHA256 of the accumulated tuple.
    fn hash(self) -> u64 {
        let digest = sha256d::Hash::hash(&self.data).into_inner();

        u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;

    #[test]
    fn test_placement_is_deterministic() {
        let key = [7; 32];
        let endpoint = Endpoint::new(Ipv4Addr::new(250, 1, 2, 3), 8333);

        assert_eq!(
            tried_bucket(&key, &endpoint, None),
            tried_bucket(&key, &endpoint, None)
        );
        assert_eq!(
            bucket_position(&key, true, 5, &endpoint),
            bucket_position(&key, true, 5, &endpoint)
        );
        // A different key places the endpoint elsewhere, with overwhelming
        // probability over positions and buckets combined.
        let other = [8; 32];
        assert!(
            tried_bucket(&other, &endpoint, None) != tried_bucket(&key, &endpoint, None)
                || bucket_position(&other, false, 0, &endpoint)
                    != bucket_position(&key, false, 0, &endpoint)
                || new_bucket(
                    &other,
                    &endpoint.addr,
                    &NetAddr::from(Ipv4Addr::new(1, 1, 1, 1)),
                    None
                ) != new_bucket(
                    &key,
                    &endpoint.addr,
                    &NetAddr::from(Ipv4Addr::new(1, 1, 1, 1)),
                    None
                )
        );
    }

    #[test]
    fn test_group_confinement() {
        let key = [0; 32];

        // All addresses within one /16 are confined to at most 8 distinct
        // tried buckets.
        let mut buckets = BTreeSet::new();
        for c in 0..=255u8 {
            for d in 1..=8u8 {
                let endpoint = Endpoint::new(Ipv4Addr::new(83, 99, c, d), 8333);
                buckets.insert(tried_bucket(&key, &endpoint, None));
            }
        }
        assert!(buckets.len() <= TRIED_BUCKETS_PER_GROUP as usize);
        assert!(buckets.len() > 1, "a group occupies more than one bucket");

        // Addresses learned from sources within one /16 are confined to at
        // most 64 distinct new buckets, regardless of the address's own
        // group.
        let mut buckets = BTreeSet::new();
        for a in 1..=200u8 {
            let addr = NetAddr::from(Ipv4Addr::new(a, 2, 3, 4));
            for d in 1..=4u8 {
                let source = NetAddr::from(Ipv4Addr::new(10, 0, 0, d));
                buckets.insert(new_bucket(&key, &addr, &source, None));
            }
        }
        assert!(buckets.len() <= NEW_BUCKETS_PER_SOURCE_GROUP as usize);
    }

    #[test]
    fn test_group_by_asn() {
        // Addresses in different /16s that map to the same AS share a group.
        //
        // The map is a single `RETURN 42`, assigning every address to AS42.
        // Bit layout, LSB-first per byte: one zero bit for the opcode, a
        // zero field-prefix bit, then 15 ASN value bits, most significant
        // first.
        let mut bitvec = vec![false, false];
        let asn_minus_min: u16 = 42 - 1;
        for shift in (0..15).rev() {
            bitvec.push((asn_minus_min >> shift) & 1 == 1);
        }
        let mut bytes = vec![0u8; 3];
        for (i, bit) in bitvec.iter().enumerate() {
            if *bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        let asmap = Asmap::decode(&bytes).unwrap();

        let a = NetAddr::from(Ipv4Addr::new(1, 2, 3, 4));
        let b = NetAddr::from(Ipv4Addr::new(99, 240, 1, 1));
        assert_eq!(group(&a, Some(&asmap)), group(&b, Some(&asmap)));
        assert_ne!(group(&a, None), group(&b, None));

        // Tor addresses are outside IP space and keep their prefix group.
        let tor = NetAddr::TorV3([0x17; 32]);
        assert_eq!(group(&tor, Some(&asmap)), group(&tor, None));
    }
}
