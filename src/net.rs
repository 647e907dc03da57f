//! Peer network addresses.
//!
//! The address database stores more than plain IP addresses: peers may be
//! reachable over onion services, I2P or CJDNS. [`NetAddr`] models the
//! network-level address, [`Endpoint`] adds the port, and [`Address`] is the
//! full advertisement as gossiped on the network, carrying service bits and
//! the advertised "last seen" time.
//!
//! On the wire and on disk, addresses use the extended (BIP-155 style)
//! encoding: a network identifier, a length and the raw address bytes. The
//! older fixed 16-byte encoding is still understood when reading legacy
//! databases.

use std::io;
use std::net;

use bitcoin::consensus::encode::{self, Decodable, Encodable, VarInt};
use bitcoin::network::constants::ServiceFlags;

/// Network identifier for IPv4 addresses.
const NET_IPV4: u8 = 1;
/// Network identifier for IPv6 addresses.
const NET_IPV6: u8 = 2;
/// Network identifier for Tor v3 onion services.
const NET_TORV3: u8 = 4;
/// Network identifier for I2P destinations.
const NET_I2P: u8 = 5;
/// Network identifier for CJDNS addresses.
const NET_CJDNS: u8 = 6;

/// Maximum size in bytes of an address belonging to an unknown network.
const MAX_ADDR_SIZE: u64 = 512;

/// A network-level peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetAddr {
    /// An IPv4 address.
    Ipv4(net::Ipv4Addr),
    /// An IPv6 address.
    Ipv6(net::Ipv6Addr),
    /// A Tor v3 onion service public key.
    TorV3([u8; 32]),
    /// An I2P destination hash.
    I2p([u8; 32]),
    /// A CJDNS address (fc00::/8).
    Cjdns(net::Ipv6Addr),
    /// An address belonging to a network we don't know about. Kept so that
    /// databases written by newer software can be read back without loss.
    Unknown(u8, Vec<u8>),
}

impl NetAddr {
    /// Check whether this address is globally reachable.
    ///
    /// Non-routable addresses are rejected when gossiped to us, since they
    /// are useless as outbound connection candidates and would let a peer
    /// fill our tables with garbage.
    pub fn is_routable(&self) -> bool {
        match self {
            Self::Ipv4(addr) => ipv4_is_routable(addr),
            Self::Ipv6(addr) => ipv6_is_routable(addr),
            Self::TorV3(_) | Self::I2p(_) => true,
            Self::Cjdns(addr) => addr.octets()[0] == 0xfc,
            Self::Unknown(..) => false,
        }
    }

    /// Check whether this address is well-formed.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Ipv4(addr) => {
                !addr.is_unspecified() && !addr.is_broadcast() && !addr.is_documentation()
            }
            Self::Ipv6(addr) => !addr.is_unspecified(),
            Self::TorV3(key) => key.iter().any(|b| *b != 0),
            Self::I2p(hash) => hash.iter().any(|b| *b != 0),
            Self::Cjdns(addr) => addr.octets()[0] == 0xfc,
            Self::Unknown(..) => false,
        }
    }

    /// The canonical byte representation used as input to the keyed bucket
    /// hashes. IP addresses use the 16-byte IPv6-mapped form so that an IPv4
    /// address hashes identically to its mapped representation.
    pub fn key_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ipv4(addr) => addr.to_ipv6_mapped().octets().to_vec(),
            Self::Ipv6(addr) => addr.octets().to_vec(),
            Self::Cjdns(addr) => addr.octets().to_vec(),
            Self::TorV3(bytes) | Self::I2p(bytes) => bytes.to_vec(),
            Self::Unknown(_, bytes) => bytes.clone(),
        }
    }

    /// The 16-byte IPv6-mapped form, for addresses that have one.
    /// Used by the group-map (ASN) lookup, which is defined over IP space.
    pub fn ipv6_mapped(&self) -> Option<[u8; 16]> {
        match self {
            Self::Ipv4(addr) => Some(addr.to_ipv6_mapped().octets()),
            Self::Ipv6(addr) => Some(addr.octets()),
            _ => None,
        }
    }

    fn network_id(&self) -> u8 {
        match self {
            Self::Ipv4(_) => NET_IPV4,
            Self::Ipv6(_) => NET_IPV6,
            Self::TorV3(_) => NET_TORV3,
            Self::I2p(_) => NET_I2P,
            Self::Cjdns(_) => NET_CJDNS,
            Self::Unknown(id, _) => *id,
        }
    }

    fn network_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ipv4(addr) => addr.octets().to_vec(),
            Self::Ipv6(addr) | Self::Cjdns(addr) => addr.octets().to_vec(),
            Self::TorV3(bytes) | Self::I2p(bytes) => bytes.to_vec(),
            Self::Unknown(_, bytes) => bytes.clone(),
        }
    }

    /// Decode an address in the legacy fixed 16-byte form, as written by
    /// database formats 0 through 2.
    pub fn decode_legacy(octets: [u8; 16]) -> Self {
        let ip = net::Ipv6Addr::from(octets);

        if let [0, 0, 0, 0, 0, 0xffff, ab, cd] = ip.segments() {
            Self::Ipv4(net::Ipv4Addr::new(
                (ab >> 8) as u8,
                ab as u8,
                (cd >> 8) as u8,
                cd as u8,
            ))
        } else if octets[0] == 0xfc {
            Self::Cjdns(ip)
        } else {
            Self::Ipv6(ip)
        }
    }

    /// Encode in the legacy fixed 16-byte form. Addresses with no such form
    /// encode as all-zero, like the original software did for onion peers.
    pub fn encode_legacy(&self) -> [u8; 16] {
        self.ipv6_mapped().unwrap_or([0; 16])
    }
}

impl std::fmt::Display for NetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4(addr) => write!(f, "{}", addr),
            Self::Ipv6(addr) | Self::Cjdns(addr) => write!(f, "{}", addr),
            Self::TorV3(bytes) => write!(f, "torv3:{:02x}{:02x}..", bytes[0], bytes[1]),
            Self::I2p(bytes) => write!(f, "i2p:{:02x}{:02x}..", bytes[0], bytes[1]),
            Self::Unknown(id, _) => write!(f, "unknown({})", id),
        }
    }
}

impl From<net::IpAddr> for NetAddr {
    fn from(ip: net::IpAddr) -> Self {
        match ip {
            net::IpAddr::V4(addr) => Self::Ipv4(addr),
            net::IpAddr::V6(addr) => Self::Ipv6(addr),
        }
    }
}

impl From<net::Ipv4Addr> for NetAddr {
    fn from(addr: net::Ipv4Addr) -> Self {
        Self::Ipv4(addr)
    }
}

impl From<net::Ipv6Addr> for NetAddr {
    fn from(addr: net::Ipv6Addr) -> Self {
        Self::Ipv6(addr)
    }
}

impl Encodable for NetAddr {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let bytes = self.network_bytes();
        let mut len = self.network_id().consensus_encode(writer)?;

        len += VarInt(bytes.len() as u64).consensus_encode(writer)?;
        writer.write_all(&bytes)?;

        Ok(len + bytes.len())
    }
}

impl Decodable for NetAddr {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        let id = u8::consensus_decode(reader)?;
        let len = VarInt::consensus_decode(reader)?.0;

        if len > MAX_ADDR_SIZE {
            return Err(encode::Error::ParseFailed("address exceeds maximum length"));
        }
        let mut bytes = vec![0; len as usize];
        reader.read_exact(&mut bytes)?;

        let expect = |n: u64| -> Result<(), encode::Error> {
            if len == n {
                Ok(())
            } else {
                Err(encode::Error::ParseFailed("invalid address length"))
            }
        };

        match id {
            NET_IPV4 => {
                expect(4)?;
                let octets: [u8; 4] = bytes.try_into().expect("length checked");
                Ok(Self::Ipv4(octets.into()))
            }
            NET_IPV6 => {
                expect(16)?;
                let octets: [u8; 16] = bytes.try_into().expect("length checked");
                Ok(Self::Ipv6(octets.into()))
            }
            NET_TORV3 => {
                expect(32)?;
                Ok(Self::TorV3(bytes.try_into().expect("length checked")))
            }
            NET_I2P => {
                expect(32)?;
                Ok(Self::I2p(bytes.try_into().expect("length checked")))
            }
            NET_CJDNS => {
                expect(16)?;
                let octets: [u8; 16] = bytes.try_into().expect("length checked");
                Ok(Self::Cjdns(octets.into()))
            }
            other => Ok(Self::Unknown(other, bytes)),
        }
    }
}

/// A service endpoint: a network address together with a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    /// The network address.
    pub addr: NetAddr,
    /// The transport port.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(addr: impl Into<NetAddr>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }

    /// The byte representation used as input to the keyed bucket hashes:
    /// the address key followed by the port in network byte order.
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut bytes = self.addr.key_bytes();
        bytes.extend_from_slice(&self.port.to_be_bytes());
        bytes
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl From<net::SocketAddr> for Endpoint {
    fn from(addr: net::SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl Encodable for Endpoint {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let len = self.addr.consensus_encode(writer)?;
        // The port is serialized in network byte order, as on the wire.
        writer.write_all(&self.port.to_be_bytes())?;

        Ok(len + 2)
    }
}

impl Decodable for Endpoint {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        let addr = NetAddr::consensus_decode(reader)?;
        let mut port = [0; 2];
        reader.read_exact(&mut port)?;

        Ok(Self {
            addr,
            port: u16::from_be_bytes(port),
        })
    }
}

/// A peer address as advertised on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// The advertised endpoint.
    pub endpoint: Endpoint,
    /// The services advertised for this peer.
    pub services: ServiceFlags,
    /// The advertised "last seen" time, in seconds since the epoch.
    /// Zero means unknown.
    pub time: u32,
}

impl Address {
    /// Create a new address advertisement.
    pub fn new(endpoint: impl Into<Endpoint>, services: ServiceFlags, time: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            services,
            time,
        }
    }

    /// Decode an address in the legacy fixed form used by database formats
    /// 0 through 2: time, fixed-width services, 16-byte address, port.
    pub fn decode_legacy<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        let time = u32::consensus_decode(reader)?;
        let services = ServiceFlags::from(u64::consensus_decode(reader)?);

        let mut octets = [0; 16];
        reader.read_exact(&mut octets)?;
        let mut port = [0; 2];
        reader.read_exact(&mut port)?;

        Ok(Self {
            endpoint: Endpoint {
                addr: NetAddr::decode_legacy(octets),
                port: u16::from_be_bytes(port),
            },
            services,
            time,
        })
    }
}

impl Encodable for Address {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.time.consensus_encode(writer)?;
        len += VarInt(self.services.as_u64()).consensus_encode(writer)?;
        len += self.endpoint.consensus_encode(writer)?;

        Ok(len)
    }
}

impl Decodable for Address {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        let time = u32::consensus_decode(reader)?;
        let services = ServiceFlags::from(VarInt::consensus_decode(reader)?.0);
        let endpoint = Endpoint::consensus_decode(reader)?;

        Ok(Self {
            endpoint,
            services,
            time,
        })
    }
}

/// Check whether an IPv4 address is globally routable.
///
/// This code is adapted from the Rust standard library's
/// `net::Ipv4Addr::is_global`. It can be replaced once that function is
/// stabilized.
fn ipv4_is_routable(addr: &net::Ipv4Addr) -> bool {
    // Check if this address is 192.0.0.9 or 192.0.0.10. These addresses are
    // the only two globally routable addresses in the 192.0.0.0/24 range.
    if u32::from(*addr) == 0xc0000009 || u32::from(*addr) == 0xc000000a {
        return true;
    }
    !addr.is_private()
        && !addr.is_loopback()
        && !addr.is_link_local()
        && !addr.is_broadcast()
        && !addr.is_documentation()
        // Make sure the address is not in 0.0.0.0/8.
        && addr.octets()[0] != 0
}

/// Check whether an IPv6 address is globally routable.
fn ipv6_is_routable(addr: &net::Ipv6Addr) -> bool {
    let segments = addr.segments();

    !addr.is_loopback()
        && !addr.is_unspecified()
        // Unique-local (fc00::/7). CJDNS claims fc00::/8 but is modeled as
        // its own network.
        && (segments[0] & 0xfe00) != 0xfc00
        // Link-local (fe80::/10).
        && (segments[0] & 0xffc0) != 0xfe80
        // Documentation (2001:db8::/32).
        && !(segments[0] == 0x2001 && segments[1] == 0xdb8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: &Address) -> Address {
        let mut bytes = Vec::new();
        addr.consensus_encode(&mut bytes).unwrap();

        Address::consensus_decode(&mut bytes.as_slice()).unwrap()
    }

    #[test]
    fn test_routable() {
        assert!(NetAddr::from(net::Ipv4Addr::new(1, 2, 3, 4)).is_routable());
        assert!(!NetAddr::from(net::Ipv4Addr::new(127, 0, 0, 1)).is_routable());
        assert!(!NetAddr::from(net::Ipv4Addr::new(10, 0, 0, 1)).is_routable());
        assert!(!NetAddr::from(net::Ipv4Addr::new(0, 1, 2, 3)).is_routable());
        assert!(!NetAddr::from(net::Ipv6Addr::LOCALHOST).is_routable());
        assert!(NetAddr::from("2001:4860:4860::8888".parse::<net::Ipv6Addr>().unwrap()).is_routable());
        assert!(!NetAddr::from("fe80::1".parse::<net::Ipv6Addr>().unwrap()).is_routable());
        assert!(NetAddr::TorV3([7; 32]).is_routable());
        assert!(!NetAddr::Unknown(42, vec![1, 2, 3]).is_routable());
    }

    #[test]
    fn test_encode_roundtrip() {
        let addr = Address::new(
            Endpoint::new(net::Ipv4Addr::new(8, 8, 8, 8), 8333),
            ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            1234567,
        );
        assert_eq!(roundtrip(&addr), addr);

        let onion = Address::new(
            Endpoint {
                addr: NetAddr::TorV3([9; 32]),
                port: 8333,
            },
            ServiceFlags::NONE,
            0,
        );
        assert_eq!(roundtrip(&onion), onion);
    }

    #[test]
    fn test_unknown_network_roundtrip() {
        let addr = Address::new(
            Endpoint {
                addr: NetAddr::Unknown(99, vec![1, 2, 3, 4, 5]),
                port: 1,
            },
            ServiceFlags::NONE,
            7,
        );
        assert_eq!(roundtrip(&addr), addr);
    }

    #[test]
    fn test_legacy_decode() {
        let ip = net::Ipv4Addr::new(41, 32, 5, 6);
        let octets = ip.to_ipv6_mapped().octets();

        assert_eq!(NetAddr::decode_legacy(octets), NetAddr::Ipv4(ip));

        // An IPv4 address encodes in a legacy record as its mapped form and
        // decodes back to itself.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&77u32.to_le_bytes());
        bytes.extend_from_slice(&ServiceFlags::NETWORK.as_u64().to_le_bytes());
        bytes.extend_from_slice(&octets);
        bytes.extend_from_slice(&8333u16.to_be_bytes());

        let addr = Address::decode_legacy(&mut bytes.as_slice()).unwrap();
        assert_eq!(addr.endpoint, Endpoint::new(ip, 8333));
        assert_eq!(addr.services, ServiceFlags::NETWORK);
        assert_eq!(addr.time, 77);
    }

    #[test]
    fn test_key_bytes() {
        // An IPv4 address and its IPv6-mapped form share a key.
        let v4 = NetAddr::from(net::Ipv4Addr::new(1, 2, 3, 4));
        let mapped = NetAddr::from(net::Ipv4Addr::new(1, 2, 3, 4).to_ipv6_mapped());
        assert_eq!(v4.key_bytes(), mapped.key_bytes());

        // The port participates in the endpoint key.
        let a = Endpoint::new(net::Ipv4Addr::new(1, 2, 3, 4), 8333);
        let b = Endpoint::new(net::Ipv4Addr::new(1, 2, 3, 4), 8334);
        assert_ne!(a.key_bytes(), b.key_bytes());
    }
}
