//! Stochastic peer-address manager.
//!
//! Keeps the addresses a peer-to-peer node has learned about, in memory,
//! and serves the node's outbound connection logic with uniformly-random,
//! high-quality candidates. The design goal is resistance to eclipse
//! attacks: no localized attacker should be able to fill the tables with
//! addresses it controls.
//!
//! To that end:
//!
//! * Addresses are organized into buckets:
//!   * Addresses that have not yet been tried go into 1024 *new* buckets.
//!     Based on the network group (/16 for IPv4, or the AS number when a
//!     group map is loaded) of the *source* of the information, 64 of these
//!     buckets are selected at random; the actual bucket within them is
//!     chosen based on the group of the address itself. A single address
//!     can occur in up to 8 buckets, with the chance of adding another
//!     occurrence falling off exponentially.
//!   * Addresses of nodes we have successfully connected to go into 256
//!     *tried* buckets, 8 per address group. Promoting into an occupied
//!     slot is arbitrated with a test-before-evict policy: the occupant
//!     gets probed before it is demoted back to the new tables.
//! * Bucket selection is keyed with a randomly-generated 256-bit secret,
//!   so placements are not observable by adversaries.
//! * Selection samples buckets uniformly and then accepts entries with a
//!   weight reflecting attempt history, so well-behaved addresses win
//!   without starving the rest.
//!
//! The whole database serializes to a caller-provided stream and reloads
//! across restarts, re-bucketing itself when the bucketing function
//! changed; see the `serialize` code for the format.
//!
//! The per-peer transaction-announcement tracker in [`txdownload`] shares
//! the same anti-eclipse rationale for download scheduling and lives here
//! with the address tables.
//!
//! ```
//! use addrman::{Address, AddressManager, Config, Endpoint, LocalTime, NetAddr};
//! use bitcoin::network::constants::ServiceFlags;
//!
//! let addrmgr = AddressManager::deterministic(Config::default());
//! let now = LocalTime::from_secs(1_600_000_000);
//!
//! let addr = Address::new(
//!     Endpoint::new(std::net::Ipv4Addr::new(83, 250, 1, 1), 8333),
//!     ServiceFlags::NETWORK,
//!     now.as_secs() as u32,
//! );
//! let source = NetAddr::from(std::net::Ipv4Addr::new(99, 2, 3, 4));
//!
//! assert!(addrmgr.add(&addr, &source, 0, now));
//! assert_eq!(addrmgr.size(), 1);
//!
//! let candidate = addrmgr.select(false, now).unwrap();
//! assert_eq!(candidate.addr.endpoint, addr.endpoint);
//! ```
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod asmap;
pub mod buckets;
pub mod collections;
pub mod error;
pub mod manager;
pub mod net;
pub mod record;
pub mod time;
pub mod txdownload;

mod serialize;
mod store;

pub use asmap::Asmap;
pub use error::Error;
pub use manager::{AddressManager, Config};
pub use net::{Address, Endpoint, NetAddr};
pub use record::AddrInfo;
pub use time::{LocalDuration, LocalTime};

pub use bitcoin;
