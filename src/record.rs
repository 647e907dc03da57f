//! Per-address statistics.
//!
//! Every stored address carries statistics about our history with it: when
//! we last tried it, when we last succeeded, and how often we failed. The
//! aging predicate [`AddrInfo::is_terrible`] and the selection weight
//! [`AddrInfo::chance`] are both pure functions of these statistics.

use std::io;

use bitcoin::consensus::encode::{self, Decodable, Encodable};

use crate::asmap::Asmap;
use crate::buckets::{self, Key};
use crate::net::{Address, NetAddr};
use crate::time::LocalTime;

/// How old an advertised address can maximally be, in days.
pub const HORIZON_DAYS: u64 = 30;
/// After how many failed attempts we give up on an address that never
/// connected.
pub const RETRIES: u32 = 3;
/// How many successive failures are allowed...
pub const MAX_FAILURES: u32 = 10;
/// ...in at least this many days.
pub const MIN_FAIL_DAYS: u64 = 7;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// A stored address, with statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// The address itself, with its advertised services and time.
    pub addr: Address,
    /// Where knowledge about this address first came from.
    pub source: NetAddr,
    /// Last time we tried connecting, successful or not. Zero if never.
    pub last_try: u64,
    /// Last successful connection. Zero if never.
    pub last_success: u64,
    /// Connection attempts since the last successful one.
    pub attempts: u32,

    /// Last attempt that was counted towards `attempts`.
    pub(crate) last_counted_attempt: u64,
    /// Number of new-table slots referencing this record. Zero iff the
    /// record is in the tried table.
    pub(crate) ref_count: u32,
    /// Whether the record is in the tried table.
    pub(crate) in_tried: bool,
    /// Position in the random-order vector.
    pub(crate) random_pos: usize,
}

impl AddrInfo {
    /// Create a record for a newly learned address.
    pub fn new(addr: Address, source: NetAddr) -> Self {
        Self {
            addr,
            source,
            last_try: 0,
            last_success: 0,
            last_counted_attempt: 0,
            attempts: 0,
            ref_count: 0,
            in_tried: false,
            random_pos: 0,
        }
    }

    /// Whether the record is in the tried table.
    pub fn is_tried(&self) -> bool {
        self.in_tried
    }

    /// Number of new-table slots referencing this record.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether the statistics are bad enough that the record can just be
    /// dropped when something else wants its slot.
    pub fn is_terrible(&self, now: LocalTime) -> bool {
        let now = now.as_secs();

        // Never remove things tried in the last minute.
        if self.last_try != 0 && self.last_try >= now.saturating_sub(60) {
            return false;
        }
        // The advertised time is from the future: the peer's clock is off,
        // and the value is useless for aging.
        if self.addr.time as u64 > now + 10 * 60 {
            return true;
        }
        // Not seen in recent history.
        if self.addr.time == 0
            || now.saturating_sub(self.addr.time as u64) > HORIZON_DAYS * SECONDS_PER_DAY
        {
            return true;
        }
        // Tried several times and never a success.
        if self.last_success == 0 && self.attempts >= RETRIES {
            return true;
        }
        // Too many failures in the last week.
        if now.saturating_sub(self.last_success) > MIN_FAIL_DAYS * SECONDS_PER_DAY
            && self.attempts >= MAX_FAILURES
        {
            return true;
        }
        false
    }

    /// The relative chance this record should be given when selecting an
    /// address to connect to, in (0, 1].
    pub fn chance(&self, now: LocalTime) -> f64 {
        let since_try = now.as_secs().saturating_sub(self.last_try);
        let mut chance = 1.0;

        // Deprioritize very recent attempts.
        if since_try < 60 * 10 {
            chance *= 0.01;
        }
        // Deprioritize 66% after each failed attempt, with a floor of about
        // 1/28 so that a long outage doesn't bury an address forever.
        chance * 0.66f64.powi(self.attempts.min(8) as i32)
    }

    /// The tried bucket this record belongs to.
    pub fn tried_bucket(&self, key: &Key, asmap: Option<&Asmap>) -> usize {
        buckets::tried_bucket(key, &self.addr.endpoint, asmap)
    }

    /// The new bucket this record belongs to, given a source.
    pub fn new_bucket(&self, key: &Key, source: &NetAddr, asmap: Option<&Asmap>) -> usize {
        buckets::new_bucket(key, &self.addr.endpoint.addr, source, asmap)
    }

    /// The new bucket this record belongs to, based on the source that
    /// first told us about it.
    pub fn primary_new_bucket(&self, key: &Key, asmap: Option<&Asmap>) -> usize {
        buckets::new_bucket(key, &self.addr.endpoint.addr, &self.source, asmap)
    }

    /// The position of this record within a given bucket.
    pub fn bucket_position(&self, key: &Key, new: bool, bucket: usize) -> usize {
        buckets::bucket_position(key, new, bucket, &self.addr.endpoint)
    }

    /// Decode a record in the legacy fixed address encoding used by
    /// database formats 0 through 2.
    pub(crate) fn decode_legacy<R: io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        let addr = Address::decode_legacy(reader)?;

        let mut source = [0; 16];
        reader.read_exact(&mut source)?;

        Self::decode_stats(addr, NetAddr::decode_legacy(source), reader)
    }

    fn decode_stats<R: io::Read + ?Sized>(
        addr: Address,
        source: NetAddr,
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        let last_success = i64::consensus_decode(reader)?.max(0) as u64;
        let attempts = i32::consensus_decode(reader)?.max(0) as u32;

        let mut info = Self::new(addr, source);
        info.last_success = last_success;
        info.attempts = attempts;

        Ok(info)
    }
}

impl Encodable for AddrInfo {
    fn consensus_encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.addr.consensus_encode(writer)?;
        len += self.source.consensus_encode(writer)?;
        len += (self.last_success as i64).consensus_encode(writer)?;
        len += (self.attempts as i32).consensus_encode(writer)?;

        Ok(len)
    }
}

impl Decodable for AddrInfo {
    fn consensus_decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, encode::Error> {
        let addr = Address::consensus_decode(reader)?;
        let source = NetAddr::consensus_decode(reader)?;

        Self::decode_stats(addr, source, reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Endpoint;
    use bitcoin::network::constants::ServiceFlags;
    use std::net::Ipv4Addr;

    fn record(time: u32) -> AddrInfo {
        AddrInfo::new(
            Address::new(
                Endpoint::new(Ipv4Addr::new(33, 44, 55, 66), 8333),
                ServiceFlags::NETWORK,
                time,
            ),
            NetAddr::from(Ipv4Addr::new(1, 2, 3, 4)),
        )
    }

    #[test]
    fn test_terrible() {
        let now = LocalTime::from_secs(500_000_000);
        let fresh = record(now.as_secs() as u32 - 100);

        assert!(!fresh.is_terrible(now));

        // Advertised too far in the future.
        assert!(record(now.as_secs() as u32 + 11 * 60).is_terrible(now));
        // Advertised time unknown.
        assert!(record(0).is_terrible(now));
        // Older than the horizon.
        assert!(record(now.as_secs() as u32 - 31 * 24 * 60 * 60).is_terrible(now));

        // Tried enough times with no success.
        let mut failed = record(now.as_secs() as u32 - 100);
        failed.attempts = RETRIES;
        assert!(failed.is_terrible(now));

        // ..but a recent try shields the record, no matter what.
        failed.last_try = now.as_secs() - 30;
        assert!(!failed.is_terrible(now));

        // Many failures since the last success, over a week ago.
        let mut flaky = record(now.as_secs() as u32 - 100);
        flaky.last_success = now.as_secs() - 8 * 24 * 60 * 60;
        flaky.attempts = MAX_FAILURES;
        assert!(flaky.is_terrible(now));

        flaky.attempts = MAX_FAILURES - 1;
        assert!(!flaky.is_terrible(now));
    }

    #[test]
    fn test_chance() {
        let now = LocalTime::from_secs(500_000_000);
        let mut info = record(now.as_secs() as u32 - 100);

        assert_eq!(info.chance(now), 1.0);

        // A recent attempt crushes the weight.
        info.last_try = now.as_secs() - 60;
        assert_eq!(info.chance(now), 0.01);

        // Each failure compounds, capped at eight.
        info.last_try = now.as_secs() - 3600;
        info.attempts = 2;
        assert_eq!(info.chance(now), 0.66 * 0.66);

        info.attempts = 20;
        assert_eq!(info.chance(now), 0.66f64.powi(8));
    }
}
