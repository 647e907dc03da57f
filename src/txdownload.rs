//! Per-peer transaction download scheduling.
//!
//! Tracks, for a single peer, which transaction announcements we have seen,
//! which we have requested, and when the next request is due. The same
//! anti-eclipse thinking as the address tables applies: request times are
//! staggered and jittered across peers, so that no peer can reliably become
//! the only one we fetch a transaction from, and inbound peers cannot blind
//! us to a transaction by announcing it first.
//!
//! Each tracker is owned by its peer's state and guarded by the caller's
//! peer lock; the shared [`RequestTimes`] table coordinates request times
//! across all peers.

use std::collections::BTreeSet;

use bitcoin::Txid;

use crate::collections::HashMap;
use crate::time::{LocalDuration, LocalTime};

/// How long to wait before downloading a transaction from an additional
/// peer.
pub const GETDATA_INTERVAL: LocalDuration = LocalDuration::from_secs(60);

/// Maximum number of in-flight transaction requests to a single peer.
pub const MAX_IN_FLIGHT: usize = 100;

/// Extra delay before requesting from inbound peers, to prefer outbound
/// ones.
pub const INBOUND_DELAY: LocalDuration = LocalDuration::from_secs(2);

/// Upper bound on the random delay added to request times, to avoid biasing
/// some peers over others through fixed processing order.
pub const MAX_RANDOM_DELAY: LocalDuration = LocalDuration::from_secs(2);

/// How long a request may be outstanding before it is expired and the
/// peer's slot is freed.
pub const EXPIRY_INTERVAL: LocalDuration = LocalDuration::from_mins(10);

/// A single announcement and its scheduling state.
#[derive(Debug, Clone, Copy)]
struct Announcement {
    /// For announcements we haven't acted on, the time at which we'll next
    /// consider requesting the transaction; for requested ones, the time
    /// the request was sent.
    time: LocalTime,
    /// Whether a request to this peer is in flight.
    requested: bool,
}

/// Transaction announcements from a single peer.
#[derive(Debug)]
pub struct TxDownload {
    /// All known announcements, by transaction.
    txs: HashMap<Txid, Announcement>,
    /// Announcements not yet requested, in request-time order.
    queued: BTreeSet<(LocalTime, Txid)>,
    /// Requests in flight, in send-time order.
    in_flight: BTreeSet<(LocalTime, Txid)>,
    /// Next time we'll sweep for stuck requests.
    check_expiry: Option<LocalTime>,
}

impl TxDownload {
    /// Create an empty tracker. The announcement index is seeded from the
    /// given random source.
    pub fn new(rng: &fastrand::Rng) -> Self {
        Self {
            txs: HashMap::with_hasher(rng.into()),
            queued: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            check_expiry: None,
        }
    }

    /// The number of announcements tracked.
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    /// Whether no announcements are tracked.
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Whether the given transaction has been announced by this peer.
    pub fn contains(&self, txid: &Txid) -> bool {
        self.txs.contains_key(txid)
    }

    /// The number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// The peer announced a transaction: remember it, scheduled for request
    /// at the given time. Announcements we already know are ignored.
    pub fn add_announced(&mut self, txid: Txid, request_time: LocalTime) {
        if self.txs.contains_key(&txid) {
            return;
        }
        self.txs.insert(
            txid,
            Announcement {
                time: request_time,
                requested: false,
            },
        );
        self.queued.insert((request_time, txid));
    }

    /// We requested this transaction from another peer: push this peer's
    /// request back to after the outstanding request would time out.
    pub fn requeue(&mut self, txid: Txid, request_time: LocalTime) {
        let announcement = match self.txs.get_mut(&txid) {
            Some(announcement) => announcement,
            None => return,
        };
        if announcement.requested {
            self.in_flight.remove(&(announcement.time, txid));
        } else {
            self.queued.remove(&(announcement.time, txid));
        }
        announcement.time = request_time;
        announcement.requested = false;
        self.queued.insert((request_time, txid));
    }

    /// We sent this peer a request for the transaction. Records the send
    /// time so an unresponsive peer's request can be expired.
    pub fn request_sent(&mut self, txid: Txid, time: LocalTime) {
        let announcement = match self.txs.get_mut(&txid) {
            Some(announcement) => announcement,
            None => return,
        };
        if !announcement.requested {
            self.queued.remove(&(announcement.time, txid));
            announcement.time = time;
            announcement.requested = true;
            self.in_flight.insert((time, txid));
        }
    }

    /// The transaction was received, rejected or expired: stop tracking it
    /// for this peer.
    pub fn remove(&mut self, txid: &Txid) {
        if let Some(announcement) = self.txs.remove(txid) {
            if announcement.requested {
                self.in_flight.remove(&(announcement.time, *txid));
            } else {
                self.queued.remove(&(announcement.time, *txid));
            }
        }
    }

    /// Move requests that have been in flight for too long into `expired`,
    /// so that download can resume from other peers. Rate-limited by an
    /// internal checkpoint; sweeping on every call would be wasted work.
    pub fn expire_old(&mut self, now: LocalTime, expired: &mut Vec<Txid>) {
        match self.check_expiry {
            Some(at) if at > now => return,
            _ => {}
        }
        let cutoff = now - EXPIRY_INTERVAL;
        loop {
            let (time, txid) = match self.in_flight.iter().next() {
                Some(&entry) => entry,
                None => break,
            };
            if time > cutoff {
                break;
            }
            expired.push(txid);
            self.in_flight.remove(&(time, txid));
            self.txs.remove(&txid);
        }
        // Re-arm half an interval out: twice per interval is often enough
        // to catch everything within its expiry.
        self.check_expiry = Some(now + EXPIRY_INTERVAL / 2);
    }

    /// The next transaction we should request from this peer, if any is due
    /// and the in-flight cap leaves room. The entry stays queued until the
    /// caller reports [`TxDownload::request_sent`] or
    /// [`TxDownload::requeue`].
    pub fn next_to_request(&self, now: LocalTime) -> Option<Txid> {
        if self.in_flight.len() >= MAX_IN_FLIGHT {
            return None;
        }
        match self.queued.iter().next() {
            Some(&(time, txid)) if time <= now => Some(txid),
            _ => None,
        }
    }
}

/// Most recent request time for each transaction, across all peers.
///
/// Used to coordinate requests: a peer only becomes eligible to fetch a
/// transaction one getdata interval after the previous request to anyone,
/// plus a small random delay so that peer ordering doesn't bias who we
/// fetch from.
#[derive(Debug)]
pub struct RequestTimes {
    times: HashMap<Txid, LocalTime>,
}

impl RequestTimes {
    /// Create an empty table.
    pub fn new(rng: &fastrand::Rng) -> Self {
        Self {
            times: HashMap::with_hasher(rng.into()),
        }
    }

    /// The last time the transaction was requested from any peer.
    pub fn last_request(&self, txid: &Txid) -> Option<LocalTime> {
        self.times.get(txid).copied()
    }

    /// Record that the transaction was requested.
    pub fn record_request(&mut self, txid: Txid, time: LocalTime) {
        self.times.insert(txid, time);
    }

    /// Forget the transaction, eg. once it has been received, so that a
    /// rejected-but-unfiltered transaction can eventually be re-downloaded.
    pub fn erase(&mut self, txid: &Txid) {
        self.times.remove(txid);
    }

    /// Compute the time at which a peer should request the transaction:
    /// immediately if it was never requested, otherwise one interval after
    /// the previous request plus jitter, with an extra delay for inbound
    /// peers.
    pub fn getdata_time(
        &self,
        txid: &Txid,
        now: LocalTime,
        inbound: bool,
        rng: &fastrand::Rng,
    ) -> LocalTime {
        let mut time = match self.last_request(txid) {
            None => now,
            Some(last) => {
                let jitter =
                    LocalDuration::from_millis(rng.u128(..=MAX_RANDOM_DELAY.as_millis()));
                last + GETDATA_INTERVAL + jitter
            }
        };
        if inbound {
            time = time + INBOUND_DELAY;
        }
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin_hashes::Hash;

    fn txid(n: u8) -> Txid {
        Txid::from_slice(&[n; 32]).unwrap()
    }

    fn tracker() -> TxDownload {
        TxDownload::new(&fastrand::Rng::with_seed(7))
    }

    #[test]
    fn test_request_ordering() {
        let mut txs = tracker();
        let now = LocalTime::from_secs(1000);

        txs.add_announced(txid(3), now + LocalDuration::from_secs(30));
        txs.add_announced(txid(1), now);
        txs.add_announced(txid(2), now + LocalDuration::from_secs(10));

        // Earliest due first, and nothing that isn't due yet.
        assert_eq!(txs.next_to_request(now), Some(txid(1)));
        txs.request_sent(txid(1), now);
        assert_eq!(txs.next_to_request(now), None);
        assert_eq!(
            txs.next_to_request(now + LocalDuration::from_secs(10)),
            Some(txid(2))
        );
        assert_eq!(txs.in_flight(), 1);

        // Duplicate announcements are ignored.
        txs.add_announced(txid(2), now + LocalDuration::from_secs(99));
        assert_eq!(
            txs.next_to_request(now + LocalDuration::from_secs(10)),
            Some(txid(2))
        );
    }

    #[test]
    fn test_in_flight_cap() {
        let mut txs = tracker();
        let now = LocalTime::from_secs(1000);

        for n in 0..MAX_IN_FLIGHT {
            txs.add_announced(txid(n as u8), now);
            txs.request_sent(txid(n as u8), now);
        }
        txs.add_announced(txid(200), now);

        assert_eq!(txs.in_flight(), MAX_IN_FLIGHT);
        assert_eq!(txs.next_to_request(now), None, "the cap is enforced");

        // Receiving one frees a slot.
        txs.remove(&txid(0));
        assert_eq!(txs.next_to_request(now), Some(txid(200)));
    }

    #[test]
    fn test_requeue() {
        let mut txs = tracker();
        let now = LocalTime::from_secs(1000);
        let later = now + GETDATA_INTERVAL;

        txs.add_announced(txid(1), now);
        txs.request_sent(txid(1), now);
        assert_eq!(txs.in_flight(), 1);

        // Another peer answered first; this peer's turn comes after the
        // outstanding request would time out.
        txs.requeue(txid(1), later);
        assert_eq!(txs.in_flight(), 0);
        assert_eq!(txs.next_to_request(now), None);
        assert_eq!(txs.next_to_request(later), Some(txid(1)));
    }

    #[test]
    fn test_expiry() {
        let mut txs = tracker();
        let now = LocalTime::from_secs(10_000);

        txs.add_announced(txid(1), now);
        txs.request_sent(txid(1), now);
        txs.add_announced(txid(2), now);

        let mut expired = Vec::new();
        txs.expire_old(now, &mut expired);
        assert!(expired.is_empty());

        // Not yet due for another sweep.
        let soon = now + LocalDuration::from_secs(1);
        txs.expire_old(soon, &mut expired);
        assert!(expired.is_empty());

        // Once the request is older than the expiry interval, it is
        // surfaced and dropped; unrequested announcements are untouched.
        let late = now + EXPIRY_INTERVAL + LocalDuration::from_secs(1);
        txs.expire_old(late, &mut expired);
        assert_eq!(expired, vec![txid(1)]);
        assert!(!txs.contains(&txid(1)));
        assert!(txs.contains(&txid(2)));
        assert_eq!(txs.in_flight(), 0);
    }

    #[test]
    fn test_getdata_time() {
        let rng = fastrand::Rng::with_seed(7);
        let mut times = RequestTimes::new(&rng);
        let now = LocalTime::from_secs(1000);

        // Never requested: request immediately, or after the inbound delay.
        assert_eq!(times.getdata_time(&txid(1), now, false, &rng), now);
        assert_eq!(
            times.getdata_time(&txid(1), now, true, &rng),
            now + INBOUND_DELAY
        );

        // Requested before: at least one interval after that request, at
        // most the interval plus the jitter bound.
        times.record_request(txid(1), now);
        let at = times.getdata_time(&txid(1), now, false, &rng);
        assert!(at >= now + GETDATA_INTERVAL);
        assert!(at <= now + GETDATA_INTERVAL + MAX_RANDOM_DELAY);

        times.erase(&txid(1));
        assert_eq!(times.getdata_time(&txid(1), now, false, &rng), now);
    }
}
