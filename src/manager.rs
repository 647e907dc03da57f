//! The stochastic address manager.
//!
//! All mutable state lives behind a single mutex: every externally visible
//! operation locks it for its whole duration and performs no I/O while
//! holding it. Internal helpers are plain `&mut self` methods on the inner
//! engine, so that compound operations (collision resolution promoting a
//! candidate, for instance) share the critical section without re-locking.
//!
//! Randomness is a capability, not a global: the sampling source is
//! injected at construction, and only the secret bucketing key is drawn
//! from OS entropy. In deterministic mode both are fixed, which tests rely
//! on.

use std::collections::BTreeSet;
use std::sync::Mutex;

use bitcoin::network::constants::ServiceFlags;

use crate::asmap::Asmap;
use crate::buckets::{
    self, Key, BUCKET_SIZE, BUCKET_SIZE_LOG2, NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT,
    NEW_BUCKET_COUNT_LOG2, TRIED_BUCKET_COUNT, TRIED_BUCKET_COUNT_LOG2,
};
use crate::net::{Address, Endpoint, NetAddr};
use crate::record::AddrInfo;
use crate::store::{Id, Store};
use crate::time::LocalTime;

/// How recent a successful connection must be for a tried entry to be
/// shielded from eviction, in hours.
pub const REPLACEMENT_HOURS: u64 = 4;

/// Maximum number of unresolved tried-table collisions kept for
/// test-before-evict arbitration.
pub const MAX_TRIED_COLLISIONS: usize = 10;

/// Maximum time we wait for a queued collision to be tested before evicting
/// the occupant anyway, in seconds.
pub const TEST_WINDOW_SECS: u64 = 40 * 60;

/// Address manager configuration.
#[derive(Debug, Default)]
pub struct Config {
    /// Verify every table invariant before and after each operation.
    /// Expensive; meant for tests and debugging.
    pub check_consistency: bool,
    /// Optional IP-to-ASN map used for bucketing. Changing the map between
    /// runs re-buckets the database on load.
    pub asmap: Option<Asmap>,
}

/// Manages peer network addresses.
///
/// Addresses learned from the network go into 1024 *new* buckets, keyed by
/// the address range of the peer that told us about them; addresses we have
/// connected to ourselves live in 256 *tried* buckets. Bucket placement
/// derives from a secret key, so an adversary cannot aim for particular
/// buckets, and addresses from one network group can only ever occupy a
/// small, fixed fraction of the tables. See the crate documentation for the
/// full design rationale.
#[derive(Debug)]
pub struct AddressManager {
    pub(crate) inner: Mutex<Engine>,
}

impl AddressManager {
    /// Create a new, empty address manager. The bucketing key is drawn from
    /// OS entropy; the given random source is used for sampling only.
    pub fn new(config: Config, rng: fastrand::Rng) -> Self {
        let mut key = [0; 32];
        {
            use rand::RngCore;
            rand::rngs::OsRng.fill_bytes(&mut key);
        }
        Self {
            inner: Mutex::new(Engine::new(config, rng, key, false)),
        }
    }

    /// Create an address manager with a zero key and a fixed-seed random
    /// source, so that bucket placements and sampling are reproducible.
    /// Used by tests.
    pub fn deterministic(config: Config) -> Self {
        Self {
            inner: Mutex::new(Engine::new(
                config,
                fastrand::Rng::with_seed(1),
                [0; 32],
                true,
            )),
        }
    }

    /// The number of unique addresses stored, across both tables.
    pub fn size(&self) -> usize {
        self.with(|engine| engine.store.len())
    }

    /// Whether the manager holds no addresses.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Add a single address learned from `source`.
    ///
    /// `penalty` is subtracted from the advertised time, to discount
    /// addresses relayed to us rather than observed directly; a peer's
    /// self-announcement pays no penalty. Returns `true` iff a record was
    /// created for a previously unknown address.
    pub fn add(&self, addr: &Address, source: &NetAddr, penalty: u64, time: LocalTime) -> bool {
        self.with(|engine| engine.add(addr, source, penalty, time))
    }

    /// Add multiple addresses from one source. Returns how many records
    /// were created.
    pub fn add_many(
        &self,
        addrs: &[Address],
        source: &NetAddr,
        penalty: u64,
        time: LocalTime,
    ) -> usize {
        self.with(|engine| {
            let added = addrs
                .iter()
                .filter(|addr| engine.add(addr, source, penalty, time))
                .count();
            if added > 0 {
                log::debug!(
                    "Added {} addresses from {}: {} tried, {} new",
                    added,
                    source,
                    engine.store.tried_count,
                    engine.store.new_count
                );
            }
            added
        })
    }

    /// Mark an address as good: we connected to it and completed a
    /// handshake. May move the record into the tried table, or queue it for
    /// test-before-evict arbitration when its tried slot is contested.
    pub fn good(&self, endpoint: &Endpoint, test_before_evict: bool, time: LocalTime) {
        self.with(|engine| engine.good(endpoint, test_before_evict, time))
    }

    /// Record a connection attempt. `count_failure` marks the attempt as a
    /// countable failure; attempts made before the last successful epoch
    /// are not counted, so that bursts of dialing don't bury an address.
    pub fn attempt(&self, endpoint: &Endpoint, count_failure: bool, time: LocalTime) {
        self.with(|engine| engine.attempt(endpoint, count_failure, time))
    }

    /// Record that we are still connected to an address, periodically
    /// refreshing its advertised time.
    pub fn connected(&self, endpoint: &Endpoint, time: LocalTime) {
        self.with(|engine| engine.connected(endpoint, time))
    }

    /// Replace the services advertised for an address.
    pub fn set_services(&self, endpoint: &Endpoint, services: ServiceFlags) {
        self.with(|engine| engine.set_services(endpoint, services))
    }

    /// Choose an address to connect to. With `new_only`, only the new table
    /// is sampled.
    pub fn select(&self, new_only: bool, time: LocalTime) -> Option<AddrInfo> {
        self.with(|engine| engine.select(new_only, time))
    }

    /// Return a random selection of stored addresses, skipping stale ones.
    /// At most `max_addresses` (0 for no cap) and at most `max_pct` percent
    /// of the table (0 for no cap) are returned.
    pub fn get_addr(&self, max_addresses: usize, max_pct: usize, time: LocalTime) -> Vec<Address> {
        self.with(|engine| engine.get_addr(max_addresses, max_pct, time))
    }

    /// Arbitrate pending tried-table collisions; see the module
    /// documentation for the eviction policy.
    pub fn resolve_collisions(&self, time: LocalTime) {
        self.with(|engine| engine.resolve_collisions(time))
    }

    /// Pick a random pending collision and return the tried entry the
    /// caller should test connectivity to.
    pub fn select_tried_collision(&self) -> Option<AddrInfo> {
        self.with(|engine| engine.select_tried_collision())
    }

    /// Clear all addresses, regenerating the bucketing key.
    pub fn clear(&self) {
        self.with(|engine| engine.clear())
    }

    /// Run an operation under the manager lock, verifying invariants around
    /// it when consistency checking is enabled.
    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut Engine) -> T) -> T {
        let mut engine = self.inner.lock().expect("address manager lock poisoned");

        engine.check();
        let output = f(&mut engine);
        engine.check();

        output
    }
}

/// The address manager state and mutation engine. All methods expect the
/// caller to hold the manager lock.
#[derive(Debug)]
pub(crate) struct Engine {
    /// The bucket tables and their indexes.
    pub(crate) store: Store,
    /// Secret key all bucket placements derive from.
    pub(crate) key: Key,
    /// Optional IP-to-ASN map for group computation.
    pub(crate) asmap: Option<Asmap>,
    /// Sampling randomness.
    pub(crate) rng: fastrand::Rng,
    /// Candidates awaiting test-before-evict arbitration, in insertion
    /// (identifier) order.
    pub(crate) collisions: BTreeSet<Id>,
    /// Last time an address was marked good. Starts at 1, so that a "never
    /// good" epoch sorts strictly before any recorded attempt.
    pub(crate) last_good: u64,
    /// Whether to zero the key instead of regenerating it on clear.
    pub(crate) deterministic: bool,
    check_consistency: bool,
}

impl Engine {
    pub(crate) fn new(config: Config, rng: fastrand::Rng, key: Key, deterministic: bool) -> Self {
        Self {
            store: Store::new(&rng),
            key,
            asmap: config.asmap,
            rng,
            collisions: BTreeSet::new(),
            last_good: 1,
            deterministic,
            check_consistency: config.check_consistency,
        }
    }

    pub(crate) fn check(&self) {
        if self.check_consistency {
            self.store
                .consistency_check(&self.key, self.asmap.as_ref());
        }
    }

    pub(crate) fn clear(&mut self) {
        self.store = Store::new(&self.rng);
        self.collisions.clear();
        self.last_good = 1;

        if self.deterministic {
            self.key = [0; 32];
            self.rng = fastrand::Rng::with_seed(1);
        } else {
            use rand::RngCore;
            rand::rngs::OsRng.fill_bytes(&mut self.key);
        }
    }

    pub(crate) fn add(
        &mut self,
        addr: &Address,
        source: &NetAddr,
        penalty: u64,
        time: LocalTime,
    ) -> bool {
        if !addr.endpoint.addr.is_routable() {
            return false;
        }
        // A peer announcing itself pays no relay penalty.
        let penalty = if addr.endpoint.addr == *source {
            0
        } else {
            penalty
        };
        let now = time.as_secs();
        let mut created = false;

        let id = match self.store.find(&addr.endpoint.addr) {
            Some(id) => {
                let info = self.store.get_mut(id);

                // Periodically refresh the advertised time: hourly for
                // addresses claiming to be currently online, daily
                // otherwise. The refreshed value never exceeds the claimed
                // time minus the penalty.
                let currently_online = now.saturating_sub(addr.time as u64) < 24 * 60 * 60;
                let update_interval: u64 = if currently_online {
                    60 * 60
                } else {
                    24 * 60 * 60
                };
                if addr.time != 0
                    && (info.addr.time == 0
                        || (info.addr.time as u64)
                            < (addr.time as u64).saturating_sub(update_interval + penalty))
                {
                    info.addr.time = (addr.time as u64).saturating_sub(penalty) as u32;
                }
                // Merge the advertised services.
                info.addr.services |= addr.services;

                // Don't go further if no new information is present.
                if addr.time == 0 || (info.addr.time != 0 && addr.time <= info.addr.time) {
                    return false;
                }
                // Tried entries aren't re-bucketed by gossip.
                if info.in_tried {
                    return false;
                }
                // Enforce the per-address reference limit.
                if info.ref_count == NEW_BUCKETS_PER_ADDRESS {
                    return false;
                }
                // Stochastic gate: with N references, only one in 2^N calls
                // may add another one.
                let factor = 1u32 << info.ref_count;
                if factor > 1 && self.rng.u32(..factor) != 0 {
                    return false;
                }
                id
            }
            None => {
                let mut info = AddrInfo::new(addr.clone(), source.clone());
                info.addr.time = (addr.time as u64).saturating_sub(penalty) as u32;

                let id = self.store.create(info);
                self.store.new_count += 1;
                created = true;
                id
            }
        };

        let bucket = buckets::new_bucket(&self.key, &addr.endpoint.addr, source, self.asmap.as_ref());
        let position = buckets::bucket_position(&self.key, true, bucket, &addr.endpoint);

        if self.store.new[bucket][position] != Some(id) {
            let mut insert = self.store.new[bucket][position].is_none();
            if let Some(occupant) = self.store.new[bucket][position] {
                let existing = self.store.get(occupant);
                // Displace the occupant if it has gone stale, or if it has
                // references to spare while the candidate has none.
                if existing.is_terrible(time)
                    || (existing.ref_count > 1 && self.store.get(id).ref_count == 0)
                {
                    insert = true;
                }
            }
            if insert {
                self.store.clear_new(bucket, position);
                self.store.get_mut(id).ref_count += 1;
                self.store.new[bucket][position] = Some(id);
            } else if self.store.get(id).ref_count == 0 {
                // The fresh record could not be placed anywhere.
                self.store.delete(id);
            }
        }
        if created {
            log::debug!(
                "Added {} from {}: {} tried, {} new",
                addr.endpoint,
                source,
                self.store.tried_count,
                self.store.new_count
            );
        }
        created
    }

    pub(crate) fn good(&mut self, endpoint: &Endpoint, test_before_evict: bool, time: LocalTime) {
        let now = time.as_secs();
        self.last_good = now;

        let id = match self.store.find(&endpoint.addr) {
            Some(id) => id,
            None => return,
        };
        {
            let info = self.store.get_mut(id);

            // Make sure we are talking about the exact same endpoint,
            // including the port.
            if info.addr.endpoint != *endpoint {
                return;
            }
            info.last_success = now;
            info.last_try = now;
            info.attempts = 0;
            // The advertised time is deliberately left alone, to avoid
            // leaking which peers we are currently connected to.

            if info.in_tried {
                return;
            }
        }

        // Find a new bucket that currently references this record, starting
        // the scan at a random rotation.
        let start = self.rng.usize(..NEW_BUCKET_COUNT);
        let mut referenced = false;
        for n in 0..NEW_BUCKET_COUNT {
            let bucket = (n + start) % NEW_BUCKET_COUNT;
            let position = buckets::bucket_position(&self.key, true, bucket, endpoint);

            if self.store.new[bucket][position] == Some(id) {
                referenced = true;
                break;
            }
        }
        // If no bucket references the record, something is off; bail out.
        if !referenced {
            return;
        }

        let bucket = buckets::tried_bucket(&self.key, endpoint, self.asmap.as_ref());
        let position = buckets::bucket_position(&self.key, false, bucket, endpoint);

        // Will moving this record into tried evict another entry?
        if test_before_evict && self.store.tried[bucket][position].is_some() {
            log::debug!(
                "Collision inserting {} into tried table; {} collision(s) pending",
                endpoint,
                self.collisions.len()
            );
            if self.collisions.len() < MAX_TRIED_COLLISIONS {
                self.collisions.insert(id);
            }
        } else {
            log::debug!("Moving {} to tried table", endpoint);
            self.make_tried(id);
        }
    }

    /// Move a record from the new table to its tried slot, demoting the
    /// slot's current occupant back to the new table if there is one.
    fn make_tried(&mut self, id: Id) {
        let endpoint = self.store.get(id).addr.endpoint.clone();

        // Drop every new-table reference to the record.
        for bucket in 0..NEW_BUCKET_COUNT {
            let position = buckets::bucket_position(&self.key, true, bucket, &endpoint);

            if self.store.new[bucket][position] == Some(id) {
                self.store.new[bucket][position] = None;
                self.store.get_mut(id).ref_count -= 1;
            }
        }
        self.store.new_count -= 1;
        assert_eq!(self.store.get(id).ref_count, 0);

        let bucket = buckets::tried_bucket(&self.key, &endpoint, self.asmap.as_ref());
        let position = buckets::bucket_position(&self.key, false, bucket, &endpoint);

        // Make room, moving the current occupant back to the new table and
        // deleting whatever its new slot holds.
        if let Some(evicted) = self.store.tried[bucket][position] {
            self.store.get_mut(evicted).in_tried = false;
            self.store.tried[bucket][position] = None;
            self.store.tried_count -= 1;

            let (new_bucket, new_position) = {
                let info = self.store.get(evicted);
                let b = info.primary_new_bucket(&self.key, self.asmap.as_ref());

                (b, info.bucket_position(&self.key, true, b))
            };
            self.store.clear_new(new_bucket, new_position);
            assert!(self.store.new[new_bucket][new_position].is_none());

            self.store.get_mut(evicted).ref_count = 1;
            self.store.new[new_bucket][new_position] = Some(evicted);
            self.store.new_count += 1;

            log::debug!(
                "Evicted {} from tried table",
                self.store.get(evicted).addr.endpoint
            );
        }
        assert!(self.store.tried[bucket][position].is_none());

        self.store.tried[bucket][position] = Some(id);
        self.store.tried_count += 1;
        self.store.get_mut(id).in_tried = true;
    }

    pub(crate) fn attempt(&mut self, endpoint: &Endpoint, count_failure: bool, time: LocalTime) {
        let id = match self.store.find(&endpoint.addr) {
            Some(id) => id,
            None => return,
        };
        let last_good = self.last_good;
        let info = self.store.get_mut(id);

        if info.addr.endpoint != *endpoint {
            return;
        }
        info.last_try = time.as_secs();

        // Only count one failure per "good" epoch, so that repeated dialing
        // while the network is down doesn't bury the address.
        if count_failure && info.last_counted_attempt < last_good {
            info.last_counted_attempt = time.as_secs();
            info.attempts += 1;
        }
    }

    pub(crate) fn connected(&mut self, endpoint: &Endpoint, time: LocalTime) {
        let id = match self.store.find(&endpoint.addr) {
            Some(id) => id,
            None => return,
        };
        let info = self.store.get_mut(id);

        if info.addr.endpoint != *endpoint {
            return;
        }
        // Refresh the advertised time at most every 20 minutes.
        let update_interval = 20 * 60;
        let now = time.as_secs();

        if now.saturating_sub(info.addr.time as u64) > update_interval {
            info.addr.time = now as u32;
        }
    }

    pub(crate) fn set_services(&mut self, endpoint: &Endpoint, services: ServiceFlags) {
        let id = match self.store.find(&endpoint.addr) {
            Some(id) => id,
            None => return,
        };
        let info = self.store.get_mut(id);

        if info.addr.endpoint != *endpoint {
            return;
        }
        info.addr.services = services;
    }

    pub(crate) fn select(&mut self, new_only: bool, time: LocalTime) -> Option<AddrInfo> {
        if self.store.len() == 0 {
            return None;
        }
        if new_only && self.store.new_count == 0 {
            return None;
        }
        // Equal chance between the tried and new tables, when both are
        // populated.
        let use_tried = !new_only
            && self.store.tried_count > 0
            && (self.store.new_count == 0 || self.rng.bool());

        let (table, count, count_log2) = if use_tried {
            (&self.store.tried, TRIED_BUCKET_COUNT, TRIED_BUCKET_COUNT_LOG2)
        } else {
            (&self.store.new, NEW_BUCKET_COUNT, NEW_BUCKET_COUNT_LOG2)
        };

        // Weighted rejection sampling: pick a uniform slot, walk to the
        // next filled one, and accept proportionally to the record's
        // chance. The acceptance factor grows on every rejection, so the
        // loop terminates.
        let mut factor = 1.0;
        loop {
            let mut bucket = self.rng.usize(..count);
            let mut position = self.rng.usize(..BUCKET_SIZE);

            while table[bucket][position].is_none() {
                bucket = (bucket + rand_bits(&self.rng, count_log2) as usize) % count;
                position =
                    (position + rand_bits(&self.rng, BUCKET_SIZE_LOG2) as usize) % BUCKET_SIZE;
            }
            let id = table[bucket][position].expect("slot is filled");
            let info = self.store.get(id);

            if (rand_bits(&self.rng, 30) as f64) < factor * info.chance(time) * (1u64 << 30) as f64
            {
                return Some(info.clone());
            }
            factor *= 1.2;
        }
    }

    pub(crate) fn get_addr(
        &mut self,
        max_addresses: usize,
        max_pct: usize,
        time: LocalTime,
    ) -> Vec<Address> {
        let mut wanted = self.store.len();
        if max_pct != 0 {
            wanted = max_pct * wanted / 100;
        }
        if max_addresses != 0 {
            wanted = wanted.min(max_addresses);
        }

        // Gather random records, skipping those of low quality. The partial
        // shuffle mutates the random-order vector, cheaply mixing future
        // samples.
        let mut addrs = Vec::new();
        for n in 0..self.store.len() {
            if addrs.len() >= wanted {
                break;
            }
            let pick = self.rng.usize(..self.store.len() - n) + n;
            self.store.swap_random(n, pick);

            let info = self.store.get(self.store.random[n]);
            if !info.is_terrible(time) {
                addrs.push(info.addr.clone());
            }
        }
        addrs
    }

    pub(crate) fn resolve_collisions(&mut self, time: LocalTime) {
        let now = time.as_secs();
        let pending: Vec<Id> = self.collisions.iter().copied().collect();

        for id in pending {
            let mut erase = false;
            let mut promote = false;

            if !self.store.contains(id) {
                erase = true;
            } else {
                let info = self.store.get(id);
                let endpoint = info.addr.endpoint.clone();
                let bucket = buckets::tried_bucket(&self.key, &endpoint, self.asmap.as_ref());
                let position = buckets::bucket_position(&self.key, false, bucket, &endpoint);

                if !endpoint.addr.is_valid() {
                    // The candidate no longer maps to a valid address.
                    erase = true;
                } else if let Some(occupant) = self.store.tried[bucket][position] {
                    let old = self.store.get(occupant);

                    if now.saturating_sub(old.last_success) < REPLACEMENT_HOURS * 60 * 60 {
                        // The occupant connected successfully recently; it
                        // keeps its slot.
                        erase = true;
                    } else if now.saturating_sub(old.last_try) < REPLACEMENT_HOURS * 60 * 60 {
                        // The occupant was tried recently and failed. Give
                        // it at least a minute to complete a connection
                        // before replacing it.
                        if now.saturating_sub(old.last_try) > 60 {
                            log::debug!(
                                "Replacing {} with {} in tried table",
                                old.addr.endpoint,
                                endpoint
                            );
                            promote = true;
                            erase = true;
                        }
                    } else if now.saturating_sub(info.last_success) > TEST_WINDOW_SECS {
                        // The collision never got tested in a reasonable
                        // time; we must not be able to reach the occupant.
                        log::debug!(
                            "Unable to test; replacing {} with {} in tried table anyway",
                            old.addr.endpoint,
                            endpoint
                        );
                        promote = true;
                        erase = true;
                    }
                } else {
                    // The slot freed up: not a collision anymore.
                    promote = true;
                    erase = true;
                }
            }
            if promote {
                let endpoint = self.store.get(id).addr.endpoint.clone();
                self.good(&endpoint, false, time);
            }
            if erase {
                self.collisions.remove(&id);
            }
        }
    }

    pub(crate) fn select_tried_collision(&mut self) -> Option<AddrInfo> {
        if self.collisions.is_empty() {
            return None;
        }
        let pick = self.rng.usize(..self.collisions.len());
        let id = *self
            .collisions
            .iter()
            .nth(pick)
            .expect("index is within the set");

        if !self.store.contains(id) {
            self.collisions.remove(&id);
            return None;
        }
        let info = self.store.get(id);
        let bucket = info.tried_bucket(&self.key, self.asmap.as_ref());
        let position = info.bucket_position(&self.key, false, bucket);

        self.store.tried[bucket][position].map(|occupant| self.store.get(occupant).clone())
    }
}

/// Draw a uniform `bits`-bit value from the random source.
fn rand_bits(rng: &fastrand::Rng, bits: u32) -> u64 {
    rng.u64(..) >> (64 - bits)
}
