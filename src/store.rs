//! The address tables.
//!
//! Three structures share ownership-free references through stable integer
//! identifiers: the record map owns the records, while the two bucket
//! matrices and the random-order vector hold only identifiers. Deletion is
//! centralised in [`Store::delete`], which asserts its preconditions; slots
//! are only ever vacated through [`Store::clear_new`] or by the promotion
//! logic in the manager.

use std::collections::{BTreeMap, BTreeSet};

use crate::asmap::Asmap;
use crate::buckets::{Key, BUCKET_SIZE, NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT, TRIED_BUCKET_COUNT};
use crate::collections::HashMap;
use crate::net::NetAddr;
use crate::record::AddrInfo;

/// Stable record identifier.
pub(crate) type Id = u32;

/// The two bucket tables and their indexes.
#[derive(Debug)]
pub(crate) struct Store {
    /// Next identifier to assign.
    id_count: Id,
    /// All records, by identifier. Ordered, so that serialization sees a
    /// stable identity order.
    pub info: BTreeMap<Id, AddrInfo>,
    /// Identifier lookup by network address.
    by_addr: HashMap<NetAddr, Id>,
    /// Randomly-ordered vector of all identifiers, for uniform sampling.
    pub random: Vec<Id>,
    /// Buckets of addresses we haven't connected to yet.
    pub new: Vec<[Option<Id>; BUCKET_SIZE]>,
    /// Buckets of addresses we have connected to.
    pub tried: Vec<[Option<Id>; BUCKET_SIZE]>,
    /// Number of unique records in the new table.
    pub new_count: usize,
    /// Number of records in the tried table.
    pub tried_count: usize,
}

impl Store {
    /// Create an empty store. The address index is seeded from the given
    /// random source.
    pub fn new(rng: &fastrand::Rng) -> Self {
        Self {
            id_count: 0,
            info: BTreeMap::new(),
            by_addr: HashMap::with_hasher(rng.into()),
            random: Vec::new(),
            new: vec![[None; BUCKET_SIZE]; NEW_BUCKET_COUNT],
            tried: vec![[None; BUCKET_SIZE]; TRIED_BUCKET_COUNT],
            new_count: 0,
            tried_count: 0,
        }
    }

    /// The number of unique addresses stored.
    pub fn len(&self) -> usize {
        self.random.len()
    }

    /// Look up a record identifier by network address.
    pub fn find(&self, addr: &NetAddr) -> Option<Id> {
        self.by_addr.get(addr).copied()
    }

    /// Whether the given identifier refers to a record.
    pub fn contains(&self, id: Id) -> bool {
        self.info.contains_key(&id)
    }

    /// Access a record.
    ///
    /// # Panics
    ///
    /// Panics if the identifier is dangling; identifiers obtained from the
    /// tables are always live.
    pub fn get(&self, id: Id) -> &AddrInfo {
        self.info.get(&id).expect("store: dangling identifier")
    }

    /// Access a record mutably. Panics like [`Store::get`].
    pub fn get_mut(&mut self, id: Id) -> &mut AddrInfo {
        self.info.get_mut(&id).expect("store: dangling identifier")
    }

    /// Insert a record, assigning it a fresh identifier and appending it to
    /// the random-order vector. The caller is responsible for placing the
    /// record in a bucket and keeping the table counters current.
    pub fn create(&mut self, mut info: AddrInfo) -> Id {
        let id = self.id_count;
        self.id_count += 1;

        info.random_pos = self.random.len();
        self.by_addr.insert(info.addr.endpoint.addr.clone(), id);
        self.random.push(id);
        self.info.insert(id, info);

        id
    }

    /// Swap two entries of the random-order vector, keeping the records'
    /// positions in sync.
    pub fn swap_random(&mut self, pos1: usize, pos2: usize) {
        if pos1 == pos2 {
            return;
        }
        assert!(pos1 < self.random.len() && pos2 < self.random.len());

        let id1 = self.random[pos1];
        let id2 = self.random[pos2];

        self.get_mut(id1).random_pos = pos2;
        self.get_mut(id2).random_pos = pos1;

        self.random[pos1] = id2;
        self.random[pos2] = id1;
    }

    /// Delete a record. It must not be in tried, and must have no remaining
    /// bucket references.
    pub fn delete(&mut self, id: Id) {
        let info = self.get(id);
        assert!(!info.in_tried);
        assert_eq!(info.ref_count, 0);

        let pos = info.random_pos;
        self.swap_random(pos, self.random.len() - 1);
        self.random.pop();

        let info = self.info.remove(&id).expect("store: record exists");
        self.by_addr.remove(&info.addr.endpoint.addr);
        self.new_count -= 1;
    }

    /// Clear a position in the new table, releasing the occupant's
    /// reference. This is the only place where records are actually deleted
    /// during normal operation.
    pub fn clear_new(&mut self, bucket: usize, position: usize) {
        if let Some(id) = self.new[bucket][position] {
            let info = self.get_mut(id);
            assert!(info.ref_count > 0);
            info.ref_count -= 1;
            self.new[bucket][position] = None;

            if self.get(id).ref_count == 0 {
                self.delete(id);
            }
        }
    }

    /// Verify all structural invariants. Panics on violation: a failure
    /// here means memory corruption or a logic bug, and continuing would
    /// corrupt the database.
    pub fn consistency_check(&self, key: &Key, asmap: Option<&Asmap>) {
        assert_eq!(self.random.len(), self.new_count + self.tried_count);
        assert_eq!(self.by_addr.len(), self.info.len());

        let mut tried = BTreeSet::new();
        let mut refs: BTreeMap<Id, u32> = BTreeMap::new();

        for (&id, info) in &self.info {
            if info.in_tried {
                assert!(info.last_success > 0);
                assert_eq!(info.ref_count, 0);
                tried.insert(id);
            } else {
                assert!(info.ref_count >= 1);
                assert!(info.ref_count <= NEW_BUCKETS_PER_ADDRESS);
                refs.insert(id, info.ref_count);
            }
            assert_eq!(self.find(&info.addr.endpoint.addr), Some(id));
            assert!(info.random_pos < self.random.len());
            assert_eq!(self.random[info.random_pos], id);
        }
        assert_eq!(tried.len(), self.tried_count);
        assert_eq!(refs.len(), self.new_count);

        for (bucket, slots) in self.tried.iter().enumerate() {
            for (position, slot) in slots.iter().enumerate() {
                if let Some(id) = slot {
                    assert!(tried.remove(id));

                    let info = self.get(*id);
                    assert_eq!(info.tried_bucket(key, asmap), bucket);
                    assert_eq!(info.bucket_position(key, false, bucket), position);
                }
            }
        }
        for (bucket, slots) in self.new.iter().enumerate() {
            for (position, slot) in slots.iter().enumerate() {
                if let Some(id) = slot {
                    let info = self.get(*id);
                    // A record can be referenced from any bucket assigned to
                    // one of its source groups, but the position within the
                    // bucket is fully determined.
                    assert_eq!(info.bucket_position(key, true, bucket), position);

                    let count = refs.get_mut(id).expect("new slot holds a new record");
                    *count -= 1;
                    if *count == 0 {
                        refs.remove(id);
                    }
                }
            }
        }
        assert!(tried.is_empty(), "every tried record is in a tried slot");
        assert!(refs.is_empty(), "every reference is backed by a new slot");
    }
}
