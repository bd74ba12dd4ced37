//! Mapping of rows to buckets.

use std::{
    hash::{Hash, Hasher},
    sync::atomic::{AtomicUsize, Ordering},
};

use siphasher::sip::SipHasher13;

use crate::{
    config::DispatchPolicy,
    row::{PrimaryKey, PrimaryKeyColumn, RowChange},
};

/// Maps a [`RowChange`] to one of `N` buckets according to a
/// [`DispatchPolicy`].
///
/// The hash policies consistently map the same key to the same bucket, for
/// any number of calls from any number of threads, as long as the bucket count
/// is unchanged. Different [`Dispatcher`] instances with the same bucket count
/// produce the same mapping.
///
/// [`DispatchPolicy::RoundRobin`] advances a shared cursor with a single
/// atomic increment, giving an approximately even spread with no locality.
#[derive(Debug)]
pub struct Dispatcher {
    policy: DispatchPolicy,
    bucket_count: usize,
    hasher: SipHasher13,
    cursor: AtomicUsize,
}

impl Dispatcher {
    /// # Panics
    ///
    /// Panics if `bucket_count` is 0.
    pub fn new(policy: DispatchPolicy, bucket_count: usize) -> Self {
        assert_ne!(bucket_count, 0, "dispatcher needs at least one bucket");

        // A static siphash key so every writer instance hashes the same key to
        // the same bucket index.
        let key = [
            0x3c, 0x91, 0x07, 0xe2, 0x5a, 0x44, 0xd8, 0x1f, 0xb6, 0x2e, 0x73, 0x09, 0xc5, 0x60,
            0x8d, 0xaa,
        ];

        Self {
            policy,
            bucket_count,
            hasher: SipHasher13::new_with_key(&key),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Return the bucket index in `[0, bucket_count)` for `row`.
    pub fn dispatch(&self, row: &RowChange) -> usize {
        match self.policy {
            DispatchPolicy::HashPrimaryKey => self.hash(&RowKey {
                table: row.table_name(),
                primary_key: row.primary_key(),
            }),
            DispatchPolicy::HashPartitionKey => self.hash(&PartitionKey {
                table: row.table_name(),
                partition_key: row.primary_key().partition_key(),
            }),
            DispatchPolicy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.bucket_count
            }
        }
    }

    fn hash<H: Hash>(&self, key: &H) -> usize {
        let mut state = self.hasher;
        key.hash(&mut state);
        jump_hash(state.finish(), self.bucket_count)
    }
}

// The derived hash impls are hardened against prefix collisions when
// combining the fields.
#[derive(Hash)]
struct RowKey<'a> {
    table: &'a str,
    primary_key: &'a PrimaryKey,
}

#[derive(Hash)]
struct PartitionKey<'a> {
    table: &'a str,
    partition_key: Option<&'a PrimaryKeyColumn>,
}

/// Google's jump consistent hash, mapping `key` to `[0, n)` with `O(ln n)`
/// work and a near perfect distribution.
fn jump_hash(mut key: u64, n: usize) -> usize {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < n as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * (((1u64 << 31) as f64) / (((key >> 33) + 1) as f64)))
            as i64;
    }

    assert!(b >= 0);
    b as usize
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    fn row(table: &str, region: &str, id: i64) -> RowChange {
        RowChange::put(
            table,
            PrimaryKey::new([
                ("region", crate::row::PrimaryKeyValue::from(region)),
                ("id", crate::row::PrimaryKeyValue::from(id)),
            ]),
        )
    }

    #[test]
    fn test_hash_primary_key_is_stable() {
        let a = Dispatcher::new(DispatchPolicy::HashPrimaryKey, 16);
        let b = Dispatcher::new(DispatchPolicy::HashPrimaryKey, 16);

        for id in 0..100 {
            let r = row("t", "eu", id);
            let want = a.dispatch(&r);
            // Same key, same answer, regardless of instance or column values.
            assert_eq!(b.dispatch(&r), want);
            assert_eq!(a.dispatch(&r.clone().with_column("v", id)), want);
        }
    }

    #[test]
    fn test_hash_primary_key_spreads_keys() {
        let d = Dispatcher::new(DispatchPolicy::HashPrimaryKey, 8);
        let used = (0..1000)
            .map(|id| d.dispatch(&row("t", "eu", id)))
            .collect::<HashSet<_>>();
        assert_eq!(used.len(), 8);
    }

    #[test]
    fn test_hash_partition_key_groups_partition() {
        let d = Dispatcher::new(DispatchPolicy::HashPartitionKey, 8);
        let eu = (0..100)
            .map(|id| d.dispatch(&row("t", "eu", id)))
            .collect::<HashSet<_>>();
        assert_eq!(eu.len(), 1);
    }

    // Note this is a property test that asserts the round-robin nature of the
    // returned results, not the values themselves.
    #[test]
    fn test_round_robin() {
        let d = Dispatcher::new(DispatchPolicy::RoundRobin, 5);
        let r = row("t", "eu", 1);

        let mappings = (0..5).map(|_| d.dispatch(&r)).collect::<Vec<_>>();
        assert_eq!(mappings.iter().collect::<HashSet<_>>().len(), 5);

        for want in mappings.into_iter().cycle().take(100) {
            assert_eq!(want, d.dispatch(&r));
        }
    }

    proptest! {
        #[test]
        fn prop_dispatch_in_range(
            buckets in 1_usize..64,
            table in "[a-z]{1,8}",
            region in "[a-z]{0,8}",
            id in any::<i64>(),
        ) {
            let r = row(&table, &region, id);
            for policy in [
                DispatchPolicy::HashPrimaryKey,
                DispatchPolicy::HashPartitionKey,
                DispatchPolicy::RoundRobin,
            ] {
                let d = Dispatcher::new(policy, buckets);
                let got = d.dispatch(&r);
                prop_assert!(got < buckets);
                if policy != DispatchPolicy::RoundRobin {
                    prop_assert_eq!(got, d.dispatch(&r));
                }
            }
        }
    }
}
