use crossbeam_ebr::Guard;

use super::params::TreeParams;
use super::traverse::TreeStats;
use crate::error::Result;

/// Keys that can be folded into the checksum returned by `key_sum`.
pub trait KeySum {
    fn key_sum(&self) -> i64;
}

macro_rules! impl_key_sum {
    ($($t:ty),*) => {
        $(impl KeySum for $t {
            #[inline]
            fn key_sum(&self) -> i64 {
                *self as i64
            }
        })*
    };
}

impl_key_sum!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

pub trait ConcurrentMap<K, V> {
    fn new() -> Self;
    fn with_params(params: TreeParams) -> Result<Self>
    where
        Self: Sized;
    fn get<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V>;
    fn contains_key(&self, key: &K, guard: &Guard) -> bool {
        self.get(key, guard).is_some()
    }
    /// Returns the value already mapped to `key`, or `None` if the entry was
    /// inserted.
    fn put_if_absent<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V>;
    fn insert(&self, key: K, value: V, guard: &Guard) -> bool {
        self.put_if_absent(key, value, guard).is_none()
    }
    fn remove<'g>(&'g self, key: &K, guard: &'g Guard) -> Option<&'g V>;
}

/// Ordered queries and quiescent diagnostics.
pub trait RangeMap<K, V>: ConcurrentMap<K, V> {
    /// Values of the entries with keys in `[lo, hi]`, in key order.
    fn range_scan<'g>(&'g self, lo: &K, hi: &K, guard: &'g Guard) -> Vec<&'g V>;
    /// The first `count` entries with keys not less than `key`.
    fn successors<'g>(&'g self, key: &K, count: usize, guard: &'g Guard) -> Vec<(&'g K, &'g V)>;
    fn multi_search<'g>(&'g self, keys: &[K], guard: &'g Guard) -> Vec<Option<&'g V>>;
    /// The smallest entry in `[lo, hi]` accepted by `pred`.
    fn find_if<'g, P>(&'g self, lo: &K, hi: &K, pred: P, guard: &'g Guard) -> Option<(&'g K, &'g V)>
    where
        P: FnMut(&K, &V) -> bool;

    /// Sum of the keys in `[lo, hi]`.
    fn range_sum(&self, lo: &K, hi: &K, guard: &Guard) -> i64
    where
        K: KeySum;

    fn stats(&self, guard: &Guard) -> TreeStats;
    fn key_sum(&self, guard: &Guard) -> i64
    where
        K: KeySum;
    fn validate(&self, guard: &Guard) -> Result<TreeStats>;

    /// Number of entries. Linear, and only exact while no update is running.
    fn size(&self, guard: &Guard) -> usize {
        self.stats(guard).keys
    }
    fn sum_of_depths(&self, guard: &Guard) -> usize {
        self.stats(guard).sum_of_depths
    }
    fn number_of_nodes(&self, guard: &Guard) -> usize {
        self.stats(guard).nodes()
    }
}

#[cfg(test)]
pub mod tests {
    extern crate rand;
    use super::{ConcurrentMap, RangeMap};
    use crossbeam_ebr::pin;
    use crossbeam_utils::thread;
    use rand::prelude::*;
    use std::collections::BTreeMap;

    const THREADS: i32 = 30;
    const ELEMENTS_PER_THREADS: i32 = 1000;

    pub fn smoke<M: ConcurrentMap<i32, String> + Send + Sync>() {
        let map = &M::new();

        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i32> =
                        (0..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        assert!(map.insert(i, i.to_string(), &pin()));
                    }
                });
            }
        })
        .unwrap();

        thread::scope(|s| {
            for t in 0..(THREADS / 2) {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i32> =
                        (0..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        let guard = pin();
                        assert_eq!(Some(&i.to_string()), map.remove(&i, &guard));
                    }
                });
            }
        })
        .unwrap();

        thread::scope(|s| {
            for t in (THREADS / 2)..THREADS {
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut keys: Vec<i32> =
                        (0..ELEMENTS_PER_THREADS).map(|k| k * THREADS + t).collect();
                    keys.shuffle(&mut rng);
                    for i in keys {
                        let guard = pin();
                        assert_eq!(i.to_string(), *map.get(&i, &guard).unwrap());
                    }
                });
            }
        })
        .unwrap();
    }

    /// Threads race on a shared key range; the tree's key sum must match
    /// the sum of successful inserts minus successful removes.
    pub fn contended_key_sum<M: RangeMap<i32, i32> + Send + Sync>() {
        const KEY_RANGE: i32 = 512;
        const OPS: usize = 20_000;
        let map = &M::new();

        let deltas = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(move |_| {
                        let mut rng = rand::thread_rng();
                        let (mut sum, mut count) = (0i64, 0i64);
                        for _ in 0..OPS {
                            let key = rng.gen_range(0..KEY_RANGE);
                            let guard = pin();
                            if rng.gen_bool(0.5) {
                                if map.put_if_absent(key, key, &guard).is_none() {
                                    sum += key as i64;
                                    count += 1;
                                }
                            } else if let Some(v) = map.remove(&key, &guard) {
                                assert_eq!(*v, key);
                                sum -= key as i64;
                                count -= 1;
                            }
                        }
                        (sum, count)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();

        let guard = pin();
        let sum: i64 = deltas.iter().map(|(s, _)| s).sum();
        let count: i64 = deltas.iter().map(|(_, c)| c).sum();
        assert_eq!(map.key_sum(&guard), sum);
        assert_eq!(map.size(&guard) as i64, count);
        map.validate(&guard).unwrap();
    }

    /// Distinct-key inserts from many threads are never lost.
    pub fn no_lost_inserts<M: RangeMap<i32, i32> + Send + Sync>() {
        const PER_THREAD: i32 = 2000;
        const THREADS: i32 = 8;
        let map = &M::new();
        thread::scope(|s| {
            for t in 0..THREADS {
                s.spawn(move |_| {
                    for k in 0..PER_THREAD {
                        let key = k * THREADS + t;
                        assert!(map.insert(key, key, &pin()));
                    }
                });
            }
        })
        .unwrap();

        let guard = pin();
        let n = PER_THREAD * THREADS;
        assert_eq!(map.size(&guard), n as usize);
        for key in 0..n {
            assert!(map.contains_key(&key, &guard));
        }
        assert_eq!(map.key_sum(&guard), (0..n as i64).sum::<i64>());
        map.validate(&guard).unwrap();
    }

    pub fn single_key<M: RangeMap<i32, i32>>() {
        let map = M::new();
        let guard = &pin();
        assert!(map.insert(10, 10, guard));
        assert!(!map.insert(10, 11, guard));
        assert_eq!(map.get(&10, guard), Some(&10));
        assert_eq!(map.remove(&10, guard), Some(&10));
        assert_eq!(map.remove(&10, guard), None);
        assert!(!map.contains_key(&10, guard));
        assert_eq!(map.size(guard), 0);
    }

    pub fn range_scenario<M: RangeMap<i32, i32>>() {
        let map = M::new();
        let guard = &pin();
        assert!(map.range_scan(&1, &100, guard).is_empty());
        assert_eq!(map.remove(&11, guard), None);
        for key in [11, 30, 20] {
            assert!(map.insert(key, key, guard));
        }
        assert_eq!(map.range_scan(&1, &100, guard).len(), 3);
        assert_eq!(map.remove(&11, guard), Some(&11));
        assert!(!map.contains_key(&11, guard));
        assert_eq!(map.range_scan(&1, &100, guard).len(), 2);
        assert!(map.contains_key(&20, guard));
        assert!(map.contains_key(&30, guard));
        assert_eq!(map.range_scan(&20, &29, guard), vec![&20]);
        assert_eq!(map.range_scan(&20, &30, guard).len(), 2);
        assert_eq!(map.range_scan(&20, &31, guard).len(), 2);
        assert_eq!(map.remove(&20, guard), Some(&20));
        assert_eq!(map.remove(&30, guard), Some(&30));
        assert_eq!(map.size(guard), 0);
    }

    /// Sequential mixed workload checked against a `BTreeMap`, enough keys to
    /// split and collapse many leaves.
    pub fn against_model<M: RangeMap<i32, i32>>() {
        let map = M::new();
        let mut model = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let guard = &pin();

        for round in 0..20_000 {
            let key = rng.gen_range(0..2_000);
            if rng.gen_bool(0.6) {
                let expected = model.get(&key).copied();
                assert_eq!(map.put_if_absent(key, round, guard).copied(), expected);
                model.entry(key).or_insert(round);
            } else {
                assert_eq!(map.remove(&key, guard).copied(), model.remove(&key));
            }

            if round % 1000 == 0 {
                let lo = rng.gen_range(0..2_000);
                let hi = lo + rng.gen_range(0..300);
                let scanned: Vec<i32> =
                    map.range_scan(&lo, &hi, guard).into_iter().copied().collect();
                let expected: Vec<i32> = model.range(lo..=hi).map(|(_, v)| *v).collect();
                assert_eq!(scanned, expected);
            }
        }

        let stats = map.validate(guard).unwrap();
        assert_eq!(stats.keys, model.len());
        assert_eq!(map.key_sum(guard), model.keys().map(|k| *k as i64).sum::<i64>());

        let lookups: Vec<i32> = (0..50).map(|k| k * 37).collect();
        let found: Vec<Option<i32>> = map
            .multi_search(&lookups, guard)
            .into_iter()
            .map(|v| v.copied())
            .collect();
        let expected: Vec<Option<i32>> = lookups.iter().map(|k| model.get(k).copied()).collect();
        assert_eq!(found, expected);

        let succ: Vec<(i32, i32)> = map
            .successors(&1000, 10, guard)
            .into_iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        let expected: Vec<(i32, i32)> = model.range(1000..).take(10).map(|(k, v)| (*k, *v)).collect();
        assert_eq!(succ, expected);

        let first_odd = map.find_if(&500, &1500, |k, _| k % 2 == 1, guard);
        let expected = model.range(500..=1500).find(|(k, _)| *k % 2 == 1);
        assert_eq!(first_odd.map(|(k, v)| (*k, *v)), expected.map(|(k, v)| (*k, *v)));
    }
}
