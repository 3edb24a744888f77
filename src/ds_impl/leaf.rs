/// A sorted, duplicate-free batch of entries stored in a leaf.
///
/// Leaves are never mutated once published: every update builds a new batch
/// and swaps it in through the owning tree's protocol.
#[derive(Debug, Clone)]
pub struct Leaf<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
}

impl<K, V> Default for Leaf<K, V> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<K, V> Leaf<K, V> {
    pub fn empty() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[inline]
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    #[inline]
    pub fn entry(&self, index: usize) -> (&K, &V) {
        (&self.keys[index], &self.values[index])
    }
}

impl<K: Ord, V> Leaf<K, V> {
    #[inline]
    fn search(&self, key: &K) -> Result<usize, usize> {
        self.keys.binary_search(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.search(key).ok().map(|i| &self.values[i])
    }

    /// Index of the first key that is not less than `key`.
    #[inline]
    pub fn lower_bound(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k < key)
    }

    /// Index of the first key that is greater than `key`.
    #[inline]
    pub fn upper_bound(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k <= key)
    }
}

impl<K: Ord + Clone, V: Clone> Leaf<K, V> {
    /// Copy of this batch with `key` added. `key` must be absent.
    pub fn with_inserted(&self, key: K, value: V) -> Self {
        let at = match self.search(&key) {
            Ok(_) => unreachable!("inserting a key that is already in the batch"),
            Err(at) => at,
        };
        let mut keys = Vec::with_capacity(self.len() + 1);
        let mut values = Vec::with_capacity(self.len() + 1);
        keys.extend_from_slice(&self.keys[..at]);
        values.extend_from_slice(&self.values[..at]);
        keys.push(key);
        values.push(value);
        keys.extend_from_slice(&self.keys[at..]);
        values.extend_from_slice(&self.values[at..]);
        Self { keys, values }
    }

    /// Copy of this batch with `key` taken out. `key` must be present.
    pub fn with_removed(&self, key: &K) -> Self {
        let at = match self.search(key) {
            Ok(at) => at,
            Err(_) => unreachable!("removing a key that is not in the batch"),
        };
        let mut keys = self.keys.clone();
        let mut values = self.values.clone();
        keys.remove(at);
        values.remove(at);
        Self { keys, values }
    }

    /// Adds `key` to a full batch and splits the result in two.
    ///
    /// The new key lands in the left half iff it is smaller than the median
    /// key `keys[len / 2]`. The right half's first key separates the halves.
    pub fn split_inserted(&self, key: K, value: V) -> (Self, Self) {
        let size = self.len();
        let put_left = key < self.keys[size / 2];
        let merged = self.with_inserted(key, value);
        let left_len = if put_left { size / 2 + 1 } else { (size + 1) / 2 };

        let Leaf {
            mut keys,
            mut values,
        } = merged;
        let right = Self {
            keys: keys.split_off(left_len),
            values: values.split_off(left_len),
        };
        (Self { keys, values }, right)
    }
}

#[cfg(test)]
mod tests {
    use super::Leaf;

    fn leaf_of(keys: &[i32]) -> Leaf<i32, i32> {
        keys.iter()
            .fold(Leaf::empty(), |l, &k| l.with_inserted(k, k * 10))
    }

    #[test]
    fn insert_keeps_order() {
        let l = leaf_of(&[5, 1, 3]);
        assert_eq!(l.keys(), &[1, 3, 5]);
        assert_eq!(l.get(&3), Some(&30));
        assert_eq!(l.get(&4), None);
        let l = l.with_removed(&3);
        assert_eq!(l.keys(), &[1, 5]);
    }

    #[test]
    fn split_even_batch() {
        let full = leaf_of(&[0, 2, 4, 6, 8, 10, 12, 14]);

        let (left, right) = full.split_inserted(3, 30);
        assert_eq!(left.keys(), &[0, 2, 3, 4, 6]);
        assert_eq!(right.keys(), &[8, 10, 12, 14]);

        let (left, right) = full.split_inserted(9, 90);
        assert_eq!(left.keys(), &[0, 2, 4, 6]);
        assert_eq!(right.keys(), &[8, 9, 10, 12, 14]);
        assert_eq!(right.get(&9), Some(&90));
    }

    #[test]
    fn split_odd_batch() {
        let full = leaf_of(&[1, 3, 5, 7, 9]);

        let (left, right) = full.split_inserted(0, 0);
        assert_eq!(left.keys(), &[0, 1, 3]);
        assert_eq!(right.keys(), &[5, 7, 9]);

        let (left, right) = full.split_inserted(6, 60);
        assert_eq!(left.keys(), &[1, 3, 5]);
        assert_eq!(right.keys(), &[6, 7, 9]);
    }

    #[test]
    fn bounds_bracket_inclusive_ranges() {
        let l = leaf_of(&[2, 4, 6, 8]);
        assert_eq!((l.lower_bound(&4), l.upper_bound(&8)), (1, 4));
        assert_eq!((l.lower_bound(&5), l.upper_bound(&5)), (2, 2));
        assert_eq!(l.lower_bound(&0), 0);
        assert_eq!(l.upper_bound(&9), 4);
        assert_eq!(l.entry(2), (&6, &60));
        assert!(Leaf::<i32, i32>::empty().is_empty());
    }
}
