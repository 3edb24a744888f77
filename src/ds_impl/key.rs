use std::cmp::Ordering;

/// Routing key of an internal node.
///
/// The two sentinels above the real root carry `Inf`, which compares greater
/// than every real key, so a search never leaves their left spine.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Key<K> {
    Fin(K),
    Inf,
}

impl<K> Key<K> {
    #[inline]
    pub fn is_inf(&self) -> bool {
        matches!(self, Key::Inf)
    }
}

impl<K: Ord> Key<K> {
    /// Compares the separator against a search key.
    #[inline]
    pub fn cmp(&self, rhs: &K) -> Ordering {
        match self {
            Key::Fin(k) => k.cmp(rhs),
            Key::Inf => Ordering::Greater,
        }
    }

    /// Whether a search for `key` continues into the left subtree.
    #[inline]
    pub fn goes_left(&self, key: &K) -> bool {
        self.cmp(key) == Ordering::Greater
    }
}

impl<K: PartialOrd> PartialOrd for Key<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Key::Fin(k1), Key::Fin(k2)) => k1.partial_cmp(k2),
            (Key::Fin(_), Key::Inf) => Some(Ordering::Less),
            (Key::Inf, Key::Fin(_)) => Some(Ordering::Greater),
            (Key::Inf, Key::Inf) => Some(Ordering::Equal),
        }
    }
}

impl<K: PartialEq> PartialEq<K> for Key<K> {
    fn eq(&self, rhs: &K) -> bool {
        match self {
            Key::Fin(k) => k == rhs,
            Key::Inf => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Key;

    #[test]
    fn inf_routes_everything_left() {
        let inf = Key::<i32>::Inf;
        assert!(inf.goes_left(&i32::MAX));
        assert!(inf.goes_left(&i32::MIN));
        assert!(Key::Fin(3) < inf);
    }

    #[test]
    fn separator_sends_equal_keys_right() {
        let sep = Key::Fin(10);
        assert!(sep.goes_left(&9));
        assert!(!sep.goes_left(&10));
        assert!(!sep.goes_left(&11));
        assert!(sep == 10i32);
    }
}
