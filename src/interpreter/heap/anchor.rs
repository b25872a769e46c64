use super::HeapKey;
use std::rc::{Rc, Weak};

/// Shared by every clone of a host handle to the same object
#[derive(Clone)]
pub(crate) struct CounterRef {
    #[allow(dead_code)]
    rc: Rc<()>,
}

/// Kept in the heap's root set, counts live host handles without owning them.
///
/// Once the count reaches zero the root is released during the next collection.
pub(crate) struct RefCounter {
    weak: Weak<()>,
}

impl RefCounter {
    pub(crate) fn new() -> (Self, CounterRef) {
        let rc = Rc::new(());
        let weak = Rc::downgrade(&rc);

        (Self { weak }, CounterRef { rc })
    }

    /// A new handle for a root that may have lost all of its handles since the last collection
    pub(crate) fn create_counter_ref(&mut self) -> CounterRef {
        if let Some(rc) = self.weak.upgrade() {
            return CounterRef { rc };
        }

        let (counter, counter_ref) = Self::new();
        *self = counter;
        counter_ref
    }

    pub(crate) fn count(&self) -> usize {
        self.weak.strong_count()
    }
}

/// Anchors a heap object as a gc root for as long as the handle lives
#[derive(Clone)]
pub(crate) struct HeapRef<K = HeapKey> {
    pub(super) key: K,
    #[allow(dead_code)]
    pub(super) counter_ref: CounterRef,
}

impl<K: Copy> HeapRef<K> {
    #[inline]
    pub(crate) fn key(&self) -> K {
        self.key
    }
}

impl<K: PartialEq> PartialEq for HeapRef<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<K: Eq> Eq for HeapRef<K> {}

impl<K: std::fmt::Debug> std::fmt::Debug for HeapRef<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HeapRef").field(&self.key).finish()
    }
}

impl<K: std::hash::Hash> std::hash::Hash for HeapRef<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counts_live_handles() {
        let (mut counter, first) = RefCounter::new();
        let second = counter.create_counter_ref();
        let third = second.clone();

        assert_eq!(counter.count(), 3);

        drop((first, second, third));
        assert_eq!(counter.count(), 0);

        let revived = counter.create_counter_ref();
        assert_eq!(counter.count(), 1);
        drop(revived);
    }
}
