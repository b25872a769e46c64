use super::StringKey;
use crate::interpreter::ByteString;
use slotmap::SlotMap;

/// Strings at or below this length are interned, longer strings are compared by content when needed
pub(crate) const MAX_SHORT_LEN: usize = 40;
const MIN_SLOTS: usize = 64;
/// Long strings sample at most 2^HASH_LIMIT bytes when hashing
const HASH_LIMIT: usize = 5;

pub(crate) fn hash_bytes(seed: u32, bytes: &[u8]) -> u32 {
    let mut h = seed ^ bytes.len() as u32;
    let step = (bytes.len() >> HASH_LIMIT) + 1;
    let mut len = bytes.len();

    while len >= step {
        h ^= (h << 5)
            .wrapping_add(h >> 2)
            .wrapping_add(bytes[len - 1] as u32);
        len -= step;
    }

    h
}

pub(crate) struct StringObject {
    pub(crate) bytes: ByteString,
    pub(crate) hash: u32,
    pub(crate) is_short: bool,
}

impl StringObject {
    pub(crate) fn gc_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.bytes.allocation_size()
    }
}

pub(crate) enum Interned {
    Existing(StringKey),
    Created(StringKey),
}

/// Owns every string in the vm. Short strings are deduplicated through an open addressing table keyed by
/// a seeded hash.
///
/// Slots referring to freed strings are left in place and reclaimed on the next rebuild.
pub(crate) struct StringTable {
    storage: SlotMap<StringKey, StringObject>,
    slots: Vec<Option<StringKey>>,
    used_slots: usize,
    seed: u32,
}

impl StringTable {
    pub(crate) fn new(seed: u32) -> Self {
        Self {
            storage: Default::default(),
            slots: vec![None; MIN_SLOTS],
            used_slots: 0,
            seed,
        }
    }

    #[inline]
    pub(crate) fn seed(&self) -> u32 {
        self.seed
    }

    #[inline]
    pub(crate) fn get(&self, key: StringKey) -> Option<&StringObject> {
        self.storage.get(key)
    }

    #[inline]
    pub(crate) fn contains_key(&self, key: StringKey) -> bool {
        self.storage.contains_key(key)
    }

    #[inline]
    pub(crate) fn hash_of(&self, key: StringKey) -> u32 {
        self.storage.get(key).map(|s| s.hash).unwrap_or_default()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = StringKey> + '_ {
        self.storage.keys()
    }

    pub(crate) fn len(&self) -> usize {
        self.storage.len()
    }

    /// Slots in the interning table
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Short strings are interned, so differing keys only matter for long strings
    pub(crate) fn contents_equal(&self, a: StringKey, b: StringKey) -> bool {
        let (Some(a), Some(b)) = (self.storage.get(a), self.storage.get(b)) else {
            return false;
        };

        !a.is_short && !b.is_short && a.hash == b.hash && a.bytes == b.bytes
    }

    pub(crate) fn intern(&mut self, bytes: &[u8]) -> Interned {
        let hash = hash_bytes(self.seed, bytes);

        if bytes.len() > MAX_SHORT_LEN {
            let key = self.storage.insert(StringObject {
                bytes: ByteString::from(bytes),
                hash,
                is_short: false,
            });

            return Interned::Created(key);
        }

        if (self.used_slots + 1) * 4 > self.slots.len() * 3 {
            self.rebuild(true);
        }

        let mask = self.slots.len() - 1;
        let mut index = hash as usize & mask;
        let mut reusable = None;

        while let Some(key) = self.slots[index] {
            match self.storage.get(key) {
                Some(string) => {
                    if string.hash == hash && string.bytes.as_bytes() == bytes {
                        return Interned::Existing(key);
                    }
                }
                None => {
                    reusable.get_or_insert(index);
                }
            }

            index = (index + 1) & mask;
        }

        let key = self.storage.insert(StringObject {
            bytes: ByteString::from(bytes),
            hash,
            is_short: true,
        });

        match reusable {
            Some(slot) => self.slots[slot] = Some(key),
            None => {
                self.slots[index] = Some(key);
                self.used_slots += 1;
            }
        }

        Interned::Created(key)
    }

    pub(crate) fn remove(&mut self, key: StringKey) -> Option<StringObject> {
        self.storage.remove(key)
    }

    /// Halves the interning table when less than a quarter of it is in use
    pub(crate) fn shrink_if_sparse(&mut self) {
        let live = self.storage.values().filter(|s| s.is_short).count();

        if self.slots.len() > MIN_SLOTS && live * 4 < self.slots.len() {
            self.rebuild(false);
        }
    }

    fn rebuild(&mut self, growing: bool) {
        let live: Vec<StringKey> = self
            .slots
            .iter()
            .flatten()
            .copied()
            .filter(|&key| self.storage.contains_key(key))
            .collect();

        let mut size = self.slots.len();

        if growing {
            if (live.len() + 1) * 2 > size {
                size *= 2;
            }
        } else {
            size = (size / 2).max(MIN_SLOTS);
        }

        self.slots.clear();
        self.slots.resize(size, None);
        self.used_slots = live.len();

        let mask = size - 1;

        for key in live {
            let mut index = self.hash_of(key) as usize & mask;

            while self.slots[index].is_some() {
                index = (index + 1) & mask;
            }

            self.slots[index] = Some(key);
        }

        tracing::trace!(size, used = self.used_slots, "rebuilt string table");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key_of(interned: Interned) -> StringKey {
        match interned {
            Interned::Existing(key) | Interned::Created(key) => key,
        }
    }

    #[test]
    fn short_strings_are_deduplicated() {
        let mut strings = StringTable::new(7);
        let a = key_of(strings.intern(b"hello"));

        assert!(matches!(strings.intern(b"hello"), Interned::Existing(key) if key == a));
        assert!(matches!(strings.intern(b"world"), Interned::Created(_)));
    }

    #[test]
    fn long_strings_are_distinct_but_equal() {
        let mut strings = StringTable::new(7);
        let text = [b'x'; MAX_SHORT_LEN + 1];
        let a = key_of(strings.intern(&text));
        let b = key_of(strings.intern(&text));

        assert_ne!(a, b);
        assert!(strings.contents_equal(a, b));
    }

    #[test]
    fn grows_and_shrinks() {
        let mut strings = StringTable::new(0);
        let keys: Vec<_> = (0..1000)
            .map(|i| key_of(strings.intern(format!("s{i}").as_bytes())))
            .collect();

        assert!(strings.capacity() >= 1024);

        for key in keys.iter().skip(10) {
            strings.remove(*key);
        }

        strings.shrink_if_sparse();
        assert!(strings.capacity() < 2048);

        // survivors are still found
        assert!(matches!(strings.intern(b"s3"), Interned::Existing(key) if key == keys[3]));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut strings = StringTable::new(0);
        let a = key_of(strings.intern(b"a"));
        strings.remove(a);

        assert!(matches!(strings.intern(b"a"), Interned::Created(key) if key != a));
    }

    #[test]
    fn seed_changes_hashes() {
        assert_ne!(hash_bytes(1, b"abc"), hash_bytes(2, b"abc"));
        assert_eq!(hash_bytes(1, b"abc"), hash_bytes(1, b"abc"));
    }
}
