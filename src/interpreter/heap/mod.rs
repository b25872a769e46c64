mod anchor;
mod garbage_collector;
mod heap_value;
mod string_table;

pub(crate) use anchor::*;
pub use garbage_collector::*;
pub(crate) use heap_value::*;
pub(crate) use string_table::*;

use super::byte_string::ByteString;
use super::cache_pools::RECYCLE_LIMIT;
use super::interpreted_function::CachedClosure;
use super::number::write_number;
use super::table::Table;
use super::value_stack::StackValue;
use super::TypeName;
use crate::errors::RuntimeErrorData;
use crate::{FastHashMap, FastHashSet};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;

slotmap::new_key_type! {
    pub(crate) struct HeapKey;
    pub(crate) struct StringKey;
}

/// Identifies anything the collector tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum GcKey {
    String(StringKey),
    Object(HeapKey),
}

pub(crate) struct Heap {
    pub(crate) storage: slotmap::SlotMap<HeapKey, HeapValue>,
    pub(crate) strings: StringTable,
    pub(crate) ref_roots: IndexMap<GcKey, RefCounter, FxBuildHasher>,
    /// prototype -> most recently created closure, not a gc root
    pub(crate) closure_cache: FastHashMap<HeapKey, CachedClosure>,
    /// every thread object, running or suspended
    pub(crate) threads: FastHashSet<HeapKey>,
    /// metatables shared by every value of a non table, non userdata type
    pub(crate) type_metatables: [Option<HeapKey>; TypeName::COUNT],
    pub(crate) recycled_tables: Vec<Box<Table>>,
}

impl Heap {
    pub(crate) fn new(seed: u32) -> Self {
        Self {
            storage: Default::default(),
            strings: StringTable::new(seed),
            ref_roots: Default::default(),
            closure_cache: Default::default(),
            threads: Default::default(),
            type_metatables: Default::default(),
            recycled_tables: Default::default(),
        }
    }

    pub(crate) fn create(&mut self, gc: &mut GarbageCollector, value: HeapValue) -> HeapKey {
        let size = value.gc_size();
        let is_thread = matches!(value, HeapValue::Thread(_));
        let key = self.storage.insert(value);

        if is_thread {
            self.threads.insert(key);
        }

        gc.register(GcKey::Object(key), size);
        key
    }

    pub(crate) fn create_table(
        &mut self,
        gc: &mut GarbageCollector,
        list: usize,
        map: usize,
    ) -> HeapKey {
        // try to recycle
        let mut table = self.recycled_tables.pop().unwrap_or_default();
        table.reserve(list, map);

        self.create(gc, HeapValue::Table(table))
    }

    pub(crate) fn recycle_table(&mut self, mut table: Box<Table>) {
        if self.recycled_tables.len() < RECYCLE_LIMIT {
            table.reset();
            self.recycled_tables.push(table);
        }
    }

    /// Creates a new string, short strings are reused if they already exist.
    pub(crate) fn intern_bytes(&mut self, gc: &mut GarbageCollector, bytes: &[u8]) -> StringKey {
        match self.strings.intern(bytes) {
            Interned::Existing(key) => {
                // may have been found dead but not yet swept
                gc.resurrect(GcKey::String(key));
                key
            }
            Interned::Created(key) => {
                let size = self.strings.get(key).map(|s| s.gc_size()).unwrap_or_default();
                gc.register(GcKey::String(key), size);
                key
            }
        }
    }

    fn anchor(&mut self, key: GcKey) -> CounterRef {
        match self.ref_roots.entry(key) {
            indexmap::map::Entry::Occupied(mut entry) => entry.get_mut().create_counter_ref(),
            indexmap::map::Entry::Vacant(entry) => {
                let (ref_counter, counter_ref) = RefCounter::new();
                entry.insert(ref_counter);
                counter_ref
            }
        }
    }

    pub(crate) fn create_ref(&mut self, key: HeapKey) -> HeapRef {
        debug_assert!(self.storage.contains_key(key));

        HeapRef {
            key,
            counter_ref: self.anchor(GcKey::Object(key)),
        }
    }

    pub(crate) fn create_string_ref(&mut self, key: StringKey) -> HeapRef<StringKey> {
        debug_assert!(self.strings.contains_key(key));

        HeapRef {
            key,
            counter_ref: self.anchor(GcKey::String(key)),
        }
    }

    #[inline]
    pub(crate) fn get(&self, key: HeapKey) -> Option<&HeapValue> {
        self.storage.get(key)
    }

    /// Mutable access for writes that may store references, informs the collector
    #[inline]
    pub(crate) fn get_mut(&mut self, gc: &mut GarbageCollector, key: HeapKey) -> Option<&mut HeapValue> {
        gc.barrier_back(key);
        self.storage.get_mut(key)
    }

    /// Mutable access for writes that won't create a black -> white reference
    #[inline]
    pub(crate) fn get_mut_unmarked(&mut self, key: HeapKey) -> Option<&mut HeapValue> {
        self.storage.get_mut(key)
    }

    #[inline]
    pub(crate) fn table(&self, key: HeapKey) -> Option<&Table> {
        match self.storage.get(key)? {
            HeapValue::Table(table) => Some(table),
            _ => None,
        }
    }

    /// The table along with the string table, required for hashing string keys
    #[inline]
    pub(crate) fn table_mut(
        &mut self,
        gc: &mut GarbageCollector,
        key: HeapKey,
    ) -> Option<(&mut Table, &StringTable)> {
        gc.barrier_back(key);

        match self.storage.get_mut(key)? {
            HeapValue::Table(table) => Some((table, &self.strings)),
            _ => None,
        }
    }

    /// Raw assignment, keeps the collector's view of the table size current
    pub(crate) fn table_set(
        &mut self,
        gc: &mut GarbageCollector,
        table_key: HeapKey,
        key: StackValue,
        value: StackValue,
    ) -> Result<(), RuntimeErrorData> {
        let Some((table, strings)) = self.table_mut(gc, table_key) else {
            return Ok(());
        };

        let capacity = (table.list_capacity(), table.node_capacity());
        table.set(key, value, strings)?;

        if capacity != (table.list_capacity(), table.node_capacity()) {
            let size = std::mem::size_of::<HeapValue>() + std::mem::size_of::<Table>() + table.heap_size();
            gc.resize(GcKey::Object(table_key), size);
        }

        Ok(())
    }

    #[inline]
    pub(crate) fn string_bytes(&self, key: StringKey) -> Option<&ByteString> {
        self.strings.get(key).map(|s| &s.bytes)
    }

    pub(crate) fn metatable_of(&self, value: StackValue) -> Option<HeapKey> {
        match value {
            StackValue::Table(key) => self.table(key)?.metatable(),
            StackValue::UserData(key) => match self.storage.get(key)? {
                HeapValue::UserData(userdata) => userdata.metatable,
                _ => None,
            },
            _ => self.type_metatables[value.type_name() as usize],
        }
    }

    pub(crate) fn get_metavalue(&self, value: StackValue, name: StringKey) -> StackValue {
        let Some(metatable_key) = self.metatable_of(value) else {
            return StackValue::Nil;
        };

        let Some(metatable) = self.table(metatable_key) else {
            return StackValue::Nil;
        };

        metatable.get(StackValue::String(name), &self.strings)
    }

    /// Appends the string form of strings and numbers
    pub(crate) fn write_string_like(&self, value: StackValue, buffer: &mut Vec<u8>) -> bool {
        match value {
            StackValue::String(key) => match self.string_bytes(key) {
                Some(bytes) => {
                    buffer.extend_from_slice(bytes.as_bytes());
                    true
                }
                None => false,
            },
            _ => write_number(value, buffer),
        }
    }

    /// Tests that keys held by a value still refer to this heap
    pub(crate) fn contains_value(&self, value: StackValue) -> bool {
        match value.gc_key() {
            Some(GcKey::String(key)) => self.strings.contains_key(key),
            Some(GcKey::Object(key)) => self
                .storage
                .get(key)
                .is_some_and(|heap_value| heap_value.type_name() == value.type_name()),
            None => true,
        }
    }
}
