use super::heap::{GcKey, HeapKey, StringKey};
use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TypeName {
    Nil,
    Bool,
    Number,
    String,
    Table,
    Function,
    UserData,
    Thread,
}

impl TypeName {
    pub const COUNT: usize = 8;

    pub fn as_str(self) -> &'static str {
        match self {
            TypeName::Nil => "nil",
            TypeName::Bool => "boolean",
            TypeName::Number => "number",
            TypeName::String => "string",
            TypeName::Table => "table",
            TypeName::Function => "function",
            TypeName::UserData => "userdata",
            TypeName::Thread => "thread",
        }
    }
}

impl std::fmt::Display for TypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tag + payload stored in registers, table slots, and upvalues.
///
/// Derived equality is identity: `Integer(1) != Float(1.0)` and long strings compare by key.
/// Use [`raw_equals`](super::number::raw_equals) for language level equality.
#[derive(Default, Debug, Clone, Copy, PartialEq)]
pub(crate) enum StackValue {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(StringKey),
    Table(HeapKey),
    /// Interpreted closures and native functions
    Function(HeapKey),
    UserData(HeapKey),
    Thread(HeapKey),
}

impl StackValue {
    #[inline]
    pub(crate) fn is_nil(self) -> bool {
        matches!(self, StackValue::Nil)
    }

    #[inline]
    pub(crate) fn is_truthy(self) -> bool {
        !matches!(self, StackValue::Nil | StackValue::Bool(false))
    }

    pub(crate) fn type_name(self) -> TypeName {
        match self {
            StackValue::Nil => TypeName::Nil,
            StackValue::Bool(_) => TypeName::Bool,
            StackValue::Integer(_) | StackValue::Float(_) => TypeName::Number,
            StackValue::String(_) => TypeName::String,
            StackValue::Table(_) => TypeName::Table,
            StackValue::Function(_) => TypeName::Function,
            StackValue::UserData(_) => TypeName::UserData,
            StackValue::Thread(_) => TypeName::Thread,
        }
    }

    #[inline]
    pub(crate) fn heap_key(self) -> Option<HeapKey> {
        match self {
            StackValue::Table(key)
            | StackValue::Function(key)
            | StackValue::UserData(key)
            | StackValue::Thread(key) => Some(key),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn gc_key(self) -> Option<GcKey> {
        match self {
            StackValue::String(key) => Some(GcKey::String(key)),
            _ => self.heap_key().map(GcKey::Object),
        }
    }

    #[inline]
    pub(crate) fn is_collectable(self) -> bool {
        self.gc_key().is_some()
    }
}

/// A thread's registers. `top` marks the end of values produced by variable result calls and host pushes.
#[derive(Default, Debug, Clone)]
pub(crate) struct ValueStack {
    values: Vec<StackValue>,
    top: usize,
}

impl ValueStack {
    pub(crate) fn heap_size(&self) -> usize {
        self.values.capacity() * std::mem::size_of::<StackValue>()
    }

    /// Allocated slots, may extend past `top`
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub(crate) fn top(&self) -> usize {
        self.top
    }

    #[inline]
    pub(crate) fn set_top(&mut self, top: usize) {
        self.ensure_len(top);
        self.top = top;
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> StackValue {
        self.values.get(index).copied().unwrap_or_default()
    }

    #[inline]
    pub(crate) fn set(&mut self, index: usize, value: StackValue) {
        self.ensure_len(index + 1);
        self.values[index] = value;
    }

    /// Stores at `top` and moves `top` up by one
    pub(crate) fn push(&mut self, value: StackValue) {
        let index = self.top;
        self.set(index, value);
        self.top = index + 1;
    }

    pub(crate) fn ensure_len(&mut self, len: usize) {
        if len > self.values.len() {
            self.values.resize(len, StackValue::Nil);
        }
    }

    pub(crate) fn get_slice(&mut self, range: Range<usize>) -> &[StackValue] {
        self.ensure_len(range.end);
        &self.values[range]
    }

    pub(crate) fn get_slice_mut(&mut self, range: Range<usize>) -> &mut [StackValue] {
        self.ensure_len(range.end);
        &mut self.values[range]
    }

    pub(crate) fn copy_within(&mut self, src: Range<usize>, dest: usize) {
        if src.is_empty() {
            return;
        }

        self.ensure_len(src.end.max(dest + src.len()));
        self.values.copy_within(src, dest);
    }

    /// Sets every slot in the range to nil
    pub(crate) fn clear_range(&mut self, range: Range<usize>) {
        let end = range.end.min(self.values.len());

        if range.start < end {
            self.values[range.start..end].fill(StackValue::Nil);
        }
    }

    /// Drops slots past `len`, used to release registers of frames that have returned
    pub(crate) fn truncate(&mut self, len: usize) {
        self.values.truncate(len.max(self.top));
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &StackValue> {
        self.values.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
        self.top = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reading_past_the_end_is_nil() {
        let stack = ValueStack::default();
        assert_eq!(stack.get(10), StackValue::Nil);
    }

    #[test]
    fn push_grows_and_moves_top() {
        let mut stack = ValueStack::default();
        stack.set_top(3);
        stack.push(StackValue::Integer(7));

        assert_eq!(stack.top(), 4);
        assert_eq!(stack.get(3), StackValue::Integer(7));
        assert_eq!(stack.get(0), StackValue::Nil);
    }

    #[test]
    fn truncate_keeps_values_below_top() {
        let mut stack = ValueStack::default();
        stack.set(5, StackValue::Bool(true));
        stack.set_top(2);
        stack.truncate(1);

        assert_eq!(stack.len(), 2);
        assert_eq!(stack.get(5), StackValue::Nil);
    }
}
