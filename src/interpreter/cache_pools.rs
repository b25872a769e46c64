use super::multi::MultiValue;
use super::value_stack::ValueStack;

/// Containers kept per pool
pub(crate) const RECYCLE_LIMIT: usize = 64;
/// Stacks of finished coroutines above this many bytes are freed rather than kept
const MAX_RECYCLED_STACK_BYTES: usize = 64 * 1024;

struct Pool<T> {
    free: Vec<T>,
}

impl<T: Default> Pool<T> {
    fn take(&mut self) -> T {
        self.free.pop().unwrap_or_default()
    }

    fn give(&mut self, value: T) {
        if self.free.len() < RECYCLE_LIMIT {
            self.free.push(value);
        }
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self { free: Vec::new() }
    }
}

/// Recycled argument lists and coroutine stacks
#[derive(Default)]
pub(crate) struct CachePools {
    multivalues: Pool<MultiValue>,
    value_stacks: Pool<ValueStack>,
}

impl CachePools {
    #[inline]
    pub(crate) fn create_multi(&mut self) -> MultiValue {
        self.multivalues.take()
    }

    #[inline]
    pub(crate) fn store_multi(&mut self, mut multivalue: MultiValue) {
        multivalue.clear();
        self.multivalues.give(multivalue);
    }

    pub(crate) fn create_value_stack(&mut self) -> ValueStack {
        self.value_stacks.take()
    }

    pub(crate) fn store_value_stack(&mut self, mut value_stack: ValueStack) {
        if value_stack.heap_size() > MAX_RECYCLED_STACK_BYTES {
            return;
        }

        value_stack.clear();
        self.value_stacks.give(value_stack);
    }
}
