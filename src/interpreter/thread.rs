use super::execution::{CallContext, CallFunction, ReturnMode};
use super::heap::{GarbageCollector, Heap, HeapKey, HeapValue};
use super::up_value::UpValue;
use super::value_stack::{StackValue, ValueStack};

/// Registers reserved past a frame for metamethod calls
pub(crate) const EXTRA_STACK: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created but not started, or stopped at a yield
    Suspended,
    Running,
    /// Resumed another thread and is waiting on it
    Normal,
    /// Finished or stopped by an error
    Dead,
}

/// Where the results of the native call that yielded should go once the thread is resumed
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingReturn {
    pub(crate) stack_start: usize,
    pub(crate) return_mode: ReturnMode,
}

pub(crate) struct Thread {
    pub(crate) value_stack: ValueStack,
    pub(crate) call_stack: Vec<CallContext>,
    /// Sorted by stack index
    pub(crate) open_up_values: Vec<(usize, HeapKey)>,
    pub(crate) status: ThreadStatus,
    pub(crate) pending: Option<PendingReturn>,
    /// Native calls into the interpreter on this thread, yielding is an error while nonzero
    pub(crate) non_yieldable: usize,
}

impl Thread {
    pub(crate) fn new(value_stack: ValueStack) -> Self {
        Self {
            value_stack,
            call_stack: vec![CallContext::host()],
            open_up_values: Vec::new(),
            status: ThreadStatus::Suspended,
            pending: None,
            non_yieldable: 0,
        }
    }

    pub(crate) fn heap_size(&self) -> usize {
        self.value_stack.heap_size()
            + self.call_stack.capacity() * std::mem::size_of::<CallContext>()
            + self.open_up_values.capacity() * std::mem::size_of::<(usize, HeapKey)>()
    }

    /// Slots that may hold live values, everything past this point is scratch space
    pub(crate) fn live_extent(&self) -> usize {
        let mut extent = self.value_stack.top();

        if let Some(call) = self.call_stack.last() {
            extent = extent.max(call.register_base);

            if let CallFunction::Interpreted { definition, .. } = &call.function {
                extent = extent.max(call.register_base + definition.max_stack_size as usize);
            }
        }

        extent
    }
}

/// A thread taken out of the heap while it runs
pub(crate) struct RunningThread {
    pub(crate) key: HeapKey,
    pub(crate) thread: Box<Thread>,
}

/// Reuses the open up value aliasing `index`, or creates one
pub(crate) fn find_or_create_up_value(
    open_up_values: &mut Vec<(usize, HeapKey)>,
    heap: &mut Heap,
    gc: &mut GarbageCollector,
    thread_key: HeapKey,
    index: usize,
) -> HeapKey {
    match open_up_values.binary_search_by_key(&index, |(i, _)| *i) {
        Ok(position) => open_up_values[position].1,
        Err(position) => {
            let key = heap.create(
                gc,
                HeapValue::UpValue(UpValue::Open {
                    thread: thread_key,
                    index,
                }),
            );

            open_up_values.insert(position, (index, key));
            key
        }
    }
}

/// Copies the stack values into every open up value at or above `from`
pub(crate) fn close_up_values(
    open_up_values: &mut Vec<(usize, HeapKey)>,
    value_stack: &ValueStack,
    heap: &mut Heap,
    gc: &mut GarbageCollector,
    from: usize,
) {
    while let Some(&(index, key)) = open_up_values.last() {
        if index < from {
            break;
        }

        open_up_values.pop();

        let value = value_stack.get(index);

        if let Some(HeapValue::UpValue(up_value)) = heap.get_mut_unmarked(key) {
            *up_value = UpValue::Closed(value);
        }

        gc.barrier_forward(key, value);
    }
}

/// Reads the stack slot of an open up value belonging to a thread other than the current one
pub(crate) fn read_foreign_slot(
    heap: &Heap,
    other_threads: &[RunningThread],
    thread_key: HeapKey,
    index: usize,
) -> StackValue {
    if let Some(running) = other_threads.iter().find(|running| running.key == thread_key) {
        return running.thread.value_stack.get(index);
    }

    match heap.get(thread_key) {
        Some(HeapValue::Thread(Some(thread))) => thread.value_stack.get(index),
        _ => StackValue::Nil,
    }
}

pub(crate) fn write_foreign_slot(
    heap: &mut Heap,
    other_threads: &mut [RunningThread],
    thread_key: HeapKey,
    index: usize,
    value: StackValue,
) {
    if let Some(running) = other_threads
        .iter_mut()
        .find(|running| running.key == thread_key)
    {
        running.thread.value_stack.set(index, value);
        return;
    }

    // suspended threads are traversed again in the atomic phase, no barrier required
    if let Some(HeapValue::Thread(Some(thread))) = heap.get_mut_unmarked(thread_key) {
        thread.value_stack.set(index, value);
    }
}
