use super::heap::HeapKey;
use super::value_stack::StackValue;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum UpValue {
    /// Aliases a slot in the value stack of `thread`
    Open { thread: HeapKey, index: usize },
    Closed(StackValue),
}
