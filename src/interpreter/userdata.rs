use super::heap::HeapKey;
use super::value_stack::StackValue;
use downcast::{downcast, Any};

/// Payload of a userdata object
pub trait UserDataTrait: Any {}

impl<T: Any> UserDataTrait for T {}

downcast!(dyn UserDataTrait);

pub(crate) struct UserData {
    pub(crate) data: Box<dyn UserDataTrait>,
    pub(crate) metatable: Option<HeapKey>,
    pub(crate) user_value: StackValue,
}

impl UserData {
    pub(crate) fn new<T: 'static>(data: T) -> Self {
        Self {
            data: Box::new(data),
            metatable: None,
            user_value: StackValue::Nil,
        }
    }

    pub(crate) fn heap_size(&self) -> usize {
        std::mem::size_of_val(&*self.data)
    }
}
