use super::value_stack::StackValue;
use super::VmContext;
use crate::errors::RuntimeError;
use std::rc::Rc;

/// Reads its arguments through the stack api and returns how many values it left on the stack as results
pub type NativeCallback = Rc<dyn Fn(&mut VmContext) -> Result<usize, RuntimeError>>;

pub(crate) struct NativeClosure {
    pub(crate) callback: NativeCallback,
    pub(crate) up_values: Box<[StackValue]>,
}

impl NativeClosure {
    pub(crate) fn heap_size(&self) -> usize {
        std::mem::size_of::<Self>() + std::mem::size_of_val(&*self.up_values)
    }
}
