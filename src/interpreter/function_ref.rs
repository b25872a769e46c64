use super::binary_chunk;
use super::heap::{HeapRef, HeapValue};
use super::value_stack::StackValue;
use super::{FromMulti, IntoMulti, Vm};
use crate::errors::{RuntimeError, RuntimeErrorData};
use slotmap::Key;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionRef(pub(crate) HeapRef);

impl FunctionRef {
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.key().data().as_ffi()
    }

    /// Calls the function on the running thread.
    ///
    /// Errors escaping a call made outside of any native function are passed to the panic handler first.
    pub fn call<A: IntoMulti, R: FromMulti>(&self, args: A, vm: &mut Vm) -> Result<R, RuntimeError> {
        let args = args.into_multi(vm)?;
        let results = vm.call_function(StackValue::Function(self.0.key()), args)?;
        R::from_multi(results, vm)
    }

    /// Serializes an interpreted function as a binary chunk, native functions can't be dumped
    pub fn dump(&self, vm: &Vm, strip: bool) -> Result<Vec<u8>, RuntimeError> {
        let heap = &vm.execution_data.heap;

        match heap.get(self.0.key()) {
            Some(HeapValue::Closure(closure)) => {
                let proto = closure.prototype.to_function_proto(heap);
                Ok(binary_chunk::dump(&proto, strip))
            }
            Some(HeapValue::NativeFunction(_)) => Err(RuntimeErrorData::String(
                "unable to dump given function".into(),
            )
            .into()),
            _ => Err(RuntimeErrorData::InvalidRef.into()),
        }
    }
}
