use super::heap::{HeapRef, StringKey};
use super::{ByteString, Vm};
use crate::errors::{RuntimeError, RuntimeErrorData};
use slotmap::Key;
use std::borrow::Cow;

#[derive(Debug, Hash, Clone, PartialEq, Eq)]
pub struct StringRef(pub(crate) HeapRef<StringKey>);

impl StringRef {
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.key().data().as_ffi()
    }

    pub fn fetch<'vm>(&self, vm: &'vm Vm) -> Result<&'vm ByteString, RuntimeError> {
        match vm.execution_data.heap.string_bytes(self.0.key()) {
            Some(bytes) => Ok(bytes),
            None => Err(RuntimeErrorData::InvalidRef.into()),
        }
    }

    pub fn to_string_lossy<'vm>(&self, vm: &'vm Vm) -> Result<Cow<'vm, str>, RuntimeError> {
        Ok(self.fetch(vm)?.to_string_lossy())
    }
}
