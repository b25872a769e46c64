use super::dispatch::{get_index, length, read_up_value, set_index, write_up_value};
use super::execution::{current_thread, split_vm, CallFunction, CallResult};
use super::heap::HeapValue;
use super::number::raw_equals;
use super::thread::Thread;
use super::userdata::UserData;
use super::value_stack::{StackValue, TypeName};
use super::{FromValue, IntoValue, Value, Vm};
use crate::errors::{RuntimeError, RuntimeErrorData};
use std::ops::{Deref, DerefMut};

/// Result of [`VmContext::protected_call`], the error value is left on the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ok,
    RuntimeError,
    MemoryError,
}

/// Access to the running thread's stack.
///
/// Positive indices count from the first argument of the current native call, starting at 1.
/// Negative indices count down from the top, -1 is the last value pushed.
pub struct VmContext<'vm> {
    pub(crate) vm: &'vm mut Vm,
}

impl Deref for VmContext<'_> {
    type Target = Vm;

    #[inline]
    fn deref(&self) -> &Vm {
        self.vm
    }
}

impl DerefMut for VmContext<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Vm {
        self.vm
    }
}

fn frame_base(thread: &Thread) -> usize {
    thread
        .call_stack
        .last()
        .map(|call| call.register_base)
        .unwrap_or_default()
}

/// Resolves a relative index, allowing positive indices past the top
fn resolve_index(thread: &Thread, index: isize) -> Result<usize, RuntimeErrorData> {
    let base = frame_base(thread);
    let top = thread.value_stack.top();

    if index > 0 {
        Ok(base + index as usize - 1)
    } else if index < 0 && index.unsigned_abs() <= top - base {
        Ok(top - index.unsigned_abs())
    } else {
        Err(RuntimeErrorData::InvalidStackIndex(index))
    }
}

/// Resolves a relative index that must refer to a value below the top
fn resolve_valid_index(thread: &Thread, index: isize) -> Result<usize, RuntimeErrorData> {
    let absolute = resolve_index(thread, index)?;

    if absolute >= thread.value_stack.top() {
        return Err(RuntimeErrorData::InvalidStackIndex(index));
    }

    Ok(absolute)
}

impl<'vm> VmContext<'vm> {
    /// Number of values in the current frame
    pub fn top(&self) -> usize {
        match self.vm.threads.last() {
            Some(running) => running.thread.value_stack.top() - frame_base(&running.thread),
            None => 0,
        }
    }

    /// Grows the frame with nils or drops values from the top
    pub fn set_top(&mut self, count: usize) -> Result<(), RuntimeError> {
        let stack_size = self.vm.limits().stack_size;
        let thread = current_thread(self.vm)?;
        let old_top = thread.value_stack.top();
        let new_top = frame_base(thread) + count;

        if new_top > stack_size {
            return Err(RuntimeErrorData::StackOverflow.into());
        }

        if new_top > old_top {
            thread.value_stack.set_top(new_top);
            thread.value_stack.clear_range(old_top..new_top);
        } else {
            thread.value_stack.set_top(new_top);
        }

        Ok(())
    }

    pub(crate) fn push_stack_value(&mut self, value: StackValue) -> Result<(), RuntimeErrorData> {
        let stack_size = self.vm.limits().stack_size;
        let thread = current_thread(self.vm)?;

        if thread.value_stack.top() + 1 > stack_size {
            return Err(RuntimeErrorData::StackOverflow);
        }

        thread.value_stack.push(value);
        Ok(())
    }

    fn stack_value(&mut self, index: isize) -> Result<StackValue, RuntimeErrorData> {
        let thread = current_thread(self.vm)?;
        let absolute = resolve_index(thread, index)?;

        if absolute >= thread.value_stack.top() {
            return Ok(StackValue::Nil);
        }

        Ok(thread.value_stack.get(absolute))
    }

    fn to_value(&mut self, value: StackValue) -> Value {
        Value::from_stack_value(&mut self.vm.execution_data.heap, value)
    }

    pub fn push<V: IntoValue>(&mut self, value: V) -> Result<(), RuntimeError> {
        let value = value.into_value(self.vm)?;
        value.test_validity(&self.vm.execution_data.heap)?;
        self.push_stack_value(value.to_stack_value())?;
        Ok(())
    }

    /// Pushes a copy of the value at `index`
    pub fn push_copy(&mut self, index: isize) -> Result<(), RuntimeError> {
        let value = self.stack_value(index)?;
        self.push_stack_value(value)?;
        Ok(())
    }

    /// Reads a value without removing it, indices past the top read as nil
    pub fn get<V: FromValue>(&mut self, index: isize) -> Result<V, RuntimeError> {
        let value = self.stack_value(index)?;
        let value = self.to_value(value);
        V::from_value(value, self.vm)
    }

    pub fn type_name(&mut self, index: isize) -> Result<TypeName, RuntimeError> {
        Ok(self.stack_value(index)?.type_name())
    }

    pub fn pop<V: FromValue>(&mut self) -> Result<V, RuntimeError> {
        let value = self.pop_stack_value()?;
        let value = self.to_value(value);
        V::from_value(value, self.vm)
    }

    fn pop_stack_value(&mut self) -> Result<StackValue, RuntimeErrorData> {
        let thread = current_thread(self.vm)?;
        let index = resolve_valid_index(thread, -1)?;
        let value = thread.value_stack.get(index);
        thread.value_stack.set_top(index);
        Ok(value)
    }

    /// Removes the value at `index`, shifting values above it down
    pub fn remove(&mut self, index: isize) -> Result<(), RuntimeError> {
        let thread = current_thread(self.vm)?;
        let absolute = resolve_valid_index(thread, index)?;
        let top = thread.value_stack.top();

        thread.value_stack.copy_within(absolute + 1..top, absolute);
        thread.value_stack.set_top(top - 1);
        Ok(())
    }

    /// Moves the top value into `index`, shifting values above it up
    pub fn insert(&mut self, index: isize) -> Result<(), RuntimeError> {
        let thread = current_thread(self.vm)?;
        let absolute = resolve_valid_index(thread, index)?;
        let top = thread.value_stack.top();
        let value = thread.value_stack.get(top - 1);

        thread.value_stack.copy_within(absolute..top - 1, absolute + 1);
        thread.value_stack.set(absolute, value);
        Ok(())
    }

    /// Pops the top value into `index`
    pub fn replace(&mut self, index: isize) -> Result<(), RuntimeError> {
        let thread = current_thread(self.vm)?;
        let absolute = resolve_valid_index(thread, index)?;
        let value = self.pop_stack_value()?;
        current_thread(self.vm)?.value_stack.set(absolute, value);
        Ok(())
    }

    pub fn raw_equal(&mut self, a: isize, b: isize) -> Result<bool, RuntimeError> {
        let a = self.stack_value(a)?;
        let b = self.stack_value(b)?;
        Ok(raw_equals(a, b, &self.vm.execution_data.heap.strings))
    }

    pub fn new_table(&mut self) -> Result<(), RuntimeError> {
        self.new_table_with_capacity(0, 0)
    }

    pub fn new_table_with_capacity(&mut self, list: usize, map: usize) -> Result<(), RuntimeError> {
        let data = &mut self.vm.execution_data;
        let key = data.heap.create_table(&mut data.gc, list, map);
        self.push_stack_value(StackValue::Table(key))?;
        self.vm.check_gc()?;
        Ok(())
    }

    pub fn new_userdata<T: 'static>(&mut self, data: T) -> Result<(), RuntimeError> {
        let execution_data = &mut self.vm.execution_data;
        let key = execution_data.heap.create(
            &mut execution_data.gc,
            HeapValue::UserData(Box::new(UserData::new(data))),
        );
        self.push_stack_value(StackValue::UserData(key))?;
        self.vm.check_gc()?;
        Ok(())
    }

    fn intern(&mut self, name: &str) -> StackValue {
        let data = &mut self.vm.execution_data;
        StackValue::String(data.heap.intern_bytes(&mut data.gc, name.as_bytes()))
    }

    /// Pushes `t[k]` where `t` is at `index` and `k` is popped, metamethods apply
    pub fn get_table(&mut self, index: isize) -> Result<TypeName, RuntimeError> {
        let object = self.stack_value(index)?;
        let key = self.pop_stack_value()?;
        let value = self.vm.index_value(object, key)?;
        self.push_stack_value(value)?;
        Ok(value.type_name())
    }

    /// Pushes `t[name]` where `t` is at `index`, metamethods apply
    pub fn get_field(&mut self, index: isize, name: &str) -> Result<TypeName, RuntimeError> {
        let object = self.stack_value(index)?;
        let key = self.intern(name);
        let value = self.vm.index_value(object, key)?;
        self.push_stack_value(value)?;
        Ok(value.type_name())
    }

    /// `t[k] = v` where `t` is at `index`, `v` is the top value and `k` is below it. Both are popped
    pub fn set_table(&mut self, index: isize) -> Result<(), RuntimeError> {
        let object = self.stack_value(index)?;
        let key = self.stack_value(-2)?;
        let value = self.stack_value(-1)?;
        self.vm.set_index_value(object, key, value)?;
        self.pop_count(2)
    }

    /// `t[name] = v` where `t` is at `index` and `v` is popped
    pub fn set_field(&mut self, index: isize, name: &str) -> Result<(), RuntimeError> {
        let object = self.stack_value(index)?;
        let value = self.stack_value(-1)?;
        let key = self.intern(name);
        self.vm.set_index_value(object, key, value)?;
        self.pop_count(1)
    }

    /// Like [`Self::get_table`] without metamethods
    pub fn raw_get(&mut self, index: isize) -> Result<TypeName, RuntimeError> {
        let object = self.stack_value(index)?;
        let key = self.pop_stack_value()?;
        let value = self.vm.raw_get_value(object, key)?;
        self.push_stack_value(value)?;
        Ok(value.type_name())
    }

    /// Like [`Self::set_table`] without metamethods
    pub fn raw_set(&mut self, index: isize) -> Result<(), RuntimeError> {
        let object = self.stack_value(index)?;
        let key = self.stack_value(-2)?;
        let value = self.stack_value(-1)?;
        self.vm.raw_set_value(object, key, value)?;
        self.pop_count(2)
    }

    pub fn get_global(&mut self, name: &str) -> Result<TypeName, RuntimeError> {
        let globals = StackValue::Table(self.vm.globals);
        let key = self.intern(name);
        let value = self.vm.index_value(globals, key)?;
        self.push_stack_value(value)?;
        Ok(value.type_name())
    }

    /// Pops a value into the global `name`
    pub fn set_global(&mut self, name: &str) -> Result<(), RuntimeError> {
        let globals = StackValue::Table(self.vm.globals);
        let value = self.stack_value(-1)?;
        let key = self.intern(name);
        self.vm.set_index_value(globals, key, value)?;
        self.pop_count(1)
    }

    fn pop_count(&mut self, count: usize) -> Result<(), RuntimeError> {
        let thread = current_thread(self.vm)?;
        let top = thread.value_stack.top();

        if top < frame_base(thread) + count {
            return Err(RuntimeErrorData::InvalidStackIndex(-(count as isize)).into());
        }

        thread.value_stack.set_top(top - count);
        Ok(())
    }

    /// Pops a table or nil and uses it as the metatable of the value at `index`
    pub fn set_metatable(&mut self, index: isize) -> Result<(), RuntimeError> {
        let object = self.stack_value(index)?;

        let metatable = match self.stack_value(-1)? {
            StackValue::Table(key) => Some(key),
            StackValue::Nil => None,
            value => {
                return Err(RuntimeErrorData::FromValueConversion {
                    from: value.type_name().as_str(),
                    to: "table",
                    message: Some("metatable must be a table or nil".into()),
                }
                .into())
            }
        };

        self.vm.set_metatable_of(object, metatable)?;
        self.pop_count(1)
    }

    /// Pushes the metatable of the value at `index`, returns `false` and pushes nothing when it has none
    pub fn get_metatable(&mut self, index: isize) -> Result<bool, RuntimeError> {
        let object = self.stack_value(index)?;

        match self.vm.execution_data.heap.metatable_of(object) {
            Some(key) => {
                self.push_stack_value(StackValue::Table(key))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pops a key and pushes the next key and value of the table at `index`
    pub fn next(&mut self, index: isize) -> Result<bool, RuntimeError> {
        let object = self.stack_value(index)?;
        let key = self.pop_stack_value()?;

        let StackValue::Table(table_key) = object else {
            return Err(RuntimeErrorData::AttemptToIndex(object.type_name()).into());
        };

        let heap = &self.vm.execution_data.heap;
        let table = heap.table(table_key).ok_or(RuntimeErrorData::InvalidRef)?;

        match table.next(key, &heap.strings)? {
            Some((key, value)) => {
                self.push_stack_value(key)?;
                self.push_stack_value(value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Length without metamethods: bytes for strings, the border for tables
    pub fn raw_len(&mut self, index: isize) -> Result<usize, RuntimeError> {
        let value = self.stack_value(index)?;
        let heap = &self.vm.execution_data.heap;

        match value {
            StackValue::String(key) => Ok(heap.string_bytes(key).map(|s| s.len()).unwrap_or_default()),
            StackValue::Table(key) => {
                let table = heap.table(key).ok_or(RuntimeErrorData::InvalidRef)?;
                Ok(table.border(&heap.strings).max(0) as usize)
            }
            _ => Ok(0),
        }
    }

    /// Pushes the length of the value at `index`, `__len` applies
    pub fn len(&mut self, index: isize) -> Result<(), RuntimeError> {
        let value = self.stack_value(index)?;
        let length = self.vm.length_of(value)?;
        self.push_stack_value(length)?;
        Ok(())
    }

    /// Calls the function below the top `arg_count` values, results replace the function and arguments
    pub fn call(&mut self, arg_count: usize, result_count: Option<usize>) -> Result<(), RuntimeError> {
        let thread = current_thread(self.vm)?;
        let top = thread.value_stack.top();

        if top < frame_base(thread) + arg_count + 1 {
            return Err(RuntimeErrorData::InvalidStackIndex(-(arg_count as isize) - 1).into());
        }

        let function_index = top - arg_count - 1;
        self.vm.call_at(function_index, arg_count, result_count)
    }

    /// Like [`Self::call`], but errors are caught and pushed in place of the results
    pub fn protected_call(&mut self, arg_count: usize, result_count: Option<usize>) -> CallStatus {
        let err = match self.call(arg_count, result_count) {
            Ok(()) => return CallStatus::Ok,
            Err(err) => err,
        };

        let status = if matches!(err.data, RuntimeErrorData::OutOfMemory) {
            CallStatus::MemoryError
        } else {
            CallStatus::RuntimeError
        };

        let value = match &err.data {
            RuntimeErrorData::Value(value) if value.test_validity(&self.vm.execution_data.heap).is_ok() => {
                value.to_stack_value()
            }
            RuntimeErrorData::ByteString(bytes) => {
                let data = &mut self.vm.execution_data;
                StackValue::String(data.heap.intern_bytes(&mut data.gc, bytes.as_bytes()))
            }
            _ => {
                let message = err.message();
                self.intern(&message)
            }
        };

        // the failed call left the top at the function's slot
        if self.push_stack_value(value).is_err() {
            return CallStatus::MemoryError;
        }

        status
    }

    /// Suspends the running coroutine, handing it the top `count` values.
    ///
    /// The returned error must be returned by the native function. The values passed to the next resume become its results.
    pub fn yield_(&mut self, count: usize) -> RuntimeError {
        if let Some(running) = self.vm.threads.last() {
            let thread = &running.thread;
            let top = thread.value_stack.top();
            let count = count.min(top - frame_base(thread));

            self.vm.transfer.clear();
            self.vm
                .transfer
                .extend((top - count..top).map(|index| thread.value_stack.get(index)));
        }

        RuntimeErrorData::Yield.into()
    }

    /// Pops the top value and wraps it as an error to be returned by the native function
    pub fn error(&mut self) -> RuntimeError {
        let value = match self.pop_stack_value() {
            Ok(value) => value,
            Err(data) => return data.into(),
        };

        let data = match value {
            StackValue::String(key) => match self.vm.execution_data.heap.string_bytes(key) {
                Some(bytes) => RuntimeErrorData::ByteString(bytes.clone()),
                None => RuntimeErrorData::InvalidRef,
            },
            _ => RuntimeErrorData::Value(self.to_value(value)),
        };

        data.into()
    }

    /// Up value of the running native closure
    pub fn native_up_value<V: FromValue>(&mut self, index: usize) -> Result<V, RuntimeError> {
        let thread = current_thread(self.vm)?;

        let function_key = match thread.call_stack.last().map(|call| &call.function) {
            Some(CallFunction::Native(key)) => Some(*key),
            _ => None,
        };

        let value = match function_key {
            Some(key) => match self.vm.execution_data.heap.get(key) {
                Some(HeapValue::NativeFunction(native)) => {
                    native.up_values.get(index).copied().unwrap_or_default()
                }
                _ => StackValue::Nil,
            },
            _ => StackValue::Nil,
        };

        let value = self.to_value(value);
        V::from_value(value, self.vm)
    }

    /// Pushes up value `n` (starting at 1) of the function at `function_index`, returns `false` if it doesn't exist
    pub fn get_up_value(&mut self, function_index: isize, n: usize) -> Result<bool, RuntimeError> {
        let function = self.stack_value(function_index)?;

        let StackValue::Function(function_key) = function else {
            return Ok(false);
        };

        let (thread, access) = split_vm(self.vm)?;

        let value = match access.heap.get(function_key) {
            Some(HeapValue::Closure(closure)) => {
                let Some(key) = n.checked_sub(1).and_then(|i| closure.up_values.get(i)).copied() else {
                    return Ok(false);
                };

                read_up_value(&thread.value_stack, &access, key)
            }
            Some(HeapValue::NativeFunction(native)) => {
                match n.checked_sub(1).and_then(|i| native.up_values.get(i)) {
                    Some(value) => *value,
                    None => return Ok(false),
                }
            }
            _ => return Ok(false),
        };

        self.push_stack_value(value)?;
        Ok(true)
    }

    /// Pops a value into up value `n` (starting at 1) of the function at `function_index`
    pub fn set_up_value(&mut self, function_index: isize, n: usize) -> Result<bool, RuntimeError> {
        let function = self.stack_value(function_index)?;
        let value = self.stack_value(-1)?;

        let StackValue::Function(function_key) = function else {
            return Ok(false);
        };

        let (thread, mut access) = split_vm(self.vm)?;
        let Some(index) = n.checked_sub(1) else {
            return Ok(false);
        };

        let up_value_key = match access.heap.get(function_key) {
            Some(HeapValue::Closure(closure)) => closure.up_values.get(index).copied(),
            _ => None,
        };

        let written = match up_value_key {
            Some(key) => {
                write_up_value(&mut thread.value_stack, &mut access, key, value);
                true
            }
            None => match access.heap.get_mut(access.gc, function_key) {
                Some(HeapValue::NativeFunction(native)) => match native.up_values.get_mut(index) {
                    Some(slot) => {
                        *slot = value;
                        true
                    }
                    None => false,
                },
                _ => false,
            },
        };

        if written {
            self.pop_count(1)?;
        }

        Ok(written)
    }
}

impl Vm {
    /// Scratch space for host driven metamethod calls
    fn scratch_index(&mut self) -> Result<(usize, usize), RuntimeErrorData> {
        let thread = current_thread(self)?;
        Ok((thread.value_stack.top(), thread.live_extent()))
    }

    /// Runs a metamethod call placed by the interpreter's index helpers, returns its first result
    fn finish_metamethod_call(
        &mut self,
        call: Option<CallResult>,
        old_top: usize,
        dest: usize,
    ) -> Result<StackValue, RuntimeError> {
        let Some(CallResult::Call {
            function_index,
            arg_count,
            ..
        }) = call
        else {
            let thread = current_thread(self)?;
            let value = thread.value_stack.get(dest);
            thread.value_stack.clear_range(dest..dest + 1);
            return Ok(value);
        };

        current_thread(self)?
            .value_stack
            .set_top(function_index + 1 + arg_count);

        let result = self.call_at(function_index, arg_count, Some(1));
        let thread = current_thread(self)?;
        let value = thread.value_stack.get(function_index);
        thread
            .value_stack
            .clear_range(dest.min(function_index)..function_index + 1 + arg_count);
        thread.value_stack.set_top(old_top);
        result?;

        Ok(value)
    }

    /// `object[key]` with `__index`
    pub(crate) fn index_value(
        &mut self,
        object: StackValue,
        key: StackValue,
    ) -> Result<StackValue, RuntimeError> {
        let (old_top, dest) = self.scratch_index()?;
        let (thread, mut access) = split_vm(self)?;
        let call = get_index(
            &mut access,
            &mut thread.value_stack,
            dest + 1,
            object,
            key,
            dest,
        )?;

        self.finish_metamethod_call(call, old_top, dest)
    }

    /// `object[key] = value` with `__newindex`
    pub(crate) fn set_index_value(
        &mut self,
        object: StackValue,
        key: StackValue,
        value: StackValue,
    ) -> Result<(), RuntimeError> {
        let (old_top, dest) = self.scratch_index()?;
        let (thread, mut access) = split_vm(self)?;
        let call = set_index(&mut access, &mut thread.value_stack, dest, object, key, value)?;

        self.finish_metamethod_call(call, old_top, dest)?;
        self.check_gc()?;
        Ok(())
    }

    /// `#value` with `__len`
    pub(crate) fn length_of(&mut self, value: StackValue) -> Result<StackValue, RuntimeError> {
        let (old_top, dest) = self.scratch_index()?;
        let (thread, mut access) = split_vm(self)?;
        let call = length(&mut access, &mut thread.value_stack, dest + 1, value, dest)?;

        self.finish_metamethod_call(call, old_top, dest)
    }

    pub(crate) fn raw_get_value(
        &self,
        object: StackValue,
        key: StackValue,
    ) -> Result<StackValue, RuntimeError> {
        let StackValue::Table(table_key) = object else {
            return Err(RuntimeErrorData::AttemptToIndex(object.type_name()).into());
        };

        let heap = &self.execution_data.heap;
        let table = heap.table(table_key).ok_or(RuntimeErrorData::InvalidRef)?;
        Ok(table.get(key, &heap.strings))
    }

    pub(crate) fn raw_set_value(
        &mut self,
        object: StackValue,
        key: StackValue,
        value: StackValue,
    ) -> Result<(), RuntimeError> {
        let StackValue::Table(table_key) = object else {
            return Err(RuntimeErrorData::AttemptToIndex(object.type_name()).into());
        };

        let data = &mut self.execution_data;
        data.heap.table_set(&mut data.gc, table_key, key, value)?;
        self.check_gc()?;
        Ok(())
    }

    /// Sets the metatable of a table, a userdata, or every value of another type.
    ///
    /// Tables and userdata with `__gc` in the new metatable are registered for finalization.
    pub(crate) fn set_metatable_of(
        &mut self,
        object: StackValue,
        metatable: Option<super::heap::HeapKey>,
    ) -> Result<(), RuntimeErrorData> {
        let data = &mut self.execution_data;
        let heap = &mut data.heap;
        let gc = &mut data.gc;

        let object_key = match object {
            StackValue::Table(key) => {
                let (table, _) = heap.table_mut(gc, key).ok_or(RuntimeErrorData::InvalidRef)?;
                table.set_metatable(metatable);
                key
            }
            StackValue::UserData(key) => {
                let Some(HeapValue::UserData(userdata)) = heap.get_mut(gc, key) else {
                    return Err(RuntimeErrorData::InvalidRef);
                };

                userdata.metatable = metatable;
                key
            }
            _ => {
                heap.type_metatables[object.type_name() as usize] = metatable;
                return Ok(());
            }
        };

        if !heap.get_metavalue(object, data.metatable_keys.gc).is_nil() {
            gc.check_finalizer(object_key);
        }

        Ok(())
    }
}
