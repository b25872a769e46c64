use super::heap::{GarbageCollector, Heap, HeapKey, HeapValue};
use super::interpreted_function::Prototype;
use super::metatable_keys::MetatableKeys;
use super::native_function::NativeCallback;
use super::thread::{close_up_values, PendingReturn, RunningThread, Thread, EXTRA_STACK};
use super::value_stack::{StackValue, ValueStack};
use super::vm::{Vm, VmLimits};
use super::VmContext;
use crate::errors::{IllegalInstruction, RuntimeError, RuntimeErrorData};
use std::rc::Rc;

pub(crate) enum CallFunction {
    Interpreted {
        definition: Rc<Prototype>,
        up_values: Rc<[HeapKey]>,
    },
    Native(HeapKey),
    /// The bottom frame of every thread, owned by the host
    Host,
}

/// Where a finished call places its results, relative to the slot of the called function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReturnMode {
    /// Exactly this many results, padded with nil
    Static(usize),
    /// Every result, the stack top marks the end
    Multi,
    /// The first result is stored at an absolute stack index
    Destination(usize),
    /// Skips the caller's next instruction when `truthy(result) ^ negate != expected`
    Compare { expected: bool, negate: bool },
    Discard,
}

pub(crate) enum CallResult {
    Call {
        function_index: usize,
        arg_count: usize,
        return_mode: ReturnMode,
    },
    TailCall {
        function_index: usize,
        arg_count: usize,
    },
    Return {
        start: usize,
        count: usize,
    },
    /// The collector has work to do, the current instruction has completed
    StepGc,
}

pub(crate) struct CallContext {
    pub(crate) function: CallFunction,
    /// Slot of the called function, results are placed here
    pub(crate) stack_start: usize,
    pub(crate) register_base: usize,
    pub(crate) next_instruction_index: usize,
    pub(crate) return_mode: ReturnMode,
    /// Extra arguments stored below the registers
    pub(crate) vararg_count: usize,
    /// Values left to concatenate when a `Concat` is resumed after a `__concat` call
    pub(crate) concat_remaining: usize,
    pub(crate) is_tail_call: bool,
}

impl CallContext {
    pub(crate) fn host() -> Self {
        Self {
            function: CallFunction::Host,
            stack_start: 0,
            register_base: 0,
            next_instruction_index: 0,
            return_mode: ReturnMode::Multi,
            vararg_count: 0,
            concat_remaining: 0,
            is_tail_call: false,
        }
    }
}

/// Everything the interpreter loop may touch besides the running thread
pub(crate) struct ExecutionAccess<'a> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) gc: &'a mut GarbageCollector,
    pub(crate) metatable_keys: &'a MetatableKeys,
    pub(crate) limits: &'a VmLimits,
    pub(crate) thread_key: HeapKey,
    pub(crate) other_threads: &'a mut [RunningThread],
}

pub(crate) fn split_vm(vm: &mut Vm) -> Result<(&mut Thread, ExecutionAccess<'_>), RuntimeErrorData> {
    let (running, other_threads) = vm
        .threads
        .split_last_mut()
        .ok_or(RuntimeErrorData::InvalidRef)?;

    let thread_key = running.key;
    let data = &mut vm.execution_data;

    let access = ExecutionAccess {
        heap: &mut data.heap,
        gc: &mut data.gc,
        metatable_keys: &data.metatable_keys,
        limits: &data.limits,
        thread_key,
        other_threads,
    };

    Ok((&mut running.thread, access))
}

pub(crate) fn current_thread(vm: &mut Vm) -> Result<&mut Thread, RuntimeErrorData> {
    vm.threads
        .last_mut()
        .map(|running| &mut *running.thread)
        .ok_or(RuntimeErrorData::InvalidRef)
}

enum Precall {
    Interpreted,
    Native(NativeCallback),
}

/// Pushes a frame for the value at `function_index`, resolving `__call` on non functions
fn precall(
    thread: &mut Thread,
    access: &mut ExecutionAccess,
    function_index: usize,
    mut arg_count: usize,
    return_mode: ReturnMode,
) -> Result<Precall, RuntimeErrorData> {
    let value_stack = &mut thread.value_stack;
    let mut chain_depth = 0;

    loop {
        let value = value_stack.get(function_index);

        let key = match value {
            StackValue::Function(key) => key,
            _ => {
                let metamethod = access
                    .heap
                    .get_metavalue(value, access.metatable_keys.call);

                if metamethod.is_nil() {
                    return Err(RuntimeErrorData::NotCallable(value.type_name()));
                }

                chain_depth += 1;

                // a __call loop never reaches a function
                if chain_depth > access.limits.metatable_chain_depth {
                    return Err(RuntimeErrorData::NotCallable(value.type_name()));
                }

                // the called value becomes the first argument
                value_stack.copy_within(
                    function_index..function_index + 1 + arg_count,
                    function_index + 1,
                );
                value_stack.set(function_index, metamethod);
                arg_count += 1;
                continue;
            }
        };

        match access.heap.get(key) {
            Some(HeapValue::Closure(closure)) => {
                let definition = closure.prototype.clone();
                let up_values = closure.up_values.clone();
                let num_params = definition.num_params as usize;

                let (register_base, vararg_count) =
                    if definition.is_vararg && arg_count > num_params {
                        // move the function and fixed parameters above the extra arguments
                        let new_start = function_index + 1 + arg_count;
                        value_stack.copy_within(
                            function_index..function_index + 1 + num_params,
                            new_start,
                        );
                        value_stack.clear_range(function_index + 1..function_index + 1 + num_params);

                        (new_start + 1, arg_count - num_params)
                    } else {
                        let register_base = function_index + 1;

                        for i in arg_count..num_params {
                            value_stack.set(register_base + i, StackValue::Nil);
                        }

                        (register_base, 0)
                    };

                let frame_top = register_base + definition.max_stack_size as usize;

                if frame_top > access.limits.stack_size {
                    return Err(RuntimeErrorData::StackOverflow);
                }

                value_stack.ensure_len(frame_top + EXTRA_STACK);

                tracing::trace!(
                    source = &*definition.source_name,
                    function_index,
                    arg_count,
                    "call"
                );

                thread.call_stack.push(CallContext {
                    function: CallFunction::Interpreted {
                        definition,
                        up_values,
                    },
                    stack_start: function_index,
                    register_base,
                    next_instruction_index: 0,
                    return_mode,
                    vararg_count,
                    concat_remaining: 0,
                    is_tail_call: false,
                });

                return Ok(Precall::Interpreted);
            }
            Some(HeapValue::NativeFunction(native)) => {
                let callback = native.callback.clone();
                let register_base = function_index + 1;

                if register_base + arg_count + EXTRA_STACK > access.limits.stack_size {
                    return Err(RuntimeErrorData::StackOverflow);
                }

                value_stack.set_top(register_base + arg_count);

                tracing::trace!(function_index, arg_count, "native call");

                thread.call_stack.push(CallContext {
                    function: CallFunction::Native(key),
                    stack_start: function_index,
                    register_base,
                    next_instruction_index: 0,
                    return_mode,
                    vararg_count: 0,
                    concat_remaining: 0,
                    is_tail_call: false,
                });

                return Ok(Precall::Native(callback));
            }
            _ => return Err(IllegalInstruction::InvalidHeapKey.into()),
        }
    }
}

/// Moves results starting at `start` to where the caller expects them
pub(crate) fn place_results(
    value_stack: &mut ValueStack,
    caller: Option<&mut CallContext>,
    pending: PendingReturn,
    start: usize,
    count: usize,
) {
    let stack_start = pending.stack_start;

    match pending.return_mode {
        ReturnMode::Static(expected) => {
            let copied = count.min(expected);
            value_stack.copy_within(start..start + copied, stack_start);

            for i in copied..expected {
                value_stack.set(stack_start + i, StackValue::Nil);
            }
        }
        ReturnMode::Multi => {
            value_stack.copy_within(start..start + count, stack_start);
            value_stack.set_top(stack_start + count);
        }
        ReturnMode::Destination(dest) => {
            let value = if count > 0 {
                value_stack.get(start)
            } else {
                StackValue::Nil
            };

            value_stack.set(dest, value);
        }
        ReturnMode::Compare { expected, negate } => {
            let result = count > 0 && value_stack.get(start).is_truthy();

            if (result ^ negate) != expected {
                if let Some(caller) = caller {
                    caller.next_instruction_index += 1;
                }
            }
        }
        ReturnMode::Discard => {}
    }
}

/// Pops the top frame and hands its results to the frame below
fn return_from_frame(thread: &mut Thread, access: &mut ExecutionAccess, start: usize, count: usize) {
    let Some(frame) = thread.call_stack.pop() else {
        return;
    };

    if thread
        .open_up_values
        .last()
        .is_some_and(|(index, _)| *index >= frame.register_base)
    {
        close_up_values(
            &mut thread.open_up_values,
            &thread.value_stack,
            access.heap,
            access.gc,
            frame.register_base,
        );
    }

    tracing::trace!(stack_start = frame.stack_start, count, "return");

    let pending = PendingReturn {
        stack_start: frame.stack_start,
        return_mode: frame.return_mode,
    };

    place_results(
        &mut thread.value_stack,
        thread.call_stack.last_mut(),
        pending,
        start,
        count,
    );
}

/// Calls the value at `function_index`, interpreted functions are left for [`execute`] to run
pub(crate) fn call_value(
    vm: &mut Vm,
    function_index: usize,
    arg_count: usize,
    return_mode: ReturnMode,
) -> Result<(), RuntimeError> {
    let (thread, mut access) = split_vm(vm)?;

    match precall(thread, &mut access, function_index, arg_count, return_mode)? {
        Precall::Interpreted => Ok(()),
        Precall::Native(callback) => call_native(vm, callback),
    }
}

fn tail_call(vm: &mut Vm, function_index: usize, arg_count: usize) -> Result<(), RuntimeError> {
    let (thread, mut access) = split_vm(vm)?;

    let Some(frame) = thread.call_stack.pop() else {
        return Err(RuntimeErrorData::InvalidRef.into());
    };

    close_up_values(
        &mut thread.open_up_values,
        &thread.value_stack,
        access.heap,
        access.gc,
        frame.register_base,
    );

    // reuse the slots of the frame being replaced
    thread.value_stack.copy_within(
        function_index..function_index + 1 + arg_count,
        frame.stack_start,
    );

    let precall = precall(
        thread,
        &mut access,
        frame.stack_start,
        arg_count,
        frame.return_mode,
    )?;

    if let Some(call) = thread.call_stack.last_mut() {
        call.is_tail_call = true;
    }

    match precall {
        Precall::Interpreted => Ok(()),
        Precall::Native(callback) => call_native(vm, callback),
    }
}

/// Runs a native function whose frame is on top of the call stack
fn call_native(vm: &mut Vm, callback: NativeCallback) -> Result<(), RuntimeError> {
    if vm.native_depth >= vm.execution_data.limits.native_depth {
        return Err(RuntimeErrorData::NativeStackOverflow.into());
    }

    vm.native_depth += 1;
    let result = callback(&mut VmContext { vm });
    vm.native_depth -= 1;

    let is_main_thread = vm.threads.len() <= 1;
    let (thread, mut access) = split_vm(vm)?;

    match result {
        Ok(count) => {
            let register_base = thread
                .call_stack
                .last()
                .map(|call| call.register_base)
                .unwrap_or_default();
            let top = thread.value_stack.top().max(register_base);
            let count = count.min(top - register_base);

            return_from_frame(thread, &mut access, top - count, count);
            Ok(())
        }
        Err(err) if err.data == RuntimeErrorData::Yield => {
            if is_main_thread {
                return Err(err);
            }

            if thread.non_yieldable > 0 {
                return Err(RuntimeErrorData::InvalidYield.into());
            }

            let Some(frame) = thread.call_stack.pop() else {
                return Err(err);
            };

            thread.pending = Some(PendingReturn {
                stack_start: frame.stack_start,
                return_mode: frame.return_mode,
            });

            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Runs the current thread until its call stack shrinks back to `depth` frames.
///
/// Errors unwind every frame above `depth`, a yield leaves the frames in place.
pub(crate) fn execute(vm: &mut Vm, depth: usize) -> Result<(), RuntimeError> {
    loop {
        let result = {
            let (thread, mut access) = split_vm(vm)?;

            if thread.call_stack.len() <= depth {
                return Ok(());
            }

            let Thread {
                call_stack,
                value_stack,
                open_up_values,
                ..
            } = thread;

            match call_stack.last_mut() {
                Some(call) => call.resume(value_stack, open_up_values, &mut access),
                None => return Ok(()),
            }
        };

        let outcome = match result {
            Ok(CallResult::Call {
                function_index,
                arg_count,
                return_mode,
            }) => call_value(vm, function_index, arg_count, return_mode),
            Ok(CallResult::TailCall {
                function_index,
                arg_count,
            }) => tail_call(vm, function_index, arg_count),
            Ok(CallResult::Return { start, count }) => {
                let (thread, mut access) = split_vm(vm)?;
                return_from_frame(thread, &mut access, start, count);
                Ok(())
            }
            Ok(CallResult::StepGc) => vm.check_gc().map_err(RuntimeError::from),
            Err(data) => Err(RuntimeError::from(data)),
        };

        if let Err(err) = outcome {
            if err.data == RuntimeErrorData::Yield
                && current_thread(vm).is_ok_and(|thread| thread.pending.is_some())
            {
                return Err(err);
            }

            return Err(unwind(vm, depth, err));
        }
    }
}

/// Pops frames above `depth`, recording interpreted frames in the stack trace
pub(crate) fn unwind(vm: &mut Vm, depth: usize, mut err: RuntimeError) -> RuntimeError {
    let Ok((thread, access)) = split_vm(vm) else {
        return err;
    };

    let mut lowest_start = None;

    while thread.call_stack.len() > depth.max(1) {
        let Some(frame) = thread.call_stack.pop() else {
            break;
        };

        if let CallFunction::Interpreted { definition, .. } = &frame.function {
            let instruction_index = frame.next_instruction_index.saturating_sub(1);
            err.trace
                .push_frame(definition.create_stack_trace_frame(instruction_index));
        }

        lowest_start = Some(frame.stack_start);
    }

    if let Some(start) = lowest_start {
        close_up_values(
            &mut thread.open_up_values,
            &thread.value_stack,
            access.heap,
            access.gc,
            start,
        );

        thread.value_stack.set_top(start);
    }

    err
}
