use super::binary_chunk;
use super::cache_pools::CachePools;
use super::execution::{call_value, current_thread, execute, place_results, unwind, ReturnMode};
use super::heap::{
    GarbageCollector, GarbageCollectorConfig, GcKey, GcMode, Heap, HeapKey, HeapValue,
};
use super::interpreted_function::{Closure, Prototype};
use super::metatable_keys::MetatableKeys;
use super::module::{Constant, FunctionProto};
use super::native_function::{NativeCallback, NativeClosure};
use super::thread::{RunningThread, Thread, ThreadStatus};
use super::up_value::UpValue;
use super::value_stack::{StackValue, TypeName};
use super::{FunctionRef, MultiValue, StringRef, TableRef, ThreadRef, Value, VmContext};
use crate::errors::{IllegalInstruction, RuntimeError, RuntimeErrorData};
use crate::FastHashMap;
use downcast::downcast;
use std::any::TypeId;
use std::rc::Rc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VmLimits {
    /// Stack slots available to each thread
    pub stack_size: usize,
    /// Nested native calls, including calls from natives back into the interpreter
    pub native_depth: usize,
    /// `__index`, `__newindex`, and `__call` lookups before giving up
    pub metatable_chain_depth: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            stack_size: 1_000_000,
            native_depth: 200,
            metatable_chain_depth: 2000,
        }
    }
}

trait AppData: downcast::Any {}

impl<T: 'static> AppData for T {}

downcast!(dyn AppData);

/// Called with errors that escape to the host through an unprotected call
pub type PanicHandler = Rc<dyn Fn(&RuntimeError)>;
/// Receives warnings, such as errors raised by finalizers
pub type WarnHandler = Rc<dyn Fn(&str)>;

pub(crate) struct ExecutionAccessibleData {
    pub(crate) limits: VmLimits,
    pub(crate) heap: Heap,
    pub(crate) gc: GarbageCollector,
    pub(crate) metatable_keys: MetatableKeys,
    pub(crate) cache_pools: CachePools,
}

pub struct Vm {
    pub(crate) execution_data: ExecutionAccessibleData,
    /// The main thread followed by every resumed coroutine, the last entry is running
    pub(crate) threads: Vec<RunningThread>,
    pub(crate) registry: HeapKey,
    pub(crate) globals: HeapKey,
    main_thread: HeapKey,
    /// Values passed out of a coroutine by a yield
    pub(crate) transfer: Vec<StackValue>,
    pub(crate) native_depth: usize,
    panic_handler: Option<PanicHandler>,
    warn_handler: WarnHandler,
    app_data: FastHashMap<TypeId, Box<dyn AppData>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Creates a vm with a random string hash seed
    pub fn new() -> Self {
        Self::with_seed(fastrand::u32(..))
    }

    pub fn with_seed(seed: u32) -> Self {
        let mut gc = GarbageCollector::default();
        let mut heap = Heap::new(seed);
        let metatable_keys = MetatableKeys::new(&mut gc, &mut heap);
        let mut cache_pools = CachePools::default();

        let registry = heap.create_table(&mut gc, 2, 0);
        let globals = heap.create_table(&mut gc, 0, 0);
        let main_thread = heap.create(&mut gc, HeapValue::Thread(None));

        for key in [registry, globals, main_thread] {
            gc.fix(GcKey::Object(key));
        }

        // integer keys are never rejected
        let _ = heap.table_set(
            &mut gc,
            registry,
            StackValue::Integer(1),
            StackValue::Thread(main_thread),
        );
        let _ = heap.table_set(
            &mut gc,
            registry,
            StackValue::Integer(2),
            StackValue::Table(globals),
        );

        let mut thread = Thread::new(cache_pools.create_value_stack());
        thread.status = ThreadStatus::Running;

        gc.settle();

        Self {
            execution_data: ExecutionAccessibleData {
                limits: Default::default(),
                heap,
                gc,
                metatable_keys,
                cache_pools,
            },
            threads: vec![RunningThread {
                key: main_thread,
                thread: Box::new(thread),
            }],
            registry,
            globals,
            main_thread,
            transfer: Vec::new(),
            native_depth: 0,
            panic_handler: None,
            warn_handler: Rc::new(|message| tracing::warn!("{message}")),
            app_data: Default::default(),
        }
    }

    #[inline]
    pub fn context(&mut self) -> VmContext {
        VmContext { vm: self }
    }

    #[inline]
    pub fn create_multi(&mut self) -> MultiValue {
        self.execution_data.cache_pools.create_multi()
    }

    #[inline]
    pub fn store_multi(&mut self, multivalue: MultiValue) {
        self.execution_data.cache_pools.store_multi(multivalue)
    }

    #[inline]
    pub fn limits(&self) -> &VmLimits {
        &self.execution_data.limits
    }

    #[inline]
    pub fn set_limits(&mut self, limits: VmLimits) {
        self.execution_data.limits = limits;
    }

    /// Allocations past this many bytes fail with an out of memory error after an emergency collection
    pub fn set_memory_limit(&mut self, limit: Option<usize>) {
        self.execution_data.gc.memory_limit = limit;
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.execution_data.gc.memory_limit
    }

    pub fn globals(&mut self) -> TableRef {
        TableRef(self.execution_data.heap.create_ref(self.globals))
    }

    pub fn registry(&mut self) -> TableRef {
        TableRef(self.execution_data.heap.create_ref(self.registry))
    }

    pub fn main_thread(&mut self) -> ThreadRef {
        ThreadRef(self.execution_data.heap.create_ref(self.main_thread))
    }

    pub fn set_app_data<T: 'static>(&mut self, value: T) -> Option<T> {
        self.app_data
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn app_data<T: 'static>(&self) -> Option<&T> {
        self.app_data
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>().ok())
    }

    pub fn app_data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.app_data
            .get_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut::<T>().ok())
    }

    pub fn remove_app_data<T: 'static>(&mut self) -> Option<T> {
        self.app_data
            .remove(&TypeId::of::<T>())
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn set_panic_handler(&mut self, handler: Option<PanicHandler>) {
        self.panic_handler = handler;
    }

    pub fn set_warn_handler(&mut self, handler: WarnHandler) {
        self.warn_handler = handler;
    }

    pub fn warn(&self, message: &str) {
        (self.warn_handler)(message);
    }

    pub fn intern_string(&mut self, bytes: &[u8]) -> StringRef {
        let data = &mut self.execution_data;
        let key = data.heap.intern_bytes(&mut data.gc, bytes);
        let string_ref = StringRef(data.heap.create_string_ref(key));

        // test after creating ref to avoid immediately collecting the generated value
        self.step_gc_if_needed();

        string_ref
    }

    pub fn create_table(&mut self) -> TableRef {
        self.create_table_with_capacity(0, 0)
    }

    pub fn create_table_with_capacity(&mut self, list: usize, map: usize) -> TableRef {
        let data = &mut self.execution_data;
        let key = data.heap.create_table(&mut data.gc, list, map);
        let table_ref = TableRef(data.heap.create_ref(key));

        // test after creating ref to avoid immediately collecting the generated value
        self.step_gc_if_needed();

        table_ref
    }

    /// Metatable shared by every value of a type other than table and userdata
    pub fn set_type_metatable(
        &mut self,
        type_name: TypeName,
        metatable: Option<&TableRef>,
    ) -> Result<(), RuntimeError> {
        if matches!(type_name, TypeName::Table | TypeName::UserData) {
            return Err(RuntimeErrorData::String(
                format!("{type_name} values have individual metatables").into(),
            )
            .into());
        }

        let metatable = match metatable {
            Some(table) => {
                Value::Table(table.clone()).test_validity(&self.execution_data.heap)?;
                Some(table.0.key())
            }
            None => None,
        };

        self.execution_data.heap.type_metatables[type_name as usize] = metatable;
        Ok(())
    }

    pub fn type_metatable(&mut self, type_name: TypeName) -> Option<TableRef> {
        let heap = &mut self.execution_data.heap;
        let key = heap.type_metatables[type_name as usize]?;
        Some(TableRef(heap.create_ref(key)))
    }

    /// Instantiates a function prototype as a closure.
    ///
    /// The first up value is set to `env`, or the globals table when `env` is `None`. Other up values start as nil.
    pub fn load_function(
        &mut self,
        proto: &FunctionProto,
        env: Option<&TableRef>,
    ) -> Result<FunctionRef, RuntimeError> {
        let env = match env {
            Some(table) => {
                Value::Table(table.clone()).test_validity(&self.execution_data.heap)?;
                StackValue::Table(table.0.key())
            }
            None => StackValue::Table(self.globals),
        };

        let data = &mut self.execution_data;
        let heap = &mut data.heap;
        let gc = &mut data.gc;

        let prototype_key = load_prototype(heap, gc, proto, None);

        let Some(HeapValue::Prototype(prototype)) = heap.get(prototype_key) else {
            return Err(RuntimeErrorData::from(IllegalInstruction::InvalidHeapKey).into());
        };

        let prototype = prototype.clone();

        let up_values: Rc<[HeapKey]> = (0..prototype.up_values.len())
            .map(|i| {
                let value = if i == 0 { env } else { StackValue::Nil };
                heap.create(gc, HeapValue::UpValue(UpValue::Closed(value)))
            })
            .collect();

        let key = heap.create(
            gc,
            HeapValue::Closure(Closure {
                prototype,
                prototype_key,
                up_values,
            }),
        );

        let function_ref = FunctionRef(heap.create_ref(key));

        // test after creating ref to avoid immediately collecting the generated value
        self.step_gc_if_needed();

        Ok(function_ref)
    }

    /// Reads a binary chunk and instantiates its main function
    pub fn load_chunk(
        &mut self,
        bytes: &[u8],
        env: Option<&TableRef>,
    ) -> Result<FunctionRef, RuntimeError> {
        let proto = binary_chunk::undump(bytes).map_err(RuntimeErrorData::from)?;
        self.load_function(&proto, env)
    }

    pub fn create_native_function(
        &mut self,
        callback: impl Fn(&mut VmContext) -> Result<usize, RuntimeError> + 'static,
    ) -> FunctionRef {
        self.create_native_closure_internal(Rc::new(callback), Box::default())
    }

    /// A native function with up values, readable through [`VmContext::native_up_value`]
    pub fn create_native_closure(
        &mut self,
        callback: impl Fn(&mut VmContext) -> Result<usize, RuntimeError> + 'static,
        up_values: MultiValue,
    ) -> Result<FunctionRef, RuntimeError> {
        let heap = &self.execution_data.heap;

        for value in up_values.iter() {
            value.test_validity(heap)?;
        }

        let stack_values = up_values.iter().map(Value::to_stack_value).collect();
        self.store_multi(up_values);

        Ok(self.create_native_closure_internal(Rc::new(callback), stack_values))
    }

    fn create_native_closure_internal(
        &mut self,
        callback: NativeCallback,
        up_values: Box<[StackValue]>,
    ) -> FunctionRef {
        let data = &mut self.execution_data;
        let key = data.heap.create(
            &mut data.gc,
            HeapValue::NativeFunction(NativeClosure {
                callback,
                up_values,
            }),
        );
        let function_ref = FunctionRef(data.heap.create_ref(key));

        // test after creating ref to avoid immediately collecting the generated value
        self.step_gc_if_needed();

        function_ref
    }

    /// Stores a native function in the globals table
    pub fn register_native_function(
        &mut self,
        name: &str,
        callback: impl Fn(&mut VmContext) -> Result<usize, RuntimeError> + 'static,
    ) -> Result<(), RuntimeError> {
        let function = self.create_native_function(callback);
        let name = self.intern_string(name.as_bytes());
        let data = &mut self.execution_data;

        data.heap.table_set(
            &mut data.gc,
            self.globals,
            StackValue::String(name.0.key()),
            StackValue::Function(function.0.key()),
        )?;

        Ok(())
    }

    /// A suspended coroutine that runs `function` when first resumed
    pub fn create_thread(&mut self, function: &FunctionRef) -> Result<ThreadRef, RuntimeError> {
        Value::Function(function.clone()).test_validity(&self.execution_data.heap)?;

        let data = &mut self.execution_data;
        let mut value_stack = data.cache_pools.create_value_stack();
        value_stack.push(StackValue::Function(function.0.key()));

        let thread = Thread::new(value_stack);
        let key = data
            .heap
            .create(&mut data.gc, HeapValue::Thread(Some(Box::new(thread))));
        let thread_ref = ThreadRef(data.heap.create_ref(key));

        // test after creating ref to avoid immediately collecting the generated value
        self.step_gc_if_needed();

        Ok(thread_ref)
    }

    pub(crate) fn thread_status(&self, key: HeapKey) -> Result<ThreadStatus, RuntimeError> {
        match self.execution_data.heap.get(key) {
            Some(HeapValue::Thread(Some(thread))) => Ok(thread.status),
            Some(HeapValue::Thread(None)) => {
                let running = self.threads.last().is_some_and(|running| running.key == key);

                if running {
                    Ok(ThreadStatus::Running)
                } else {
                    Ok(ThreadStatus::Normal)
                }
            }
            _ => Err(RuntimeErrorData::InvalidRef.into()),
        }
    }

    /// Calls the value at `function_index` with the `arg_count` values above it.
    ///
    /// Results are stored starting at `function_index` and the stack top is placed after the last result.
    pub(crate) fn call_at(
        &mut self,
        function_index: usize,
        arg_count: usize,
        result_count: Option<usize>,
    ) -> Result<(), RuntimeError> {
        let return_mode = match result_count {
            Some(count) => ReturnMode::Static(count),
            None => ReturnMode::Multi,
        };

        let thread = current_thread(self)?;
        let depth = thread.call_stack.len();
        thread.non_yieldable += 1;

        let result = match call_value(self, function_index, arg_count, return_mode) {
            Ok(()) => execute(self, depth),
            Err(err) => Err(unwind(self, depth, err)),
        };

        let thread = current_thread(self)?;
        thread.non_yieldable -= 1;

        match result {
            Ok(()) => {
                if let Some(count) = result_count {
                    thread.value_stack.set_top(function_index + count);
                }

                Ok(())
            }
            Err(err) => {
                thread.value_stack.set_top(function_index);
                Err(err)
            }
        }
    }

    /// Calls a function with host values, collecting every result
    pub(crate) fn call_function(
        &mut self,
        function: StackValue,
        args: MultiValue,
    ) -> Result<MultiValue, RuntimeError> {
        let heap = &self.execution_data.heap;

        for value in args.iter() {
            value.test_validity(heap)?;
        }

        let stack_size = self.execution_data.limits.stack_size;
        let thread = current_thread(self)?;
        let old_top = thread.value_stack.top();
        let function_index = thread.live_extent();
        let arg_count = args.len();

        if function_index + arg_count + 1 > stack_size {
            return Err(RuntimeErrorData::StackOverflow.into());
        }

        thread.value_stack.set_top(function_index);
        thread.value_stack.push(function);

        for value in args.iter() {
            thread.value_stack.push(value.to_stack_value());
        }

        self.store_multi(args);

        if let Err(err) = self.call_at(function_index, arg_count, None) {
            current_thread(self)?.value_stack.set_top(old_top);
            return Err(self.report_unprotected(err));
        }

        let mut multi = self.create_multi();
        let heap = &mut self.execution_data.heap;

        if let Some(running) = self.threads.last_mut() {
            let value_stack = &mut running.thread.value_stack;

            for index in (function_index..value_stack.top()).rev() {
                multi.push_front(Value::from_stack_value(heap, value_stack.get(index)));
            }

            value_stack.set_top(old_top);
        }

        Ok(multi)
    }

    /// Hands errors leaving the outermost host call to the panic handler
    pub(crate) fn report_unprotected(&self, err: RuntimeError) -> RuntimeError {
        if self.native_depth == 0 && self.threads.len() <= 1 {
            if let Some(handler) = &self.panic_handler {
                handler(&err);
            }
        }

        err
    }

    /// Runs a suspended thread until it yields, returns, or raises an error
    pub(crate) fn resume_thread(
        &mut self,
        thread_key: HeapKey,
        args: MultiValue,
    ) -> Result<MultiValue, RuntimeError> {
        let data = &mut self.execution_data;

        for value in args.iter() {
            value.test_validity(&data.heap)?;
        }

        let Some(HeapValue::Thread(slot)) = data.heap.get_mut_unmarked(thread_key) else {
            return Err(RuntimeErrorData::InvalidRef.into());
        };

        match slot.as_deref().map(|thread| thread.status) {
            Some(ThreadStatus::Suspended) => {}
            Some(ThreadStatus::Dead) => return Err(RuntimeErrorData::DeadCoroutine.into()),
            _ => return Err(RuntimeErrorData::ResumedNonSuspendedCoroutine.into()),
        }

        let Some(mut thread) = slot.take() else {
            return Err(RuntimeErrorData::ResumedNonSuspendedCoroutine.into());
        };

        let arg_count = args.len();
        let base = thread.value_stack.top();

        if base + arg_count + 1 > data.limits.stack_size {
            *slot = Some(thread);
            return Err(RuntimeErrorData::StackOverflow.into());
        }

        for value in args.iter() {
            thread.value_stack.push(value.to_stack_value());
        }

        self.store_multi(args);

        if let Some(previous) = self.threads.last_mut() {
            previous.thread.status = ThreadStatus::Normal;
        }

        let pending = thread.pending.take();
        thread.status = ThreadStatus::Running;
        self.threads.push(RunningThread {
            key: thread_key,
            thread,
        });

        tracing::trace!(arg_count, "resume");

        let result = match pending {
            None => match call_value(self, 0, arg_count, ReturnMode::Multi) {
                Ok(()) => execute(self, 1),
                Err(err) if self.is_yielding(&err) => Err(err),
                Err(err) => Err(unwind(self, 1, err)),
            },
            Some(pending) => {
                if let Some(running) = self.threads.last_mut() {
                    let thread = &mut running.thread;
                    place_results(
                        &mut thread.value_stack,
                        thread.call_stack.last_mut(),
                        pending,
                        base,
                        arg_count,
                    );
                }

                execute(self, 1)
            }
        };

        let yielded = result.as_ref().is_err_and(|err| self.is_yielding(err));

        let Some(RunningThread { mut thread, .. }) = self.threads.pop() else {
            return Err(RuntimeErrorData::InvalidRef.into());
        };

        if let Some(previous) = self.threads.last_mut() {
            previous.thread.status = ThreadStatus::Running;
        }

        let data = &mut self.execution_data;
        let heap = &mut data.heap;
        let mut multi = data.cache_pools.create_multi();

        let outcome = match result {
            Ok(()) => {
                thread.status = ThreadStatus::Dead;

                let value_stack = &thread.value_stack;

                for index in (0..value_stack.top()).rev() {
                    multi.push_front(Value::from_stack_value(heap, value_stack.get(index)));
                }

                Ok(multi)
            }
            Err(_) if yielded => {
                thread.status = ThreadStatus::Suspended;

                for value in self.transfer.drain(..).rev() {
                    multi.push_front(Value::from_stack_value(heap, value));
                }

                Ok(multi)
            }
            Err(err) => {
                thread.status = ThreadStatus::Dead;
                Err(err)
            }
        };

        if thread.status == ThreadStatus::Dead && thread.open_up_values.is_empty() {
            let value_stack = std::mem::take(&mut thread.value_stack);
            data.cache_pools.store_value_stack(value_stack);
        }

        let size = std::mem::size_of::<HeapValue>() + std::mem::size_of::<Thread>() + thread.heap_size();

        if let Some(HeapValue::Thread(slot)) = heap.get_mut(&mut data.gc, thread_key) {
            *slot = Some(thread);
        }

        data.gc.resize(GcKey::Object(thread_key), size);

        outcome
    }

    fn is_yielding(&self, err: &RuntimeError) -> bool {
        err.data == RuntimeErrorData::Yield
            && self
                .threads
                .last()
                .is_some_and(|running| running.thread.pending.is_some())
    }

    #[inline]
    pub fn gc_used_memory(&self) -> usize {
        self.execution_data.gc.used_memory()
    }

    #[inline]
    pub fn gc_is_running(&self) -> bool {
        self.execution_data.gc.is_running()
    }

    #[inline]
    pub fn gc_stop(&mut self) {
        self.execution_data.gc.stop()
    }

    #[inline]
    pub fn gc_restart(&mut self) {
        self.execution_data.gc.restart()
    }

    #[inline]
    pub fn gc_mode(&self) -> GcMode {
        self.execution_data.gc.mode()
    }

    #[inline]
    pub fn gc_config(&self) -> &GarbageCollectorConfig {
        &self.execution_data.gc.config
    }

    #[inline]
    pub fn gc_config_mut(&mut self) -> &mut GarbageCollectorConfig {
        &mut self.execution_data.gc.config
    }
}

/// Interns constants and loads nested prototypes first, nothing is collected in between
fn load_prototype(
    heap: &mut Heap,
    gc: &mut GarbageCollector,
    proto: &FunctionProto,
    parent_source: Option<&Rc<str>>,
) -> HeapKey {
    let source_name: Rc<str> = match (&proto.source, parent_source) {
        (None, Some(parent_source)) => parent_source.clone(),
        _ => proto.source_name().into(),
    };

    let protos = proto
        .protos
        .iter()
        .map(|child| load_prototype(heap, gc, child, Some(&source_name)))
        .collect();

    let constants = proto
        .constants
        .iter()
        .map(|constant| match constant {
            Constant::Nil => StackValue::Nil,
            Constant::Bool(b) => StackValue::Bool(*b),
            Constant::Integer(i) => StackValue::Integer(*i),
            Constant::Float(f) => StackValue::Float(*f),
            Constant::String(bytes) => StackValue::String(heap.intern_bytes(gc, bytes.as_bytes())),
        })
        .collect();

    let prototype = Prototype {
        source_name,
        source: proto.source.clone(),
        line_defined: proto.line_defined,
        last_line_defined: proto.last_line_defined,
        num_params: proto.num_params,
        is_vararg: proto.is_vararg,
        max_stack_size: proto.max_stack_size,
        code: proto.code.clone().into(),
        constants,
        up_values: proto.up_values.clone().into(),
        protos,
        line_info: proto.debug.line_info.clone().into(),
        local_vars: proto.debug.local_vars.clone().into(),
        up_value_names: proto.debug.up_value_names.clone().into(),
    };

    heap.create(gc, HeapValue::Prototype(Rc::new(prototype)))
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.run_all_finalizers();
    }
}
