use super::heap::{Heap, HeapKey, HeapValue};
use super::instruction::Instruction;
use super::module::{Constant, DebugInfo, FunctionProto, LocalVar, UpValueDescriptor};
use super::value_stack::StackValue;
use super::ByteString;
use crate::errors::StackTraceFrame;
use std::rc::Rc;

/// Closure cache misses tolerated before a prototype stops caching
pub(crate) const CLOSURE_CACHE_MISS_LIMIT: u32 = 8;

/// A loaded [`FunctionProto`](super::FunctionProto), with constants interned into the heap
pub(crate) struct Prototype {
    pub(crate) source_name: Rc<str>,
    pub(crate) source: Option<ByteString>,
    pub(crate) line_defined: u32,
    pub(crate) last_line_defined: u32,
    pub(crate) num_params: u8,
    pub(crate) is_vararg: bool,
    pub(crate) max_stack_size: u8,
    pub(crate) code: Box<[Instruction]>,
    pub(crate) constants: Box<[StackValue]>,
    pub(crate) up_values: Box<[UpValueDescriptor]>,
    pub(crate) protos: Box<[HeapKey]>,
    pub(crate) line_info: Box<[u32]>,
    pub(crate) local_vars: Box<[LocalVar]>,
    pub(crate) up_value_names: Box<[ByteString]>,
}

impl Prototype {
    pub(crate) fn heap_size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        // source_name: weak count + strong count + data
        size += std::mem::size_of::<usize>() * 2 + self.source_name.len();
        size += std::mem::size_of_val(&*self.code);
        size += std::mem::size_of_val(&*self.constants);
        size += std::mem::size_of_val(&*self.up_values);
        size += std::mem::size_of_val(&*self.protos);
        size += std::mem::size_of_val(&*self.line_info);
        size += std::mem::size_of_val(&*self.local_vars);
        size += std::mem::size_of_val(&*self.up_value_names);
        size
    }

    pub(crate) fn line_at(&self, instruction_index: usize) -> usize {
        match self.line_info.get(instruction_index) {
            Some(line) => *line as usize,
            None => self.line_defined as usize,
        }
    }

    /// Rebuilds the compiled form, used for dumping a loaded function
    pub(crate) fn to_function_proto(&self, heap: &Heap) -> FunctionProto {
        let constants = self
            .constants
            .iter()
            .map(|value| match *value {
                StackValue::Bool(b) => Constant::Bool(b),
                StackValue::Integer(i) => Constant::Integer(i),
                StackValue::Float(f) => Constant::Float(f),
                StackValue::String(key) => match heap.string_bytes(key) {
                    Some(bytes) => Constant::String(bytes.clone()),
                    None => Constant::Nil,
                },
                _ => Constant::Nil,
            })
            .collect();

        let protos = self
            .protos
            .iter()
            .filter_map(|key| match heap.get(*key) {
                Some(HeapValue::Prototype(prototype)) => Some(prototype.to_function_proto(heap)),
                _ => None,
            })
            .collect();

        FunctionProto {
            source: self.source.clone(),
            line_defined: self.line_defined,
            last_line_defined: self.last_line_defined,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack_size: self.max_stack_size,
            code: self.code.to_vec(),
            constants,
            up_values: self.up_values.to_vec(),
            protos,
            debug: DebugInfo {
                line_info: self.line_info.to_vec(),
                local_vars: self.local_vars.to_vec(),
                up_value_names: self.up_value_names.to_vec(),
            },
        }
    }

    pub(crate) fn create_stack_trace_frame(&self, instruction_index: usize) -> StackTraceFrame {
        StackTraceFrame {
            source_name: self.source_name.clone(),
            line: self.line_at(instruction_index),
            instruction_index,
        }
    }
}

pub(crate) struct Closure {
    pub(crate) prototype: Rc<Prototype>,
    pub(crate) prototype_key: HeapKey,
    pub(crate) up_values: Rc<[HeapKey]>,
}

impl Closure {
    pub(crate) fn heap_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + std::mem::size_of::<usize>() * 2
            + std::mem::size_of_val(&*self.up_values)
    }
}

/// The last closure built from a prototype, reused while the up values match
#[derive(Default)]
pub(crate) struct CachedClosure {
    pub(crate) closure: Option<HeapKey>,
    pub(crate) misses: u32,
}

impl CachedClosure {
    #[inline]
    pub(crate) fn is_disabled(&self) -> bool {
        self.misses >= CLOSURE_CACHE_MISS_LIMIT
    }
}
