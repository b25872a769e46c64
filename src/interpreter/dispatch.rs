use super::execution::{CallContext, CallFunction, CallResult, ExecutionAccess, ReturnMode};
use super::heap::{HeapKey, HeapValue};
use super::instruction::{decode_floating_byte, ArithOp, Instruction, OpCode, MAX_C};
use super::interpreted_function::{Closure, Prototype};
use super::number::{
    arith_error, arith_values, as_number, coerce_integer, coerce_number, for_limit, le_numbers,
    lt_numbers, raw_equals, Number,
};
use super::thread::{
    close_up_values, find_or_create_up_value, read_foreign_slot, write_foreign_slot,
};
use super::up_value::UpValue;
use super::value_stack::{StackValue, ValueStack};
use crate::errors::{IllegalInstruction, RuntimeErrorData};
use std::rc::Rc;

enum Compared {
    Done(bool),
    Call(CallResult),
}

#[derive(Clone, Copy)]
enum Comparison {
    Lt,
    Le,
}

impl CallContext {
    /// Runs instructions until a call, a return, or a collector checkpoint
    pub(crate) fn resume(
        &mut self,
        value_stack: &mut ValueStack,
        open_up_values: &mut Vec<(usize, HeapKey)>,
        access: &mut ExecutionAccess,
    ) -> Result<CallResult, RuntimeErrorData> {
        let (definition, up_values) = match &self.function {
            CallFunction::Interpreted {
                definition,
                up_values,
            } => (definition.clone(), up_values.clone()),
            _ => return Err(IllegalInstruction::InvalidHeapKey.into()),
        };

        let base = self.register_base;
        let frame_top = base + definition.max_stack_size as usize;

        loop {
            let Some(&instruction) = definition.code.get(self.next_instruction_index) else {
                // ran off the end of the function
                return Ok(CallResult::Return {
                    start: base,
                    count: 0,
                });
            };

            self.next_instruction_index += 1;

            let a = base + instruction.a() as usize;

            match instruction.op()? {
                OpCode::Move => {
                    let value = value_stack.get(base + instruction.b() as usize);
                    value_stack.set(a, value);
                }
                OpCode::LoadI => {
                    value_stack.set(a, StackValue::Integer(instruction.sbx() as i64));
                }
                OpCode::LoadF => {
                    value_stack.set(a, StackValue::Float(instruction.sbx() as f64));
                }
                OpCode::LoadK => {
                    let value = constant(&definition, instruction.bx() as usize)?;
                    value_stack.set(a, value);
                }
                OpCode::LoadKX => {
                    let extra = self.extra_arg(&definition)?;
                    let value = constant(&definition, extra as usize)?;
                    value_stack.set(a, value);
                }
                OpCode::LoadBool => {
                    value_stack.set(a, StackValue::Bool(instruction.b() != 0));

                    if instruction.c() != 0 {
                        self.next_instruction_index += 1;
                    }
                }
                OpCode::LoadNil => {
                    for i in 0..=instruction.b() as usize {
                        value_stack.set(a + i, StackValue::Nil);
                    }
                }
                OpCode::GetUpVal => {
                    let key = up_value_key(&up_values, instruction.b())?;
                    let value = read_up_value(value_stack, access, key);
                    value_stack.set(a, value);
                }
                OpCode::SetUpVal => {
                    let key = up_value_key(&up_values, instruction.b())?;
                    let value = value_stack.get(a);
                    write_up_value(value_stack, access, key, value);
                }
                OpCode::GetTabUp => {
                    let up_value = up_value_key(&up_values, instruction.b())?;
                    let object = read_up_value(value_stack, access, up_value);
                    let key = constant(&definition, instruction.c() as usize)?;

                    if let Some(call) = get_index(access, value_stack, frame_top, object, key, a)? {
                        return Ok(call);
                    }
                }
                OpCode::GetTable => {
                    let object = value_stack.get(base + instruction.b() as usize);
                    let key = value_stack.get(base + instruction.c() as usize);

                    if let Some(call) = get_index(access, value_stack, frame_top, object, key, a)? {
                        return Ok(call);
                    }
                }
                OpCode::GetI => {
                    let object = value_stack.get(base + instruction.b() as usize);
                    let key = StackValue::Integer(instruction.c() as i64);

                    if let Some(call) = get_index(access, value_stack, frame_top, object, key, a)? {
                        return Ok(call);
                    }
                }
                OpCode::GetField => {
                    let object = value_stack.get(base + instruction.b() as usize);
                    let key = constant(&definition, instruction.c() as usize)?;

                    if let Some(call) = get_index(access, value_stack, frame_top, object, key, a)? {
                        return Ok(call);
                    }
                }
                OpCode::SetTabUp => {
                    let up_value = up_value_key(&up_values, instruction.a())?;
                    let object = read_up_value(value_stack, access, up_value);
                    let key = constant(&definition, instruction.b() as usize)?;
                    let value = rk_c(value_stack, base, &definition, instruction)?;

                    if let Some(call) = set_index(access, value_stack, frame_top, object, key, value)? {
                        return Ok(call);
                    }
                }
                OpCode::SetTable => {
                    let object = value_stack.get(a);
                    let key = value_stack.get(base + instruction.b() as usize);
                    let value = rk_c(value_stack, base, &definition, instruction)?;

                    if let Some(call) = set_index(access, value_stack, frame_top, object, key, value)? {
                        return Ok(call);
                    }
                }
                OpCode::SetI => {
                    let object = value_stack.get(a);
                    let key = StackValue::Integer(instruction.b() as i64);
                    let value = rk_c(value_stack, base, &definition, instruction)?;

                    if let Some(call) = set_index(access, value_stack, frame_top, object, key, value)? {
                        return Ok(call);
                    }
                }
                OpCode::SetField => {
                    let object = value_stack.get(a);
                    let key = constant(&definition, instruction.b() as usize)?;
                    let value = rk_c(value_stack, base, &definition, instruction)?;

                    if let Some(call) = set_index(access, value_stack, frame_top, object, key, value)? {
                        return Ok(call);
                    }
                }
                OpCode::NewTable => {
                    let map = decode_floating_byte(instruction.b());
                    let list = decode_floating_byte(instruction.c());
                    let key = access.heap.create_table(access.gc, list, map);
                    value_stack.set(a, StackValue::Table(key));

                    if gc_checkpoint(access) {
                        return Ok(CallResult::StepGc);
                    }
                }
                OpCode::SelfField => {
                    let object = value_stack.get(base + instruction.b() as usize);
                    let key = rk_c(value_stack, base, &definition, instruction)?;
                    value_stack.set(a + 1, object);

                    if let Some(call) = get_index(access, value_stack, frame_top, object, key, a)? {
                        return Ok(call);
                    }
                }
                OpCode::AddI => {
                    let lhs = value_stack.get(base + instruction.b() as usize);
                    let rhs = StackValue::Integer(instruction.sc() as i64);

                    if let Some(call) = arith(access, value_stack, frame_top, ArithOp::Add, lhs, rhs, a)? {
                        return Ok(call);
                    }
                }
                op @ (OpCode::AddK
                | OpCode::SubK
                | OpCode::MulK
                | OpCode::ModK
                | OpCode::PowK
                | OpCode::DivK
                | OpCode::IDivK
                | OpCode::BAndK
                | OpCode::BOrK
                | OpCode::BXorK
                | OpCode::ShlK
                | OpCode::ShrK) => {
                    let arith_op = op.arith_op().ok_or(IllegalInstruction::OperandOutOfRange)?;
                    let lhs = value_stack.get(base + instruction.b() as usize);
                    let rhs = constant(&definition, instruction.c() as usize)?;

                    if let Some(call) = arith(access, value_stack, frame_top, arith_op, lhs, rhs, a)? {
                        return Ok(call);
                    }
                }
                op @ (OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Mod
                | OpCode::Pow
                | OpCode::Div
                | OpCode::IDiv
                | OpCode::BAnd
                | OpCode::BOr
                | OpCode::BXor
                | OpCode::Shl
                | OpCode::Shr) => {
                    let arith_op = op.arith_op().ok_or(IllegalInstruction::OperandOutOfRange)?;
                    let lhs = value_stack.get(base + instruction.b() as usize);
                    let rhs = value_stack.get(base + instruction.c() as usize);

                    if let Some(call) = arith(access, value_stack, frame_top, arith_op, lhs, rhs, a)? {
                        return Ok(call);
                    }
                }
                OpCode::Unm => {
                    let value = value_stack.get(base + instruction.b() as usize);

                    match coerce_number(value, &access.heap.strings) {
                        Some(Number::Integer(i)) => {
                            value_stack.set(a, StackValue::Integer(i.wrapping_neg()))
                        }
                        Some(Number::Float(f)) => value_stack.set(a, StackValue::Float(-f)),
                        None => {
                            let metamethod =
                                access.heap.get_metavalue(value, access.metatable_keys.unm);

                            if metamethod.is_nil() {
                                return Err(RuntimeErrorData::InvalidArithmetic(value.type_name()));
                            }

                            return Ok(call_metamethod(
                                value_stack,
                                frame_top,
                                metamethod,
                                &[value, value],
                                ReturnMode::Destination(a),
                            ));
                        }
                    }
                }
                OpCode::BNot => {
                    let value = value_stack.get(base + instruction.b() as usize);

                    match coerce_integer(value, &access.heap.strings) {
                        Some(i) => value_stack.set(a, StackValue::Integer(!i)),
                        None => {
                            let metamethod =
                                access.heap.get_metavalue(value, access.metatable_keys.bnot);

                            if metamethod.is_nil() {
                                return Err(if coerce_number(value, &access.heap.strings).is_some() {
                                    RuntimeErrorData::NoIntegerRepresentation
                                } else {
                                    RuntimeErrorData::InvalidBitwise(value.type_name())
                                });
                            }

                            return Ok(call_metamethod(
                                value_stack,
                                frame_top,
                                metamethod,
                                &[value, value],
                                ReturnMode::Destination(a),
                            ));
                        }
                    }
                }
                OpCode::Not => {
                    let value = value_stack.get(base + instruction.b() as usize);
                    value_stack.set(a, StackValue::Bool(!value.is_truthy()));
                }
                OpCode::Len => {
                    let value = value_stack.get(base + instruction.b() as usize);

                    if let Some(call) = length(access, value_stack, frame_top, value, a)? {
                        return Ok(call);
                    }
                }
                OpCode::Concat => {
                    if self.concat_remaining == 0 {
                        self.concat_remaining = instruction.b() as usize;
                    }

                    if let Some(call) = self.concat(access, value_stack, frame_top, a)? {
                        // resume the concatenation once the metamethod returns
                        self.next_instruction_index -= 1;
                        return Ok(call);
                    }

                    if gc_checkpoint(access) {
                        return Ok(CallResult::StepGc);
                    }
                }
                OpCode::Close => {
                    close_up_values(open_up_values, value_stack, access.heap, access.gc, a);
                }
                OpCode::Jmp => {
                    self.jump(instruction.sj_arg() as isize);
                }
                OpCode::Eq => {
                    let lhs = value_stack.get(a);
                    let rhs = value_stack.get(base + instruction.b() as usize);
                    let compared = equals(access, value_stack, frame_top, lhs, rhs, instruction.k());

                    if let Some(call) = self.apply_comparison(compared, instruction.k()) {
                        return Ok(call);
                    }
                }
                OpCode::Lt | OpCode::Le => {
                    let comparison = match instruction.op()? {
                        OpCode::Lt => Comparison::Lt,
                        _ => Comparison::Le,
                    };

                    let lhs = value_stack.get(a);
                    let rhs = value_stack.get(base + instruction.b() as usize);
                    let compared =
                        compare(access, value_stack, frame_top, comparison, lhs, rhs, instruction.k())?;

                    if let Some(call) = self.apply_comparison(compared, instruction.k()) {
                        return Ok(call);
                    }
                }
                OpCode::EqK => {
                    let lhs = value_stack.get(a);
                    let rhs = constant(&definition, instruction.b() as usize)?;
                    let equal = raw_equals(lhs, rhs, &access.heap.strings);

                    if equal != instruction.k() {
                        self.next_instruction_index += 1;
                    }
                }
                OpCode::EqI => {
                    let lhs = value_stack.get(a);
                    let immediate = instruction.sb() as i64;

                    let equal = match lhs {
                        StackValue::Integer(i) => i == immediate,
                        StackValue::Float(f) => f == immediate as f64,
                        _ => false,
                    };

                    if equal != instruction.k() {
                        self.next_instruction_index += 1;
                    }
                }
                op @ (OpCode::LtI | OpCode::LeI | OpCode::GtI | OpCode::GeI) => {
                    let register = value_stack.get(a);
                    let immediate = if instruction.c() != 0 {
                        StackValue::Float(instruction.sb() as f64)
                    } else {
                        StackValue::Integer(instruction.sb() as i64)
                    };

                    let (comparison, lhs, rhs) = match op {
                        OpCode::LtI => (Comparison::Lt, register, immediate),
                        OpCode::LeI => (Comparison::Le, register, immediate),
                        OpCode::GtI => (Comparison::Lt, immediate, register),
                        _ => (Comparison::Le, immediate, register),
                    };

                    let compared =
                        compare(access, value_stack, frame_top, comparison, lhs, rhs, instruction.k())?;

                    if let Some(call) = self.apply_comparison(compared, instruction.k()) {
                        return Ok(call);
                    }
                }
                OpCode::Test => {
                    if value_stack.get(a).is_truthy() != instruction.k() {
                        self.next_instruction_index += 1;
                    }
                }
                OpCode::TestSet => {
                    let value = value_stack.get(base + instruction.b() as usize);

                    if value.is_truthy() != instruction.k() {
                        self.next_instruction_index += 1;
                    } else {
                        value_stack.set(a, value);
                    }
                }
                OpCode::Call => {
                    let arg_count = match instruction.b() {
                        0 => value_stack.top().saturating_sub(a + 1),
                        b => b as usize - 1,
                    };

                    let return_mode = match instruction.c() {
                        0 => ReturnMode::Multi,
                        c => ReturnMode::Static(c as usize - 1),
                    };

                    return Ok(CallResult::Call {
                        function_index: a,
                        arg_count,
                        return_mode,
                    });
                }
                OpCode::TailCall => {
                    let arg_count = match instruction.b() {
                        0 => value_stack.top().saturating_sub(a + 1),
                        b => b as usize - 1,
                    };

                    return Ok(CallResult::TailCall {
                        function_index: a,
                        arg_count,
                    });
                }
                OpCode::Return => {
                    let count = match instruction.b() {
                        0 => value_stack.top().saturating_sub(a),
                        b => b as usize - 1,
                    };

                    return Ok(CallResult::Return { start: a, count });
                }
                OpCode::Return0 => {
                    return Ok(CallResult::Return { start: a, count: 0 });
                }
                OpCode::Return1 => {
                    return Ok(CallResult::Return { start: a, count: 1 });
                }
                OpCode::ForLoop => {
                    if for_loop(value_stack, a) {
                        self.next_instruction_index -= instruction.bx() as usize;
                    }
                }
                OpCode::ForPrep => {
                    if !for_prep(value_stack, a)? {
                        self.next_instruction_index += instruction.bx() as usize + 1;
                    }
                }
                OpCode::TForPrep => {
                    self.next_instruction_index += instruction.bx() as usize;
                }
                OpCode::TForCall => {
                    // iterator, state, and control are copied so the call doesn't consume them
                    value_stack.copy_within(a..a + 3, a + 4);

                    return Ok(CallResult::Call {
                        function_index: a + 4,
                        arg_count: 2,
                        return_mode: ReturnMode::Static(instruction.c() as usize),
                    });
                }
                OpCode::TForLoop => {
                    let control = value_stack.get(a + 4);

                    if !control.is_nil() {
                        value_stack.set(a + 2, control);
                        self.next_instruction_index -= instruction.bx() as usize;
                    }
                }
                OpCode::SetList => {
                    let count = match instruction.b() {
                        0 => value_stack.top().saturating_sub(a + 1),
                        b => b as usize,
                    };

                    let mut offset = instruction.c() as usize;

                    if instruction.k() {
                        offset += self.extra_arg(&definition)? as usize * (MAX_C as usize + 1);
                    }

                    let StackValue::Table(table_key) = value_stack.get(a) else {
                        return Err(RuntimeErrorData::AttemptToIndex(value_stack.get(a).type_name()));
                    };

                    for i in 1..=count {
                        let key = StackValue::Integer((offset + i) as i64);
                        let value = value_stack.get(a + i);
                        access.heap.table_set(access.gc, table_key, key, value)?;
                    }

                    if gc_checkpoint(access) {
                        return Ok(CallResult::StepGc);
                    }
                }
                OpCode::Closure => {
                    let key = self.closure(
                        &definition,
                        &up_values,
                        open_up_values,
                        access,
                        instruction.bx(),
                    )?;

                    value_stack.set(a, StackValue::Function(key));

                    if gc_checkpoint(access) {
                        return Ok(CallResult::StepGc);
                    }
                }
                OpCode::VarArg => {
                    let vararg_start = base - 1 - self.vararg_count;

                    match instruction.c() {
                        0 => {
                            let count = self.vararg_count;

                            if a + count > access.limits.stack_size {
                                return Err(RuntimeErrorData::StackOverflow);
                            }

                            value_stack.copy_within(vararg_start..vararg_start + count, a);
                            value_stack.set_top(a + count);
                        }
                        c => {
                            let wanted = c as usize - 1;
                            let copied = wanted.min(self.vararg_count);
                            value_stack.copy_within(vararg_start..vararg_start + copied, a);

                            for i in copied..wanted {
                                value_stack.set(a + i, StackValue::Nil);
                            }
                        }
                    }
                }
                OpCode::VarArgPrep => {}
                OpCode::ExtraArg => {
                    return Err(IllegalInstruction::UnknownOpcode(instruction.raw_op()).into());
                }
            }
        }
    }

    #[inline]
    fn jump(&mut self, offset: isize) {
        self.next_instruction_index = (self.next_instruction_index as isize + offset) as usize;
    }

    /// Consumes the `ExtraArg` following the current instruction
    fn extra_arg(&mut self, definition: &Prototype) -> Result<u32, RuntimeErrorData> {
        let instruction = definition
            .code
            .get(self.next_instruction_index)
            .copied()
            .ok_or(IllegalInstruction::MissingExtraArg)?;

        if instruction.op()? != OpCode::ExtraArg {
            return Err(IllegalInstruction::MissingExtraArg.into());
        }

        self.next_instruction_index += 1;
        Ok(instruction.ax_arg())
    }

    fn apply_comparison(&mut self, compared: Compared, expected: bool) -> Option<CallResult> {
        match compared {
            Compared::Done(result) => {
                if result != expected {
                    self.next_instruction_index += 1;
                }

                None
            }
            Compared::Call(call) => Some(call),
        }
    }

    /// Concatenates from the right, returns a call when a `__concat` metamethod is needed
    fn concat(
        &mut self,
        access: &mut ExecutionAccess,
        value_stack: &mut ValueStack,
        frame_top: usize,
        a: usize,
    ) -> Result<Option<CallResult>, RuntimeErrorData> {
        while self.concat_remaining > 1 {
            let end = a + self.concat_remaining;
            let lhs = value_stack.get(end - 2);
            let rhs = value_stack.get(end - 1);

            if is_string_like(lhs) && is_string_like(rhs) {
                let mut start = end - 2;

                while start > a && is_string_like(value_stack.get(start - 1)) {
                    start -= 1;
                }

                let mut buffer = Vec::new();

                for i in start..end {
                    access
                        .heap
                        .write_string_like(value_stack.get(i), &mut buffer);
                }

                let key = access.heap.intern_bytes(access.gc, &buffer);
                value_stack.set(start, StackValue::String(key));
                self.concat_remaining -= end - start - 1;
                continue;
            }

            let event = access.metatable_keys.concat;
            let metamethod = binary_metamethod(access, lhs, rhs, event);

            if metamethod.is_nil() {
                let culprit = if is_string_like(lhs) { rhs } else { lhs };
                self.concat_remaining = 0;
                return Err(RuntimeErrorData::AttemptToConcat(culprit.type_name()));
            }

            self.concat_remaining -= 1;

            return Ok(Some(call_metamethod(
                value_stack,
                frame_top,
                metamethod,
                &[lhs, rhs],
                ReturnMode::Destination(end - 2),
            )));
        }

        self.concat_remaining = 0;
        Ok(None)
    }

    fn closure(
        &mut self,
        definition: &Prototype,
        parent_up_values: &Rc<[HeapKey]>,
        open_up_values: &mut Vec<(usize, HeapKey)>,
        access: &mut ExecutionAccess,
        index: u32,
    ) -> Result<HeapKey, RuntimeErrorData> {
        let prototype_key = definition
            .protos
            .get(index as usize)
            .copied()
            .ok_or(IllegalInstruction::MissingPrototype(index))?;

        let Some(HeapValue::Prototype(prototype)) = access.heap.get(prototype_key) else {
            return Err(IllegalInstruction::MissingPrototype(index).into());
        };

        let prototype = prototype.clone();
        let base = self.register_base;

        // reuse the previous closure when it captured the same variables
        let cached = access.heap.closure_cache.get(&prototype_key);

        if let Some(cached_key) = cached.and_then(|cached| cached.closure) {
            if let Some(HeapValue::Closure(closure)) = access.heap.get(cached_key) {
                let matches = prototype
                    .up_values
                    .iter()
                    .zip(closure.up_values.iter())
                    .all(|(descriptor, &key)| {
                        if descriptor.in_stack {
                            matches!(
                                access.heap.get(key),
                                Some(HeapValue::UpValue(UpValue::Open { thread, index }))
                                    if *thread == access.thread_key
                                        && *index == base + descriptor.index as usize
                            )
                        } else {
                            parent_up_values.get(descriptor.index as usize) == Some(&key)
                        }
                    });

                if matches {
                    return Ok(cached_key);
                }
            }
        }

        let mut up_values = Vec::with_capacity(prototype.up_values.len());

        for descriptor in prototype.up_values.iter() {
            let key = if descriptor.in_stack {
                find_or_create_up_value(
                    open_up_values,
                    access.heap,
                    access.gc,
                    access.thread_key,
                    base + descriptor.index as usize,
                )
            } else {
                parent_up_values
                    .get(descriptor.index as usize)
                    .copied()
                    .ok_or(IllegalInstruction::MissingUpValue(descriptor.index))?
            };

            up_values.push(key);
        }

        let key = access.heap.create(
            access.gc,
            HeapValue::Closure(Closure {
                prototype,
                prototype_key,
                up_values: up_values.into(),
            }),
        );

        let cached = access.heap.closure_cache.entry(prototype_key).or_default();

        if !cached.is_disabled() {
            if cached.closure.is_some() {
                cached.misses += 1;
            }

            cached.closure = if cached.is_disabled() { None } else { Some(key) };
        }

        Ok(key)
    }
}

#[inline]
fn gc_checkpoint(access: &ExecutionAccess) -> bool {
    access.gc.should_step() || access.gc.exceeds_memory_limit()
}

#[inline]
fn constant(definition: &Prototype, index: usize) -> Result<StackValue, RuntimeErrorData> {
    definition
        .constants
        .get(index)
        .copied()
        .ok_or_else(|| IllegalInstruction::MissingConstant(index as u32).into())
}

/// `K[C]` when `k` is set, `R[C]` otherwise
#[inline]
fn rk_c(
    value_stack: &ValueStack,
    base: usize,
    definition: &Prototype,
    instruction: Instruction,
) -> Result<StackValue, RuntimeErrorData> {
    if instruction.k() {
        constant(definition, instruction.c() as usize)
    } else {
        Ok(value_stack.get(base + instruction.c() as usize))
    }
}

#[inline]
fn up_value_key(up_values: &[HeapKey], index: u8) -> Result<HeapKey, RuntimeErrorData> {
    up_values
        .get(index as usize)
        .copied()
        .ok_or_else(|| IllegalInstruction::MissingUpValue(index).into())
}

pub(crate) fn read_up_value(value_stack: &ValueStack, access: &ExecutionAccess, key: HeapKey) -> StackValue {
    match access.heap.get(key) {
        Some(HeapValue::UpValue(UpValue::Closed(value))) => *value,
        Some(HeapValue::UpValue(UpValue::Open { thread, index })) => {
            if *thread == access.thread_key {
                value_stack.get(*index)
            } else {
                read_foreign_slot(access.heap, access.other_threads, *thread, *index)
            }
        }
        _ => StackValue::Nil,
    }
}

pub(crate) fn write_up_value(
    value_stack: &mut ValueStack,
    access: &mut ExecutionAccess,
    key: HeapKey,
    value: StackValue,
) {
    let up_value = match access.heap.get(key) {
        Some(HeapValue::UpValue(up_value)) => *up_value,
        _ => return,
    };

    match up_value {
        UpValue::Closed(_) => {
            if let Some(HeapValue::UpValue(up_value)) = access.heap.get_mut_unmarked(key) {
                *up_value = UpValue::Closed(value);
            }

            access.gc.barrier_forward(key, value);
        }
        UpValue::Open { thread, index } => {
            if thread == access.thread_key {
                value_stack.set(index, value);
            } else {
                write_foreign_slot(access.heap, access.other_threads, thread, index, value);
            }
        }
    }
}

/// Places `function(args...)` past the frame's registers
fn call_metamethod(
    value_stack: &mut ValueStack,
    frame_top: usize,
    function: StackValue,
    args: &[StackValue],
    return_mode: ReturnMode,
) -> CallResult {
    value_stack.set(frame_top, function);

    for (i, value) in args.iter().enumerate() {
        value_stack.set(frame_top + 1 + i, *value);
    }

    CallResult::Call {
        function_index: frame_top,
        arg_count: args.len(),
        return_mode,
    }
}

/// The first operand's metamethod, or the second's
fn binary_metamethod(
    access: &ExecutionAccess,
    lhs: StackValue,
    rhs: StackValue,
    event: super::heap::StringKey,
) -> StackValue {
    let metamethod = access.heap.get_metavalue(lhs, event);

    if metamethod.is_nil() {
        access.heap.get_metavalue(rhs, event)
    } else {
        metamethod
    }
}

#[inline]
fn is_string_like(value: StackValue) -> bool {
    matches!(
        value,
        StackValue::String(_) | StackValue::Integer(_) | StackValue::Float(_)
    )
}

/// `dest = object[key]`, following `__index` chains
pub(crate) fn get_index(
    access: &mut ExecutionAccess,
    value_stack: &mut ValueStack,
    frame_top: usize,
    mut object: StackValue,
    key: StackValue,
    dest: usize,
) -> Result<Option<CallResult>, RuntimeErrorData> {
    let event = access.metatable_keys.index;

    for _ in 0..access.limits.metatable_chain_depth {
        let metamethod = if let StackValue::Table(table_key) = object {
            let table = access
                .heap
                .table(table_key)
                .ok_or(IllegalInstruction::InvalidHeapKey)?;

            let value = table.get(key, &access.heap.strings);

            if !value.is_nil() {
                value_stack.set(dest, value);
                return Ok(None);
            }

            let metamethod = access.heap.get_metavalue(object, event);

            if metamethod.is_nil() {
                value_stack.set(dest, StackValue::Nil);
                return Ok(None);
            }

            metamethod
        } else {
            let metamethod = access.heap.get_metavalue(object, event);

            if metamethod.is_nil() {
                return Err(RuntimeErrorData::AttemptToIndex(object.type_name()));
            }

            metamethod
        };

        if let StackValue::Function(_) = metamethod {
            return Ok(Some(call_metamethod(
                value_stack,
                frame_top,
                metamethod,
                &[object, key],
                ReturnMode::Destination(dest),
            )));
        }

        object = metamethod;
    }

    Err(RuntimeErrorData::MetatableChainTooLong)
}

/// `object[key] = value`, following `__newindex` chains
pub(crate) fn set_index(
    access: &mut ExecutionAccess,
    value_stack: &mut ValueStack,
    frame_top: usize,
    mut object: StackValue,
    key: StackValue,
    value: StackValue,
) -> Result<Option<CallResult>, RuntimeErrorData> {
    let event = access.metatable_keys.newindex;

    for _ in 0..access.limits.metatable_chain_depth {
        let metamethod = if let StackValue::Table(table_key) = object {
            let table = access
                .heap
                .table(table_key)
                .ok_or(IllegalInstruction::InvalidHeapKey)?;

            let existing = table.get(key, &access.heap.strings);
            let metamethod = if existing.is_nil() {
                access.heap.get_metavalue(object, event)
            } else {
                StackValue::Nil
            };

            if metamethod.is_nil() {
                access.heap.table_set(access.gc, table_key, key, value)?;
                return Ok(None);
            }

            metamethod
        } else {
            let metamethod = access.heap.get_metavalue(object, event);

            if metamethod.is_nil() {
                return Err(RuntimeErrorData::AttemptToIndex(object.type_name()));
            }

            metamethod
        };

        if let StackValue::Function(_) = metamethod {
            return Ok(Some(call_metamethod(
                value_stack,
                frame_top,
                metamethod,
                &[object, key, value],
                ReturnMode::Discard,
            )));
        }

        object = metamethod;
    }

    Err(RuntimeErrorData::MetatableChainTooLong)
}

fn arith(
    access: &mut ExecutionAccess,
    value_stack: &mut ValueStack,
    frame_top: usize,
    op: ArithOp,
    lhs: StackValue,
    rhs: StackValue,
    dest: usize,
) -> Result<Option<CallResult>, RuntimeErrorData> {
    if let Some(value) = arith_values(op, lhs, rhs, &access.heap.strings)? {
        value_stack.set(dest, value);
        return Ok(None);
    }

    let metamethod = binary_metamethod(access, lhs, rhs, access.metatable_keys.arith(op));

    if metamethod.is_nil() {
        return Err(arith_error(op, lhs, rhs, &access.heap.strings));
    }

    Ok(Some(call_metamethod(
        value_stack,
        frame_top,
        metamethod,
        &[lhs, rhs],
        ReturnMode::Destination(dest),
    )))
}

pub(crate) fn length(
    access: &mut ExecutionAccess,
    value_stack: &mut ValueStack,
    frame_top: usize,
    value: StackValue,
    dest: usize,
) -> Result<Option<CallResult>, RuntimeErrorData> {
    if let StackValue::String(key) = value {
        let len = access.heap.string_bytes(key).map(|s| s.len()).unwrap_or_default();
        value_stack.set(dest, StackValue::Integer(len as i64));
        return Ok(None);
    }

    let metamethod = access.heap.get_metavalue(value, access.metatable_keys.len);

    if metamethod.is_nil() {
        let StackValue::Table(table_key) = value else {
            return Err(RuntimeErrorData::NoLength(value.type_name()));
        };

        let table = access
            .heap
            .table(table_key)
            .ok_or(IllegalInstruction::InvalidHeapKey)?;

        let border = table.border(&access.heap.strings);
        value_stack.set(dest, StackValue::Integer(border));
        return Ok(None);
    }

    Ok(Some(call_metamethod(
        value_stack,
        frame_top,
        metamethod,
        &[value, value],
        ReturnMode::Destination(dest),
    )))
}

fn equals(
    access: &mut ExecutionAccess,
    value_stack: &mut ValueStack,
    frame_top: usize,
    lhs: StackValue,
    rhs: StackValue,
    expected: bool,
) -> Compared {
    if raw_equals(lhs, rhs, &access.heap.strings) {
        return Compared::Done(true);
    }

    let comparable = matches!(
        (lhs, rhs),
        (StackValue::Table(_), StackValue::Table(_)) | (StackValue::UserData(_), StackValue::UserData(_))
    );

    if !comparable {
        return Compared::Done(false);
    }

    let metamethod = binary_metamethod(access, lhs, rhs, access.metatable_keys.eq);

    if metamethod.is_nil() {
        return Compared::Done(false);
    }

    Compared::Call(call_metamethod(
        value_stack,
        frame_top,
        metamethod,
        &[lhs, rhs],
        ReturnMode::Compare {
            expected,
            negate: false,
        },
    ))
}

fn compare(
    access: &mut ExecutionAccess,
    value_stack: &mut ValueStack,
    frame_top: usize,
    comparison: Comparison,
    lhs: StackValue,
    rhs: StackValue,
    expected: bool,
) -> Result<Compared, RuntimeErrorData> {
    if let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) {
        return Ok(Compared::Done(match comparison {
            Comparison::Lt => lt_numbers(a, b),
            Comparison::Le => le_numbers(a, b),
        }));
    }

    if let (StackValue::String(a), StackValue::String(b)) = (lhs, rhs) {
        let a = access.heap.string_bytes(a).map(|s| s.as_bytes()).unwrap_or_default();
        let b = access.heap.string_bytes(b).map(|s| s.as_bytes()).unwrap_or_default();

        return Ok(Compared::Done(match comparison {
            Comparison::Lt => a < b,
            Comparison::Le => a <= b,
        }));
    }

    let keys = access.metatable_keys;

    let (metamethod, args, negate) = match comparison {
        Comparison::Lt => (binary_metamethod(access, lhs, rhs, keys.lt), [lhs, rhs], false),
        Comparison::Le => {
            let metamethod = binary_metamethod(access, lhs, rhs, keys.le);

            if metamethod.is_nil() {
                // a <= b is not (b < a)
                (binary_metamethod(access, rhs, lhs, keys.lt), [rhs, lhs], true)
            } else {
                (metamethod, [lhs, rhs], false)
            }
        }
    };

    if metamethod.is_nil() {
        return Err(RuntimeErrorData::InvalidCompare(
            lhs.type_name(),
            rhs.type_name(),
        ));
    }

    Ok(Compared::Call(call_metamethod(
        value_stack,
        frame_top,
        metamethod,
        &args,
        ReturnMode::Compare { expected, negate },
    )))
}

/// Returns `true` while the loop continues
fn for_loop(value_stack: &mut ValueStack, a: usize) -> bool {
    match value_stack.get(a + 2) {
        StackValue::Integer(step) => {
            let StackValue::Integer(count) = value_stack.get(a + 1) else {
                return false;
            };

            if count as u64 == 0 {
                return false;
            }

            let StackValue::Integer(index) = value_stack.get(a) else {
                return false;
            };

            let index = index.wrapping_add(step);
            value_stack.set(a + 1, StackValue::Integer((count as u64 - 1) as i64));
            value_stack.set(a, StackValue::Integer(index));
            value_stack.set(a + 3, StackValue::Integer(index));
            true
        }
        StackValue::Float(step) => {
            let (StackValue::Float(index), StackValue::Float(limit)) =
                (value_stack.get(a), value_stack.get(a + 1))
            else {
                return false;
            };

            let index = index + step;

            let continues = if step > 0.0 {
                index <= limit
            } else {
                limit <= index
            };

            if continues {
                value_stack.set(a, StackValue::Float(index));
                value_stack.set(a + 3, StackValue::Float(index));
            }

            continues
        }
        _ => false,
    }
}

/// Prepares a numeric for loop, returns `false` when the body never runs
fn for_prep(value_stack: &mut ValueStack, a: usize) -> Result<bool, RuntimeErrorData> {
    let init = value_stack.get(a);
    let limit = value_stack.get(a + 1);
    let step = value_stack.get(a + 2);

    if let (StackValue::Integer(init), StackValue::Integer(step)) = (init, step) {
        if step == 0 {
            return Err(RuntimeErrorData::ForZeroStep);
        }

        value_stack.set(a + 3, StackValue::Integer(init));

        let Some(limit) = for_limit(init, limit, step)? else {
            return Ok(false);
        };

        // iteration count, computed unsigned to survive overflow
        let count = if step > 0 {
            let count = (limit as u64).wrapping_sub(init as u64);

            if step != 1 {
                count / step as u64
            } else {
                count
            }
        } else {
            let count = (init as u64).wrapping_sub(limit as u64);
            count / ((-(step + 1)) as u64 + 1)
        };

        value_stack.set(a + 1, StackValue::Integer(count as i64));
        return Ok(true);
    }

    let Some(init) = as_number(init) else {
        return Err(RuntimeErrorData::ForInitialValue);
    };

    let Some(limit) = as_number(limit) else {
        return Err(RuntimeErrorData::ForLimit);
    };

    let Some(step) = as_number(step) else {
        return Err(RuntimeErrorData::ForStep);
    };

    let (init, limit, step) = (init.to_float(), limit.to_float(), step.to_float());

    if step == 0.0 {
        return Err(RuntimeErrorData::ForZeroStep);
    }

    let skip = if step > 0.0 {
        limit < init
    } else {
        init < limit
    };

    if skip {
        return Ok(false);
    }

    value_stack.set(a, StackValue::Float(init));
    value_stack.set(a + 1, StackValue::Float(limit));
    value_stack.set(a + 2, StackValue::Float(step));
    value_stack.set(a + 3, StackValue::Float(init));

    Ok(true)
}
