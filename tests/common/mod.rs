#![allow(dead_code)]

use new_moon::interpreter::{
    Constant, DebugInfo, FunctionProto, Instruction, OpCode, UpValueDescriptor,
};

/// A main chunk: vararg, with `_ENV` as its only up value
pub fn main_function(
    code: Vec<Instruction>,
    constants: Vec<Constant>,
    max_stack_size: u8,
) -> FunctionProto {
    FunctionProto {
        source: Some("@test.lua".into()),
        is_vararg: true,
        max_stack_size,
        debug: DebugInfo {
            line_info: (1..=code.len() as u32).collect(),
            ..Default::default()
        },
        code,
        constants,
        up_values: vec![UpValueDescriptor::register(0)],
        ..Default::default()
    }
}

pub fn abc(op: OpCode, a: u8, b: u8, c: u8) -> Instruction {
    Instruction::abc(op, a, b, c, false)
}

pub fn abck(op: OpCode, a: u8, b: u8, c: u8) -> Instruction {
    Instruction::abc(op, a, b, c, true)
}

pub fn load_i(a: u8, value: i32) -> Instruction {
    Instruction::asbx(OpCode::LoadI, a, value)
}

/// `return R[a]`
pub fn return1(a: u8) -> Instruction {
    abc(OpCode::Return, a, 2, 0)
}
