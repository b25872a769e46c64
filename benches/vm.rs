use criterion::{black_box, criterion_group, criterion_main, Criterion};
use new_moon::interpreter::{
    Constant, DebugInfo, FunctionProto, Instruction, OpCode, UpValueDescriptor, Vm,
};

fn main_function(code: Vec<Instruction>, constants: Vec<Constant>, max_stack_size: u8) -> FunctionProto {
    FunctionProto {
        source: Some("=bench".into()),
        is_vararg: true,
        max_stack_size,
        debug: DebugInfo {
            line_info: vec![1; code.len()],
            ..Default::default()
        },
        code,
        constants,
        up_values: vec![UpValueDescriptor::register(0)],
        ..Default::default()
    }
}

fn abc(op: OpCode, a: u8, b: u8, c: u8) -> Instruction {
    Instruction::abc(op, a, b, c, false)
}

/// `local sum = 0 for i = 1, n do sum = sum + i end return sum`
fn numeric_for(n: i64) -> FunctionProto {
    main_function(
        vec![
            Instruction::asbx(OpCode::LoadI, 0, 0),
            Instruction::asbx(OpCode::LoadI, 1, 1),
            Instruction::abx(OpCode::LoadK, 2, 0),
            Instruction::asbx(OpCode::LoadI, 3, 1),
            Instruction::abx(OpCode::ForPrep, 1, 1),
            abc(OpCode::Add, 0, 0, 4),
            Instruction::abx(OpCode::ForLoop, 1, 2),
            abc(OpCode::Return, 0, 2, 0),
        ],
        vec![Constant::Integer(n)],
        5,
    )
}

/// `local t = {} for i = 1, n do t[i] = {} end return #t`
fn table_fill(n: i64) -> FunctionProto {
    main_function(
        vec![
            abc(OpCode::NewTable, 0, 0, 0),
            Instruction::asbx(OpCode::LoadI, 1, 1),
            Instruction::abx(OpCode::LoadK, 2, 0),
            Instruction::asbx(OpCode::LoadI, 3, 1),
            Instruction::abx(OpCode::ForPrep, 1, 2),
            abc(OpCode::NewTable, 5, 0, 0),
            abc(OpCode::SetTable, 0, 4, 5),
            Instruction::abx(OpCode::ForLoop, 1, 3),
            abc(OpCode::Len, 1, 0, 0),
            abc(OpCode::Return, 1, 2, 0),
        ],
        vec![Constant::Integer(n)],
        6,
    )
}

/// `for i = 1, n do f(i) end`
fn native_calls(n: i64) -> FunctionProto {
    main_function(
        vec![
            Instruction::asbx(OpCode::LoadI, 0, 1),
            Instruction::abx(OpCode::LoadK, 1, 0),
            Instruction::asbx(OpCode::LoadI, 2, 1),
            Instruction::abx(OpCode::ForPrep, 0, 3),
            abc(OpCode::GetTabUp, 4, 0, 1),
            abc(OpCode::Move, 5, 3, 0),
            abc(OpCode::Call, 4, 2, 1),
            Instruction::abx(OpCode::ForLoop, 0, 4),
            abc(OpCode::Return0, 0, 0, 0),
        ],
        vec![Constant::Integer(n), "f".into()],
        6,
    )
}

fn bench_numeric_for(c: &mut Criterion) {
    let mut vm = Vm::with_seed(0);
    let function = vm.load_function(&numeric_for(10_000), None).unwrap();

    c.bench_function("numeric_for_10k", |b| {
        b.iter(|| black_box(function.call::<_, i64>((), &mut vm).unwrap()));
    });
}

fn bench_table_fill(c: &mut Criterion) {
    let mut vm = Vm::with_seed(0);
    let function = vm.load_function(&table_fill(1_000), None).unwrap();

    c.bench_function("table_fill_1k", |b| {
        b.iter(|| black_box(function.call::<_, i64>((), &mut vm).unwrap()));
    });
}

fn bench_native_calls(c: &mut Criterion) {
    let mut vm = Vm::with_seed(0);

    vm.register_native_function("f", |ctx| {
        let value: i64 = ctx.get(1)?;
        ctx.push(value + 1)?;
        Ok(1)
    })
    .unwrap();

    let function = vm.load_function(&native_calls(1_000), None).unwrap();

    c.bench_function("native_calls_1k", |b| {
        b.iter(|| function.call::<_, ()>((), &mut vm).unwrap());
    });
}

fn bench_full_collect(c: &mut Criterion) {
    let mut vm = Vm::with_seed(0);
    let root = vm.create_table();

    for i in 0..1_000 {
        let child = vm.create_table();
        root.set(i + 1, child, &mut vm).unwrap();
    }

    c.bench_function("gc_collect_1k_live", |b| {
        b.iter(|| vm.gc_collect());
    });
}

criterion_group!(
    benches,
    bench_numeric_for,
    bench_table_fill,
    bench_native_calls,
    bench_full_collect
);
criterion_main!(benches);
