mod common;

use common::{abc, load_i, main_function, return1};
use new_moon::errors::RuntimeErrorData;
use new_moon::interpreter::binary_chunk;
use new_moon::interpreter::{ChunkError, Instruction, OpCode, Value, Vm};
use pretty_assertions::assert_eq;

/// `return x // d`
fn divide_global() -> new_moon::interpreter::FunctionProto {
    main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            Instruction::abx(OpCode::LoadK, 1, 1),
            abc(OpCode::IDiv, 0, 0, 1),
            return1(0),
        ],
        vec!["x".into(), 0i64.into()],
        2,
    )
}

#[test]
fn dumped_functions_reload() {
    let mut vm = Vm::with_seed(0);
    let proto = divide_global();

    let function = vm.load_function(&proto, None).unwrap();
    let bytes = function.dump(&vm, false).unwrap();

    assert_eq!(binary_chunk::undump(&bytes), Ok(proto));

    vm.globals().set("x", 7, &mut vm).unwrap();

    let reloaded = vm.load_chunk(&bytes, None).unwrap();
    let err = reloaded.call::<_, Value>((), &mut vm).unwrap_err();
    assert_eq!(err.message(), "test.lua:3: attempt to perform 'n//0'");
}

#[test]
fn stripped_functions_lose_debug_info() {
    let mut vm = Vm::with_seed(0);

    let function = vm.load_function(&divide_global(), None).unwrap();
    let full = function.dump(&vm, false).unwrap();
    let stripped = function.dump(&vm, true).unwrap();

    assert!(stripped.len() < full.len());

    vm.globals().set("x", 7, &mut vm).unwrap();

    let reloaded = vm.load_chunk(&stripped, None).unwrap();
    let err = reloaded.call::<_, Value>((), &mut vm).unwrap_err();

    assert_eq!(err.data, RuntimeErrorData::DivideByZero);
    assert_eq!(err.message(), "?:0: attempt to perform 'n//0'");
}

#[test]
fn reloaded_chunks_use_the_given_environment() {
    let mut vm = Vm::with_seed(0);
    let proto = main_function(
        vec![abc(OpCode::GetTabUp, 0, 0, 0), return1(0)],
        vec!["x".into()],
        1,
    );

    let bytes = binary_chunk::dump(&proto, false);
    let env = vm.create_table();
    env.set("x", "from env", &mut vm).unwrap();

    let function = vm.load_chunk(&bytes, Some(&env)).unwrap();
    let result: String = function.call((), &mut vm).unwrap();
    assert_eq!(result, "from env");
}

#[test]
fn native_functions_cannot_be_dumped() {
    let mut vm = Vm::with_seed(0);
    let function = vm.create_native_function(|_| Ok(0));

    let err = function.dump(&vm, false).unwrap_err();
    assert_eq!(err.to_string(), "error: unable to dump given function");
}

#[test]
fn bad_chunks_are_rejected() {
    let mut vm = Vm::with_seed(0);

    let err = vm.load_chunk(b"return 1", None).unwrap_err();
    assert_eq!(
        err.data,
        RuntimeErrorData::CorruptChunk(ChunkError::BadSignature)
    );

    let bytes = binary_chunk::dump(&main_function(vec![load_i(0, 1)], vec![], 1), false);

    let err = vm.load_chunk(&bytes[..bytes.len() - 3], None).unwrap_err();
    assert_eq!(err.data, RuntimeErrorData::CorruptChunk(ChunkError::Truncated));

    let mut wrong_version = bytes.clone();
    wrong_version[4] = 0x53;

    let err = vm.load_chunk(&wrong_version, None).unwrap_err();
    assert_eq!(
        err.data,
        RuntimeErrorData::CorruptChunk(ChunkError::VersionMismatch(0x53))
    );
}
