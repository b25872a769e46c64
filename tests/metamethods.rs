mod common;

use common::{abc, abck, load_i, main_function, return1};
use new_moon::errors::RuntimeErrorData;
use new_moon::interpreter::{Instruction, OpCode, TableRef, TypeName, Value, Vm};
use pretty_assertions::assert_eq;
use std::cell::Cell;
use std::rc::Rc;

/// `return t.x`
fn read_field(vm: &mut Vm) -> new_moon::interpreter::FunctionRef {
    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            abc(OpCode::GetField, 0, 0, 1),
            return1(0),
        ],
        vec!["t".into(), "x".into()],
        1,
    );

    vm.load_function(&proto, None).unwrap()
}

/// `if a <op> b then return true else return false end`
fn test_globals(vm: &mut Vm, op: OpCode) -> new_moon::interpreter::FunctionRef {
    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            abc(OpCode::GetTabUp, 1, 0, 1),
            abck(op, 0, 1, 0),
            Instruction::sj(OpCode::Jmp, 2),
            abc(OpCode::LoadBool, 2, 0, 0),
            return1(2),
            abc(OpCode::LoadBool, 2, 1, 0),
            return1(2),
        ],
        vec!["a".into(), "b".into()],
        3,
    );

    vm.load_function(&proto, None).unwrap()
}

fn with_metatable(vm: &mut Vm, metatable: &TableRef) -> TableRef {
    let table = vm.create_table();
    table.set_metatable(Some(metatable), vm).unwrap();
    table
}

#[test]
fn index_falls_back_to_a_table() {
    let mut vm = Vm::with_seed(0);

    let defaults = vm.create_table();
    defaults.set("x", "default", &mut vm).unwrap();

    let metatable = vm.create_table();
    metatable.set("__index", defaults, &mut vm).unwrap();

    let t = with_metatable(&mut vm, &metatable);
    vm.globals().set("t", t.clone(), &mut vm).unwrap();

    let function = read_field(&mut vm);
    assert_eq!(function.call::<_, String>((), &mut vm).unwrap(), "default");

    t.raw_set("x", "own", &mut vm).unwrap();
    assert_eq!(function.call::<_, String>((), &mut vm).unwrap(), "own");
}

#[test]
fn index_calls_a_function() {
    let mut vm = Vm::with_seed(0);

    let index = vm.create_native_function(|ctx| {
        let key: String = ctx.get(2)?;
        ctx.push(key.repeat(2))?;
        Ok(1)
    });

    let metatable = vm.create_table();
    metatable.set("__index", index, &mut vm).unwrap();

    let t = with_metatable(&mut vm, &metatable);
    vm.globals().set("t", t.clone(), &mut vm).unwrap();

    let function = read_field(&mut vm);
    assert_eq!(function.call::<_, String>((), &mut vm).unwrap(), "xx");

    // host access goes through the same path
    assert_eq!(t.get::<_, String>("ab", &mut vm).unwrap(), "abab");
    assert_eq!(t.raw_get::<_, Value>("ab", &mut vm).unwrap(), Value::Nil);
}

#[test]
fn newindex_redirects_assignments() {
    let mut vm = Vm::with_seed(0);

    let backing = vm.create_table();
    let metatable = vm.create_table();
    metatable.set("__newindex", backing.clone(), &mut vm).unwrap();

    let proxy = with_metatable(&mut vm, &metatable);
    vm.globals().set("t", proxy.clone(), &mut vm).unwrap();

    // t.x = 5
    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            abck(OpCode::SetField, 0, 1, 2),
            abc(OpCode::Return0, 0, 0, 0),
        ],
        vec!["t".into(), "x".into(), 5i64.into()],
        1,
    );

    let function = vm.load_function(&proto, None).unwrap();
    function.call::<_, ()>((), &mut vm).unwrap();

    assert_eq!(proxy.raw_get::<_, Value>("x", &mut vm).unwrap(), Value::Nil);
    assert_eq!(backing.raw_get::<_, i64>("x", &mut vm).unwrap(), 5);

    // existing keys skip the metamethod
    proxy.raw_set("x", 1, &mut vm).unwrap();
    function.call::<_, ()>((), &mut vm).unwrap();
    assert_eq!(proxy.raw_get::<_, i64>("x", &mut vm).unwrap(), 5);
}

#[test]
fn arithmetic_metamethods() {
    let mut vm = Vm::with_seed(0);

    let add = vm.create_native_function(|ctx| {
        let lhs: TableRef = ctx.get(1)?;
        let rhs: i64 = ctx.get(2)?;
        let value: i64 = lhs.raw_get("value", ctx)?;
        ctx.push(value + rhs)?;
        Ok(1)
    });
    let unm = vm.create_native_function(|ctx| {
        ctx.push("negated")?;
        Ok(1)
    });

    let metatable = vm.create_table();
    metatable.set("__add", add, &mut vm).unwrap();
    metatable.set("__unm", unm, &mut vm).unwrap();

    let t = with_metatable(&mut vm, &metatable);
    t.raw_set("value", 10, &mut vm).unwrap();
    vm.globals().set("t", t, &mut vm).unwrap();

    // return t + 5, -t
    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            load_i(1, 5),
            abc(OpCode::Add, 1, 0, 1),
            abc(OpCode::Unm, 2, 0, 0),
            abc(OpCode::Return, 1, 3, 0),
        ],
        vec!["t".into()],
        3,
    );

    let function = vm.load_function(&proto, None).unwrap();
    let (sum, negated): (i64, String) = function.call((), &mut vm).unwrap();

    assert_eq!(sum, 15);
    assert_eq!(negated, "negated");
}

#[test]
fn arithmetic_without_a_metamethod_fails() {
    let mut vm = Vm::with_seed(0);
    let t = vm.create_table();
    vm.globals().set("t", t, &mut vm).unwrap();

    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            load_i(1, 5),
            abc(OpCode::Add, 1, 0, 1),
            return1(1),
        ],
        vec!["t".into()],
        2,
    );

    let function = vm.load_function(&proto, None).unwrap();
    let err = function.call::<_, Value>((), &mut vm).unwrap_err();

    assert_eq!(
        err.data,
        RuntimeErrorData::InvalidArithmetic(TypeName::Table)
    );
    assert_eq!(
        err.message(),
        "test.lua:3: attempt to perform arithmetic on a table value"
    );
}

#[test]
fn call_passes_the_object_first() {
    let mut vm = Vm::with_seed(0);

    let call = vm.create_native_function(|ctx| {
        let this: Value = ctx.get(1)?;
        let arg: i64 = ctx.get(2)?;
        ctx.push(this.type_name() == TypeName::Table)?;
        ctx.push(arg * 3)?;
        Ok(2)
    });

    let metatable = vm.create_table();
    metatable.set("__call", call, &mut vm).unwrap();

    let callable = with_metatable(&mut vm, &metatable);
    vm.globals().set("callable", callable, &mut vm).unwrap();

    // return callable(7)
    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            load_i(1, 7),
            abc(OpCode::Call, 0, 2, 0),
            abc(OpCode::Return, 0, 0, 0),
        ],
        vec!["callable".into()],
        2,
    );

    let function = vm.load_function(&proto, None).unwrap();
    let results: (bool, i64) = function.call((), &mut vm).unwrap();
    assert_eq!(results, (true, 21));
}

#[test]
fn call_loops_are_not_callable() {
    let mut vm = Vm::with_seed(0);

    let metatable = vm.create_table();
    metatable.set("__call", metatable.clone(), &mut vm).unwrap();
    metatable.set_metatable(Some(&metatable), &mut vm).unwrap();

    let callable = with_metatable(&mut vm, &metatable);
    vm.globals().set("callable", callable, &mut vm).unwrap();

    // return callable()
    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            abc(OpCode::Call, 0, 1, 0),
            abc(OpCode::Return, 0, 0, 0),
        ],
        vec!["callable".into()],
        1,
    );

    let function = vm.load_function(&proto, None).unwrap();
    let err = function.call::<_, Value>((), &mut vm).unwrap_err();

    assert_eq!(err.data, RuntimeErrorData::NotCallable(TypeName::Table));
    assert_eq!(err.message(), "test.lua:2: attempt to call a table value");
}

#[test]
fn equality_consults_eq_for_distinct_tables() {
    let mut vm = Vm::with_seed(0);

    let eq = vm.create_native_function(|ctx| {
        ctx.push(true)?;
        Ok(1)
    });

    let metatable = vm.create_table();
    metatable.set("__eq", eq, &mut vm).unwrap();

    let a = with_metatable(&mut vm, &metatable);
    let b = with_metatable(&mut vm, &metatable);
    let plain = vm.create_table();

    let globals = vm.globals();
    globals.set("a", a, &mut vm).unwrap();
    globals.set("b", b, &mut vm).unwrap();

    let function = test_globals(&mut vm, OpCode::Eq);
    assert_eq!(function.call::<_, bool>((), &mut vm).unwrap(), true);

    // tables without __eq compare by identity
    globals.set("b", plain, &mut vm).unwrap();
    metatable.set("__eq", Value::Nil, &mut vm).unwrap();
    assert_eq!(function.call::<_, bool>((), &mut vm).unwrap(), false);
}

#[test]
fn ordering_metamethods() {
    let mut vm = Vm::with_seed(0);

    let lt = vm.create_native_function(|ctx| {
        let a: TableRef = ctx.get(1)?;
        let b: TableRef = ctx.get(2)?;
        let a: i64 = a.raw_get("rank", ctx)?;
        let b: i64 = b.raw_get("rank", ctx)?;
        ctx.push(a < b)?;
        Ok(1)
    });

    let metatable = vm.create_table();
    metatable.set("__lt", lt, &mut vm).unwrap();

    let a = with_metatable(&mut vm, &metatable);
    let b = with_metatable(&mut vm, &metatable);
    a.raw_set("rank", 1, &mut vm).unwrap();
    b.raw_set("rank", 2, &mut vm).unwrap();

    let globals = vm.globals();
    globals.set("a", a, &mut vm).unwrap();
    globals.set("b", b, &mut vm).unwrap();

    let less = test_globals(&mut vm, OpCode::Lt);
    assert_eq!(less.call::<_, bool>((), &mut vm).unwrap(), true);

    // `a <= b` falls back to `not (b < a)`
    let less_equal = test_globals(&mut vm, OpCode::Le);
    assert_eq!(less_equal.call::<_, bool>((), &mut vm).unwrap(), true);
}

#[test]
fn comparing_mismatched_types_fails() {
    let mut vm = Vm::with_seed(0);
    let globals = vm.globals();
    globals.set("a", 1, &mut vm).unwrap();
    globals.set("b", "2", &mut vm).unwrap();

    let function = test_globals(&mut vm, OpCode::Lt);
    let err = function.call::<_, bool>((), &mut vm).unwrap_err();

    assert_eq!(
        err.data,
        RuntimeErrorData::InvalidCompare(TypeName::Number, TypeName::String)
    );
    assert_eq!(
        err.message(),
        "test.lua:3: attempt to compare number with string"
    );
}

#[test]
fn length_and_concat() {
    let mut vm = Vm::with_seed(0);

    let len = vm.create_native_function(|ctx| {
        ctx.push(99)?;
        Ok(1)
    });
    let concat = vm.create_native_function(|ctx| {
        let lhs: String = ctx.get(1)?;
        ctx.push(format!("{lhs}T"))?;
        Ok(1)
    });

    let metatable = vm.create_table();
    metatable.set("__len", len, &mut vm).unwrap();
    metatable.set("__concat", concat, &mut vm).unwrap();

    let t = with_metatable(&mut vm, &metatable);
    vm.globals().set("t", t, &mut vm).unwrap();

    // return #t, "x" .. t
    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            abc(OpCode::Len, 0, 0, 0),
            Instruction::abx(OpCode::LoadK, 1, 1),
            abc(OpCode::GetTabUp, 2, 0, 0),
            abc(OpCode::Concat, 1, 2, 0),
            abc(OpCode::Return, 0, 3, 0),
        ],
        vec!["t".into(), "x".into()],
        3,
    );

    let function = vm.load_function(&proto, None).unwrap();
    let (length, joined): (i64, String) = function.call((), &mut vm).unwrap();

    assert_eq!(length, 99);
    assert_eq!(joined, "xT");
}

#[test]
fn index_loops_are_detected() {
    let mut vm = Vm::with_seed(0);

    let metatable = vm.create_table();
    metatable.set("__index", metatable.clone(), &mut vm).unwrap();
    metatable.set_metatable(Some(&metatable), &mut vm).unwrap();

    let t = with_metatable(&mut vm, &metatable);
    let err = t.get::<_, Value>("missing", &mut vm).unwrap_err();

    assert_eq!(err.data, RuntimeErrorData::MetatableChainTooLong);
}

#[test]
fn close_only_closes_up_values() {
    let mut vm = Vm::with_seed(0);
    let calls = Rc::new(Cell::new(0));

    let close = {
        let calls = calls.clone();
        vm.create_native_function(move |_| {
            calls.set(calls.get() + 1);
            Ok(0)
        })
    };

    let metatable = vm.create_table();
    metatable.set("__close", close, &mut vm).unwrap();

    let t = with_metatable(&mut vm, &metatable);
    vm.globals().set("t", t, &mut vm).unwrap();

    // local x = t; close from x; return x
    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            abc(OpCode::Close, 0, 0, 0),
            return1(0),
        ],
        vec!["t".into()],
        1,
    );

    let function = vm.load_function(&proto, None).unwrap();
    let result: Value = function.call((), &mut vm).unwrap();

    assert_eq!(result.type_name(), TypeName::Table);
    assert_eq!(calls.get(), 0);
}

#[test]
fn strings_share_a_type_metatable() {
    let mut vm = Vm::with_seed(0);

    let shout = vm.create_native_function(|ctx| {
        let text: String = ctx.get(1)?;
        ctx.push(text.to_uppercase())?;
        Ok(1)
    });

    let methods = vm.create_table();
    methods.set("shout", shout, &mut vm).unwrap();

    let metatable = vm.create_table();
    metatable.set("__index", methods, &mut vm).unwrap();
    vm.set_type_metatable(TypeName::String, Some(&metatable))
        .unwrap();

    // return ("hey"):shout()
    let proto = main_function(
        vec![
            Instruction::abx(OpCode::LoadK, 0, 0),
            abck(OpCode::SelfField, 0, 0, 1),
            abc(OpCode::Call, 0, 2, 2),
            return1(0),
        ],
        vec!["hey".into(), "shout".into()],
        2,
    );

    let function = vm.load_function(&proto, None).unwrap();
    assert_eq!(function.call::<_, String>((), &mut vm).unwrap(), "HEY");
}
