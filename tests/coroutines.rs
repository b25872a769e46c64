mod common;

use common::{abc, load_i, main_function, return1};
use new_moon::errors::RuntimeErrorData;
use new_moon::interpreter::{
    FunctionRef, Instruction, MultiValue, OpCode, ThreadStatus, Value, Vm, VmContext,
};
use pretty_assertions::assert_eq;

fn register_pause(vm: &mut Vm) {
    vm.register_native_function("pause", |ctx| {
        let count = ctx.top();
        Err(ctx.yield_(count))
    })
    .unwrap();
}

/// `local n = pause(1); return n + 10`
fn pause_then_add(vm: &mut Vm) -> FunctionRef {
    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            load_i(1, 1),
            abc(OpCode::Call, 0, 2, 2),
            abc(OpCode::AddI, 0, 0, Instruction::signed_arg(10)),
            return1(0),
        ],
        vec!["pause".into()],
        2,
    );

    vm.load_function(&proto, None).unwrap()
}

#[test]
fn yield_and_resume() {
    let mut vm = Vm::with_seed(0);
    register_pause(&mut vm);

    let function = pause_then_add(&mut vm);
    let thread = vm.create_thread(&function).unwrap();

    assert_eq!(thread.status(&vm).unwrap(), ThreadStatus::Suspended);

    let yielded: i64 = thread.resume((), &mut vm).unwrap();
    assert_eq!(yielded, 1);
    assert_eq!(thread.status(&vm).unwrap(), ThreadStatus::Suspended);

    let returned: i64 = thread.resume(5, &mut vm).unwrap();
    assert_eq!(returned, 15);
    assert_eq!(thread.status(&vm).unwrap(), ThreadStatus::Dead);

    let err = thread.resume::<_, ()>((), &mut vm).unwrap_err();
    assert_eq!(err.data, RuntimeErrorData::DeadCoroutine);
}

#[test]
fn first_resume_passes_arguments() {
    let mut vm = Vm::with_seed(0);

    // return ...
    let proto = main_function(
        vec![
            abc(OpCode::VarArg, 0, 0, 0),
            abc(OpCode::Return, 0, 0, 0),
        ],
        vec![],
        1,
    );

    let function = vm.load_function(&proto, None).unwrap();
    let thread = vm.create_thread(&function).unwrap();

    let results: Vec<String> = thread.resume(("a", "b"), &mut vm).unwrap();
    assert_eq!(results, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(thread.status(&vm).unwrap(), ThreadStatus::Dead);
}

#[test]
fn native_function_as_coroutine_body() {
    let mut vm = Vm::with_seed(0);

    let function = vm.create_native_function(|ctx| {
        let value: i64 = ctx.get(1)?;
        ctx.push(value * 2)?;
        Err(ctx.yield_(1))
    });

    let thread = vm.create_thread(&function).unwrap();

    let yielded: i64 = thread.resume(21, &mut vm).unwrap();
    assert_eq!(yielded, 42);

    // the native's frame is gone, resuming returns the resume arguments
    let returned: (String, bool) = thread.resume(("done", true), &mut vm).unwrap();
    assert_eq!(returned, ("done".to_string(), true));
    assert_eq!(thread.status(&vm).unwrap(), ThreadStatus::Dead);
}

#[test]
fn yield_outside_of_a_coroutine() {
    let mut vm = Vm::with_seed(0);
    register_pause(&mut vm);

    let function = pause_then_add(&mut vm);
    let err = function.call::<_, ()>((), &mut vm).unwrap_err();

    assert_eq!(err.data, RuntimeErrorData::Yield);
}

#[test]
fn yield_across_a_native_call() {
    let mut vm = Vm::with_seed(0);
    register_pause(&mut vm);

    let inner = pause_then_add(&mut vm);
    vm.globals().set("inner", inner, &mut vm).unwrap();

    vm.register_native_function("call_inner", |ctx: &mut VmContext| {
        let inner: FunctionRef = ctx.globals().get("inner", ctx)?;
        inner.call::<_, ()>((), ctx)?;
        Ok(0)
    })
    .unwrap();

    let proto = main_function(
        vec![
            abc(OpCode::GetTabUp, 0, 0, 0),
            abc(OpCode::Call, 0, 1, 1),
            abc(OpCode::Return0, 0, 0, 0),
        ],
        vec!["call_inner".into()],
        1,
    );

    let function = vm.load_function(&proto, None).unwrap();
    let thread = vm.create_thread(&function).unwrap();

    let err = thread.resume::<_, ()>((), &mut vm).unwrap_err();
    assert_eq!(err.data, RuntimeErrorData::InvalidYield);
    assert_eq!(thread.status(&vm).unwrap(), ThreadStatus::Dead);
}

#[test]
fn errors_kill_the_coroutine() {
    let mut vm = Vm::with_seed(0);

    let function = vm.create_native_function(|ctx| {
        ctx.push("oops")?;
        Err(ctx.error())
    });

    let thread = vm.create_thread(&function).unwrap();
    let err = thread.resume::<_, ()>((), &mut vm).unwrap_err();

    assert_eq!(err.data, RuntimeErrorData::ByteString("oops".into()));
    assert_eq!(thread.status(&vm).unwrap(), ThreadStatus::Dead);
}

#[test]
fn running_and_normal_status() {
    let mut vm = Vm::with_seed(0);
    let outer_status = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let statuses = outer_status.clone();

    let main_thread = vm.main_thread();

    let function = vm.create_native_function(move |ctx| {
        let current: Value = ctx.get(1)?;
        let Value::Thread(current) = current else {
            return Ok(0);
        };

        statuses.borrow_mut().push(current.status(ctx)?);
        statuses.borrow_mut().push(main_thread.status(ctx)?);
        Ok(0)
    });

    let thread = vm.create_thread(&function).unwrap();
    let _: MultiValue = thread.resume(thread.clone(), &mut vm).unwrap();

    assert_eq!(
        *outer_status.borrow(),
        vec![ThreadStatus::Running, ThreadStatus::Normal]
    );
    assert_eq!(vm.main_thread().status(&vm).unwrap(), ThreadStatus::Running);
}
