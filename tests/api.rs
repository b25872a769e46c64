use new_moon::errors::{RuntimeError, RuntimeErrorData};
use new_moon::interpreter::{CallStatus, TableRef, TypeName, Value, Vm};
use pretty_assertions::assert_eq;

#[test]
fn push_and_read() {
    let mut vm = Vm::with_seed(0);
    let mut ctx = vm.context();

    ctx.push(1).unwrap();
    ctx.push("two").unwrap();
    ctx.push(3.5).unwrap();

    assert_eq!(ctx.top(), 3);
    assert_eq!(ctx.get::<i64>(1).unwrap(), 1);
    assert_eq!(ctx.get::<String>(-2).unwrap(), "two");
    assert_eq!(ctx.type_name(-1).unwrap(), TypeName::Number);
    assert_eq!(ctx.get::<Value>(10).unwrap(), Value::Nil);

    assert_eq!(ctx.pop::<f64>().unwrap(), 3.5);
    assert_eq!(ctx.top(), 2);
}

#[test]
fn invalid_indices() {
    let mut vm = Vm::with_seed(0);
    let mut ctx = vm.context();

    ctx.push(1).unwrap();

    let err = ctx.get::<Value>(-2).unwrap_err();
    assert_eq!(err.data, RuntimeErrorData::InvalidStackIndex(-2));

    let err = ctx.get::<Value>(0).unwrap_err();
    assert_eq!(err.data, RuntimeErrorData::InvalidStackIndex(0));
}

#[test]
fn shuffle_values() {
    let mut vm = Vm::with_seed(0);
    let mut ctx = vm.context();

    for i in 1..=4 {
        ctx.push(i).unwrap();
    }

    // 1 2 3 4 -> 1 4 2 3
    ctx.insert(2).unwrap();
    // 1 4 2 3 -> 1 2 3
    ctx.remove(2).unwrap();
    // 1 2 3 9 -> 9 2 3
    ctx.push(9).unwrap();
    ctx.replace(1).unwrap();
    // 9 2 3 2
    ctx.push_copy(2).unwrap();

    let values: Vec<i64> = (1..=4).map(|i| ctx.get(i).unwrap()).collect();
    assert_eq!(values, vec![9, 2, 3, 2]);
}

#[test]
fn set_top_fills_with_nil() {
    let mut vm = Vm::with_seed(0);
    let mut ctx = vm.context();

    ctx.push(true).unwrap();
    ctx.set_top(3).unwrap();

    assert_eq!(ctx.top(), 3);
    assert_eq!(ctx.get::<Value>(3).unwrap(), Value::Nil);

    ctx.set_top(0).unwrap();
    assert_eq!(ctx.top(), 0);
}

#[test]
fn fields_and_globals() {
    let mut vm = Vm::with_seed(0);
    let mut ctx = vm.context();

    ctx.new_table().unwrap();
    ctx.push("value").unwrap();
    ctx.set_field(1, "key").unwrap();

    assert_eq!(ctx.get_field(1, "key").unwrap(), TypeName::String);
    assert_eq!(ctx.pop::<String>().unwrap(), "value");

    ctx.push_copy(1).unwrap();
    ctx.set_global("config").unwrap();
    assert_eq!(ctx.top(), 1);

    assert_eq!(ctx.get_global("config").unwrap(), TypeName::Table);
    assert!(ctx.raw_equal(1, 2).unwrap());

    assert_eq!(ctx.get_global("missing").unwrap(), TypeName::Nil);
}

#[test]
fn table_indexing_with_keys_on_the_stack() {
    let mut vm = Vm::with_seed(0);
    let mut ctx = vm.context();

    ctx.new_table().unwrap();
    ctx.push(1).unwrap();
    ctx.push("one").unwrap();
    ctx.set_table(1).unwrap();

    ctx.push(1).unwrap();
    assert_eq!(ctx.get_table(1).unwrap(), TypeName::String);
    assert_eq!(ctx.pop::<String>().unwrap(), "one");

    ctx.push(1).unwrap();
    ctx.raw_get(1).unwrap();
    assert_eq!(ctx.pop::<String>().unwrap(), "one");

    assert_eq!(ctx.raw_len(1).unwrap(), 1);
}

#[test]
fn traversal_with_next() {
    let mut vm = Vm::with_seed(0);
    let mut ctx = vm.context();

    ctx.new_table().unwrap();

    for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
        ctx.push(name).unwrap();
        ctx.push(i as i64 + 1).unwrap();
        ctx.set_table(1).unwrap();
    }

    let mut total = 0;
    ctx.push(Value::Nil).unwrap();

    while ctx.next(1).unwrap() {
        total += ctx.pop::<i64>().unwrap();
    }

    assert_eq!(total, 6);
    assert_eq!(ctx.top(), 1);
}

#[test]
fn metatables_through_the_stack() {
    let mut vm = Vm::with_seed(0);
    let index = vm.create_native_function(|ctx| {
        let key: String = ctx.get(2)?;
        ctx.push(format!("missing {key}"))?;
        Ok(1)
    });

    let mut ctx = vm.context();

    ctx.new_table().unwrap();
    ctx.new_table().unwrap();
    ctx.push(index).unwrap();
    ctx.set_field(2, "__index").unwrap();
    ctx.set_metatable(1).unwrap();

    assert!(ctx.get_metatable(1).unwrap());
    ctx.set_top(1).unwrap();

    ctx.get_field(1, "name").unwrap();
    assert_eq!(ctx.pop::<String>().unwrap(), "missing name");

    ctx.push("name").unwrap();
    ctx.raw_get(1).unwrap();
    assert_eq!(ctx.pop::<Value>().unwrap(), Value::Nil);
}

#[test]
fn length_with_and_without_metamethods() {
    let mut vm = Vm::with_seed(0);
    let len = vm.create_native_function(|ctx| {
        ctx.push(42)?;
        Ok(1)
    });

    let mut ctx = vm.context();

    ctx.push("four").unwrap();
    ctx.len(1).unwrap();
    assert_eq!(ctx.pop::<i64>().unwrap(), 4);

    ctx.new_table().unwrap();
    ctx.new_table().unwrap();
    ctx.push(len).unwrap();
    ctx.set_field(3, "__len").unwrap();
    ctx.set_metatable(2).unwrap();

    ctx.len(2).unwrap();
    assert_eq!(ctx.pop::<i64>().unwrap(), 42);
    assert_eq!(ctx.raw_len(2).unwrap(), 0);
}

#[test]
fn calls_through_the_stack() {
    let mut vm = Vm::with_seed(0);
    let sum = vm.create_native_function(|ctx| {
        let mut total = 0;

        for i in 1..=ctx.top() {
            total += ctx.get::<i64>(i as isize)?;
        }

        ctx.push(total)?;
        ctx.push("extra")?;
        Ok(2)
    });

    let mut ctx = vm.context();

    ctx.push(sum.clone()).unwrap();
    ctx.push(1).unwrap();
    ctx.push(2).unwrap();
    ctx.call(2, Some(1)).unwrap();

    assert_eq!(ctx.top(), 1);
    assert_eq!(ctx.pop::<i64>().unwrap(), 3);

    ctx.push(sum).unwrap();
    ctx.push(5).unwrap();
    ctx.call(1, None).unwrap();

    assert_eq!(ctx.top(), 2);
    assert_eq!(ctx.get::<i64>(1).unwrap(), 5);
    assert_eq!(ctx.get::<String>(2).unwrap(), "extra");
}

#[test]
fn protected_calls_push_the_error() {
    let mut vm = Vm::with_seed(0);
    let raise_value = vm.create_native_function(|ctx| {
        ctx.push("boom")?;
        Err(ctx.error())
    });
    let raise_table = vm.create_native_function(|ctx| {
        ctx.new_table()?;
        Err(ctx.error())
    });
    let raise_message = vm.create_native_function(|_| {
        Err(RuntimeError::from_message("static message"))
    });
    let raise_integer = vm.create_native_function(|_| Err(RuntimeError::from_value(Value::Integer(7))));

    let mut ctx = vm.context();

    ctx.push(raise_value).unwrap();
    assert_eq!(ctx.protected_call(0, Some(1)), CallStatus::RuntimeError);
    assert_eq!(ctx.pop::<String>().unwrap(), "boom");

    ctx.push(raise_table).unwrap();
    assert_eq!(ctx.protected_call(0, Some(1)), CallStatus::RuntimeError);
    assert_eq!(ctx.type_name(-1).unwrap(), TypeName::Table);
    ctx.pop::<TableRef>().unwrap();

    ctx.push(raise_message).unwrap();
    assert_eq!(ctx.protected_call(0, None), CallStatus::RuntimeError);
    assert_eq!(ctx.pop::<String>().unwrap(), "static message");

    ctx.push(raise_integer).unwrap();
    assert_eq!(ctx.protected_call(0, Some(1)), CallStatus::RuntimeError);
    assert_eq!(ctx.pop::<i64>().unwrap(), 7);

    ctx.push(Value::Nil).unwrap();
    assert_eq!(ctx.protected_call(0, None), CallStatus::RuntimeError);
    assert_eq!(ctx.pop::<String>().unwrap(), "attempt to call a nil value");

    assert_eq!(ctx.top(), 0);
}

#[test]
fn protected_calls_report_memory_errors() {
    let mut vm = Vm::with_seed(0);
    let allocate = vm.create_native_function(|ctx| loop {
        ctx.new_table_with_capacity(64, 64)?;
    });

    vm.gc_collect();
    vm.set_memory_limit(Some(vm.gc_used_memory() + 64 * 1024));

    let mut ctx = vm.context();
    ctx.push(allocate).unwrap();

    assert_eq!(ctx.protected_call(0, None), CallStatus::MemoryError);
    assert_eq!(ctx.pop::<String>().unwrap(), "not enough memory");
    assert_eq!(ctx.top(), 0);
}

#[test]
fn up_values_through_the_stack() {
    let mut vm = Vm::with_seed(0);
    let function = vm
        .create_native_closure(|_| Ok(0), vec![Value::Integer(1)].into())
        .unwrap();

    let mut ctx = vm.context();
    ctx.push(function).unwrap();

    assert!(ctx.get_up_value(1, 1).unwrap());
    assert_eq!(ctx.pop::<i64>().unwrap(), 1);

    ctx.push(2).unwrap();
    assert!(ctx.set_up_value(1, 1).unwrap());

    assert!(ctx.get_up_value(1, 1).unwrap());
    assert_eq!(ctx.pop::<i64>().unwrap(), 2);

    assert!(!ctx.get_up_value(1, 2).unwrap());
}

#[test]
fn userdata_on_the_stack() {
    struct Point {
        x: i32,
    }

    let mut vm = Vm::with_seed(0);
    let mut ctx = vm.context();

    ctx.new_userdata(Point { x: 3 }).unwrap();
    assert_eq!(ctx.type_name(1).unwrap(), TypeName::UserData);

    let userdata: new_moon::interpreter::UserDataRef = ctx.get(1).unwrap();
    assert_eq!(userdata.borrow::<Point>(&ctx).unwrap().x, 3);
}

#[test]
fn app_data() {
    let mut vm = Vm::with_seed(0);

    assert_eq!(vm.set_app_data(String::from("first")), None);
    assert_eq!(
        vm.set_app_data(String::from("second")),
        Some(String::from("first"))
    );

    vm.app_data_mut::<String>().unwrap().push('!');
    assert_eq!(vm.app_data::<String>().unwrap(), "second!");
    assert_eq!(vm.remove_app_data::<String>(), Some(String::from("second!")));
    assert_eq!(vm.app_data::<u32>(), None);
}

#[test]
fn type_metatables() {
    let mut vm = Vm::with_seed(0);
    let metatable = vm.create_table();

    vm.set_type_metatable(TypeName::String, Some(&metatable))
        .unwrap();
    assert_eq!(vm.type_metatable(TypeName::String), Some(metatable.clone()));

    let err = vm
        .set_type_metatable(TypeName::Table, Some(&metatable))
        .unwrap_err();
    assert!(matches!(err.data, RuntimeErrorData::String(_)));
}
