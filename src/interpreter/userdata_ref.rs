use super::heap::{HeapRef, HeapValue};
use super::userdata::UserData;
use super::value_stack::StackValue;
use super::{FromValue, IntoValue, TableRef, Value, Vm};
use crate::errors::{RuntimeError, RuntimeErrorData};
use slotmap::Key;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserDataRef(pub(crate) HeapRef);

fn type_mismatch<T>() -> RuntimeError {
    RuntimeErrorData::FromValueConversion {
        from: "userdata",
        to: std::any::type_name::<T>(),
        message: None,
    }
    .into()
}

impl UserDataRef {
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.key().data().as_ffi()
    }

    fn userdata<'vm>(&self, vm: &'vm Vm) -> Result<&'vm UserData, RuntimeError> {
        match vm.execution_data.heap.get(self.0.key()) {
            Some(HeapValue::UserData(userdata)) => Ok(&**userdata),
            _ => Err(RuntimeErrorData::InvalidRef.into()),
        }
    }

    /// Creates a userdata object holding `data`
    pub fn new<T: 'static>(data: T, vm: &mut Vm) -> UserDataRef {
        let execution_data = &mut vm.execution_data;
        let key = execution_data.heap.create(
            &mut execution_data.gc,
            HeapValue::UserData(Box::new(UserData::new(data))),
        );
        let userdata_ref = UserDataRef(execution_data.heap.create_ref(key));

        vm.step_gc_if_needed();

        userdata_ref
    }

    pub fn is<T: 'static>(&self, vm: &Vm) -> Result<bool, RuntimeError> {
        Ok(self.userdata(vm)?.data.is::<T>())
    }

    pub fn borrow<'vm, T: 'static>(&self, vm: &'vm Vm) -> Result<&'vm T, RuntimeError> {
        self.userdata(vm)?
            .data
            .downcast_ref::<T>()
            .map_err(|_| type_mismatch::<T>())
    }

    /// Mutating the payload can't create references the collector is unaware of
    pub fn borrow_mut<'vm, T: 'static>(&self, vm: &'vm mut Vm) -> Result<&'vm mut T, RuntimeError> {
        match vm.execution_data.heap.get_mut_unmarked(self.0.key()) {
            Some(HeapValue::UserData(userdata)) => userdata
                .data
                .downcast_mut::<T>()
                .map_err(|_| type_mismatch::<T>()),
            _ => Err(RuntimeErrorData::InvalidRef.into()),
        }
    }

    pub fn metatable(&self, vm: &mut Vm) -> Result<Option<TableRef>, RuntimeError> {
        let metatable = self.userdata(vm)?.metatable;
        let heap = &mut vm.execution_data.heap;

        Ok(metatable.map(|key| TableRef(heap.create_ref(key))))
    }

    /// Replaces the metatable, a `__gc` field present at this point marks the userdata for finalization
    pub fn set_metatable(
        &self,
        metatable_ref: Option<&TableRef>,
        vm: &mut Vm,
    ) -> Result<(), RuntimeError> {
        let metatable_key = match metatable_ref {
            Some(metatable_ref) => {
                Value::Table(metatable_ref.clone()).test_validity(&vm.execution_data.heap)?;
                Some(metatable_ref.0.key())
            }
            None => None,
        };

        vm.set_metatable_of(StackValue::UserData(self.0.key()), metatable_key)?;
        Ok(())
    }

    /// The value associated with the userdata, nil by default
    pub fn user_value<V: FromValue>(&self, vm: &mut Vm) -> Result<V, RuntimeError> {
        let value = self.userdata(vm)?.user_value;
        let value = Value::from_stack_value(&mut vm.execution_data.heap, value);
        V::from_value(value, vm)
    }

    pub fn set_user_value<V: IntoValue>(&self, value: V, vm: &mut Vm) -> Result<(), RuntimeError> {
        let value = value.into_value(vm)?;
        value.test_validity(&vm.execution_data.heap)?;

        let data = &mut vm.execution_data;

        match data.heap.get_mut(&mut data.gc, self.0.key()) {
            Some(HeapValue::UserData(userdata)) => {
                userdata.user_value = value.to_stack_value();
                Ok(())
            }
            _ => Err(RuntimeErrorData::InvalidRef.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Counter(u32);

    #[test]
    fn borrow_payload() {
        let mut vm = Vm::with_seed(0);
        let userdata = UserDataRef::new(Counter(1), &mut vm);

        userdata.borrow_mut::<Counter>(&mut vm).unwrap().0 += 1;

        assert_eq!(userdata.borrow::<Counter>(&vm).unwrap().0, 2);
        assert!(userdata.borrow::<String>(&vm).is_err());
        assert_eq!(userdata.is::<Counter>(&vm).unwrap(), true);
    }

    #[test]
    fn user_value_defaults_to_nil() {
        let mut vm = Vm::with_seed(0);
        let userdata = UserDataRef::new(Counter(0), &mut vm);

        assert_eq!(userdata.user_value::<Value>(&mut vm).unwrap(), Value::Nil);

        userdata.set_user_value(5, &mut vm).unwrap();
        assert_eq!(userdata.user_value::<i64>(&mut vm).unwrap(), 5);
    }
}
