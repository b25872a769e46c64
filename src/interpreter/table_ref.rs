use super::heap::HeapRef;
use super::value_stack::StackValue;
use super::{FromValue, IntoValue, Value, Vm};
use crate::errors::{RuntimeError, RuntimeErrorData};
use slotmap::Key;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef(pub(crate) HeapRef);

impl TableRef {
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.key().data().as_ffi()
    }

    fn stack_value(&self) -> StackValue {
        StackValue::Table(self.0.key())
    }

    pub fn metatable(&self, vm: &mut Vm) -> Result<Option<TableRef>, RuntimeError> {
        let heap = &mut vm.execution_data.heap;
        let Some(table) = heap.table(self.0.key()) else {
            return Err(RuntimeErrorData::InvalidRef.into());
        };

        Ok(table.metatable().map(|key| TableRef(heap.create_ref(key))))
    }

    /// Replaces the metatable, a `__gc` field present at this point marks the table for finalization
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

        vm.set_metatable_of(self.stack_value(), metatable_key)?;
        Ok(())
    }

    /// Gets a value from the table without invoking the `__index` metamethod.
    pub fn raw_get<K: IntoValue, V: FromValue>(
        &self,
        key: K,
        vm: &mut Vm,
    ) -> Result<V, RuntimeError> {
        let key = key.into_value(vm)?;
        key.test_validity(&vm.execution_data.heap)?;

        let value = vm.raw_get_value(self.stack_value(), key.to_stack_value())?;
        let value = Value::from_stack_value(&mut vm.execution_data.heap, value);

        V::from_value(value, vm)
    }

    /// Sets a value on the table without invoking the `__newindex` metamethod.
    pub fn raw_set<K: IntoValue, V: IntoValue>(
        &self,
        key: K,
        value: V,
        vm: &mut Vm,
    ) -> Result<(), RuntimeError> {
        let key = key.into_value(vm)?;
        let value = value.into_value(vm)?;

        // invalid keys must never be stored in the vm
        let heap = &vm.execution_data.heap;
        key.test_validity(heap)?;
        value.test_validity(heap)?;

        vm.raw_set_value(self.stack_value(), key.to_stack_value(), value.to_stack_value())
    }

    /// A border of the table, without invoking the `__len` metamethod.
    pub fn raw_len(&self, vm: &Vm) -> Result<usize, RuntimeError> {
        let heap = &vm.execution_data.heap;
        let Some(table) = heap.table(self.0.key()) else {
            return Err(RuntimeErrorData::InvalidRef.into());
        };

        Ok(table.border(&heap.strings).max(0) as usize)
    }

    /// Indexes the table, `__index` applies.
    pub fn get<K: IntoValue, V: FromValue>(&self, key: K, vm: &mut Vm) -> Result<V, RuntimeError> {
        let key = key.into_value(vm)?;
        key.test_validity(&vm.execution_data.heap)?;

        let value = vm.index_value(self.stack_value(), key.to_stack_value())?;
        let value = Value::from_stack_value(&mut vm.execution_data.heap, value);

        V::from_value(value, vm)
    }

    /// Assigns to the table, `__newindex` applies.
    pub fn set<K: IntoValue, V: IntoValue>(
        &self,
        key: K,
        value: V,
        vm: &mut Vm,
    ) -> Result<(), RuntimeError> {
        let key = key.into_value(vm)?;
        let value = value.into_value(vm)?;

        let heap = &vm.execution_data.heap;
        key.test_validity(heap)?;
        value.test_validity(heap)?;

        vm.set_index_value(self.stack_value(), key.to_stack_value(), value.to_stack_value())
    }

    /// The length of the table, `__len` applies.
    pub fn len<V: FromValue>(&self, vm: &mut Vm) -> Result<V, RuntimeError> {
        let value = vm.length_of(self.stack_value())?;
        let value = Value::from_stack_value(&mut vm.execution_data.heap, value);

        V::from_value(value, vm)
    }

    /// The entry following `key`, `Value::Nil` starts the traversal
    pub fn next<K: IntoValue, NK: FromValue, NV: FromValue>(
        &self,
        key: K,
        vm: &mut Vm,
    ) -> Result<Option<(NK, NV)>, RuntimeError> {
        let key = key.into_value(vm)?;
        key.test_validity(&vm.execution_data.heap)?;

        let heap = &mut vm.execution_data.heap;
        let Some(table) = heap.table(self.0.key()) else {
            return Err(RuntimeErrorData::InvalidRef.into());
        };

        let Some((next_key, next_value)) = table.next(key.to_stack_value(), &heap.strings)? else {
            return Ok(None);
        };

        let next_key = Value::from_stack_value(heap, next_key);
        let next_value = Value::from_stack_value(heap, next_value);

        Ok(Some((NK::from_value(next_key, vm)?, NV::from_value(next_value, vm)?)))
    }

    /// Removes every entry, the metatable is kept
    pub fn clear(&self, vm: &mut Vm) -> Result<(), RuntimeError> {
        let data = &mut vm.execution_data;
        let Some((table, _)) = data.heap.table_mut(&mut data.gc, self.0.key()) else {
            return Err(RuntimeErrorData::InvalidRef.into());
        };

        table.clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn raw_access() {
        let mut vm = Vm::with_seed(0);
        let table = vm.create_table();

        table.raw_set(1, "a", &mut vm).unwrap();
        table.raw_set(2, "b", &mut vm).unwrap();
        table.raw_set("key", 5, &mut vm).unwrap();

        assert_eq!(table.raw_len(&vm).unwrap(), 2);
        assert_eq!(table.raw_get::<_, String>(2, &mut vm).unwrap(), "b");
        assert_eq!(table.raw_get::<_, i64>("key", &mut vm).unwrap(), 5);
        assert_eq!(table.raw_get::<_, Value>(3, &mut vm).unwrap(), Value::Nil);
    }

    #[test]
    fn float_keys_with_integer_values_are_normalized() {
        let mut vm = Vm::with_seed(0);
        let table = vm.create_table();

        table.raw_set(2.0, true, &mut vm).unwrap();
        assert_eq!(table.raw_get::<_, bool>(2, &mut vm).unwrap(), true);
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        let mut vm = Vm::with_seed(0);
        let table = vm.create_table();

        let err = table.raw_set(Value::Nil, 1, &mut vm).unwrap_err();
        assert_eq!(err.data, RuntimeErrorData::NilIndex);

        let err = table.raw_set(f64::NAN, 1, &mut vm).unwrap_err();
        assert_eq!(err.data, RuntimeErrorData::NaNIndex);
    }

    #[test]
    fn traversal_visits_every_entry() {
        let mut vm = Vm::with_seed(0);
        let table = vm.create_table();

        for i in 1..=3 {
            table.raw_set(i, i * 10, &mut vm).unwrap();
        }

        table.raw_set("x", 1, &mut vm).unwrap();

        let mut key = Value::Nil;
        let mut count = 0;

        while let Some((next_key, _)) = table.next::<_, Value, Value>(key, &mut vm).unwrap() {
            key = next_key;
            count += 1;
        }

        assert_eq!(count, 4);
    }

    #[test]
    fn clear_keeps_metatable() {
        let mut vm = Vm::with_seed(0);
        let table = vm.create_table();
        let metatable = vm.create_table();

        table.raw_set(1, 1, &mut vm).unwrap();
        table.set_metatable(Some(&metatable), &mut vm).unwrap();
        table.clear(&mut vm).unwrap();

        assert_eq!(table.raw_len(&vm).unwrap(), 0);
        assert_eq!(table.metatable(&mut vm).unwrap(), Some(metatable));
    }
}
