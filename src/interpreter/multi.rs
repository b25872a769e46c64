use super::{FromValue, IntoValue, Value, Vm};
use crate::errors::{RuntimeError, RuntimeErrorData};

/// An ordered list of values passed to or returned from a call
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MultiValue {
    /// Stored in reverse so popping the first value is cheap
    values: Vec<Value>,
}

impl MultiValue {
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.values.clear();
    }

    #[inline]
    pub fn push_front(&mut self, value: Value) {
        self.values.push(value);
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Value> {
        self.values.pop()
    }

    pub fn push_back(&mut self, value: Value) {
        self.values.insert(0, value);
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        let len = self.values.len();

        if index >= len {
            return None;
        }

        self.values.get(len - 1 - index)
    }

    /// Front to back
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Value> {
        self.values.iter().rev()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().cloned().collect()
    }

    /// Removes and converts the first value, missing values convert from nil
    pub fn unpack_front<T: FromValue>(&mut self, vm: &mut Vm) -> Result<T, RuntimeError> {
        T::from_value(self.pop_front().unwrap_or_default(), vm)
    }
}

impl From<Vec<Value>> for MultiValue {
    fn from(mut values: Vec<Value>) -> Self {
        values.reverse();
        Self { values }
    }
}

impl FromIterator<Value> for MultiValue {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}

pub trait IntoMulti {
    fn into_multi(self, vm: &mut Vm) -> Result<MultiValue, RuntimeError>;
}

pub trait FromMulti: Sized {
    fn from_multi(multi: MultiValue, vm: &mut Vm) -> Result<Self, RuntimeError>;
}

impl IntoMulti for MultiValue {
    #[inline]
    fn into_multi(self, _: &mut Vm) -> Result<MultiValue, RuntimeError> {
        Ok(self)
    }
}

impl FromMulti for MultiValue {
    #[inline]
    fn from_multi(multi: MultiValue, _: &mut Vm) -> Result<Self, RuntimeError> {
        Ok(multi)
    }
}

impl IntoMulti for () {
    #[inline]
    fn into_multi(self, vm: &mut Vm) -> Result<MultiValue, RuntimeError> {
        Ok(vm.create_multi())
    }
}

impl FromMulti for () {
    #[inline]
    fn from_multi(multi: MultiValue, vm: &mut Vm) -> Result<Self, RuntimeError> {
        vm.store_multi(multi);
        Ok(())
    }
}

impl<T: IntoValue> IntoMulti for T {
    #[inline]
    fn into_multi(self, vm: &mut Vm) -> Result<MultiValue, RuntimeError> {
        let value = self.into_value(vm)?;
        let mut multi = vm.create_multi();
        multi.push_front(value);
        Ok(multi)
    }
}

impl<T: FromValue> FromMulti for T {
    #[inline]
    fn from_multi(mut multi: MultiValue, vm: &mut Vm) -> Result<Self, RuntimeError> {
        let value = multi.unpack_front(vm);
        vm.store_multi(multi);
        value
    }
}

impl<T: IntoValue> IntoMulti for Vec<T> {
    fn into_multi(self, vm: &mut Vm) -> Result<MultiValue, RuntimeError> {
        let mut multi = vm.create_multi();

        for value in self.into_iter().rev() {
            multi.push_front(value.into_value(vm)?);
        }

        Ok(multi)
    }
}

impl<T: FromValue> FromMulti for Vec<T> {
    fn from_multi(mut multi: MultiValue, vm: &mut Vm) -> Result<Self, RuntimeError> {
        let mut values = Vec::with_capacity(multi.len());

        while let Some(value) = multi.pop_front() {
            values.push(T::from_value(value, vm)?);
        }

        vm.store_multi(multi);
        Ok(values)
    }
}

macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: IntoValue,)+> IntoMulti for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_multi(self, vm: &mut Vm) -> Result<MultiValue, RuntimeError> {
                let ($($name,)+) = self;
                let values = [$($name.into_value(vm)?,)+];
                let mut multi = vm.create_multi();

                for value in values.into_iter().rev() {
                    multi.push_front(value);
                }

                Ok(multi)
            }
        }

        impl<$($name: FromValue,)+> FromMulti for ($($name,)+) {
            #[allow(non_snake_case)]
            fn from_multi(mut multi: MultiValue, vm: &mut Vm) -> Result<Self, RuntimeError> {
                $(let $name = multi.unpack_front::<$name>(vm)?;)+
                vm.store_multi(multi);
                Ok(($($name,)+))
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);
impl_tuple!(A, B, C, D, E);
impl_tuple!(A, B, C, D, E, F);
impl_tuple!(A, B, C, D, E, F, G);
impl_tuple!(A, B, C, D, E, F, G, H);

/// Reports a missing argument with its position
pub(crate) fn missing_argument(position: usize) -> RuntimeError {
    RuntimeError::bad_argument(position, RuntimeErrorData::String("value expected".into()))
}
