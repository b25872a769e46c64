use super::heap::Heap;
use super::number::{coerce_number, float_to_integer, Number};
use super::value_stack::StackValue;
use super::{
    ByteString, FunctionRef, StringRef, TableRef, ThreadRef, TypeName, UserDataRef, Vm,
};
use crate::errors::{RuntimeError, RuntimeErrorData};

/// A value held by the host. Collectable values are anchored and stay alive while the handle exists
#[derive(Debug, Default, Clone, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(StringRef),
    Table(TableRef),
    Function(FunctionRef),
    UserData(UserDataRef),
    Thread(ThreadRef),
}

impl Value {
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Everything except `nil` and `false`
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn type_name(&self) -> TypeName {
        match self {
            Value::Nil => TypeName::Nil,
            Value::Bool(_) => TypeName::Bool,
            Value::Integer(_) | Value::Float(_) => TypeName::Number,
            Value::String(_) => TypeName::String,
            Value::Table(_) => TypeName::Table,
            Value::Function(_) => TypeName::Function,
            Value::UserData(_) => TypeName::UserData,
            Value::Thread(_) => TypeName::Thread,
        }
    }

    #[inline]
    pub fn as_string_ref(&self) -> Option<&StringRef> {
        if let Value::String(string_ref) = self {
            Some(string_ref)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_table_ref(&self) -> Option<&TableRef> {
        if let Value::Table(table_ref) = self {
            Some(table_ref)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_function_ref(&self) -> Option<&FunctionRef> {
        if let Value::Function(function_ref) = self {
            Some(function_ref)
        } else {
            None
        }
    }

    pub(crate) fn to_stack_value(&self) -> StackValue {
        match self {
            Value::Nil => StackValue::Nil,
            Value::Bool(b) => StackValue::Bool(*b),
            Value::Integer(i) => StackValue::Integer(*i),
            Value::Float(f) => StackValue::Float(*f),
            Value::String(string_ref) => StackValue::String(string_ref.0.key()),
            Value::Table(table_ref) => StackValue::Table(table_ref.0.key()),
            Value::Function(function_ref) => StackValue::Function(function_ref.0.key()),
            Value::UserData(userdata_ref) => StackValue::UserData(userdata_ref.0.key()),
            Value::Thread(thread_ref) => StackValue::Thread(thread_ref.0.key()),
        }
    }

    /// Expects stack values to be made from within the same vm as the heap
    pub(crate) fn from_stack_value(heap: &mut Heap, value: StackValue) -> Value {
        match value {
            StackValue::Nil => Value::Nil,
            StackValue::Bool(b) => Value::Bool(b),
            StackValue::Integer(i) => Value::Integer(i),
            StackValue::Float(f) => Value::Float(f),
            StackValue::String(key) => Value::String(StringRef(heap.create_string_ref(key))),
            StackValue::Table(key) => Value::Table(TableRef(heap.create_ref(key))),
            StackValue::Function(key) => Value::Function(FunctionRef(heap.create_ref(key))),
            StackValue::UserData(key) => Value::UserData(UserDataRef(heap.create_ref(key))),
            StackValue::Thread(key) => Value::Thread(ThreadRef(heap.create_ref(key))),
        }
    }

    /// Handles from another vm, or to objects that no longer exist, must not reach the heap
    pub(crate) fn test_validity(&self, heap: &Heap) -> Result<(), RuntimeErrorData> {
        if heap.contains_value(self.to_stack_value()) {
            Ok(())
        } else {
            Err(RuntimeErrorData::InvalidRef)
        }
    }
}

impl From<bool> for Value {
    #[inline]
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<StringRef> for Value {
    #[inline]
    fn from(value: StringRef) -> Self {
        Self::String(value)
    }
}

impl From<TableRef> for Value {
    #[inline]
    fn from(value: TableRef) -> Self {
        Self::Table(value)
    }
}

impl From<FunctionRef> for Value {
    #[inline]
    fn from(value: FunctionRef) -> Self {
        Self::Function(value)
    }
}

impl From<UserDataRef> for Value {
    #[inline]
    fn from(value: UserDataRef) -> Self {
        Self::UserData(value)
    }
}

impl From<ThreadRef> for Value {
    #[inline]
    fn from(value: ThreadRef) -> Self {
        Self::Thread(value)
    }
}

pub trait IntoValue {
    fn into_value(self, vm: &mut Vm) -> Result<Value, RuntimeError>;
}

impl IntoValue for Value {
    #[inline]
    fn into_value(self, _: &mut Vm) -> Result<Value, RuntimeError> {
        Ok(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    #[inline]
    fn into_value(self, vm: &mut Vm) -> Result<Value, RuntimeError> {
        match self {
            Some(v) => v.into_value(vm),
            None => Ok(Value::Nil),
        }
    }
}

macro_rules! into_ref_value {
    ($name:ty, $variant:ident) => {
        impl IntoValue for $name {
            #[inline]
            fn into_value(self, _: &mut Vm) -> Result<Value, RuntimeError> {
                Ok(Value::$variant(self))
            }
        }
    };
}

into_ref_value!(StringRef, String);
into_ref_value!(TableRef, Table);
into_ref_value!(FunctionRef, Function);
into_ref_value!(UserDataRef, UserData);
into_ref_value!(ThreadRef, Thread);

impl IntoValue for String {
    #[inline]
    fn into_value(self, vm: &mut Vm) -> Result<Value, RuntimeError> {
        Ok(Value::String(vm.intern_string(self.as_bytes())))
    }
}

impl<'a> IntoValue for &'a str {
    #[inline]
    fn into_value(self, vm: &mut Vm) -> Result<Value, RuntimeError> {
        Ok(Value::String(vm.intern_string(self.as_bytes())))
    }
}

impl<'a> IntoValue for &'a [u8] {
    #[inline]
    fn into_value(self, vm: &mut Vm) -> Result<Value, RuntimeError> {
        Ok(Value::String(vm.intern_string(self)))
    }
}

impl IntoValue for ByteString {
    #[inline]
    fn into_value(self, vm: &mut Vm) -> Result<Value, RuntimeError> {
        Ok(Value::String(vm.intern_string(self.as_bytes())))
    }
}

impl IntoValue for bool {
    #[inline]
    fn into_value(self, _: &mut Vm) -> Result<Value, RuntimeError> {
        Ok(Value::Bool(self))
    }
}

macro_rules! into_int_value {
    ($name:ty) => {
        impl IntoValue for $name {
            #[inline]
            fn into_value(self, _: &mut Vm) -> Result<Value, RuntimeError> {
                Ok(Value::Integer(self as _))
            }
        }
    };
}

macro_rules! into_float_value {
    ($name:ty) => {
        impl IntoValue for $name {
            #[inline]
            fn into_value(self, _: &mut Vm) -> Result<Value, RuntimeError> {
                Ok(Value::Float(self as _))
            }
        }
    };
}

into_int_value!(i8);
into_int_value!(i16);
into_int_value!(i32);
into_int_value!(i64);
into_int_value!(isize);
into_int_value!(u8);
into_int_value!(u16);
into_int_value!(u32);
into_int_value!(u64);
into_int_value!(usize);
into_float_value!(f32);
into_float_value!(f64);

pub trait FromValue: Sized {
    fn from_value(value: Value, vm: &mut Vm) -> Result<Self, RuntimeError>;
}

fn conversion_error(value: &Value, to: &'static str) -> RuntimeError {
    RuntimeErrorData::FromValueConversion {
        from: value.type_name().as_str(),
        to,
        message: None,
    }
    .into()
}

impl FromValue for Value {
    #[inline]
    fn from_value(value: Value, _: &mut Vm) -> Result<Self, RuntimeError> {
        Ok(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    #[inline]
    fn from_value(value: Value, vm: &mut Vm) -> Result<Self, RuntimeError> {
        match value {
            Value::Nil => Ok(None),
            _ => Ok(Some(T::from_value(value, vm)?)),
        }
    }
}

macro_rules! ref_from_value {
    ($name:ident, $variant:ident) => {
        impl FromValue for $name {
            #[inline]
            fn from_value(value: Value, _: &mut Vm) -> Result<Self, RuntimeError> {
                if let Value::$variant(value_ref) = value {
                    Ok(value_ref)
                } else {
                    Err(conversion_error(&value, stringify!($name)))
                }
            }
        }
    };
}

ref_from_value!(StringRef, String);
ref_from_value!(TableRef, Table);
ref_from_value!(FunctionRef, Function);
ref_from_value!(UserDataRef, UserData);
ref_from_value!(ThreadRef, Thread);

impl FromValue for String {
    #[inline]
    fn from_value(value: Value, vm: &mut Vm) -> Result<Self, RuntimeError> {
        let bytes = ByteString::from_value(value, vm)?;
        Ok(bytes.to_string_lossy().into_owned())
    }
}

impl FromValue for ByteString {
    fn from_value(value: Value, vm: &mut Vm) -> Result<Self, RuntimeError> {
        match &value {
            Value::String(string_ref) => Ok(string_ref.fetch(vm)?.clone()),
            Value::Integer(_) | Value::Float(_) => {
                let mut buffer = Vec::new();
                super::number::write_number(value.to_stack_value(), &mut buffer);
                Ok(buffer.into())
            }
            _ => Err(conversion_error(&value, "String")),
        }
    }
}

impl FromValue for bool {
    #[inline]
    fn from_value(value: Value, _: &mut Vm) -> Result<Self, RuntimeError> {
        Ok(value.is_truthy())
    }
}

/// Numbers, and strings that parse as numbers
fn number_from_value(value: &Value, vm: &Vm) -> Option<Number> {
    match value {
        Value::Integer(i) => Some(Number::Integer(*i)),
        Value::Float(f) => Some(Number::Float(*f)),
        Value::String(_) => {
            let strings = &vm.execution_data.heap.strings;
            coerce_number(value.to_stack_value(), strings)
        }
        _ => None,
    }
}

macro_rules! integer_from_value {
    ($name:ty) => {
        impl FromValue for $name {
            fn from_value(value: Value, vm: &mut Vm) -> Result<Self, RuntimeError> {
                let integer = match number_from_value(&value, vm) {
                    Some(Number::Integer(i)) => Some(i),
                    Some(Number::Float(f)) => float_to_integer(f),
                    None => None,
                };

                let Some(integer) = integer else {
                    return Err(conversion_error(&value, stringify!($name)));
                };

                <$name>::try_from(integer).map_err(|_| {
                    RuntimeErrorData::FromValueConversion {
                        from: "number",
                        to: stringify!($name),
                        message: Some("out of range".into()),
                    }
                    .into()
                })
            }
        }
    };
}

macro_rules! float_from_value {
    ($name:ty) => {
        impl FromValue for $name {
            #[inline]
            fn from_value(value: Value, vm: &mut Vm) -> Result<Self, RuntimeError> {
                match number_from_value(&value, vm) {
                    Some(number) => Ok(number.to_float() as _),
                    None => Err(conversion_error(&value, stringify!($name))),
                }
            }
        }
    };
}

integer_from_value!(i8);
integer_from_value!(i16);
integer_from_value!(i32);
integer_from_value!(i64);
integer_from_value!(isize);
integer_from_value!(u8);
integer_from_value!(u16);
integer_from_value!(u32);
integer_from_value!(u64);
integer_from_value!(usize);
float_from_value!(f32);
float_from_value!(f64);
