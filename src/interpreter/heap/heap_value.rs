use crate::interpreter::interpreted_function::{Closure, Prototype};
use crate::interpreter::native_function::NativeClosure;
use crate::interpreter::table::Table;
use crate::interpreter::thread::Thread;
use crate::interpreter::up_value::UpValue;
use crate::interpreter::userdata::UserData;
use crate::interpreter::TypeName;
use std::rc::Rc;

pub(crate) enum HeapValue {
    Table(Box<Table>),
    Closure(Closure),
    NativeFunction(NativeClosure),
    UpValue(UpValue),
    Prototype(Rc<Prototype>),
    UserData(Box<UserData>),
    /// `None` while the thread is running, the running state lives on the vm
    Thread(Option<Box<Thread>>),
}

impl HeapValue {
    pub(crate) fn gc_size(&self) -> usize {
        let inner = match self {
            HeapValue::Table(table) => std::mem::size_of::<Table>() + table.heap_size(),
            HeapValue::Closure(closure) => closure.heap_size(),
            HeapValue::NativeFunction(native) => native.heap_size(),
            HeapValue::UpValue(_) => 0,
            HeapValue::Prototype(prototype) => prototype.heap_size(),
            HeapValue::UserData(userdata) => std::mem::size_of::<UserData>() + userdata.heap_size(),
            HeapValue::Thread(Some(thread)) => std::mem::size_of::<Thread>() + thread.heap_size(),
            HeapValue::Thread(None) => 0,
        };

        std::mem::size_of::<Self>() + inner
    }

    pub(crate) fn type_name(&self) -> TypeName {
        match self {
            HeapValue::Table(_) => TypeName::Table,
            HeapValue::Closure(_) | HeapValue::NativeFunction(_) => TypeName::Function,
            HeapValue::UserData(_) => TypeName::UserData,
            HeapValue::Thread(_) => TypeName::Thread,
            // not visible to scripts
            HeapValue::UpValue(_) | HeapValue::Prototype(_) => TypeName::Nil,
        }
    }
}
