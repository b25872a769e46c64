pub mod binary_chunk;
mod byte_string;
mod cache_pools;
mod collection;
mod dispatch;
mod execution;
mod function_ref;
pub(crate) mod heap;
pub mod instruction;
mod interpreted_function;
mod metatable_keys;
mod module;
mod multi;
mod native_function;
mod number;
mod string_ref;
mod table;
mod table_ref;
mod thread;
mod thread_ref;
mod up_value;
mod userdata;
mod userdata_ref;
mod value;
mod value_stack;
mod vm;
mod vm_context;

pub use binary_chunk::ChunkError;
pub use byte_string::ByteString;
pub use collection::{GcOption, GcResponse};
pub use function_ref::FunctionRef;
pub use heap::{GarbageCollectorConfig, GcMode};
pub use instruction::{Instruction, OpCode};
pub use module::{Constant, DebugInfo, FunctionProto, LocalVar, UpValueDescriptor};
pub use multi::{FromMulti, IntoMulti, MultiValue};
pub use native_function::NativeCallback;
pub use string_ref::StringRef;
pub use table_ref::TableRef;
pub use thread::ThreadStatus;
pub use thread_ref::ThreadRef;
pub use userdata::UserDataTrait;
pub use userdata_ref::UserDataRef;
pub use value::{FromValue, IntoValue, Value};
pub use value_stack::TypeName;
pub use vm::{PanicHandler, Vm, VmLimits, WarnHandler};
pub use vm_context::{CallStatus, VmContext};
