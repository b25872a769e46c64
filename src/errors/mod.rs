mod illegal_instruction;
mod runtime_error;
mod runtime_error_data;
mod stack_trace;

pub use illegal_instruction::*;
pub use runtime_error::*;
pub use runtime_error_data::*;
pub use stack_trace::*;
