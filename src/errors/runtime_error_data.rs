use super::IllegalInstruction;
use crate::interpreter::{ByteString, ChunkError, TypeName, Value};
use std::borrow::Cow;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, PartialEq, Clone, Error)]
pub enum RuntimeErrorData {
    #[error("illegal instruction: {0:?}")]
    IllegalInstruction(IllegalInstruction),
    #[error("invalid reference, the value may belong to another vm")]
    InvalidRef,
    #[error("stack overflow")]
    StackOverflow,
    #[error("native stack overflow")]
    NativeStackOverflow,
    #[error("attempt to call a {0} value")]
    NotCallable(TypeName),
    #[error("metatable chain too long; possible loop")]
    MetatableChainTooLong,
    #[error("attempt to index a {0} value")]
    AttemptToIndex(TypeName),
    #[error("attempt to concatenate a {0} value")]
    AttemptToConcat(TypeName),
    #[error("attempt to get length of a {0} value")]
    NoLength(TypeName),
    #[error("{}", compare_message(*.0, *.1))]
    InvalidCompare(TypeName, TypeName),
    #[error("attempt to perform arithmetic on a {0} value")]
    InvalidArithmetic(TypeName),
    #[error("attempt to perform bitwise operation on a {0} value")]
    InvalidBitwise(TypeName),
    #[error("attempt to perform 'n//0'")]
    DivideByZero,
    #[error("attempt to perform 'n%%0'")]
    ModuloByZero,
    #[error("number has no integer representation")]
    NoIntegerRepresentation,
    #[error("table index is nil")]
    NilIndex,
    #[error("table index is NaN")]
    NaNIndex,
    #[error("invalid stack index {0}")]
    InvalidStackIndex(isize),
    #[error("invalid key to 'next'")]
    InvalidNextKey,
    #[error("'for' initial value must be a number")]
    ForInitialValue,
    #[error("'for' limit must be a number")]
    ForLimit,
    #[error("'for' step must be a number")]
    ForStep,
    #[error("'for' step is zero")]
    ForZeroStep,
    #[error("not enough memory")]
    OutOfMemory,
    #[error("{0}")]
    CorruptChunk(ChunkError),
    #[error("cannot resume dead coroutine")]
    DeadCoroutine,
    #[error("cannot resume non-suspended coroutine")]
    ResumedNonSuspendedCoroutine,
    /// Raised by a native function to suspend the running coroutine.
    #[error("attempt to yield outside of a coroutine")]
    Yield,
    #[error("attempt to yield across a native call boundary")]
    InvalidYield,
    /// Bad argument received by a native function.
    #[error("bad argument #{position} ({reason})")]
    BadArgument {
        /// Argument position, starting from 1.
        position: usize,
        reason: Rc<RuntimeErrorData>,
    },
    /// A value could not be converted to the expected Rust type.
    #[error("{from} expected, could not convert to {to}{}", message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    FromValueConversion {
        from: &'static str,
        to: &'static str,
        message: Option<String>,
    },
    #[error("{0}")]
    String(Cow<'static, str>),
    #[error("{0}")]
    ByteString(ByteString),
    /// A non string value raised as an error.
    #[error("(error object is a {} value)", .0.type_name())]
    Value(Value),
}

fn compare_message(a: TypeName, b: TypeName) -> String {
    if a == b {
        format!("attempt to compare two {a} values")
    } else {
        format!("attempt to compare {a} with {b}")
    }
}

impl RuntimeErrorData {
    /// Errors raised with a value keep the value as is, everything else is reported with a message.
    pub(crate) fn is_raised_value(&self) -> bool {
        matches!(self, Self::ByteString(_) | Self::Value(_))
    }
}

impl From<IllegalInstruction> for RuntimeErrorData {
    fn from(value: IllegalInstruction) -> Self {
        Self::IllegalInstruction(value)
    }
}

impl From<ChunkError> for RuntimeErrorData {
    fn from(value: ChunkError) -> Self {
        Self::CorruptChunk(value)
    }
}
