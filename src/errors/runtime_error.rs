use super::stack_trace::StackTrace;
use super::RuntimeErrorData;
use crate::interpreter::Value;
use std::borrow::Cow;

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub data: RuntimeErrorData,
    pub trace: StackTrace,
}

impl RuntimeError {
    /// An error carrying a host message, reported with the location of the innermost interpreted frame.
    pub fn from_message(message: impl Into<Cow<'static, str>>) -> Self {
        RuntimeErrorData::String(message.into()).into()
    }

    /// Raises `value` as is, protected calls receive it unchanged.
    pub fn from_value(value: Value) -> Self {
        RuntimeErrorData::Value(value).into()
    }

    pub(crate) fn bad_argument(position: usize, reason: RuntimeErrorData) -> Self {
        RuntimeErrorData::BadArgument {
            position,
            reason: reason.into(),
        }
        .into()
    }

    /// The message a protected call reports, prefixed with `source:line:` unless a value was raised.
    pub fn message(&self) -> String {
        match self.trace.innermost() {
            Some(frame) if !self.data.is_raised_value() => format!("{frame}: {}", self.data),
            _ => self.data.to_string(),
        }
    }
}

impl From<RuntimeErrorData> for RuntimeError {
    #[inline]
    fn from(data: RuntimeErrorData) -> Self {
        Self {
            data,
            trace: StackTrace::default(),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error: {}{}", self.data, self.trace)
    }
}
