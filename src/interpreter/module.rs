use super::instruction::Instruction;
use super::ByteString;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A constant pool entry
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Constant {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(ByteString),
}

impl From<i64> for Constant {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Constant {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Constant {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Constant {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

/// Where a closure finds an up value when it's created
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UpValueDescriptor {
    /// `true`: a register of the enclosing function, `false`: an up value of the enclosing function
    pub in_stack: bool,
    pub index: u8,
    /// Variable kind, kept for the binary format
    pub kind: u8,
}

impl UpValueDescriptor {
    pub fn register(index: u8) -> Self {
        Self {
            in_stack: true,
            index,
            kind: 0,
        }
    }

    pub fn parent(index: u8) -> Self {
        Self {
            in_stack: false,
            index,
            kind: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocalVar {
    pub name: ByteString,
    /// First instruction where the variable is active
    pub start_pc: u32,
    /// First instruction where the variable is dead
    pub end_pc: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DebugInfo {
    /// Source line for each instruction, empty when stripped
    pub line_info: Vec<u32>,
    pub local_vars: Vec<LocalVar>,
    pub up_value_names: Vec<ByteString>,
}

/// The compiled form of a function, produced by a compiler or read from a binary chunk
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FunctionProto {
    pub source: Option<ByteString>,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub up_values: Vec<UpValueDescriptor>,
    pub protos: Vec<FunctionProto>,
    pub debug: DebugInfo,
}

impl FunctionProto {
    /// Source name reported in stack traces
    pub fn source_name(&self) -> String {
        match &self.source {
            Some(source) => {
                let text = source.to_string_lossy();

                match text.strip_prefix(['@', '=']) {
                    Some(stripped) => stripped.to_string(),
                    None => format!("[string \"{}\"]", text.lines().next().unwrap_or_default()),
                }
            }
            None => "?".to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn source_names() {
        let mut proto = FunctionProto::default();
        assert_eq!(proto.source_name(), "?");

        proto.source = Some("@main.lua".into());
        assert_eq!(proto.source_name(), "main.lua");

        proto.source = Some("return 1\nreturn 2".into());
        assert_eq!(proto.source_name(), "[string \"return 1\"]");
    }
}
