//! Reading and writing precompiled functions.
//!
//! Fields are little-endian and fixed width. Loading rejects any header that doesn't match the values written here.

use super::instruction::Instruction;
use super::module::{Constant, DebugInfo, FunctionProto, LocalVar, UpValueDescriptor};
use super::ByteString;
use thiserror::Error;

pub const SIGNATURE: &[u8; 4] = b"\x1bLua";
pub const VERSION: u8 = 0x54;
pub const FORMAT: u8 = 0;
/// Catches files mangled by newline conversion
pub const DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
pub const TEST_INTEGER: i64 = 0x5678;
pub const TEST_FLOAT: f64 = 370.5;

const INT_SIZE: u8 = 4;
const SIZE_T_SIZE: u8 = 8;
const INSTRUCTION_SIZE: u8 = 4;
const INTEGER_SIZE: u8 = 8;
const FLOAT_SIZE: u8 = 8;

const TAG_NIL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x11;
const TAG_INTEGER: u8 = 0x03;
const TAG_FLOAT: u8 = 0x13;
const TAG_SHORT_STRING: u8 = 0x04;
const TAG_LONG_STRING: u8 = 0x14;

/// Strings up to this length are tagged as short
const MAX_SHORT_LEN: usize = super::heap::MAX_SHORT_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("truncated precompiled chunk")]
    Truncated,
    #[error("not a precompiled chunk")]
    BadSignature,
    #[error("version mismatch in precompiled chunk: {0:#04x}")]
    VersionMismatch(u8),
    #[error("format mismatch in precompiled chunk: {0}")]
    FormatMismatch(u8),
    #[error("corrupted precompiled chunk")]
    CorruptedData,
    #[error("{0} size mismatch in precompiled chunk")]
    SizeMismatch(&'static str),
    #[error("integer format mismatch in precompiled chunk")]
    IntegerFormatMismatch,
    #[error("float format mismatch in precompiled chunk")]
    FloatFormatMismatch,
    #[error("bad constant tag in precompiled chunk: {0:#04x}")]
    InvalidConstantTag(u8),
    #[error("up value count mismatch in precompiled chunk")]
    UpValueCountMismatch,
    #[error("count out of range in precompiled chunk")]
    CountOutOfRange,
}

/// Serializes a function and its nested functions, `strip` drops debug information
pub fn dump(proto: &FunctionProto, strip: bool) -> Vec<u8> {
    let mut writer = Writer {
        bytes: Vec::new(),
        strip,
    };

    writer.header();
    writer.byte(proto.up_values.len() as u8);
    writer.function(proto, None);
    writer.bytes
}

pub fn undump(bytes: &[u8]) -> Result<FunctionProto, ChunkError> {
    let mut reader = Reader { bytes, position: 0 };

    reader.header()?;
    let up_value_count = reader.byte()?;
    let proto = reader.function(None)?;

    if proto.up_values.len() != up_value_count as usize {
        return Err(ChunkError::UpValueCountMismatch);
    }

    Ok(proto)
}

struct Writer {
    bytes: Vec<u8>,
    strip: bool,
}

impl Writer {
    fn byte(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn int(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn size(&mut self, value: usize) {
        self.bytes.extend_from_slice(&(value as u64).to_le_bytes());
    }

    fn integer(&mut self, value: i64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn float(&mut self, value: f64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn string(&mut self, value: Option<&ByteString>) {
        match value {
            Some(value) => {
                self.size(value.len() + 1);
                self.bytes.extend_from_slice(value.as_bytes());
            }
            None => self.size(0),
        }
    }

    fn header(&mut self) {
        self.bytes.extend_from_slice(SIGNATURE);
        self.byte(VERSION);
        self.byte(FORMAT);
        self.bytes.extend_from_slice(DATA);
        self.byte(INT_SIZE);
        self.byte(SIZE_T_SIZE);
        self.byte(INSTRUCTION_SIZE);
        self.byte(INTEGER_SIZE);
        self.byte(FLOAT_SIZE);
        self.integer(TEST_INTEGER);
        self.float(TEST_FLOAT);
    }

    fn function(&mut self, proto: &FunctionProto, parent_source: Option<&ByteString>) {
        // nested functions share the source of their parent
        let source = if self.strip || proto.source.as_ref() == parent_source {
            None
        } else {
            proto.source.as_ref()
        };

        self.string(source);
        self.int(proto.line_defined);
        self.int(proto.last_line_defined);
        self.byte(proto.num_params);
        self.byte(proto.is_vararg as u8);
        self.byte(proto.max_stack_size);

        self.int(proto.code.len() as u32);

        for instruction in &proto.code {
            self.int(instruction.0);
        }

        self.int(proto.constants.len() as u32);

        for constant in &proto.constants {
            match constant {
                Constant::Nil => self.byte(TAG_NIL),
                Constant::Bool(false) => self.byte(TAG_FALSE),
                Constant::Bool(true) => self.byte(TAG_TRUE),
                Constant::Integer(i) => {
                    self.byte(TAG_INTEGER);
                    self.integer(*i);
                }
                Constant::Float(f) => {
                    self.byte(TAG_FLOAT);
                    self.float(*f);
                }
                Constant::String(s) => {
                    let tag = if s.len() <= MAX_SHORT_LEN {
                        TAG_SHORT_STRING
                    } else {
                        TAG_LONG_STRING
                    };

                    self.byte(tag);
                    self.string(Some(s));
                }
            }
        }

        self.int(proto.up_values.len() as u32);

        for up_value in &proto.up_values {
            self.byte(up_value.in_stack as u8);
            self.byte(up_value.index);
            self.byte(up_value.kind);
        }

        self.int(proto.protos.len() as u32);

        for child in &proto.protos {
            self.function(child, proto.source.as_ref());
        }

        self.debug(&proto.debug);
    }

    fn debug(&mut self, debug: &DebugInfo) {
        if self.strip {
            self.int(0);
            self.int(0);
            self.int(0);
            return;
        }

        self.int(debug.line_info.len() as u32);

        for line in &debug.line_info {
            self.int(*line);
        }

        self.int(debug.local_vars.len() as u32);

        for local in &debug.local_vars {
            self.string(Some(&local.name));
            self.int(local.start_pc);
            self.int(local.end_pc);
        }

        self.int(debug.up_value_names.len() as u32);

        for name in &debug.up_value_names {
            self.string(Some(name));
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ChunkError> {
        let end = self.position.checked_add(len).ok_or(ChunkError::Truncated)?;
        let slice = self
            .bytes
            .get(self.position..end)
            .ok_or(ChunkError::Truncated)?;
        self.position = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ChunkError> {
        let mut array = [0; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn byte(&mut self) -> Result<u8, ChunkError> {
        Ok(self.array::<1>()?[0])
    }

    fn int(&mut self) -> Result<u32, ChunkError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn size(&mut self) -> Result<usize, ChunkError> {
        usize::try_from(u64::from_le_bytes(self.array()?)).map_err(|_| ChunkError::CountOutOfRange)
    }

    fn integer(&mut self) -> Result<i64, ChunkError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn float(&mut self) -> Result<f64, ChunkError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Rejects counts that can't fit in the remaining input
    fn count(&mut self, min_element_size: usize) -> Result<usize, ChunkError> {
        let count = self.int()? as usize;
        let remaining = self.bytes.len() - self.position;

        if count.saturating_mul(min_element_size) > remaining {
            return Err(ChunkError::Truncated);
        }

        Ok(count)
    }

    fn string(&mut self) -> Result<Option<ByteString>, ChunkError> {
        let size = self.size()?;

        if size == 0 {
            return Ok(None);
        }

        Ok(Some(self.take(size - 1)?.into()))
    }

    fn header(&mut self) -> Result<(), ChunkError> {
        if self.take(SIGNATURE.len()).ok() != Some(&SIGNATURE[..]) {
            return Err(ChunkError::BadSignature);
        }

        let version = self.byte()?;

        if version != VERSION {
            return Err(ChunkError::VersionMismatch(version));
        }

        let format = self.byte()?;

        if format != FORMAT {
            return Err(ChunkError::FormatMismatch(format));
        }

        if self.take(DATA.len())? != &DATA[..] {
            return Err(ChunkError::CorruptedData);
        }

        let sizes = [
            ("int", INT_SIZE),
            ("size_t", SIZE_T_SIZE),
            ("Instruction", INSTRUCTION_SIZE),
            ("integer", INTEGER_SIZE),
            ("float", FLOAT_SIZE),
        ];

        for (name, expected) in sizes {
            if self.byte()? != expected {
                return Err(ChunkError::SizeMismatch(name));
            }
        }

        if self.integer()? != TEST_INTEGER {
            return Err(ChunkError::IntegerFormatMismatch);
        }

        if self.float()? != TEST_FLOAT {
            return Err(ChunkError::FloatFormatMismatch);
        }

        Ok(())
    }

    fn function(&mut self, parent_source: Option<&ByteString>) -> Result<FunctionProto, ChunkError> {
        let source = self.string()?.or_else(|| parent_source.cloned());
        let line_defined = self.int()?;
        let last_line_defined = self.int()?;
        let num_params = self.byte()?;
        let is_vararg = self.byte()? != 0;
        let max_stack_size = self.byte()?;

        let code_len = self.count(4)?;
        let mut code = Vec::with_capacity(code_len);

        for _ in 0..code_len {
            code.push(Instruction(self.int()?));
        }

        let constants_len = self.count(1)?;
        let mut constants = Vec::with_capacity(constants_len);

        for _ in 0..constants_len {
            let constant = match self.byte()? {
                TAG_NIL => Constant::Nil,
                TAG_FALSE => Constant::Bool(false),
                TAG_TRUE => Constant::Bool(true),
                TAG_INTEGER => Constant::Integer(self.integer()?),
                TAG_FLOAT => Constant::Float(self.float()?),
                TAG_SHORT_STRING | TAG_LONG_STRING => {
                    Constant::String(self.string()?.ok_or(ChunkError::CorruptedData)?)
                }
                tag => return Err(ChunkError::InvalidConstantTag(tag)),
            };

            constants.push(constant);
        }

        let up_values_len = self.count(3)?;
        let mut up_values = Vec::with_capacity(up_values_len);

        for _ in 0..up_values_len {
            up_values.push(UpValueDescriptor {
                in_stack: self.byte()? != 0,
                index: self.byte()?,
                kind: self.byte()?,
            });
        }

        let protos_len = self.count(1)?;
        let mut protos = Vec::with_capacity(protos_len);

        for _ in 0..protos_len {
            protos.push(self.function(source.as_ref())?);
        }

        let debug = self.debug()?;

        Ok(FunctionProto {
            source,
            line_defined,
            last_line_defined,
            num_params,
            is_vararg,
            max_stack_size,
            code,
            constants,
            up_values,
            protos,
            debug,
        })
    }

    fn debug(&mut self) -> Result<DebugInfo, ChunkError> {
        let line_info_len = self.count(4)?;
        let mut line_info = Vec::with_capacity(line_info_len);

        for _ in 0..line_info_len {
            line_info.push(self.int()?);
        }

        let local_vars_len = self.count(8)?;
        let mut local_vars = Vec::with_capacity(local_vars_len);

        for _ in 0..local_vars_len {
            local_vars.push(LocalVar {
                name: self.string()?.ok_or(ChunkError::CorruptedData)?,
                start_pc: self.int()?,
                end_pc: self.int()?,
            });
        }

        let up_value_names_len = self.count(8)?;
        let mut up_value_names = Vec::with_capacity(up_value_names_len);

        for _ in 0..up_value_names_len {
            up_value_names.push(self.string()?.unwrap_or_else(|| ByteString::from("")));
        }

        Ok(DebugInfo {
            line_info,
            local_vars,
            up_value_names,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interpreter::instruction::OpCode;
    use pretty_assertions::assert_eq;

    fn sample() -> FunctionProto {
        FunctionProto {
            source: Some("@sample.lua".into()),
            line_defined: 0,
            last_line_defined: 0,
            num_params: 0,
            is_vararg: true,
            max_stack_size: 2,
            code: vec![
                Instruction::abc(OpCode::VarArgPrep, 0, 0, 0, false),
                Instruction::abx(OpCode::Closure, 0, 0),
                Instruction::abc(OpCode::Return, 0, 2, 1, false),
            ],
            constants: vec![
                Constant::Nil,
                Constant::Bool(true),
                Constant::Integer(-3),
                Constant::Float(0.5),
                "short".into(),
                Constant::String("x".repeat(100).as_str().into()),
            ],
            up_values: vec![UpValueDescriptor::register(0)],
            protos: vec![FunctionProto {
                source: Some("@sample.lua".into()),
                line_defined: 2,
                last_line_defined: 4,
                max_stack_size: 2,
                code: vec![Instruction::abc(OpCode::Return0, 0, 0, 0, false)],
                debug: DebugInfo {
                    line_info: vec![4],
                    ..Default::default()
                },
                ..Default::default()
            }],
            debug: DebugInfo {
                line_info: vec![1, 4, 5],
                local_vars: vec![LocalVar {
                    name: "f".into(),
                    start_pc: 2,
                    end_pc: 3,
                }],
                up_value_names: vec!["_ENV".into()],
            },
        }
    }

    #[test]
    fn reload_preserves_the_function() {
        let proto = sample();
        let bytes = dump(&proto, false);

        assert_eq!(&bytes[..4], SIGNATURE);
        assert_eq!(undump(&bytes), Ok(proto));
    }

    #[test]
    fn stripping_drops_debug_info() {
        let bytes = dump(&sample(), true);
        let loaded = undump(&bytes).unwrap();

        assert_eq!(loaded.source, None);
        assert_eq!(loaded.debug, DebugInfo::default());
        assert_eq!(loaded.protos[0].debug, DebugInfo::default());
        assert_eq!(loaded.code, sample().code);
        assert!(bytes.len() < dump(&sample(), false).len());
    }

    #[test]
    fn header_mismatches_are_rejected() {
        let bytes = dump(&sample(), false);

        let mut bad_signature = bytes.clone();
        bad_signature[1] = b'X';
        assert_eq!(undump(&bad_signature), Err(ChunkError::BadSignature));

        let mut bad_version = bytes.clone();
        bad_version[4] = 0x53;
        assert_eq!(undump(&bad_version), Err(ChunkError::VersionMismatch(0x53)));

        let mut bad_format = bytes.clone();
        bad_format[5] = 1;
        assert_eq!(undump(&bad_format), Err(ChunkError::FormatMismatch(1)));

        let mut newline_converted = bytes.clone();
        newline_converted[8] = b'\n';
        assert_eq!(undump(&newline_converted), Err(ChunkError::CorruptedData));

        let mut bad_size = bytes.clone();
        bad_size[13] = 4;
        assert_eq!(undump(&bad_size), Err(ChunkError::SizeMismatch("size_t")));

        let mut bad_integer = bytes.clone();
        bad_integer[17] ^= 0xff;
        assert_eq!(undump(&bad_integer), Err(ChunkError::IntegerFormatMismatch));

        let mut bad_float = bytes;
        bad_float[25] ^= 0xff;
        assert_eq!(undump(&bad_float), Err(ChunkError::FloatFormatMismatch));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = dump(&sample(), false);

        for len in [0, 3, 20, 40, bytes.len() - 1] {
            assert!(undump(&bytes[..len]).is_err(), "accepted {len} bytes");
        }
    }

    #[test]
    fn unknown_constant_tags_are_rejected() {
        let proto = FunctionProto {
            constants: vec![Constant::Nil],
            ..Default::default()
        };

        let mut bytes = dump(&proto, true);
        // header, up value count, source, lines, params, vararg, stack, code count, constant count
        let tag_position = 33 + 1 + 8 + 8 + 3 + 4 + 4;
        assert_eq!(bytes[tag_position], TAG_NIL);
        bytes[tag_position] = 0x7f;

        assert_eq!(undump(&bytes), Err(ChunkError::InvalidConstantTag(0x7f)));
    }
}
