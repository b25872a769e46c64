use super::heap::StringTable;
use super::instruction::ArithOp;
use super::value_stack::StackValue;
use crate::errors::RuntimeErrorData;
use std::io::Write;

const TWO_POW_63: f64 = 9223372036854775808.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    #[inline]
    pub(crate) fn to_float(self) -> f64 {
        match self {
            Number::Integer(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

impl From<Number> for StackValue {
    #[inline]
    fn from(value: Number) -> Self {
        match value {
            Number::Integer(i) => StackValue::Integer(i),
            Number::Float(f) => StackValue::Float(f),
        }
    }
}

/// Converts only when the float has an exact integer representation
#[inline]
pub(crate) fn float_to_integer(f: f64) -> Option<i64> {
    if f.floor() == f && (-TWO_POW_63..TWO_POW_63).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

/// Accepts decimal and hexadecimal integers and floats surrounded by whitespace.
///
/// Decimal integers that overflow become floats, hexadecimal integers wrap around.
pub(crate) fn parse_number(text: &[u8]) -> Option<Number> {
    let text = text.trim_ascii();

    let (negative, body) = match text.first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };

    // a second sign is never part of a numeral
    if matches!(body.first(), Some(b'+' | b'-')) {
        return None;
    }

    if body.len() > 2 && body[0] == b'0' && (body[1] == b'x' || body[1] == b'X') {
        return parse_hex(&body[2..], negative);
    }

    if body.is_empty() {
        return None;
    }

    if body.iter().all(u8::is_ascii_digit) {
        // the magnitude of i64::MIN is one past i64::MAX
        let limit = if negative {
            i64::MIN.unsigned_abs()
        } else {
            i64::MAX as u64
        };

        let magnitude = body.iter().try_fold(0u64, |value, &digit| {
            value
                .checked_mul(10)
                .and_then(|v| v.checked_add((digit - b'0') as u64))
                .filter(|v| *v <= limit)
        });

        if let Some(magnitude) = magnitude {
            let value = magnitude as i64;

            return Some(Number::Integer(if negative {
                value.wrapping_neg()
            } else {
                value
            }));
        }
    }

    // reject "inf", "nan", and other forms rust accepts but lua doesn't
    let valid_float = body.iter().any(u8::is_ascii_digit)
        && body
            .iter()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'));

    if !valid_float {
        return None;
    }

    let s = std::str::from_utf8(body).ok()?;
    let f: f64 = s.parse().ok()?;

    Some(Number::Float(if negative { -f } else { f }))
}

fn parse_hex(body: &[u8], negative: bool) -> Option<Number> {
    let mut integer: i64 = 0;
    let mut mantissa = 0.0f64;
    let mut exponent: i32 = 0;
    let mut any_digit = false;
    let mut seen_dot = false;
    let mut is_float = false;
    let mut iter = body.iter().copied().peekable();

    while let Some(c) = iter.next() {
        match c {
            b'.' if !seen_dot => {
                seen_dot = true;
                is_float = true;
            }
            b'p' | b'P' => {
                is_float = true;

                let mut exponent_negative = false;

                if let Some(&sign @ (b'+' | b'-')) = iter.peek() {
                    exponent_negative = sign == b'-';
                    iter.next();
                }

                let mut explicit: i32 = 0;
                let mut any_exponent_digit = false;

                for c in iter.by_ref() {
                    if !c.is_ascii_digit() {
                        return None;
                    }

                    any_exponent_digit = true;
                    explicit = explicit.saturating_mul(10).saturating_add((c - b'0') as i32);
                }

                if !any_exponent_digit {
                    return None;
                }

                exponent += if exponent_negative {
                    -explicit
                } else {
                    explicit
                };
            }
            _ => {
                let digit = (c as char).to_digit(16)?;
                any_digit = true;
                integer = integer.wrapping_mul(16).wrapping_add(digit as i64);
                mantissa = mantissa * 16.0 + digit as f64;

                if seen_dot {
                    exponent -= 4;
                }
            }
        }
    }

    if !any_digit {
        return None;
    }

    if !is_float {
        return Some(Number::Integer(if negative {
            integer.wrapping_neg()
        } else {
            integer
        }));
    }

    let f = mantissa * 2f64.powi(exponent);
    Some(Number::Float(if negative { -f } else { f }))
}

/// `%.14g`, with `.0` appended when the result would read as an integer
pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        return if f.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }

    if f.is_infinite() {
        return if f < 0.0 { "-inf" } else { "inf" }.to_string();
    }

    const PRECISION: i32 = 14;

    let scientific = format!("{:.*e}", (PRECISION - 1) as usize, f);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    let mut output = if exponent < -4 || exponent >= PRECISION {
        let mut mantissa = mantissa.to_string();
        trim_fraction_zeros(&mut mantissa);

        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = (PRECISION - 1 - exponent) as usize;
        let mut fixed = format!("{f:.decimals$}");
        trim_fraction_zeros(&mut fixed);
        fixed
    };

    if !output.contains(['.', 'e', 'n', 'i']) {
        output.push_str(".0");
    }

    output
}

fn trim_fraction_zeros(text: &mut String) {
    if !text.contains('.') {
        return;
    }

    while text.ends_with('0') {
        text.pop();
    }

    if text.ends_with('.') {
        text.pop();
    }
}

/// Appends the string form of a number, returns false for other values
pub(crate) fn write_number(value: StackValue, buffer: &mut Vec<u8>) -> bool {
    match value {
        // writing to a vec can't fail
        StackValue::Integer(i) => {
            let _ = write!(buffer, "{i}");
        }
        StackValue::Float(f) => buffer.extend_from_slice(format_float(f).as_bytes()),
        _ => return false,
    }

    true
}

/// Numbers and numeric strings
pub(crate) fn coerce_number(value: StackValue, strings: &StringTable) -> Option<Number> {
    match value {
        StackValue::Integer(i) => Some(Number::Integer(i)),
        StackValue::Float(f) => Some(Number::Float(f)),
        StackValue::String(key) => parse_number(strings.get(key)?.bytes.as_bytes()),
        _ => None,
    }
}

pub(crate) fn coerce_integer(value: StackValue, strings: &StringTable) -> Option<i64> {
    match coerce_number(value, strings)? {
        Number::Integer(i) => Some(i),
        Number::Float(f) => float_to_integer(f),
    }
}

#[inline]
pub(crate) fn integer_floor_div(a: i64, b: i64) -> Result<i64, RuntimeErrorData> {
    if b == 0 {
        return Err(RuntimeErrorData::DivideByZero);
    }

    if b == -1 {
        return Ok(a.wrapping_neg());
    }

    let q = a / b;

    if (a ^ b) < 0 && a % b != 0 {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

#[inline]
pub(crate) fn integer_mod(a: i64, b: i64) -> Result<i64, RuntimeErrorData> {
    if b == 0 {
        return Err(RuntimeErrorData::ModuloByZero);
    }

    if b == -1 {
        return Ok(0);
    }

    let r = a % b;

    if r != 0 && (r ^ b) < 0 {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

#[inline]
pub(crate) fn float_mod(a: f64, b: f64) -> f64 {
    let m = a % b;

    let adjust = if m > 0.0 { b < 0.0 } else { m < 0.0 && b != m };

    if adjust {
        m + b
    } else {
        m
    }
}

/// Logical shift, negative amounts shift right
#[inline]
pub(crate) fn shift_left(x: i64, y: i64) -> i64 {
    if y <= -64 || y >= 64 {
        0
    } else if y >= 0 {
        ((x as u64) << y) as i64
    } else {
        ((x as u64) >> -y) as i64
    }
}

/// Arithmetic on two numbers, bitwise operations expect integers
pub(crate) fn arith(op: ArithOp, a: Number, b: Number) -> Result<Number, RuntimeErrorData> {
    use Number::{Float, Integer};

    let result = match (op, a, b) {
        (ArithOp::Add, Integer(a), Integer(b)) => Integer(a.wrapping_add(b)),
        (ArithOp::Sub, Integer(a), Integer(b)) => Integer(a.wrapping_sub(b)),
        (ArithOp::Mul, Integer(a), Integer(b)) => Integer(a.wrapping_mul(b)),
        (ArithOp::Mod, Integer(a), Integer(b)) => Integer(integer_mod(a, b)?),
        (ArithOp::IDiv, Integer(a), Integer(b)) => Integer(integer_floor_div(a, b)?),
        (ArithOp::Add, a, b) => Float(a.to_float() + b.to_float()),
        (ArithOp::Sub, a, b) => Float(a.to_float() - b.to_float()),
        (ArithOp::Mul, a, b) => Float(a.to_float() * b.to_float()),
        (ArithOp::Mod, a, b) => Float(float_mod(a.to_float(), b.to_float())),
        (ArithOp::IDiv, a, b) => Float((a.to_float() / b.to_float()).floor()),
        (ArithOp::Div, a, b) => Float(a.to_float() / b.to_float()),
        (ArithOp::Pow, a, b) => Float(a.to_float().powf(b.to_float())),
        (op, a, b) => {
            let to_integer = |n: Number| match n {
                Integer(i) => Some(i),
                Float(f) => float_to_integer(f),
            };

            let (Some(a), Some(b)) = (to_integer(a), to_integer(b)) else {
                return Err(RuntimeErrorData::NoIntegerRepresentation);
            };

            Integer(bitwise(op, a, b))
        }
    };

    Ok(result)
}

#[inline]
fn bitwise(op: ArithOp, a: i64, b: i64) -> i64 {
    match op {
        ArithOp::BAnd => a & b,
        ArithOp::BOr => a | b,
        ArithOp::BXor => a ^ b,
        ArithOp::Shl => shift_left(a, b),
        ArithOp::Shr => shift_left(a, b.wrapping_neg()),
        _ => 0,
    }
}

/// `Ok(None)` when an operand can't be coerced and a metamethod should be tried
pub(crate) fn arith_values(
    op: ArithOp,
    a: StackValue,
    b: StackValue,
    strings: &StringTable,
) -> Result<Option<StackValue>, RuntimeErrorData> {
    // fast path for the common case
    match (op, a, b) {
        (ArithOp::Add, StackValue::Integer(a), StackValue::Integer(b)) => {
            return Ok(Some(StackValue::Integer(a.wrapping_add(b))))
        }
        (ArithOp::Add, StackValue::Float(a), StackValue::Float(b)) => {
            return Ok(Some(StackValue::Float(a + b)))
        }
        _ => {}
    }

    if op.is_bitwise() {
        let (Some(a), Some(b)) = (coerce_integer(a, strings), coerce_integer(b, strings)) else {
            return Ok(None);
        };

        return Ok(Some(StackValue::Integer(bitwise(op, a, b))));
    }

    let (Some(a), Some(b)) = (coerce_number(a, strings), coerce_number(b, strings)) else {
        return Ok(None);
    };

    arith(op, a, b).map(|n| Some(n.into()))
}

/// The error reported when no metamethod handled a failed arithmetic operation
pub(crate) fn arith_error(
    op: ArithOp,
    a: StackValue,
    b: StackValue,
    strings: &StringTable,
) -> RuntimeErrorData {
    let a_number = coerce_number(a, strings).is_some();
    let b_number = coerce_number(b, strings).is_some();
    let culprit = if a_number { b } else { a };

    if op.is_bitwise() {
        if a_number && b_number {
            RuntimeErrorData::NoIntegerRepresentation
        } else {
            RuntimeErrorData::InvalidBitwise(culprit.type_name())
        }
    } else {
        RuntimeErrorData::InvalidArithmetic(culprit.type_name())
    }
}

pub(crate) fn lt_numbers(a: Number, b: Number) -> bool {
    match (a, b) {
        (Number::Integer(a), Number::Integer(b)) => a < b,
        (Number::Float(a), Number::Float(b)) => a < b,
        (Number::Integer(i), Number::Float(f)) => {
            if f.is_nan() {
                false
            } else if f >= TWO_POW_63 {
                true
            } else if f > -TWO_POW_63 {
                i < f.ceil() as i64
            } else {
                false
            }
        }
        (Number::Float(f), Number::Integer(i)) => {
            if f.is_nan() || f >= TWO_POW_63 {
                false
            } else if f >= -TWO_POW_63 {
                (f.floor() as i64) < i
            } else {
                true
            }
        }
    }
}

pub(crate) fn le_numbers(a: Number, b: Number) -> bool {
    match (a, b) {
        (Number::Integer(a), Number::Integer(b)) => a <= b,
        (Number::Float(a), Number::Float(b)) => a <= b,
        (Number::Integer(i), Number::Float(f)) => {
            if f.is_nan() {
                false
            } else if f >= TWO_POW_63 {
                true
            } else if f >= -TWO_POW_63 {
                i <= f.floor() as i64
            } else {
                false
            }
        }
        (Number::Float(f), Number::Integer(i)) => {
            if f.is_nan() || f >= TWO_POW_63 {
                false
            } else if f >= -TWO_POW_63 {
                (f.ceil() as i64) <= i
            } else {
                true
            }
        }
    }
}

#[inline]
pub(crate) fn as_number(value: StackValue) -> Option<Number> {
    match value {
        StackValue::Integer(i) => Some(Number::Integer(i)),
        StackValue::Float(f) => Some(Number::Float(f)),
        _ => None,
    }
}

/// Equality without metamethods: numbers compare by mathematical value, strings by content
pub(crate) fn raw_equals(a: StackValue, b: StackValue, strings: &StringTable) -> bool {
    match (a, b) {
        (StackValue::Integer(i), StackValue::Float(f))
        | (StackValue::Float(f), StackValue::Integer(i)) => float_to_integer(f) == Some(i),
        (StackValue::String(a), StackValue::String(b)) => a == b || strings.contents_equal(a, b),
        _ => a == b,
    }
}

/// Integer bounds for a numeric for loop with an integer start and step.
///
/// Returns `None` when the loop should be skipped.
pub(crate) fn for_limit(
    init: i64,
    limit: StackValue,
    step: i64,
) -> Result<Option<i64>, RuntimeErrorData> {
    let limit = match limit {
        StackValue::Integer(i) => i,
        StackValue::Float(f) => {
            if f.is_nan() {
                return Ok(None);
            }

            let rounded = if step < 0 { f.ceil() } else { f.floor() };

            match float_to_integer(rounded) {
                Some(i) => i,
                None if f > 0.0 => {
                    if step < 0 {
                        return Ok(None);
                    }

                    i64::MAX
                }
                None => {
                    if step > 0 {
                        return Ok(None);
                    }

                    i64::MIN
                }
            }
        }
        _ => return Err(RuntimeErrorData::ForLimit),
    };

    let skip = if step > 0 { init > limit } else { init < limit };

    Ok(if skip { None } else { Some(limit) })
}
