//! High-level (caller-side) values and their carrier types.

use std::fmt;

use crate::memory::Segment;
use crate::{Error, Result};

/// Carrier type of a value on the binding operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// A raw address with an attached size bound.
    Address,
    /// An accessible buffer. Every segment is also addressable.
    Segment,
}

impl ValueType {
    /// Byte width of the primitive carriers, `None` for addresses and segments.
    #[must_use]
    pub const fn byte_size(self) -> Option<u64> {
        match self {
            Self::I8 => Some(1),
            Self::I16 => Some(2),
            Self::I32 | Self::F32 => Some(4),
            Self::I64 | Self::F64 => Some(8),
            Self::Address | Self::Segment => None,
        }
    }

    #[must_use]
    pub const fn is_primitive(self) -> bool {
        self.byte_size().is_some()
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Whether a value of type `self` may stand where `expected` is required.
    #[must_use]
    pub fn is_assignable_to(self, expected: ValueType) -> bool {
        self == expected || (self == Self::Segment && expected == Self::Address)
    }

    /// Integer carrier for a chunk of `size` bytes (1..=8).
    #[must_use]
    pub const fn integer_for_size(size: u64) -> Self {
        match size {
            1 => Self::I8,
            2 => Self::I16,
            3 | 4 => Self::I32,
            _ => Self::I64,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I8 => "I8",
            Self::I16 => "I16",
            Self::I32 => "I32",
            Self::I64 => "I64",
            Self::F32 => "F32",
            Self::F64 => "F64",
            Self::Address => "Address",
            Self::Segment => "Segment",
        };
        f.write_str(name)
    }
}

/// A raw native address together with the number of bytes it may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub raw: u64,
    pub size: u64,
}

impl Address {
    pub const NULL: Address = Address { raw: 0, size: 0 };

    #[must_use]
    pub const fn new(raw: u64, size: u64) -> Self {
        Self { raw, size }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.raw == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}[{}]", self.raw, self.size)
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Address(Address),
    Segment(Segment),
}

impl Value {
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::I8(_) => ValueType::I8,
            Self::I16(_) => ValueType::I16,
            Self::I32(_) => ValueType::I32,
            Self::I64(_) => ValueType::I64,
            Self::F32(_) => ValueType::F32,
            Self::F64(_) => ValueType::F64,
            Self::Address(_) => ValueType::Address,
            Self::Segment(_) => ValueType::Segment,
        }
    }

    /// Raw bits of a primitive value, sign-extended to 64 bits for integers.
    /// Floats keep their own bit pattern in the low bits.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn to_bits(&self) -> u64 {
        match self {
            Self::I8(v) => i64::from(*v) as u64,
            Self::I16(v) => i64::from(*v) as u64,
            Self::I32(v) => i64::from(*v) as u64,
            Self::I64(v) => *v as u64,
            Self::F32(v) => u64::from(v.to_bits()),
            Self::F64(v) => v.to_bits(),
            Self::Address(a) => a.raw,
            Self::Segment(s) => s.address(),
        }
    }

    /// Rebuilds a primitive value of type `ty` from raw bits, truncating as needed.
    pub fn from_bits(ty: ValueType, bits: u64) -> Result<Self> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let value = match ty {
            ValueType::I8 => Self::I8(bits as u8 as i8),
            ValueType::I16 => Self::I16(bits as u16 as i16),
            ValueType::I32 => Self::I32(bits as u32 as i32),
            ValueType::I64 => Self::I64(bits as i64),
            ValueType::F32 => Self::F32(f32::from_bits(bits as u32)),
            ValueType::F64 => Self::F64(f64::from_bits(bits)),
            ValueType::Address | ValueType::Segment => {
                return Err(Error::Internal(format!(
                    "cannot rebuild a {ty} from raw bits"
                )));
            }
        };
        Ok(value)
    }

    /// The zero value of a primitive or address type.
    #[must_use]
    pub const fn zero(ty: ValueType) -> Option<Self> {
        match ty {
            ValueType::I8 => Some(Self::I8(0)),
            ValueType::I16 => Some(Self::I16(0)),
            ValueType::I32 => Some(Self::I32(0)),
            ValueType::I64 => Some(Self::I64(0)),
            ValueType::F32 => Some(Self::F32(0.0)),
            ValueType::F64 => Some(Self::F64(0.0)),
            ValueType::Address => Some(Self::Address(Address::NULL)),
            ValueType::Segment => None,
        }
    }

    /// Raw address of an addressable value.
    pub fn raw_address(&self) -> Result<u64> {
        match self {
            Self::Address(a) => Ok(a.raw),
            Self::Segment(s) => Ok(s.address()),
            other => Err(Error::Internal(format!(
                "expected an addressable value, found {}",
                other.value_type()
            ))),
        }
    }

    pub fn as_segment(&self) -> Result<&Segment> {
        match self {
            Self::Segment(s) => Ok(s),
            other => Err(Error::Internal(format!(
                "expected a segment, found {}",
                other.value_type()
            ))),
        }
    }

    /// Bit-exact equality: floats compare by bit pattern, segments by contents.
    #[must_use]
    pub fn bit_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::F32(a), Self::F32(b)) => a.to_bits() == b.to_bits(),
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            (Self::Segment(a), Self::Segment(b)) => match (a.to_vec(), b.to_vec()) {
                (Ok(x), Ok(y)) => x == y,
                _ => false,
            },
            (a, b) => a == b,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::I8(a), Self::I8(b)) => a == b,
            (Self::I16(a), Self::I16(b)) => a == b,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::F32(a), Self::F32(b)) => a == b,
            (Self::F64(a), Self::F64(b)) => a == b,
            (Self::Address(a), Self::Address(b)) => a == b,
            (Self::Segment(a), Self::Segment(b)) => a.same_region(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I8(v) => write!(f, "{v}i8"),
            Self::I16(v) => write!(f, "{v}i16"),
            Self::I32(v) => write!(f, "{v}i32"),
            Self::I64(v) => write!(f, "{v}i64"),
            Self::F32(v) => write!(f, "{v}f32"),
            Self::F64(v) => write!(f, "{v}f64"),
            Self::Address(a) => write!(f, "{a}"),
            Self::Segment(s) => write!(f, "segment {:#x}[{}]", s.address(), s.len()),
        }
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Self::I8(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::I16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<Address> for Value {
    fn from(v: Address) -> Self {
        Self::Address(v)
    }
}

impl From<Segment> for Value {
    fn from(v: Segment) -> Self {
        Self::Segment(v)
    }
}

/// Carrier-level type of a function: what a managed implementation sees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodType {
    params: Vec<ValueType>,
    ret: Option<ValueType>,
}

impl MethodType {
    #[must_use]
    pub fn new(params: impl IntoIterator<Item = ValueType>, ret: Option<ValueType>) -> Self {
        Self {
            params: params.into_iter().collect(),
            ret,
        }
    }

    #[must_use]
    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    #[must_use]
    pub const fn ret(&self) -> Option<ValueType> {
        self.ret
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(") -> ")?;
        match self.ret {
            Some(ret) => write!(f, "{ret}"),
            None => f.write_str("void"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_round_trip_narrow_integers() {
        let v = Value::I16(-2);
        let bits = v.to_bits();
        assert_eq!(bits, u64::MAX - 1);
        assert_eq!(Value::from_bits(ValueType::I16, bits).unwrap(), v);
    }

    #[test]
    fn test_float_bits_stay_narrow() {
        let bits = Value::F32(1.5).to_bits();
        assert_eq!(bits, u64::from(1.5f32.to_bits()));
        assert!(Value::from_bits(ValueType::F32, bits).unwrap().bit_eq(&Value::F32(1.5)));
    }

    #[test]
    fn test_segment_is_assignable_to_address() {
        assert!(ValueType::Segment.is_assignable_to(ValueType::Address));
        assert!(!ValueType::Address.is_assignable_to(ValueType::Segment));
        assert!(!ValueType::I32.is_assignable_to(ValueType::I64));
    }

    #[test]
    fn test_integer_carrier_for_chunk_size() {
        assert_eq!(ValueType::integer_for_size(1), ValueType::I8);
        assert_eq!(ValueType::integer_for_size(3), ValueType::I32);
        assert_eq!(ValueType::integer_for_size(7), ValueType::I64);
    }
}
