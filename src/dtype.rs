//! Scalar type descriptors.
//!
//! `DataType` is treated as an opaque itemsize-carrying tag almost
//! everywhere in the engine. The three places it stops being opaque are
//! documented on the type itself: boolean reduction results, integer
//! min/max sentinels, and structured/raw record field access for the cache
//! proxy.

use std::fmt::{Debug, Display};
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use num_complex::{Complex32, Complex64};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type c64 = Complex32;
pub type c128 = Complex64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum IntSize {
    b8,
    b16,
    b32,
    b64,
}

impl IntSize {
    pub fn nbytes(&self) -> usize {
        match self {
            Self::b8 => 1,
            Self::b16 => 2,
            Self::b32 => 4,
            Self::b64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum FloatSize {
    b32,
    b64,
}

impl FloatSize {
    pub fn nbytes(&self) -> usize {
        match self {
            Self::b32 => 4,
            Self::b64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum ComplexSize {
    b64,
    b128,
}

impl ComplexSize {
    pub fn nbytes(&self) -> usize {
        match self {
            Self::b64 => 8,
            Self::b128 => 16,
        }
    }
}

/// A named field within a structured (`Raw`) record, used by the cache
/// proxy's field-view leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructField {
    pub name: String,
    pub offset: usize,
    pub dtype: Box<DataType>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Bool,
    Int(IntSize),
    UInt(IntSize),
    Float(FloatSize),
    Complex(ComplexSize),
    /// A fixed-width opaque record, `itemsize` bytes wide. Optionally carries
    /// named sub-fields for the proxy's structured field view.
    Raw {
        itemsize: usize,
        fields: Vec<StructField>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataTypeParseError {
    Unknown(String),
}

impl std::fmt::Display for DataTypeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(s) => write!(f, "unrecognised dtype string {:?}", s),
        }
    }
}

impl std::error::Error for DataTypeParseError {}

fn split_str_num(s: &str) -> Option<(&str, usize)> {
    let idx = s.find(|c: char| c.is_ascii_digit())?;
    let (name, num) = s.split_at(idx);
    num.parse().ok().map(|n| (name, n))
}

impl DataType {
    /// Size in bytes of a single scalar value of this type.
    pub fn itemsize(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int(s) | Self::UInt(s) => s.nbytes(),
            Self::Float(s) => s.nbytes(),
            Self::Complex(s) => s.nbytes(),
            Self::Raw { itemsize, .. } => *itemsize,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Raw { fields, .. } if !fields.is_empty())
    }

    pub fn field(&self, name: &str) -> Option<&StructField> {
        match self {
            Self::Raw { fields, .. } => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }

    /// `(min, max)` as `i128` for integer dtypes, used to seed MIN/MAX
    /// reductions. `None` for non-integer dtypes.
    pub fn int_extremes(&self) -> Option<(i128, i128)> {
        match self {
            Self::Int(IntSize::b8) => Some((i8::MIN as i128, i8::MAX as i128)),
            Self::Int(IntSize::b16) => Some((i16::MIN as i128, i16::MAX as i128)),
            Self::Int(IntSize::b32) => Some((i32::MIN as i128, i32::MAX as i128)),
            Self::Int(IntSize::b64) => Some((i64::MIN as i128, i64::MAX as i128)),
            Self::UInt(IntSize::b8) => Some((0, u8::MAX as i128)),
            Self::UInt(IntSize::b16) => Some((0, u16::MAX as i128)),
            Self::UInt(IntSize::b32) => Some((0, u32::MAX as i128)),
            Self::UInt(IntSize::b64) => Some((0, u64::MAX as i128)),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int(_) | Self::UInt(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int(s) => write!(f, "int{}", s.nbytes() * 8),
            Self::UInt(s) => write!(f, "uint{}", s.nbytes() * 8),
            Self::Float(s) => write!(f, "float{}", s.nbytes() * 8),
            Self::Complex(s) => write!(f, "complex{}", s.nbytes() * 8),
            Self::Raw { itemsize, .. } => write!(f, "raw{}", itemsize * 8),
        }
    }
}

impl FromStr for DataType {
    type Err = DataTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "bool" {
            return Ok(Self::Bool);
        }
        let (name, nbits) =
            split_str_num(s).ok_or_else(|| DataTypeParseError::Unknown(s.to_owned()))?;
        let size_err = || DataTypeParseError::Unknown(s.to_owned());
        match name {
            "int" => Ok(Self::Int(match nbits {
                8 => IntSize::b8,
                16 => IntSize::b16,
                32 => IntSize::b32,
                64 => IntSize::b64,
                _ => return Err(size_err()),
            })),
            "uint" => Ok(Self::UInt(match nbits {
                8 => IntSize::b8,
                16 => IntSize::b16,
                32 => IntSize::b32,
                64 => IntSize::b64,
                _ => return Err(size_err()),
            })),
            "float" => Ok(Self::Float(match nbits {
                32 => FloatSize::b32,
                64 => FloatSize::b64,
                _ => return Err(size_err()),
            })),
            "complex" => Ok(Self::Complex(match nbits {
                64 => ComplexSize::b64,
                128 => ComplexSize::b128,
                _ => return Err(size_err()),
            })),
            "raw" => Ok(Self::Raw {
                itemsize: nbits / 8,
                fields: Vec::new(),
            }),
            _ => Err(size_err()),
        }
    }
}

impl Serialize for DataType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Endianness used when encoding/decoding a scalar to/from a byte buffer.
/// Raw/structured dtypes ignore this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    Big,
    #[default]
    Little,
}

/// A type which is reflected by a [DataType] and can be read/written to a
/// raw byte buffer. Implemented for the primitive numeric types the engine
/// supports natively.
pub trait ReflectedType: Copy + Debug + PartialEq + Send + Sync + 'static {
    const DTYPE: DataType;

    fn write_bytes(self, endian: Endian, buf: &mut [u8]);
    fn read_bytes(endian: Endian, buf: &[u8]) -> Self;
}

macro_rules! reflected_int {
    ($t:ty, $dt:expr, $read:ident, $write:ident) => {
        impl ReflectedType for $t {
            const DTYPE: DataType = $dt;

            fn write_bytes(self, endian: Endian, buf: &mut [u8]) {
                match endian {
                    Endian::Big => BigEndian::$write(buf, self as _),
                    Endian::Little => LittleEndian::$write(buf, self as _),
                }
            }

            fn read_bytes(endian: Endian, buf: &[u8]) -> Self {
                (match endian {
                    Endian::Big => BigEndian::$read(buf),
                    Endian::Little => LittleEndian::$read(buf),
                }) as Self
            }
        }
    };
}

impl ReflectedType for bool {
    const DTYPE: DataType = DataType::Bool;

    fn write_bytes(self, _endian: Endian, buf: &mut [u8]) {
        buf[0] = self as u8;
    }

    fn read_bytes(_endian: Endian, buf: &[u8]) -> Self {
        buf[0] != 0
    }
}

impl ReflectedType for u8 {
    const DTYPE: DataType = DataType::UInt(IntSize::b8);

    fn write_bytes(self, _endian: Endian, buf: &mut [u8]) {
        buf[0] = self;
    }

    fn read_bytes(_endian: Endian, buf: &[u8]) -> Self {
        buf[0]
    }
}

impl ReflectedType for i8 {
    const DTYPE: DataType = DataType::Int(IntSize::b8);

    fn write_bytes(self, _endian: Endian, buf: &mut [u8]) {
        buf[0] = self as u8;
    }

    fn read_bytes(_endian: Endian, buf: &[u8]) -> Self {
        buf[0] as i8
    }
}

reflected_int!(u16, DataType::UInt(IntSize::b16), read_u16, write_u16);
reflected_int!(u32, DataType::UInt(IntSize::b32), read_u32, write_u32);
reflected_int!(u64, DataType::UInt(IntSize::b64), read_u64, write_u64);
reflected_int!(i16, DataType::Int(IntSize::b16), read_i16, write_i16);
reflected_int!(i32, DataType::Int(IntSize::b32), read_i32, write_i32);
reflected_int!(i64, DataType::Int(IntSize::b64), read_i64, write_i64);
reflected_int!(f32, DataType::Float(FloatSize::b32), read_f32, write_f32);
reflected_int!(f64, DataType::Float(FloatSize::b64), read_f64, write_f64);

impl ReflectedType for c64 {
    const DTYPE: DataType = DataType::Complex(ComplexSize::b64);

    fn write_bytes(self, endian: Endian, buf: &mut [u8]) {
        self.re.write_bytes(endian, &mut buf[0..4]);
        self.im.write_bytes(endian, &mut buf[4..8]);
    }

    fn read_bytes(endian: Endian, buf: &[u8]) -> Self {
        c64::new(
            f32::read_bytes(endian, &buf[0..4]),
            f32::read_bytes(endian, &buf[4..8]),
        )
    }
}

impl ReflectedType for c128 {
    const DTYPE: DataType = DataType::Complex(ComplexSize::b128);

    fn write_bytes(self, endian: Endian, buf: &mut [u8]) {
        self.re.write_bytes(endian, &mut buf[0..8]);
        self.im.write_bytes(endian, &mut buf[8..16]);
    }

    fn read_bytes(endian: Endian, buf: &[u8]) -> Self {
        c128::new(
            f64::read_bytes(endian, &buf[0..8]),
            f64::read_bytes(endian, &buf[8..16]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_string_roundtrip() {
        for dt in [
            DataType::Bool,
            DataType::Int(IntSize::b32),
            DataType::UInt(IntSize::b64),
            DataType::Float(FloatSize::b64),
            DataType::Complex(ComplexSize::b128),
        ] {
            let s = dt.to_string();
            let back: DataType = s.parse().unwrap();
            assert_eq!(dt, back);
        }
    }

    #[test]
    fn int_extremes_match_primitive_bounds() {
        assert_eq!(
            DataType::Int(IntSize::b8).int_extremes(),
            Some((i8::MIN as i128, i8::MAX as i128))
        );
        assert_eq!(DataType::Float(FloatSize::b64).int_extremes(), None);
    }

    #[test]
    fn f64_roundtrips_through_bytes() {
        let mut buf = [0u8; 8];
        1.5f64.write_bytes(Endian::Little, &mut buf);
        assert_eq!(f64::read_bytes(Endian::Little, &buf), 1.5);
    }
}
