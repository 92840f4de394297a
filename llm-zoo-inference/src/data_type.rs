#[cfg(test)]
#[path = "../tests/unit/data_type_test.rs"]
mod data_type_test;

use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};

/// Element encodings a safetensors header may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    U8,
    I8,
    I16,
    U16,
    F16,
    BF16,
    I32,
    U32,
    F32,
    F64,
    I64,
    U64,
}

impl DataType {
    /// Number of bits a single element occupies.
    pub const fn bits(self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 8,
            Self::I16 | Self::U16 | Self::F16 | Self::BF16 => 16,
            Self::I32 | Self::U32 | Self::F32 => 32,
            Self::F64 | Self::I64 | Self::U64 => 64,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::U8 => "U8",
            Self::I8 => "I8",
            Self::I16 => "I16",
            Self::U16 => "U16",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::I32 => "I32",
            Self::U32 => "U32",
            Self::F32 => "F32",
            Self::F64 => "F64",
            Self::I64 => "I64",
            Self::U64 => "U64",
        }
    }

    /// Returns true when `decode` can turn this encoding into `f32` values.
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    /// Number of elements stored in `bytes` bytes, if the byte count is an exact multiple.
    pub fn element_count(self, bytes: usize) -> Option<usize> {
        let width = self.bits() / 8;
        (bytes % width == 0).then_some(bytes / width)
    }

    /// Decodes a little-endian byte region into `f32` values.
    ///
    /// Returns `None` for encodings that are not floating point.
    pub fn decode(self, data: &[u8]) -> Option<Vec<f32>> {
        let values = match self {
            Self::F32 => data.chunks_exact(4).map(LittleEndian::read_f32).collect(),
            Self::F64 => data.chunks_exact(8).map(|chunk| LittleEndian::read_f64(chunk) as f32).collect(),
            Self::F16 => data.chunks_exact(2).map(|chunk| f16_to_f32(LittleEndian::read_u16(chunk))).collect(),
            Self::BF16 => data.chunks_exact(2).map(|chunk| bf16_to_f32(LittleEndian::read_u16(chunk))).collect(),
            _ => return None,
        };

        Some(values)
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "BOOL" => Self::Bool,
            "U8" => Self::U8,
            "I8" => Self::I8,
            "I16" => Self::I16,
            "U16" => Self::U16,
            "F16" => Self::F16,
            "BF16" => Self::BF16,
            "I32" => Self::I32,
            "U32" => Self::U32,
            "F32" => Self::F32,
            "F64" => Self::F64,
            "I64" => Self::I64,
            "U64" => Self::U64,
            other => return Err(other.to_string()),
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Converts IEEE 754 half precision bits into `f32`.
///
/// Subnormal halves are renormalized into the wider exponent range, so every
/// half value (including infinities and NaN payloads) is represented exactly.
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits & 0x8000) as u32) << 16;
    let exponent = ((bits >> 10) & 0x1f) as u32;
    let mantissa = (bits & 0x03ff) as u32;

    let magnitude = match (exponent, mantissa) {
        (0, 0) => 0,
        (0, _) => {
            // shift the mantissa until the implicit bit appears
            let mut exponent = 127 - 15 + 1;
            let mut mantissa = mantissa;
            while mantissa & 0x0400 == 0 {
                mantissa <<= 1;
                exponent -= 1;
            }
            (exponent << 23) | ((mantissa & 0x03ff) << 13)
        }
        (0x1f, _) => 0x7f80_0000 | (mantissa << 13),
        _ => ((exponent + 127 - 15) << 23) | (mantissa << 13),
    };

    f32::from_bits(sign | magnitude)
}

/// Brain float bits are the upper half of an `f32`.
pub fn bf16_to_f32(bits: u16) -> f32 {
    f32::from_bits((bits as u32) << 16)
}
