//! Value codec between application values and Modbus register encodings
//!
//! Every function here is pure and infallible. Malformed input from either
//! side degrades to a fixed fallback value instead of an error, so neither
//! the sync pass nor the write handler can be taken down by a bad number.
//!
//! | Representation  | Registers | Encoding                                   |
//! |-----------------|-----------|--------------------------------------------|
//! | `Int16`         | 1         | round, clamp to i16, reinterpret as u16    |
//! | `Float32`       | 2         | IEEE-754 bytes permuted by [`Endianness`]  |
//! | `ScaledInteger` | 1         | `[scale_min, scale_max]` onto `[0, 65535]` |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a mapping's value is laid out in registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataRepresentation {
    /// Signed 16-bit integer in one register
    #[default]
    Int16,
    /// IEEE-754 single precision across two registers
    Float32,
    /// Linear mapping of a value range onto the unsigned 16-bit span
    ScaledInteger,
    /// Anything the configuration store sends that we do not understand
    #[serde(other)]
    Unknown,
}

impl DataRepresentation {
    /// Number of 16-bit registers a value of this representation occupies
    pub const fn register_count(self) -> u16 {
        match self {
            DataRepresentation::Int16 => 1,
            DataRepresentation::Float32 => 2,
            DataRepresentation::ScaledInteger => 1,
            DataRepresentation::Unknown => 1,
        }
    }
}

/// Byte/word ordering for packing a 32-bit value into two registers
///
/// With the IEEE-754 bytes written `A B C D` (A most significant):
///
/// | Convention        | Word order | Byte order | Registers  |
/// |-------------------|------------|------------|------------|
/// | `BigEndian`       | big        | big        | `AB`, `CD` |
/// | `LittleEndian`    | little     | little     | `DC`, `BA` |
/// | `MidBigEndian`    | little     | big        | `CD`, `AB` |
/// | `MidLittleEndian` | big        | little     | `BA`, `DC` |
///
/// Parsing never fails: an unrecognized name falls back to `BigEndian`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "String")]
pub enum Endianness {
    #[default]
    BigEndian,
    LittleEndian,
    MidBigEndian,
    MidLittleEndian,
}

impl Endianness {
    /// All conventions, in declaration order
    pub const ALL: [Endianness; 4] = [
        Endianness::BigEndian,
        Endianness::LittleEndian,
        Endianness::MidBigEndian,
        Endianness::MidLittleEndian,
    ];

    /// Lenient parse accepting the common vendor aliases
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().replace(['-', '_', ' '], "").as_str() {
            "bigendian" | "big" | "be" | "abcd" => Self::BigEndian,
            "littleendian" | "little" | "le" | "dcba" => Self::LittleEndian,
            "midbigendian" | "midbig" | "cdab" | "wordswap" => Self::MidBigEndian,
            "midlittleendian" | "midlittle" | "badc" | "byteswap" => Self::MidLittleEndian,
            _ => Self::BigEndian,
        }
    }
}

impl From<String> for Endianness {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl FromStr for Endianness {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BigEndian => "BigEndian",
            Self::LittleEndian => "LittleEndian",
            Self::MidBigEndian => "MidBigEndian",
            Self::MidLittleEndian => "MidLittleEndian",
        };
        write!(f, "{}", s)
    }
}

/// Number of registers for a representation
pub fn register_count(representation: DataRepresentation) -> u16 {
    representation.register_count()
}

/// Encode a value as a signed 16-bit register
pub fn encode_int16(value: f64) -> u16 {
    // `as` saturates and maps NaN to 0
    let clamped = value.round().clamp(i16::MIN as f64, i16::MAX as f64);
    (clamped as i16) as u16
}

/// Decode a signed 16-bit register
pub fn decode_int16(register: u16) -> i16 {
    register as i16
}

/// Encode an f32 into two registers using the given convention
pub fn encode_float32(value: f32, endianness: Endianness) -> [u16; 2] {
    let [a, b, c, d] = value.to_be_bytes();
    let (first, second) = match endianness {
        Endianness::BigEndian => ([a, b], [c, d]),
        Endianness::LittleEndian => ([d, c], [b, a]),
        Endianness::MidBigEndian => ([c, d], [a, b]),
        Endianness::MidLittleEndian => ([b, a], [d, c]),
    };
    [u16::from_be_bytes(first), u16::from_be_bytes(second)]
}

/// Decode two registers into an f32, inverting [`encode_float32`] exactly
pub fn decode_float32(registers: [u16; 2], endianness: Endianness) -> f32 {
    let [r0, r1] = [registers[0].to_be_bytes(), registers[1].to_be_bytes()];
    let bytes = match endianness {
        Endianness::BigEndian => [r0[0], r0[1], r1[0], r1[1]],
        Endianness::LittleEndian => [r1[1], r1[0], r0[1], r0[0]],
        Endianness::MidBigEndian => [r1[0], r1[1], r0[0], r0[1]],
        Endianness::MidLittleEndian => [r0[1], r0[0], r1[1], r1[0]],
    };
    f32::from_be_bytes(bytes)
}

/// Map a value in `[scale_min, scale_max]` onto `[0, 65535]`
///
/// A degenerate range returns 0.
pub fn encode_scaled(value: f64, scale_min: f64, scale_max: f64) -> u16 {
    let span = scale_max - scale_min;
    if span.abs() < f64::EPSILON {
        return 0;
    }
    // max/min instead of clamp: clamp panics on an inverted range
    let clamped = value.max(scale_min.min(scale_max)).min(scale_max.max(scale_min));
    let raw = ((clamped - scale_min) / span * u16::MAX as f64).round();
    raw.clamp(0.0, u16::MAX as f64) as u16
}

/// Map a register in `[0, 65535]` back onto `[scale_min, scale_max]`
pub fn decode_scaled(register: u16, scale_min: f64, scale_max: f64) -> f64 {
    scale_min + (register as f64 / u16::MAX as f64) * (scale_max - scale_min)
}

/// Any nonzero value switches a coil on
pub fn encode_coil(value: f64) -> bool {
    value != 0.0 && !value.is_nan()
}

/// Render a coil state as the point store expects it
pub fn decode_coil(state: bool) -> &'static str {
    if state { "1" } else { "0" }
}

/// Interpret a free-form string as a coil state
///
/// Boolean parse first, then numeric-nonzero, otherwise off.
pub fn coil_from_str(value: &str) -> bool {
    let value = value.trim();
    if value.eq_ignore_ascii_case("true") {
        return true;
    }
    if value.eq_ignore_ascii_case("false") {
        return false;
    }
    value.parse::<f64>().map(encode_coil).unwrap_or(false)
}

/// Parse a point value for encoding
///
/// Numeric parse first, then `true`/`false` as 1/0, otherwise 0.
pub fn parse_numeric(value: &str) -> f64 {
    let value = value.trim();
    if let Ok(number) = value.parse::<f64>() {
        return number;
    }
    if value.eq_ignore_ascii_case("true") {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_counts() {
        assert_eq!(register_count(DataRepresentation::Int16), 1);
        assert_eq!(register_count(DataRepresentation::Float32), 2);
        assert_eq!(register_count(DataRepresentation::ScaledInteger), 1);
        assert_eq!(register_count(DataRepresentation::Unknown), 1);
    }

    #[test]
    fn test_int16_clamping() {
        assert_eq!(encode_int16(40000.0), 32767);
        assert_eq!(encode_int16(-40000.0), (-32768i16) as u16);
        assert_eq!(encode_int16(-1.0), 0xFFFF);
        assert_eq!(encode_int16(12.5), 13);
        assert_eq!(encode_int16(f64::NAN), 0);
        assert_eq!(decode_int16(0xFFFF), -1);
        assert_eq!(decode_int16(encode_int16(-1234.0)), -1234);
    }

    #[test]
    fn test_float32_known_layouts() {
        // 23.5 == 0x41BC0000
        assert_eq!(encode_float32(23.5, Endianness::BigEndian), [0x41BC, 0x0000]);
        assert_eq!(encode_float32(23.5, Endianness::LittleEndian), [0x0000, 0xBC41]);
        assert_eq!(encode_float32(23.5, Endianness::MidBigEndian), [0x0000, 0x41BC]);
        assert_eq!(encode_float32(23.5, Endianness::MidLittleEndian), [0xBC41, 0x0000]);

        // 1.0e-3 == 0x3A83126F, distinct bytes in every position
        assert_eq!(encode_float32(1.0e-3, Endianness::BigEndian), [0x3A83, 0x126F]);
        assert_eq!(encode_float32(1.0e-3, Endianness::LittleEndian), [0x6F12, 0x833A]);
        assert_eq!(encode_float32(1.0e-3, Endianness::MidBigEndian), [0x126F, 0x3A83]);
        assert_eq!(encode_float32(1.0e-3, Endianness::MidLittleEndian), [0x833A, 0x6F12]);
    }

    #[test]
    fn test_float32_round_trip_is_bit_exact() {
        let values = [0.0f32, -0.0, 23.5, -1.5e-38, f32::MAX, f32::MIN_POSITIVE, f32::INFINITY];
        for endianness in Endianness::ALL {
            for value in values {
                let decoded = decode_float32(encode_float32(value, endianness), endianness);
                assert_eq!(decoded.to_bits(), value.to_bits(), "{} {}", endianness, value);
            }
            let nan = f32::from_bits(0x7FC0_1234);
            let decoded = decode_float32(encode_float32(nan, endianness), endianness);
            assert_eq!(decoded.to_bits(), nan.to_bits());
        }
    }

    #[test]
    fn test_scaled_quantization_bound() {
        let (min, max) = (-50.0, 150.0);
        let step = (max - min) / 65535.0;
        let mut value = min;
        while value <= max {
            let decoded = decode_scaled(encode_scaled(value, min, max), min, max);
            assert!((decoded - value).abs() <= step, "value {} decoded {}", value, decoded);
            value += 0.37;
        }
        assert_eq!(encode_scaled(min, min, max), 0);
        assert_eq!(encode_scaled(max, min, max), 65535);
        assert_eq!(encode_scaled(1000.0, min, max), 65535);
        assert_eq!(encode_scaled(-1000.0, min, max), 0);
    }

    #[test]
    fn test_scaled_degenerate_range() {
        assert_eq!(encode_scaled(12.0, 5.0, 5.0), 0);
        assert_eq!(encode_scaled(f64::NAN, 0.0, 10.0), 0);
        // inverted range must not panic
        let _ = encode_scaled(3.0, 10.0, 0.0);
    }

    #[test]
    fn test_coil_parsing() {
        assert!(encode_coil(2.0));
        assert!(!encode_coil(0.0));
        assert_eq!(decode_coil(true), "1");
        assert_eq!(decode_coil(false), "0");
        assert!(coil_from_str("TRUE"));
        assert!(coil_from_str("3.5"));
        assert!(!coil_from_str("0"));
        assert!(!coil_from_str("garbage"));
    }

    #[test]
    fn test_parse_numeric_fallbacks() {
        assert_eq!(parse_numeric(" 42.25 "), 42.25);
        assert_eq!(parse_numeric("true"), 1.0);
        assert_eq!(parse_numeric("False"), 0.0);
        assert_eq!(parse_numeric("n/a"), 0.0);
    }

    #[test]
    fn test_endianness_aliases() {
        assert_eq!(Endianness::from_name("CDAB"), Endianness::MidBigEndian);
        assert_eq!(Endianness::from_name("mid_little_endian"), Endianness::MidLittleEndian);
        assert_eq!(Endianness::from_name("little"), Endianness::LittleEndian);
        assert_eq!(Endianness::from_name("sideways"), Endianness::BigEndian);

        let parsed: Endianness = serde_json::from_str("\"DCBA\"").unwrap();
        assert_eq!(parsed, Endianness::LittleEndian);

        let repr: DataRepresentation = serde_json::from_str("\"Float64\"").unwrap();
        assert_eq!(repr, DataRepresentation::Unknown);
    }
}
