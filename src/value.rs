//! Column value codec. Bit-exact encoding/decoding of the
//! supported scalar types in the byte order the file format requires.

use crate::error::{Context, JetError, JetResult};
use crate::util;

/// Column type together with the per-type parameters the codec needs
/// (precision/scale for Numeric, length/compression for Text/Binary).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Byte,
    Int,
    Long,
    BigInt,
    Float,
    Double,
    Money,
    Numeric { precision: u8, scale: u8 },
    ShortDateTime,
    Guid,
    Text { max_len: u16, compressed: bool },
    Memo,
    ComplexFk,
    Binary { max_len: u16 },
}

impl ColumnType {
    /// Size in bytes of the fixed-width encoding, or `None` if the column is
    /// variable-length.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            ColumnType::Boolean => Some(0),
            ColumnType::Byte => Some(1),
            ColumnType::Int => Some(2),
            ColumnType::Long => Some(4),
            ColumnType::BigInt => Some(8),
            ColumnType::Float => Some(4),
            ColumnType::Double => Some(8),
            ColumnType::Money => Some(8),
            ColumnType::Numeric { .. } => Some(17),
            ColumnType::ShortDateTime => Some(8),
            ColumnType::Guid => Some(16),
            ColumnType::ComplexFk => Some(4),
            ColumnType::Text { .. } | ColumnType::Memo | ColumnType::Binary { .. } => None,
        }
    }

    pub fn is_variable(self) -> bool {
        self.fixed_size().is_none()
    }

    /// Whether this column's value lives entirely in the row null mask
    /// (only Boolean does this).
    pub fn stores_in_null_mask(self) -> bool {
        matches!(self, ColumnType::Boolean)
    }
}

/// Fixed-point decimal value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Numeric {
    pub negative: bool,
    /// 16-byte unsigned magnitude, as it appears in `Value::Numeric`
    /// (already in the disk's swapped-4-byte-word layout).
    pub magnitude: [u8; 16],
}

impl Numeric {
    pub fn from_u128(val: u128, negative: bool) -> Self {
        Numeric {
            negative,
            magnitude: u128_to_magnitude(val),
        }
    }

    pub fn to_u128(self) -> u128 {
        magnitude_to_u128(&self.magnitude)
    }
}

fn magnitude_to_u128(bytes: &[u8; 16]) -> u128 {
    let mut result: u128 = 0;
    for word in 0..4 {
        let off = word * 4;
        let w = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        result = (result << 32) | w as u128;
    }
    result
}

fn u128_to_magnitude(val: u128) -> [u8; 16] {
    let mut words = [0u32; 4];
    let mut v = val;
    for i in (0..4).rev() {
        words[i] = (v & 0xFFFF_FFFF) as u32;
        v >>= 32;
    }
    let mut bytes = [0u8; 16];
    for word in 0..4 {
        bytes[word * 4..word * 4 + 4].copy_from_slice(&words[word].to_le_bytes());
    }
    bytes
}

/// Short date/time. Raw bits are preserved across read/write so an
/// unchanged value reproduces identical bytes; the lossy `f64` conversion
/// is only used when a caller constructs a fresh value from a day count.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JetDateTime {
    pub raw_bits: u64,
}

impl JetDateTime {
    /// Days since 30 Dec 1899, with the file format's always-positive
    /// fractional part even for dates before the epoch.
    pub fn from_days(days: f64) -> Self {
        let day_part = days.floor();
        let frac = (days - day_part).abs();
        JetDateTime {
            raw_bits: (day_part + frac).to_bits(),
        }
    }

    pub fn days(self) -> f64 {
        f64::from_bits(self.raw_bits)
    }
}

/// A decoded column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(u8),
    Int(i16),
    Long(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    /// Raw scaled integer; divide by 10 000 for the decimal value.
    Money(i64),
    Numeric(Numeric),
    DateTime(JetDateTime),
    Guid([u8; 16]),
    Text(String),
    Memo(String),
    ComplexFk(i32),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Read a column value out of a fixed-size slice already positioned at the
/// column's offset (Boolean is read from the row null mask instead and is
/// never passed through here).
pub fn read(ty: ColumnType, data: &[u8], ctx: &Context) -> JetResult<Value> {
    match ty {
        ColumnType::Boolean => Ok(Value::Boolean(true)),
        ColumnType::Byte => Ok(Value::Byte(data[0])),
        ColumnType::Int => Ok(Value::Int(util::geti16(data, 0))),
        ColumnType::Long => Ok(Value::Long(util::geti32(data, 0))),
        ColumnType::BigInt => Ok(Value::BigInt(util::geti64(data, 0))),
        ColumnType::Float => Ok(Value::Float(util::getf32(data, 0))),
        ColumnType::Double => Ok(Value::Double(util::getf64(data, 0))),
        ColumnType::Money => Ok(Value::Money(util::geti64(data, 0))),
        ColumnType::Numeric { .. } => {
            if data.len() < 17 {
                return Err(JetError::invalid_value("short numeric buffer", ctx.clone()));
            }
            let negative = data[0] == 0x80;
            let mut magnitude = [0u8; 16];
            magnitude.copy_from_slice(&data[1..17]);
            Ok(Value::Numeric(Numeric { negative, magnitude }))
        }
        ColumnType::ShortDateTime => Ok(Value::DateTime(JetDateTime {
            raw_bits: util::getu64(data, 0),
        })),
        ColumnType::Guid => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&data[0..16]);
            Ok(Value::Guid(bytes))
        }
        ColumnType::ComplexFk => Ok(Value::ComplexFk(util::geti32(data, 0))),
        ColumnType::Text { .. } => decode_text(data, ctx).map(Value::Text),
        ColumnType::Memo => decode_text(data, ctx).map(Value::Memo),
        ColumnType::Binary { .. } => Ok(Value::Binary(data.to_vec())),
    }
}

/// Encode a value into its on-disk byte form. `remaining_row_len` bounds how
/// much space a variable-length value may consume.
pub fn write(value: &Value, ty: ColumnType, remaining_row_len: usize, ctx: &Context) -> JetResult<Vec<u8>> {
    match (ty, value) {
        (ColumnType::Boolean, Value::Boolean(_)) => Ok(Vec::new()),
        (ColumnType::Byte, Value::Byte(b)) => Ok(vec![*b]),
        (ColumnType::Int, Value::Int(v)) => Ok(v.to_le_bytes().to_vec()),
        (ColumnType::Long, Value::Long(v)) => Ok(v.to_le_bytes().to_vec()),
        (ColumnType::BigInt, Value::BigInt(v)) => Ok(v.to_le_bytes().to_vec()),
        (ColumnType::Float, Value::Float(v)) => Ok(v.to_le_bytes().to_vec()),
        (ColumnType::Double, Value::Double(v)) => Ok(v.to_le_bytes().to_vec()),
        (ColumnType::Money, Value::Money(v)) => Ok(v.to_le_bytes().to_vec()),
        (ColumnType::Numeric { precision, .. }, Value::Numeric(n)) => {
            if decimal_digits(n.to_u128()) > precision as u32 {
                return Err(JetError::invalid_value(
                    "numeric value exceeds column precision",
                    ctx.clone(),
                ));
            }
            let mut out = vec![0u8; 17];
            out[0] = if n.negative { 0x80 } else { 0 };
            out[1..17].copy_from_slice(&n.magnitude);
            Ok(out)
        }
        (ColumnType::ShortDateTime, Value::DateTime(d)) => Ok(d.raw_bits.to_le_bytes().to_vec()),
        (ColumnType::Guid, Value::Guid(b)) => Ok(b.to_vec()),
        (ColumnType::ComplexFk, Value::ComplexFk(v)) => Ok(v.to_le_bytes().to_vec()),
        (ColumnType::Text { .. }, Value::Text(s)) | (ColumnType::Memo, Value::Memo(s)) => {
            let bytes = encode_text(s);
            if bytes.len() > remaining_row_len {
                return Err(JetError::invalid_value(
                    "text value does not fit remaining row space",
                    ctx.clone(),
                ));
            }
            Ok(bytes)
        }
        (ColumnType::Binary { max_len }, Value::Binary(b)) => {
            if max_len != 0 && b.len() > max_len as usize {
                return Err(JetError::invalid_value("binary value too long", ctx.clone()));
            }
            if b.len() > remaining_row_len {
                return Err(JetError::invalid_value(
                    "binary value does not fit remaining row space",
                    ctx.clone(),
                ));
            }
            Ok(b.clone())
        }
        _ => Err(JetError::invalid_value(
            "value cannot be coerced to column type",
            ctx.clone(),
        )),
    }
}

fn decimal_digits(mut v: u128) -> u32 {
    if v == 0 {
        return 1;
    }
    let mut n = 0;
    while v > 0 {
        n += 1;
        v /= 10;
    }
    n
}

/// Unicode compression: attempted only when every UTF-16 code unit falls
/// in 0x0001..=0x00FF and the string has more than 2 units; otherwise the
/// value is written as plain UTF-16LE with no header.
fn should_compress(units: &[u16]) -> bool {
    units.len() > 2 && units.iter().all(|&u| (0x0001..=0x00FF).contains(&u))
}

pub fn encode_text(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    if should_compress(&units) {
        let mut out = Vec::with_capacity(2 + units.len());
        out.push(0xFF);
        out.push(0xFE);
        for u in units {
            out.push(u as u8);
        }
        out
    } else {
        let mut out = Vec::with_capacity(units.len() * 2);
        for u in units {
            out.extend_from_slice(&u.to_le_bytes());
        }
        out
    }
}

pub fn decode_text(bytes: &[u8], ctx: &Context) -> JetResult<String> {
    let bad = || JetError::invalid_value("invalid utf-16 text value", ctx.clone());
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE {
        let units: Vec<u16> = bytes[2..].iter().map(|&b| b as u16).collect();
        String::from_utf16(&units).map_err(|_| bad())
    } else {
        if bytes.len() % 2 != 0 {
            return Err(bad());
        }
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| bad())
    }
}

/// GUID braced-string form: first three segments (4,2,2 bytes)
/// respect little-endian storage, last two segments (2,6 bytes) are raw.
pub fn guid_to_string(bytes: &[u8; 16]) -> String {
    let d1 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let d2 = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
    let d3 = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
    format!(
        "{{{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}}}",
        d1,
        d2,
        d3,
        bytes[8],
        bytes[9],
        bytes[10],
        bytes[11],
        bytes[12],
        bytes[13],
        bytes[14],
        bytes[15]
    )
}

pub fn guid_from_string(s: &str, ctx: &Context) -> JetResult<[u8; 16]> {
    let bad = || JetError::invalid_value("malformed GUID literal", ctx.clone());
    let trimmed = s.trim_start_matches('{').trim_end_matches('}');
    let parts: Vec<&str> = trimmed.split('-').collect();
    if parts.len() != 5 || parts[3].len() != 4 || parts[4].len() != 12 {
        return Err(bad());
    }
    let d1 = u32::from_str_radix(parts[0], 16).map_err(|_| bad())?;
    let d2 = u16::from_str_radix(parts[1], 16).map_err(|_| bad())?;
    let d3 = u16::from_str_radix(parts[2], 16).map_err(|_| bad())?;
    let d4 = util::parse_hex(parts[3].as_bytes());
    let d5 = util::parse_hex(parts[4].as_bytes());
    let mut bytes = [0u8; 16];
    bytes[0..4].copy_from_slice(&d1.to_le_bytes());
    bytes[4..6].copy_from_slice(&d2.to_le_bytes());
    bytes[6..8].copy_from_slice(&d3.to_le_bytes());
    bytes[8..10].copy_from_slice(&d4);
    bytes[10..16].copy_from_slice(&d5);
    Ok(bytes)
}

/// Convert a freshly generated `uuid::Uuid`'s RFC-4122 big-endian byte
/// layout into this format's mixed-endian on-disk layout.
pub fn guid_from_uuid_bytes(rfc_bytes: [u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&u32::from_be_bytes(rfc_bytes[0..4].try_into().unwrap()).to_le_bytes());
    out[4..6].copy_from_slice(&u16::from_be_bytes(rfc_bytes[4..6].try_into().unwrap()).to_le_bytes());
    out[6..8].copy_from_slice(&u16::from_be_bytes(rfc_bytes[6..8].try_into().unwrap()).to_le_bytes());
    out[8..16].copy_from_slice(&rfc_bytes[8..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::default()
    }

    #[test]
    fn int_round_trip() {
        let v = Value::Long(-12345);
        let bytes = write(&v, ColumnType::Long, 4, &ctx()).unwrap();
        assert_eq!(read(ColumnType::Long, &bytes, &ctx()).unwrap(), v);
    }

    #[test]
    fn money_round_trip() {
        let v = Value::Money(123_4567);
        let bytes = write(&v, ColumnType::Money, 8, &ctx()).unwrap();
        assert_eq!(read(ColumnType::Money, &bytes, &ctx()).unwrap(), v);
    }

    #[test]
    fn numeric_round_trip_and_precision() {
        let n = Numeric::from_u128(12345, false);
        let v = Value::Numeric(n);
        let ty = ColumnType::Numeric { precision: 10, scale: 2 };
        let bytes = write(&v, ty, 17, &ctx()).unwrap();
        assert_eq!(read(ty, &bytes, &ctx()).unwrap(), v);

        let too_big = Value::Numeric(Numeric::from_u128(123_456_789_012, true));
        let tight = ColumnType::Numeric { precision: 5, scale: 0 };
        assert!(write(&too_big, tight, 17, &ctx()).is_err());
    }

    #[test]
    fn guid_string_round_trip() {
        let bytes: [u8; 16] = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ];
        let s = guid_to_string(&bytes);
        assert_eq!(guid_from_string(&s, &ctx()).unwrap(), bytes);
    }

    #[test]
    fn compressed_text_round_trips() {
        let encoded = encode_text("abc");
        assert_eq!(encoded, vec![0xFF, 0xFE, b'a', b'b', b'c']);
        assert_eq!(decode_text(&encoded, &ctx()).unwrap(), "abc");
    }

    #[test]
    fn non_compressible_text_has_no_header() {
        let encoded = encode_text("a\u{3b1}b");
        assert_eq!(encoded, vec![0x61, 0x00, 0xB1, 0x03, 0x62, 0x00]);
        assert_eq!(decode_text(&encoded, &ctx()).unwrap(), "a\u{3b1}b");
    }

    #[test]
    fn date_time_preserves_raw_bits() {
        let bits = 0x4012_3456_789a_bcdeu64;
        let d = JetDateTime { raw_bits: bits };
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&write(&Value::DateTime(d), ColumnType::ShortDateTime, 8, &ctx()).unwrap());
        let back = read(ColumnType::ShortDateTime, &buf, &ctx()).unwrap();
        assert_eq!(back, Value::DateTime(d));
    }

    #[test]
    fn random_longs_round_trip() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let n: i32 = rng.gen();
            let v = Value::Long(n);
            let bytes = write(&v, ColumnType::Long, 4, &ctx()).unwrap();
            assert_eq!(read(ColumnType::Long, &bytes, &ctx()).unwrap(), v);
        }
    }

    #[test]
    fn random_doubles_round_trip() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let n: f64 = rng.gen_range(-1e12..1e12);
            let v = Value::Double(n);
            let bytes = write(&v, ColumnType::Double, 8, &ctx()).unwrap();
            assert_eq!(read(ColumnType::Double, &bytes, &ctx()).unwrap(), v);
        }
    }
}
