//! Sortable byte-key encoding for index entries. Every encoder
//! produces bytes such that unsigned byte-wise comparison matches the
//! semantic ordering of the source value, ascending or descending per
//! column flag.

use crate::value::{Numeric, Value};

const NULL_FLAG_ASC: u8 = 0x00;
const START_FLAG_ASC: u8 = 0x01;
const START_FLAG_DESC: u8 = 0xFE;
const NULL_FLAG_DESC: u8 = 0xFF;

/// Which Numeric sort-key convention to use; `Current` fixes a sort bug
/// present in `Legacy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumericKeyVariant {
    Legacy,
    Current,
}

fn entry_prefix(ascending: bool, is_null: bool) -> u8 {
    match (ascending, is_null) {
        (true, true) => NULL_FLAG_ASC,
        (true, false) => START_FLAG_ASC,
        (false, false) => START_FLAG_DESC,
        (false, true) => NULL_FLAG_DESC,
    }
}

fn flip(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        *b = !*b;
    }
}

fn encode_signed(bytes_be: &[u8], ascending: bool) -> Vec<u8> {
    let mut out = bytes_be.to_vec();
    out[0] ^= 0x80;
    if !ascending {
        flip(&mut out);
    }
    out
}

fn encode_unsigned(bytes_be: &[u8], ascending: bool) -> Vec<u8> {
    let mut out = bytes_be.to_vec();
    if !ascending {
        flip(&mut out);
    }
    out
}

fn encode_float_bits(bits_be: &mut [u8]) {
    if bits_be[0] & 0x80 != 0 {
        flip(bits_be);
    } else {
        bits_be[0] ^= 0x80;
    }
}

fn encode_float(v: f32, ascending: bool) -> Vec<u8> {
    let mut bytes = v.to_bits().to_be_bytes();
    encode_float_bits(&mut bytes);
    if !ascending {
        flip(&mut bytes);
    }
    bytes.to_vec()
}

fn encode_double(v: f64, ascending: bool) -> Vec<u8> {
    let mut bytes = v.to_bits().to_be_bytes();
    encode_float_bits(&mut bytes);
    if !ascending {
        flip(&mut bytes);
    }
    bytes.to_vec()
}

fn encode_numeric(n: Numeric, ascending: bool, variant: NumericKeyVariant) -> Vec<u8> {
    let mut be = n.to_u128().to_be_bytes();
    match variant {
        NumericKeyVariant::Legacy => {
            if n.negative == ascending {
                flip(&mut be);
            }
            let mut out = vec![if n.negative { 0x00 } else { 0xFF }];
            out.extend_from_slice(&be);
            out
        }
        NumericKeyVariant::Current => {
            if n.negative == ascending {
                flip(&mut be);
            }
            let mut out = vec![0xFFu8];
            out.extend_from_slice(&be);
            out
        }
    }
}

fn encode_bool(v: bool, ascending: bool) -> u8 {
    match (ascending, v) {
        (true, false) => 0x00,
        (true, true) => 0x01,
        (false, true) => 0x00,
        (false, false) => 0x01,
    }
}

/// GUID/Binary segmented encoding: 8 data bytes + 1 marker byte per
/// segment; marker is `0x09` while more segments follow, else the number
/// of valid bytes in the final segment. Descending flips every data byte
/// (markers stay put except the final segment's length byte, which also
/// flips).
fn encode_segmented(data: &[u8], ascending: bool) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        let remaining = data.len() - i;
        let take = remaining.min(8);
        let is_last = take == remaining;
        let mut seg = [0u8; 8];
        seg[..take].copy_from_slice(&data[i..i + take]);
        if !ascending {
            flip(&mut seg);
        }
        out.extend_from_slice(&seg);
        if is_last {
            let len_byte = take as u8;
            out.push(if !ascending { !len_byte } else { len_byte });
            break;
        }
        out.push(0x09);
        i += take;
    }
    out
}

fn to_upper_u16(u: u16) -> u16 {
    char::from_u32(u as u32)
        .and_then(|c| c.to_uppercase().next())
        .map(|c| c as u16)
        .unwrap_or(u)
}

/// Simplified monotone text collation: primary weight is the uppercased
/// UTF-16 code unit; a secondary weight breaks case ties. Not byte-parity
/// with the three historical collation tables (see DESIGN.md), but it
/// satisfies the monotone-key invariant: `a < b` implies `encode(a) <
/// encode(b)` byte-wise.
fn encode_text(s: &str, ascending: bool) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut out = Vec::with_capacity(units.len() * 3 + 1);
    for &u in &units {
        out.extend_from_slice(&to_upper_u16(u).to_be_bytes());
    }
    out.push(0x00);
    for &u in &units {
        out.push(if u == to_upper_u16(u) { 0 } else { 1 });
    }
    if !ascending {
        flip(&mut out);
    }
    out
}

/// Encode one column's value into its sortable entry-key body (not
/// including the null/start flag byte; see [`encode_entry`]).
fn encode_body(value: &Value, ascending: bool, numeric_variant: NumericKeyVariant) -> Vec<u8> {
    match value {
        Value::Null => Vec::new(),
        Value::Boolean(b) => vec![encode_bool(*b, ascending)],
        Value::Byte(b) => encode_unsigned(&[*b], ascending),
        Value::Int(v) => encode_signed(&v.to_be_bytes(), ascending),
        Value::Long(v) => encode_signed(&v.to_be_bytes(), ascending),
        Value::BigInt(v) => encode_signed(&v.to_be_bytes(), ascending),
        Value::ComplexFk(v) => encode_signed(&v.to_be_bytes(), ascending),
        Value::Float(v) => encode_float(*v, ascending),
        Value::Double(v) => encode_double(*v, ascending),
        // Date/time keys reuse the double encoding: on disk it *is* an f64.
        Value::DateTime(d) => encode_double(d.days(), ascending),
        Value::Money(v) => encode_signed(&v.to_be_bytes(), ascending),
        Value::Numeric(n) => encode_numeric(*n, ascending, numeric_variant),
        Value::Guid(b) => encode_segmented(b, ascending),
        Value::Binary(b) => encode_segmented(b, ascending),
        Value::Text(s) | Value::Memo(s) => encode_text(s, ascending),
    }
}

/// Encode a full index entry key for one column value: a null/start flag
/// byte, then the type-specific body if non-null.
pub fn encode_entry(value: &Value, ascending: bool, numeric_variant: NumericKeyVariant) -> Vec<u8> {
    let mut out = vec![entry_prefix(ascending, value.is_null())];
    if !value.is_null() {
        out.extend(encode_body(value, ascending, numeric_variant));
    }
    out
}

/// Concatenate per-column entry keys for a composite index, in column
/// order, then append the `page_number:3 || row_number:1` leaf trailer.
pub fn encode_composite(
    values: &[(Value, bool)],
    numeric_variant: NumericKeyVariant,
    page_number: u32,
    row_number: u8,
) -> Vec<u8> {
    let mut out = Vec::new();
    for (value, ascending) in values {
        out.extend(encode_entry(value, *ascending, numeric_variant));
    }
    out.extend_from_slice(&page_number.to_be_bytes()[1..4]);
    out.push(row_number);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_keys_are_monotone() {
        let a = encode_entry(&Value::Long(-5), true, NumericKeyVariant::Current);
        let b = encode_entry(&Value::Long(10), true, NumericKeyVariant::Current);
        assert!(a < b);
    }

    #[test]
    fn descending_inverts_order() {
        let a = encode_entry(&Value::Long(-5), false, NumericKeyVariant::Current);
        let b = encode_entry(&Value::Long(10), false, NumericKeyVariant::Current);
        assert!(a > b);
    }

    #[test]
    fn null_sorts_before_values_ascending() {
        let n = encode_entry(&Value::Null, true, NumericKeyVariant::Current);
        let v = encode_entry(&Value::Long(-1_000_000), true, NumericKeyVariant::Current);
        assert!(n < v);
    }

    #[test]
    fn float_ordering_matches_ieee_order() {
        let a = encode_entry(&Value::Double(-1.5), true, NumericKeyVariant::Current);
        let b = encode_entry(&Value::Double(0.0), true, NumericKeyVariant::Current);
        let c = encode_entry(&Value::Double(2.25), true, NumericKeyVariant::Current);
        assert!(a < b && b < c);
    }

    #[test]
    fn numeric_negative_sorts_before_positive() {
        let neg = Value::Numeric(Numeric::from_u128(500, true));
        let pos = Value::Numeric(Numeric::from_u128(500, false));
        let a = encode_entry(&neg, true, NumericKeyVariant::Current);
        let b = encode_entry(&pos, true, NumericKeyVariant::Current);
        assert!(a < b);
    }

    #[test]
    fn text_case_insensitive_primary_weight_is_monotone() {
        let a = encode_entry(&Value::Text("apple".into()), true, NumericKeyVariant::Current);
        let b = encode_entry(&Value::Text("Banana".into()), true, NumericKeyVariant::Current);
        assert!(a < b);
    }

    #[test]
    fn composite_key_includes_trailer() {
        let values = vec![(Value::Long(1), true)];
        let key = encode_composite(&values, NumericKeyVariant::Current, 0x01_02_03, 5);
        assert_eq!(&key[key.len() - 4..key.len() - 1], &[0x01, 0x02, 0x03]);
        assert_eq!(key[key.len() - 1], 5);
    }
}
