//! Order-preserving key and row-value encoding.
//!
//! Every persisted key is built from fixed-width, big-endian segments so that
//! the store's lexicographic order matches the engine's value order. Row
//! payloads carry a null bitmap followed by length-prefixed column values.

use crate::errors::{Result, SqlError};
use crate::schema::Column;
use crate::value::{SqlType, Value};
use bytes::{Buf, BufMut};

/// Key namespace for catalog database records.
pub const NS_CTL_DATABASE: &str = "CTL.DATABASE.";
/// Key namespace for catalog table records.
pub const NS_CTL_TABLE: &str = "CTL.TABLE.";
/// Key namespace for catalog column records.
pub const NS_CTL_COLUMN: &str = "CTL.COLUMN.";
/// Key namespace for catalog index records.
pub const NS_CTL_INDEX: &str = "CTL.INDEX.";
/// Key namespace for primary-index rows.
pub const NS_PRIMARY: &str = "P/";
/// Key namespace for non-unique secondary-index entries.
pub const NS_SECONDARY: &str = "S/";
/// Key namespace for unique secondary-index entries.
pub const NS_UNIQUE_SECONDARY: &str = "U/";

/// Builds `prefix + namespace + segments...`.
pub fn map_key(prefix: &[u8], ns: &str, segments: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(
        prefix.len() + ns.len() + segments.iter().map(|s| s.len()).sum::<usize>(),
    );
    key.put_slice(prefix);
    key.put_slice(ns.as_bytes());
    for segment in segments {
        key.put_slice(segment);
    }
    key
}

pub fn encode_id(id: u32) -> [u8; 4] {
    id.to_be_bytes()
}

pub fn decode_id(buf: &[u8]) -> Result<u32> {
    if buf.len() < 4 {
        return Err(SqlError::CorruptedData);
    }
    Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// Encodes a value as a fixed-width, order-preserving key segment.
///
/// Integers flip the sign bit of their big-endian two's complement form so
/// negative values sort below positive ones. Varchar and blob segments are
/// right-padded with zero bytes to the column's declared length.
pub fn encode_key_segment(v: &Value, col: &Column) -> Result<Vec<u8>> {
    if v.is_null() {
        return Err(SqlError::IndexedColumnCannotBeNull);
    }
    v.check_type(col.ty)?;

    let width = col.key_len()?;
    match v {
        Value::Integer(i) => Ok(((*i as u64) ^ (1u64 << 63)).to_be_bytes().to_vec()),
        Value::Boolean(b) => Ok(vec![u8::from(*b)]),
        Value::Varchar(s) => pad_bytes(s.as_bytes(), width),
        Value::Blob(b) => pad_bytes(b, width),
        Value::Null(_) => unreachable!(),
    }
}

fn pad_bytes(raw: &[u8], width: usize) -> Result<Vec<u8>> {
    if raw.len() > width {
        return Err(SqlError::MaxLengthExceeded);
    }
    let mut buf = raw.to_vec();
    buf.resize(width, 0);
    Ok(buf)
}

/// Raw (unpadded) value encoding used inside row payloads.
fn encode_raw(v: &Value, col: &Column) -> Result<Vec<u8>> {
    v.check_type(col.ty)?;
    match v {
        Value::Integer(i) => Ok(((*i as u64) ^ (1u64 << 63)).to_be_bytes().to_vec()),
        Value::Boolean(b) => Ok(vec![u8::from(*b)]),
        Value::Varchar(s) => {
            if col.max_len > 0 && s.len() > col.max_len {
                return Err(SqlError::MaxLengthExceeded);
            }
            Ok(s.as_bytes().to_vec())
        }
        Value::Blob(b) => {
            if col.max_len > 0 && b.len() > col.max_len {
                return Err(SqlError::MaxLengthExceeded);
            }
            Ok(b.clone())
        }
        Value::Null(_) => Err(SqlError::InvalidValue),
    }
}

fn decode_raw(buf: &[u8], ty: SqlType) -> Result<Value> {
    match ty {
        SqlType::Integer => {
            if buf.len() != 8 {
                return Err(SqlError::CorruptedData);
            }
            let biased = u64::from_be_bytes(buf.try_into().expect("checked length"));
            Ok(Value::Integer((biased ^ (1u64 << 63)) as i64))
        }
        SqlType::Boolean => match buf {
            [0x00] => Ok(Value::Boolean(false)),
            [0x01] => Ok(Value::Boolean(true)),
            _ => Err(SqlError::CorruptedData),
        },
        SqlType::Varchar => match std::str::from_utf8(buf) {
            Ok(s) => Ok(Value::Varchar(s.to_string())),
            Err(_) => Err(SqlError::CorruptedData),
        },
        SqlType::Blob => Ok(Value::Blob(buf.to_vec())),
        SqlType::Any => Err(SqlError::CorruptedData),
    }
}

/// Encodes a full row payload: a null bitmap over the table's columns, then
/// each non-null value in column order as a 4-byte big-endian length followed
/// by the raw bytes.
pub fn encode_row(values: &[Value], cols: &[Column]) -> Result<Vec<u8>> {
    if values.len() != cols.len() {
        return Err(SqlError::IllegalArguments);
    }

    let mut bitmap = vec![0u8; cols.len().div_ceil(8)];
    for (pos, v) in values.iter().enumerate() {
        if v.is_null() {
            bitmap[pos / 8] |= 1 << (pos % 8);
        }
    }

    let mut buf = Vec::new();
    buf.put_slice(&bitmap);
    for (v, col) in values.iter().zip(cols) {
        if v.is_null() {
            continue;
        }
        let raw = encode_raw(v, col)?;
        buf.put_u32(raw.len() as u32);
        buf.put_slice(&raw);
    }
    Ok(buf)
}

/// Decodes a row payload back into one value per column; absent columns come
/// back as typed nulls.
pub fn decode_row(mut buf: &[u8], cols: &[Column]) -> Result<Vec<Value>> {
    let bitmap_len = cols.len().div_ceil(8);
    if buf.len() < bitmap_len {
        return Err(SqlError::CorruptedData);
    }
    let bitmap = &buf[..bitmap_len];
    let is_null = |pos: usize| bitmap[pos / 8] & (1 << (pos % 8)) != 0;
    buf = &buf[bitmap_len..];

    let mut values = Vec::with_capacity(cols.len());
    for (pos, col) in cols.iter().enumerate() {
        if is_null(pos) {
            values.push(Value::Null(col.ty));
            continue;
        }
        if buf.remaining() < 4 {
            return Err(SqlError::CorruptedData);
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(SqlError::CorruptedData);
        }
        values.push(decode_raw(&buf[..len], col.ty)?);
        buf.advance(len);
    }
    if buf.has_remaining() {
        return Err(SqlError::CorruptedData);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(ty: SqlType, max_len: usize) -> Column {
        Column {
            id: 1,
            name: "c".into(),
            ty,
            max_len,
            not_null: false,
            auto_increment: false,
        }
    }

    #[test]
    fn integer_key_round_trip() {
        let c = col(SqlType::Integer, 0);
        for v in [i64::MIN, -1000, -1, 0, 1, 42, i64::MAX] {
            let encoded = encode_key_segment(&Value::Integer(v), &c).unwrap();
            assert_eq!(decode_raw(&encoded, SqlType::Integer).unwrap(), Value::Integer(v));
        }
    }

    #[test]
    fn integer_keys_preserve_order_across_zero() {
        let c = col(SqlType::Integer, 0);
        let values = [i64::MIN, -65536, -2, -1, 0, 1, 2, 65536, i64::MAX];
        let keys: Vec<_> = values
            .iter()
            .map(|v| encode_key_segment(&Value::Integer(*v), &c).unwrap())
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn varchar_keys_preserve_order() {
        let c = col(SqlType::Varchar, 8);
        let values = ["", "a", "aa", "ab", "b"];
        let keys: Vec<_> = values
            .iter()
            .map(|v| encode_key_segment(&Value::Varchar(v.to_string()), &c).unwrap())
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for key in keys {
            assert_eq!(key.len(), 8);
        }
    }

    #[test]
    fn boolean_keys() {
        let c = col(SqlType::Boolean, 0);
        let f = encode_key_segment(&Value::Boolean(false), &c).unwrap();
        let t = encode_key_segment(&Value::Boolean(true), &c).unwrap();
        assert_eq!(f, vec![0x00]);
        assert_eq!(t, vec![0x01]);
    }

    #[test]
    fn oversized_key_segment_fails() {
        let c = col(SqlType::Varchar, 4);
        let err = encode_key_segment(&Value::Varchar("hello".into()), &c).unwrap_err();
        assert_eq!(err, SqlError::MaxLengthExceeded);
    }

    #[test]
    fn mistyped_value_fails() {
        let c = col(SqlType::Integer, 0);
        let err = encode_key_segment(&Value::Varchar("1".into()), &c).unwrap_err();
        assert_eq!(err, SqlError::InvalidValue);
    }

    #[test]
    fn unbounded_varchar_is_not_a_key_type() {
        let c = col(SqlType::Varchar, 0);
        let err = encode_key_segment(&Value::Varchar("x".into()), &c).unwrap_err();
        assert_eq!(err, SqlError::LimitedKeyType);
    }

    #[test]
    fn row_round_trip_with_nulls() {
        let cols = vec![
            col(SqlType::Integer, 0),
            col(SqlType::Varchar, 16),
            col(SqlType::Boolean, 0),
            col(SqlType::Blob, 16),
        ];
        let values = vec![
            Value::Integer(-7),
            Value::Null(SqlType::Varchar),
            Value::Boolean(true),
            Value::Blob(vec![1, 2, 3]),
        ];
        let buf = encode_row(&values, &cols).unwrap();
        assert_eq!(decode_row(&buf, &cols).unwrap(), values);
    }

    #[test]
    fn truncated_row_is_corrupted() {
        let cols = vec![col(SqlType::Integer, 0)];
        let buf = encode_row(&[Value::Integer(1)], &cols).unwrap();
        let err = decode_row(&buf[..buf.len() - 1], &cols).unwrap_err();
        assert_eq!(err, SqlError::CorruptedData);
    }

    #[test]
    fn trailing_bytes_are_corrupted() {
        let cols = vec![col(SqlType::Integer, 0)];
        let mut buf = encode_row(&[Value::Integer(1)], &cols).unwrap();
        buf.push(0);
        assert_eq!(decode_row(&buf, &cols).unwrap_err(), SqlError::CorruptedData);
    }

    #[test]
    fn map_key_concatenates_segments() {
        let key = map_key(b"\x02", NS_PRIMARY, &[&[0, 0, 0, 1], &[0, 0, 0, 2]]);
        assert_eq!(key, b"\x02P/\x00\x00\x00\x01\x00\x00\x00\x02".to_vec());
    }
}
