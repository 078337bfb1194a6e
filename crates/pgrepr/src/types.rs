use crate::error::{PgReprError, Result};
use crate::format::Format;
use sqlengine::{SqlType, Value};
use std::fmt::Write as _;

/// Type OIDs advertised in RowDescription and ParameterDescription.
///
/// `INTEGER` maps to int8, `BLOB` to bytea. Unconstrained (`ANY`) parameters
/// advertise oid 0, which tells the client the type is unspecified.
pub fn type_oid(ty: SqlType) -> i32 {
    match ty {
        SqlType::Integer => 20,
        SqlType::Varchar => 1043,
        SqlType::Boolean => 16,
        SqlType::Blob => 17,
        SqlType::Any => 0,
    }
}

/// The `typlen` advertised for a type; variable-width types are -1.
pub fn type_size(ty: SqlType) -> i16 {
    match ty {
        SqlType::Integer => 8,
        SqlType::Boolean => 1,
        SqlType::Varchar | SqlType::Blob | SqlType::Any => -1,
    }
}

/// Encodes a non-null value as a DataRow cell body in the given format.
pub fn encode_value(value: &Value, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Text => encode_text(value),
        Format::Binary => encode_binary(value),
    }
}

fn encode_text(value: &Value) -> Result<Vec<u8>> {
    let mut out = String::new();
    match value {
        Value::Integer(v) => write!(out, "{}", v).expect("writing to a string"),
        Value::Boolean(v) => out.push(if *v { 't' } else { 'f' }),
        Value::Varchar(v) => out.push_str(v),
        Value::Blob(v) => {
            out.push_str("\\x");
            for b in v {
                write!(out, "{:02x}", b).expect("writing to a string");
            }
        }
        Value::Null(_) => {
            return Err(PgReprError::UnsupportedParameter(
                "null has no cell body".into(),
            ))
        }
    }
    Ok(out.into_bytes())
}

fn encode_binary(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Integer(v) => Ok(v.to_be_bytes().to_vec()),
        Value::Boolean(v) => Ok(vec![u8::from(*v)]),
        Value::Varchar(v) => Ok(v.as_bytes().to_vec()),
        Value::Blob(v) => Ok(v.clone()),
        Value::Null(_) => Err(PgReprError::UnsupportedParameter(
            "null has no cell body".into(),
        )),
    }
}

/// Decodes a Bind parameter of a declared type from its wire bytes.
pub fn decode_param(ty: SqlType, format: Format, raw: &[u8]) -> Result<Value> {
    match format {
        Format::Text => decode_text(ty, raw),
        Format::Binary => decode_binary(ty, raw),
    }
}

fn decode_text(ty: SqlType, raw: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| PgReprError::Parse("parameter is not valid utf-8".into()))?;
    match ty {
        SqlType::Integer => text
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| PgReprError::Parse(format!("invalid integer: {}", text))),
        SqlType::Boolean => match text {
            "t" | "true" | "TRUE" | "1" => Ok(Value::Boolean(true)),
            "f" | "false" | "FALSE" | "0" => Ok(Value::Boolean(false)),
            other => Err(PgReprError::Parse(format!("invalid boolean: {}", other))),
        },
        SqlType::Varchar | SqlType::Any => Ok(Value::Varchar(text.to_string())),
        SqlType::Blob => {
            let hex = text
                .strip_prefix("\\x")
                .ok_or_else(|| PgReprError::Parse("bytea must use hex encoding".into()))?;
            if hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(PgReprError::Parse("invalid bytea literal".into()));
            }
            let bytes = (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("checked hex digits"))
                .collect();
            Ok(Value::Blob(bytes))
        }
    }
}

fn decode_binary(ty: SqlType, raw: &[u8]) -> Result<Value> {
    match ty {
        SqlType::Integer => match raw.len() {
            2 => Ok(Value::Integer(i16::from_be_bytes(
                raw.try_into().expect("checked length"),
            ) as i64)),
            4 => Ok(Value::Integer(i32::from_be_bytes(
                raw.try_into().expect("checked length"),
            ) as i64)),
            8 => Ok(Value::Integer(i64::from_be_bytes(
                raw.try_into().expect("checked length"),
            ))),
            n => Err(PgReprError::Parse(format!("invalid integer length: {}", n))),
        },
        SqlType::Boolean => match raw {
            [0] => Ok(Value::Boolean(false)),
            [1] => Ok(Value::Boolean(true)),
            _ => Err(PgReprError::Parse("invalid boolean".into())),
        },
        SqlType::Varchar => match std::str::from_utf8(raw) {
            Ok(s) => Ok(Value::Varchar(s.to_string())),
            Err(_) => Err(PgReprError::Parse("varchar is not valid utf-8".into())),
        },
        SqlType::Blob | SqlType::Any => Ok(Value::Blob(raw.to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oids_match_postgres() {
        assert_eq!(type_oid(SqlType::Integer), 20);
        assert_eq!(type_oid(SqlType::Varchar), 1043);
        assert_eq!(type_oid(SqlType::Boolean), 16);
        assert_eq!(type_oid(SqlType::Blob), 17);
    }

    #[test]
    fn text_encoding() {
        assert_eq!(
            encode_value(&Value::Integer(-42), Format::Text).unwrap(),
            b"-42".to_vec()
        );
        assert_eq!(
            encode_value(&Value::Boolean(true), Format::Text).unwrap(),
            b"t".to_vec()
        );
        assert_eq!(
            encode_value(&Value::Blob(vec![0x0a, 0xff]), Format::Text).unwrap(),
            b"\\x0aff".to_vec()
        );
    }

    #[test]
    fn binary_round_trip() {
        for value in [
            Value::Integer(-7),
            Value::Boolean(true),
            Value::Varchar("hi".into()),
            Value::Blob(vec![1, 2, 3]),
        ] {
            let raw = encode_value(&value, Format::Binary).unwrap();
            assert_eq!(
                decode_param(value.ty(), Format::Binary, &raw).unwrap(),
                value
            );
        }
    }

    #[test]
    fn text_round_trip() {
        for value in [
            Value::Integer(123),
            Value::Boolean(false),
            Value::Varchar("x'y".into()),
            Value::Blob(vec![0xde, 0xad]),
        ] {
            let raw = encode_value(&value, Format::Text).unwrap();
            assert_eq!(decode_param(value.ty(), Format::Text, &raw).unwrap(), value);
        }
    }

    #[test]
    fn short_binary_integers_widen() {
        assert_eq!(
            decode_param(SqlType::Integer, Format::Binary, &1i32.to_be_bytes()).unwrap(),
            Value::Integer(1)
        );
        assert_eq!(
            decode_param(SqlType::Integer, Format::Binary, &(-2i16).to_be_bytes()).unwrap(),
            Value::Integer(-2)
        );
    }

    #[test]
    fn invalid_parameters_fail() {
        assert!(decode_param(SqlType::Integer, Format::Text, b"abc").is_err());
        assert!(decode_param(SqlType::Boolean, Format::Text, b"yes").is_err());
        assert!(decode_param(SqlType::Integer, Format::Binary, &[1, 2, 3]).is_err());
        assert!(decode_param(SqlType::Blob, Format::Text, b"0aff").is_err());
    }
}
