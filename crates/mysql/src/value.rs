//! Values crossing the wire, in both the text and binary encodings.

use common::{
    Error,
    Result,
};

use crate::{
    constants::*,
    packet::{
        put_lenenc_bytes,
        PayloadReader,
    },
};

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micro: u32,
    },
    Time {
        negative: bool,
        days: u32,
        hours: u8,
        minutes: u8,
        seconds: u8,
        micro: u32,
    },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// (type code, parameter flag) pair sent with COM_STMT_EXECUTE.
    pub(crate) fn type_code(&self) -> (u8, u8) {
        match self {
            Value::Null => (TYPE_NULL, 0),
            Value::Int(_) => (TYPE_LONGLONG, 0),
            Value::UInt(_) => (TYPE_LONGLONG, 0x80),
            Value::Float(_) => (TYPE_FLOAT, 0),
            Value::Double(_) => (TYPE_DOUBLE, 0),
            Value::Bytes(_) => (TYPE_VAR_STRING, 0),
            Value::Date { .. } => (TYPE_DATETIME, 0),
            Value::Time { .. } => (TYPE_TIME, 0),
        }
    }

    /// Binary-protocol parameter encoding. `Null` contributes nothing; it
    /// travels in the NULL bitmap.
    pub(crate) fn encode_binary(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => (),
            Value::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Bytes(bytes) => put_lenenc_bytes(out, bytes),
            Value::Date {
                year,
                month,
                day,
                hour,
                minute,
                second,
                micro,
            } => {
                out.push(11);
                out.extend_from_slice(&year.to_le_bytes());
                out.extend_from_slice(&[*month, *day, *hour, *minute, *second]);
                out.extend_from_slice(&micro.to_le_bytes());
            },
            Value::Time {
                negative,
                days,
                hours,
                minutes,
                seconds,
                micro,
            } => {
                out.push(12);
                out.push(u8::from(*negative));
                out.extend_from_slice(&days.to_le_bytes());
                out.extend_from_slice(&[*hours, *minutes, *seconds]);
                out.extend_from_slice(&micro.to_le_bytes());
            },
        }
    }

    /// Decode one binary-row value of the given column type.
    pub(crate) fn decode_binary(
        reader: &mut PayloadReader<'_>,
        column_type: u8,
        unsigned: bool,
    ) -> Result<Value> {
        let value = match column_type {
            TYPE_TINY => {
                let raw = reader.u8()?;
                if unsigned {
                    Value::UInt(raw as u64)
                } else {
                    Value::Int(raw as i8 as i64)
                }
            },
            TYPE_SHORT | TYPE_YEAR => {
                let raw = reader.u16_le()?;
                if unsigned {
                    Value::UInt(raw as u64)
                } else {
                    Value::Int(raw as i16 as i64)
                }
            },
            TYPE_LONG | TYPE_INT24 => {
                let raw = reader.u32_le()?;
                if unsigned {
                    Value::UInt(raw as u64)
                } else {
                    Value::Int(raw as i32 as i64)
                }
            },
            TYPE_LONGLONG => {
                let raw = reader.u64_le()?;
                if unsigned {
                    Value::UInt(raw)
                } else {
                    Value::Int(raw as i64)
                }
            },
            TYPE_FLOAT => Value::Float(reader.f32_le()?),
            TYPE_DOUBLE => Value::Double(reader.f64_le()?),
            TYPE_DATE | TYPE_DATETIME | TYPE_TIMESTAMP => {
                let len = reader.u8()?;
                let mut year = 0u16;
                let (mut month, mut day, mut hour, mut minute, mut second) = (0, 0, 0, 0, 0);
                let mut micro = 0u32;
                if len >= 4 {
                    year = reader.u16_le()?;
                    month = reader.u8()?;
                    day = reader.u8()?;
                }
                if len >= 7 {
                    hour = reader.u8()?;
                    minute = reader.u8()?;
                    second = reader.u8()?;
                }
                if len >= 11 {
                    micro = reader.u32_le()?;
                }
                Value::Date {
                    year,
                    month,
                    day,
                    hour,
                    minute,
                    second,
                    micro,
                }
            },
            TYPE_TIME => {
                let len = reader.u8()?;
                let (mut negative, mut days) = (false, 0u32);
                let (mut hours, mut minutes, mut seconds) = (0, 0, 0);
                let mut micro = 0u32;
                if len >= 8 {
                    negative = reader.u8()? != 0;
                    days = reader.u32_le()?;
                    hours = reader.u8()?;
                    minutes = reader.u8()?;
                    seconds = reader.u8()?;
                }
                if len >= 12 {
                    micro = reader.u32_le()?;
                }
                Value::Time {
                    negative,
                    days,
                    hours,
                    minutes,
                    seconds,
                    micro,
                }
            },
            _ => Value::Bytes(reader.lenenc_bytes()?.to_vec()),
        };
        Ok(value)
    }

    /// Decode one text-row value of the given column type.
    pub(crate) fn decode_text(raw: &[u8], column_type: u8, unsigned: bool) -> Result<Value> {
        let text = || {
            std::str::from_utf8(raw)
                .map_err(|_| Error::protocol("non-UTF-8 text value in a numeric column"))
        };
        let value = match column_type {
            TYPE_TINY | TYPE_SHORT | TYPE_LONG | TYPE_INT24 | TYPE_LONGLONG | TYPE_YEAR => {
                if unsigned {
                    Value::UInt(text()?.parse().map_err(|_| {
                        Error::protocol("unparseable unsigned integer in text row")
                    })?)
                } else {
                    Value::Int(text()?.parse().map_err(|_| {
                        Error::protocol("unparseable integer in text row")
                    })?)
                }
            },
            TYPE_FLOAT => Value::Float(
                text()?
                    .parse()
                    .map_err(|_| Error::protocol("unparseable float in text row"))?,
            ),
            TYPE_DOUBLE => Value::Double(
                text()?
                    .parse()
                    .map_err(|_| Error::protocol("unparseable double in text row"))?,
            ),
            _ => Value::Bytes(raw.to_vec()),
        };
        Ok(value)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(v.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Bytes(v.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Conversion out of a decoded value.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn conversion_error(wanted: &str, value: &Value) -> Error {
    Error::usage(format!("cannot convert {value:?} to {wanted}"))
}

macro_rules! int_from_value {
    ($ty:ty) => {
        impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self> {
                match value {
                    Value::Int(v) => <$ty>::try_from(*v)
                        .map_err(|_| conversion_error(stringify!($ty), value)),
                    Value::UInt(v) => <$ty>::try_from(*v)
                        .map_err(|_| conversion_error(stringify!($ty), value)),
                    Value::Bytes(raw) => std::str::from_utf8(raw)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| conversion_error(stringify!($ty), value)),
                    _ => Err(conversion_error(stringify!($ty), value)),
                }
            }
        }
    };
}

int_from_value!(i64);
int_from_value!(i32);
int_from_value!(i16);
int_from_value!(u64);
int_from_value!(u32);
int_from_value!(u16);
int_from_value!(u8);

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(i64::from_value(value)? != 0)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(*v as f64),
            Value::Double(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            Value::UInt(v) => Ok(*v as f64),
            Value::Bytes(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| conversion_error("f64", value)),
            _ => Err(conversion_error("f64", value)),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(f64::from_value(value)? as f32)
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(raw) => String::from_utf8(raw.clone())
                .map_err(|_| conversion_error("String", value)),
            Value::Int(v) => Ok(v.to_string()),
            Value::UInt(v) => Ok(v.to_string()),
            Value::Double(v) => Ok(v.to_string()),
            Value::Float(v) => Ok(v.to_string()),
            _ => Err(conversion_error("String", value)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(raw) => Ok(raw.clone()),
            _ => Err(conversion_error("Vec<u8>", value)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_int_round_trip() {
        let mut out = Vec::new();
        Value::Int(-42).encode_binary(&mut out);
        let mut reader = PayloadReader::new(&out);
        assert_eq!(
            Value::decode_binary(&mut reader, TYPE_LONGLONG, false).unwrap(),
            Value::Int(-42)
        );
    }

    #[test]
    fn test_binary_bytes_round_trip() {
        let mut out = Vec::new();
        Value::Bytes(b"hello".to_vec()).encode_binary(&mut out);
        let mut reader = PayloadReader::new(&out);
        assert_eq!(
            Value::decode_binary(&mut reader, TYPE_VAR_STRING, false).unwrap(),
            Value::Bytes(b"hello".to_vec())
        );
    }

    #[test]
    fn test_binary_datetime_round_trip() {
        let value = Value::Date {
            year: 2024,
            month: 2,
            day: 29,
            hour: 12,
            minute: 30,
            second: 59,
            micro: 123456,
        };
        let mut out = Vec::new();
        value.encode_binary(&mut out);
        let mut reader = PayloadReader::new(&out);
        assert_eq!(
            Value::decode_binary(&mut reader, TYPE_DATETIME, false).unwrap(),
            value
        );
    }

    #[test]
    fn test_text_decoding_follows_column_type() {
        assert_eq!(
            Value::decode_text(b"-17", TYPE_LONG, false).unwrap(),
            Value::Int(-17)
        );
        assert_eq!(
            Value::decode_text(b"250", TYPE_TINY, true).unwrap(),
            Value::UInt(250)
        );
        assert_eq!(
            Value::decode_text(b"2.5", TYPE_DOUBLE, false).unwrap(),
            Value::Double(2.5)
        );
        assert_eq!(
            Value::decode_text(b"abc", TYPE_VAR_STRING, false).unwrap(),
            Value::Bytes(b"abc".to_vec())
        );
    }

    #[test]
    fn test_from_value_conversions() {
        assert_eq!(i64::from_value(&Value::Int(-5)).unwrap(), -5);
        assert_eq!(u32::from_value(&Value::UInt(7)).unwrap(), 7);
        assert_eq!(i64::from_value(&Value::Bytes(b"123".to_vec())).unwrap(), 123);
        assert_eq!(
            String::from_value(&Value::Bytes(b"name".to_vec())).unwrap(),
            "name"
        );
        assert_eq!(Option::<i64>::from_value(&Value::Null).unwrap(), None);
        assert!(i64::from_value(&Value::Bytes(vec![0xff])).is_err());
        assert!(u8::from_value(&Value::Int(300)).is_err());
    }
}
