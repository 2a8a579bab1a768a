//! Binary wire decoding of `tokio-postgres` rows into canonical values.

use std::error::Error;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use outflow_types::schema::{Row, Value};
use tokio_postgres::types::{FromSql, Type};

type BoxError = Box<dyn Error + Sync + Send>;

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// One cell decoded from whatever type the server sent.
pub(crate) struct Cell(pub Value);

impl<'a> FromSql<'a> for Cell {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        let value = match *ty {
            Type::BOOL => Value::Boolean(bool::from_sql(ty, raw)?),
            Type::INT2 => Value::Integer(i64::from(i16::from_sql(ty, raw)?)),
            Type::INT4 => Value::Integer(i64::from(i32::from_sql(ty, raw)?)),
            Type::INT8 => Value::Integer(i64::from_sql(ty, raw)?),
            Type::OID => Value::Integer(i64::from(u32::from_sql(ty, raw)?)),
            Type::FLOAT4 => Value::Number(f64::from(f32::from_sql(ty, raw)?)),
            Type::FLOAT8 => Value::Number(f64::from_sql(ty, raw)?),
            Type::NUMERIC => Value::Number(decode_numeric(raw)?),
            Type::DATE => Value::Date(NaiveDate::from_sql(ty, raw)?),
            Type::TIMESTAMP => Value::TimestampNtz(NaiveDateTime::from_sql(ty, raw)?),
            Type::TIMESTAMPTZ => Value::TimestampTz(DateTime::<Utc>::from_sql(ty, raw)?),
            Type::JSON | Type::JSONB => Value::Json(serde_json::Value::from_sql(ty, raw)?),
            _ => Value::String(String::from_utf8_lossy(raw).into_owned()),
        };
        Ok(Self(value))
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(Self(Value::Null))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Decode the binary `NUMERIC` format (base-10000 digit groups) into `f64`.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn decode_numeric(raw: &[u8]) -> Result<f64, BoxError> {
    let word = |i: usize| -> Result<[u8; 2], BoxError> {
        raw.get(i..i + 2)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| "numeric: truncated buffer".into())
    };
    let ndigits = i16::from_be_bytes(word(0)?);
    let weight = i16::from_be_bytes(word(2)?);
    let sign = u16::from_be_bytes(word(4)?);
    if sign == NUMERIC_NAN {
        return Ok(f64::NAN);
    }

    let mut value = 0.0_f64;
    let mut exponent = i32::from(weight);
    for i in 0..ndigits.max(0) as usize {
        let digit = i16::from_be_bytes(word(8 + i * 2)?);
        value += f64::from(digit) * 10_000_f64.powi(exponent);
        exponent -= 1;
    }
    Ok(if sign == NUMERIC_NEG { -value } else { value })
}

/// Decode every column of a row, in order.
pub(crate) fn decode_row(row: &tokio_postgres::Row) -> Result<Row, tokio_postgres::Error> {
    (0..row.len())
        .map(|i| row.try_get::<_, Cell>(i).map(|cell| cell.0))
        .collect()
}
