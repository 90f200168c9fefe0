use crate::error::RelLiteError;
use crate::schema::{Column, DataType, TableSchema};
use crate::Result;
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::fmt;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single typed cell. Records are `Vec<Value>` in schema column order.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Varchar(String),
    Bool(bool),
    Date(NaiveDate),
    Point(f32, f32),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::Varchar(_) => DataType::Varchar,
            Value::Bool(_) => DataType::Bool,
            Value::Date(_) => DataType::Date,
            Value::Point(..) => DataType::Point,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.data_type().name()
    }

    /// Adjusts the value to a column's type where a lossless widening exists
    /// (INT literals against FLOAT columns). Returns `None` on a real mismatch.
    pub fn coerce_to(&self, data_type: DataType) -> Option<Value> {
        if self.data_type() == data_type {
            return Some(self.clone());
        }
        match (self, data_type) {
            (Value::Int(v), DataType::Float) => Some(Value::Float(*v as f32)),
            _ => None,
        }
    }

    /// Parses the textual form used by CSV ingestion.
    pub fn parse(data_type: DataType, text: &str) -> Result<Value> {
        let text = text.trim();
        match data_type {
            DataType::Int => Ok(Value::Int(text.parse().map_err(|_| {
                RelLiteError::Corrupted(format!("can't parse `{}` as INT", text))
            })?)),
            DataType::Float => Ok(Value::Float(text.parse().map_err(|_| {
                RelLiteError::Corrupted(format!("can't parse `{}` as FLOAT", text))
            })?)),
            DataType::Varchar => Ok(Value::Varchar(text.to_string())),
            DataType::Bool => match text {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(RelLiteError::Corrupted(format!(
                    "can't parse `{}` as BOOL",
                    text
                ))),
            },
            DataType::Date => Ok(Value::Date(
                NaiveDate::parse_from_str(text, DATE_FORMAT)
                    .map_err(|_| RelLiteError::Corrupted(format!("can't parse `{}` as DATE", text)))?,
            )),
            DataType::Point => {
                let inner = text.trim_start_matches('(').trim_end_matches(')');
                let mut parts = inner.splitn(2, ',');
                let x = parts.next().unwrap_or("").trim();
                let y = parts.next().unwrap_or("").trim();
                match (x.parse(), y.parse()) {
                    (Ok(x), Ok(y)) => Ok(Value::Point(x, y)),
                    _ => Err(RelLiteError::Corrupted(format!(
                        "can't parse `{}` as POINT",
                        text
                    ))),
                }
            }
        }
    }

    /// Total order used by indexes and ORDER BY. Values of the same type
    /// compare naturally; VARCHAR is lexicographic on the unpadded string,
    /// DATE compares as text (identical to chronological order for the
    /// fixed format). Mixed numeric pairs compare as floats.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f32).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f32)),
            (Value::Varchar(a), Value::Varchar(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Point(ax, ay), Value::Point(bx, by)) => {
                ax.total_cmp(bx).then(ay.total_cmp(by))
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Float(_) => 1,
            Value::Varchar(_) => 2,
            Value::Bool(_) => 3,
            Value::Date(_) => 4,
            Value::Point(..) => 5,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Varchar(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v.format(DATE_FORMAT)),
            Value::Point(x, y) => write!(f, "({},{})", x, y),
        }
    }
}

/// Packs one value into its fixed-width on-disk form.
pub(crate) fn encode_fixed(
    column: &str,
    data_type: DataType,
    width: usize,
    value: &Value,
    buf: &mut Vec<u8>,
) -> Result<()> {
    let mismatch = || RelLiteError::TypeMismatch {
        column: column.to_string(),
        expected: data_type.name(),
        found: value.type_name().to_string(),
    };
    match (data_type, value) {
        (DataType::Int, Value::Int(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (DataType::Float, Value::Float(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (DataType::Varchar, Value::Varchar(s)) => {
            let bytes = s.as_bytes();
            if bytes.len() > width {
                return Err(RelLiteError::VarcharOverflow {
                    column: column.to_string(),
                    limit: width,
                });
            }
            buf.extend_from_slice(bytes);
            buf.resize(buf.len() + width - bytes.len(), 0);
        }
        (DataType::Bool, Value::Bool(v)) => buf.push(*v as u8),
        (DataType::Date, Value::Date(d)) => {
            buf.extend_from_slice(d.format(DATE_FORMAT).to_string().as_bytes());
        }
        (DataType::Point, Value::Point(x, y)) => {
            buf.extend_from_slice(&x.to_le_bytes());
            buf.extend_from_slice(&y.to_le_bytes());
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

/// Unpacks one value from its fixed-width on-disk form.
pub(crate) fn decode_fixed(
    column: &str,
    data_type: DataType,
    width: usize,
    bytes: &[u8],
) -> Result<Value> {
    if bytes.len() < width {
        return Err(RelLiteError::Corrupted(format!(
            "truncated field for column `{}`",
            column
        )));
    }
    match data_type {
        DataType::Int => Ok(Value::Int(i32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        DataType::Float => Ok(Value::Float(f32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        DataType::Varchar => {
            let end = bytes[..width].iter().position(|&b| b == 0).unwrap_or(width);
            let s = std::str::from_utf8(&bytes[..end]).map_err(|_| {
                RelLiteError::Corrupted(format!("invalid UTF-8 in column `{}`", column))
            })?;
            Ok(Value::Varchar(s.to_string()))
        }
        DataType::Bool => Ok(Value::Bool(bytes[0] != 0)),
        DataType::Date => {
            let s = std::str::from_utf8(&bytes[..10]).map_err(|_| {
                RelLiteError::Corrupted(format!("invalid UTF-8 in column `{}`", column))
            })?;
            let date = NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| {
                RelLiteError::Corrupted(format!("invalid DATE in column `{}`", column))
            })?;
            Ok(Value::Date(date))
        }
        DataType::Point => {
            let x = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let y = f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            Ok(Value::Point(x, y))
        }
    }
}

pub fn encode_value(column: &Column, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
    encode_fixed(&column.name, column.data_type, column.width(), value, buf)
}

pub fn decode_value(column: &Column, bytes: &[u8]) -> Result<Value> {
    decode_fixed(&column.name, column.data_type, column.width(), bytes)
}

/// Packs a full record; the columns' packed representations concatenated in
/// schema order.
pub fn encode_record(schema: &TableSchema, values: &[Value]) -> Result<Vec<u8>> {
    if values.len() != schema.columns.len() {
        return Err(RelLiteError::InvalidSchema(format!(
            "expected {} values, got {}",
            schema.columns.len(),
            values.len()
        )));
    }
    let mut buf = Vec::with_capacity(schema.record_size());
    for (column, value) in schema.columns.iter().zip(values) {
        encode_value(column, value, &mut buf)?;
    }
    Ok(buf)
}

pub fn decode_record(schema: &TableSchema, bytes: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(schema.columns.len());
    let mut offset = 0;
    for column in &schema.columns {
        values.push(decode_value(column, &bytes[offset..])?);
        offset += column.width();
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, IndexType, TableSchema, TableSchemaBuilder};

    fn sample_schema() -> TableSchema {
        TableSchemaBuilder::new("t")
            .column("id", DataType::Int, |c| {
                c.is_primary = true;
                c.index_type = IndexType::Btree;
            })
            .column("name", DataType::Varchar, |c| c.varchar_length = 8)
            .column("score", DataType::Float, |_| {})
            .column("active", DataType::Bool, |_| {})
            .column("born", DataType::Date, |_| {})
            .column("coord", DataType::Point, |_| {})
            .build()
    }

    #[test]
    fn test_record_round_trip() {
        let schema = sample_schema();
        let record = vec![
            Value::Int(7),
            Value::Varchar("ana".into()),
            Value::Float(1.5),
            Value::Bool(true),
            Value::Date(NaiveDate::from_ymd_opt(2021, 3, 14).unwrap()),
            Value::Point(1.0, -2.0),
        ];
        let bytes = encode_record(&schema, &record).unwrap();
        assert_eq!(bytes.len(), schema.record_size());
        assert_eq!(decode_record(&schema, &bytes).unwrap(), record);
    }

    #[test]
    fn test_varchar_overflow() {
        let schema = sample_schema();
        let record = vec![
            Value::Int(7),
            Value::Varchar("too long for eight".into()),
            Value::Float(1.5),
            Value::Bool(true),
            Value::Date(NaiveDate::from_ymd_opt(2021, 3, 14).unwrap()),
            Value::Point(0.0, 0.0),
        ];
        assert!(matches!(
            encode_record(&schema, &record),
            Err(crate::error::RelLiteError::VarcharOverflow { .. })
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let schema = sample_schema();
        let mut buf = Vec::new();
        let err = encode_value(&schema.columns[0], &Value::Bool(false), &mut buf).unwrap_err();
        assert!(matches!(
            err,
            crate::error::RelLiteError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_value_ordering() {
        assert_eq!(
            Value::Varchar("abc".into()).compare(&Value::Varchar("abd".into())),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            Value::Int(3).compare(&Value::Float(2.5)),
            std::cmp::Ordering::Greater
        );
        assert_eq!(
            Value::Bool(false).compare(&Value::Bool(true)),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!(Value::parse(DataType::Int, " 42 ").unwrap(), Value::Int(42));
        assert_eq!(
            Value::parse(DataType::Point, "(1.5, 2.5)").unwrap(),
            Value::Point(1.5, 2.5)
        );
        assert!(Value::parse(DataType::Date, "not-a-date").is_err());
    }
}
