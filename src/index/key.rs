use crate::error::RelLiteError;
use crate::schema::value::{decode_fixed, encode_fixed};
use crate::schema::{Column, DataType, Value};
use crate::Result;
use std::cmp::Ordering;

/// Fixed-width key encoder for the scalar indexes. The width is derived from
/// the indexed column (4 bytes for INT/FLOAT, the declared length for
/// VARCHAR, 1 for BOOL, 10 for DATE); comparisons always happen on decoded
/// values so VARCHAR ordering ignores the zero padding.
#[derive(Clone, Debug)]
pub struct KeyCodec {
    column: String,
    data_type: DataType,
    width: usize,
}

impl KeyCodec {
    pub fn for_column(column: &Column) -> Result<KeyCodec> {
        if column.data_type == DataType::Point {
            return Err(RelLiteError::InvalidSchema(format!(
                "POINT column `{}` can't back a scalar index",
                column.name
            )));
        }
        Ok(KeyCodec {
            column: column.name.clone(),
            data_type: column.data_type,
            width: column.width(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn encode(&self, key: &Value) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.width);
        encode_fixed(&self.column, self.data_type, self.width, key, &mut buf)?;
        Ok(buf)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        decode_fixed(&self.column, self.data_type, self.width, bytes)
    }

    /// Orders two encoded keys by their decoded values.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(self.decode(a)?.compare(&self.decode(b)?))
    }
}
