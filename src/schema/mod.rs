use crate::error::RelLiteError;
use crate::Result;
use serde::{Deserialize, Serialize};

pub mod builder;
pub mod value;

pub use builder::TableSchemaBuilder;
pub use value::Value;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Float,
    Varchar,
    Bool,
    Date,
    Point,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::Int => "INT",
            DataType::Float => "FLOAT",
            DataType::Varchar => "VARCHAR",
            DataType::Bool => "BOOL",
            DataType::Date => "DATE",
            DataType::Point => "POINT",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    None,
    Avl,
    Isam,
    Hash,
    Btree,
    Rtree,
}

impl IndexType {
    /// Lowercase tag used in index file names (`<table>_<column>_<tag>.dat`).
    pub fn file_tag(self) -> &'static str {
        match self {
            IndexType::None => "none",
            IndexType::Avl => "avl",
            IndexType::Isam => "isam",
            IndexType::Hash => "hash",
            IndexType::Btree => "btree",
            IndexType::Rtree => "rtree",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub is_primary: bool,
    pub index_type: IndexType,
    pub varchar_length: usize,
    /// Name given by `CREATE INDEX`; indexes declared with the table are unnamed.
    pub index_name: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Column {
        Column {
            name: name.into(),
            data_type,
            is_primary: false,
            index_type: IndexType::None,
            varchar_length: 0,
            index_name: None,
        }
    }

    /// Packed width of this column inside a record.
    pub fn width(&self) -> usize {
        match self.data_type {
            DataType::Int | DataType::Float => 4,
            DataType::Varchar => self.varchar_length,
            DataType::Bool => 1,
            DataType::Date => 10,
            DataType::Point => 8,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(table_name: impl Into<String>, columns: Vec<Column>) -> TableSchema {
        TableSchema {
            table_name: table_name.into().to_lowercase(),
            columns,
        }
    }

    /// Promotes an unindexed primary key to HASH. Called once on `create_table`.
    pub fn normalize(&mut self) {
        for column in &mut self.columns {
            if column.is_primary && column.index_type == IndexType::None {
                column.index_type = IndexType::Hash;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(RelLiteError::InvalidSchema(
                "the table must have at least 1 column".into(),
            ));
        }
        let mut repeats = Vec::new();
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name)
                && !repeats.contains(&column.name)
            {
                repeats.push(column.name.clone());
            }
        }
        if !repeats.is_empty() {
            return Err(RelLiteError::InvalidSchema(format!(
                "repeated column names: {}",
                repeats.join(",")
            )));
        }
        let primary_count = self.columns.iter().filter(|c| c.is_primary).count();
        if primary_count == 0 {
            return Err(RelLiteError::InvalidSchema(
                "the table must have a primary key".into(),
            ));
        }
        if primary_count > 1 {
            return Err(RelLiteError::InvalidSchema(
                "the table can't have multiple primary keys".into(),
            ));
        }
        for column in &self.columns {
            if column.data_type == DataType::Varchar && column.varchar_length == 0 {
                return Err(RelLiteError::InvalidSchema(format!(
                    "VARCHAR column `{}` needs a length",
                    column.name
                )));
            }
            match (column.data_type, column.index_type) {
                (DataType::Point, IndexType::None) | (DataType::Point, IndexType::Rtree) => {}
                (DataType::Point, other) => {
                    return Err(RelLiteError::InvalidSchema(format!(
                        "POINT column `{}` can only use an RTREE index, not {}",
                        column.name,
                        other.file_tag()
                    )));
                }
                (_, IndexType::Rtree) => {
                    return Err(RelLiteError::InvalidSchema(format!(
                        "RTREE index on `{}` needs a POINT column",
                        column.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }

    pub fn primary_column(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_primary)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Packed size of one record under this schema.
    pub fn record_size(&self) -> usize {
        self.columns.iter().map(Column::width).sum()
    }
}
