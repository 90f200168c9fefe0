use crate::schema::{Column, DataType, TableSchema};

/// Fluent helper for assembling a `TableSchema`, mostly used by tests and
/// CSV ingestion callers.
pub struct TableSchemaBuilder {
    table_name: String,
    columns: Vec<Column>,
}

impl TableSchemaBuilder {
    pub fn new(table_name: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder {
            table_name: table_name.into(),
            columns: Vec::new(),
        }
    }

    /// Adds a column, letting the closure adjust the default settings
    /// (primary flag, index type, VARCHAR length).
    pub fn column(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        configure: impl FnOnce(&mut Column),
    ) -> TableSchemaBuilder {
        let mut column = Column::new(name, data_type);
        configure(&mut column);
        self.columns.push(column);
        self
    }

    pub fn build(self) -> TableSchema {
        TableSchema::new(self.table_name, self.columns)
    }
}
