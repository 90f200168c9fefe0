use crate::db::Database;
use crate::error::RelLiteError;
use crate::schema::Value;
use crate::Result;
use std::path::Path;

impl Database {
    /// Loads a CSV file into an existing table: one `insert` per row. The
    /// header row names the columns (any order); fields are parsed by the
    /// column's declared type. Returns the number of rows inserted.
    pub fn copy_from_csv(&self, table_name: &str, path: impl AsRef<Path>) -> Result<usize> {
        let schema = self.table_schema(table_name)?;
        let mut reader = csv::Reader::from_path(path.as_ref())?;
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut mapping = Vec::with_capacity(schema.columns.len());
        for column in &schema.columns {
            let slot = headers
                .iter()
                .position(|h| *h == column.name)
                .ok_or_else(|| {
                    RelLiteError::InvalidSchema(format!(
                        "CSV header has no column `{}`",
                        column.name
                    ))
                })?;
            mapping.push(slot);
        }

        let mut inserted = 0;
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let mut values = Vec::with_capacity(schema.columns.len());
            for (column, slot) in schema.columns.iter().zip(&mapping) {
                let field = record.get(*slot).ok_or_else(|| {
                    RelLiteError::Corrupted(format!("CSV row {} is missing fields", row + 2))
                })?;
                let value = Value::parse(column.data_type, field).map_err(|e| {
                    RelLiteError::Corrupted(format!("CSV row {}: {}", row + 2, e))
                })?;
                values.push(value);
            }
            self.insert(&schema.table_name, values)?;
            inserted += 1;
        }
        info!(
            "table `{}`: loaded {} rows from CSV",
            schema.table_name, inserted
        );
        Ok(inserted)
    }
}
