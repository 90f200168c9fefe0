use crate::error::RelLiteError;
use crate::schema::{IndexType, TableSchema};
use crate::Result;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "metadata";

/// Path scheme for a storage root: one directory per table holding the
/// serialized schema, the heap file and one file per index.
#[derive(Clone, Debug)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Catalog {
        Catalog { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_dir(&self, table_name: &str) -> PathBuf {
        self.root.join(table_name)
    }

    pub fn metadata_path(&self, table_name: &str) -> PathBuf {
        self.table_dir(table_name).join(METADATA_FILE)
    }

    pub fn heap_path(&self, table_name: &str) -> PathBuf {
        self.table_dir(table_name)
            .join(format!("{}.dat", table_name))
    }

    pub fn index_path(
        &self,
        table_name: &str,
        column_name: &str,
        index_type: IndexType,
    ) -> PathBuf {
        self.table_dir(table_name).join(format!(
            "{}_{}_{}.dat",
            table_name,
            column_name,
            index_type.file_tag()
        ))
    }

    pub fn table_exists(&self, table_name: &str) -> bool {
        self.metadata_path(table_name).exists()
    }

    pub fn load_schema(&self, table_name: &str) -> Result<TableSchema> {
        let path = self.metadata_path(table_name);
        if !path.exists() {
            return Err(RelLiteError::TableMissing(table_name.to_string()));
        }
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Serializes the schema, replacing any previous metadata atomically so a
    /// failed index DDL never leaves a half-written catalog entry behind.
    pub fn save_schema(&self, schema: &TableSchema) -> Result<()> {
        let dir = self.table_dir(&schema.table_name);
        let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
        let file = File::create(&tmp)?;
        serde_json::to_writer(&file, schema)?;
        file.sync_all()?;
        fs::rename(&tmp, self.metadata_path(&schema.table_name))?;
        Ok(())
    }
}
