use crate::catalog::Catalog;
use crate::error::RelLiteError;
use crate::heap::RecordFile;
use crate::index::{open_column_index, SharedIndex};
use crate::query::eval::Evaluator;
use crate::query::{Bitmap, DeleteQuery, QueryResult, SelectQuery, SortOrder};
use crate::schema::{Column, IndexType, TableSchema, Value};
use crate::Result;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

mod ingest;

/// The database manager: owns the storage root, keeps the per-column index
/// handles memoized, and exposes the operation surface the SQL layer calls.
pub struct Database {
    catalog: Catalog,
    indexes: DashMap<(String, String), SharedIndex>,
}

impl Database {
    pub fn open(tables_root: impl Into<PathBuf>) -> Result<Database> {
        let root = tables_root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Database {
            catalog: Catalog::new(root),
            indexes: DashMap::new(),
        })
    }

    /// The conventional storage root when none is configured.
    pub fn default_root() -> PathBuf {
        PathBuf::from("./tables")
    }

    pub fn table_schema(&self, table_name: &str) -> Result<TableSchema> {
        self.catalog.load_schema(&table_name.to_lowercase())
    }

    fn heap(&self, schema: &TableSchema) -> Result<RecordFile> {
        RecordFile::open(self.catalog.heap_path(&schema.table_name), schema.clone())
    }

    /// Memoized index handle for one column.
    fn index_for(&self, schema: &TableSchema, column: &Column) -> Result<SharedIndex> {
        let key = (schema.table_name.clone(), column.name.clone());
        if let Some(handle) = self.indexes.get(&key) {
            return Ok(handle.clone());
        }
        let handle: SharedIndex = Arc::new(Mutex::new(open_column_index(
            &self.catalog,
            schema,
            column,
        )?));
        self.indexes.insert(key, handle.clone());
        Ok(handle)
    }

    pub fn create_table(&self, mut schema: TableSchema) -> Result<()> {
        schema.normalize();
        schema.validate()?;
        let dir = self.catalog.table_dir(&schema.table_name);
        if dir.exists() {
            return Err(RelLiteError::TableExists(schema.table_name));
        }
        std::fs::create_dir_all(&dir)?;
        self.catalog.save_schema(&schema)?;
        self.heap(&schema)?;
        for column in &schema.columns {
            self.index_for(&schema, column)?;
        }
        info!("table `{}` created", schema.table_name);
        Ok(())
    }

    pub fn drop_table(&self, table_name: &str) -> Result<()> {
        let table_name = table_name.to_lowercase();
        let dir = self.catalog.table_dir(&table_name);
        if !dir.exists() {
            return Err(RelLiteError::TableMissing(table_name));
        }
        self.indexes.retain(|(table, _), _| *table != table_name);
        fs_extra::dir::remove(&dir)?;
        info!("table `{}` dropped", table_name);
        Ok(())
    }

    /// Inserts one record given in schema column order.
    pub fn insert(&self, table_name: &str, values: Vec<Value>) -> Result<u32> {
        let schema = self.table_schema(table_name)?;
        self.insert_record(&schema, values)
    }

    /// Inserts one record given in an explicit column order.
    pub fn insert_with_columns(
        &self,
        table_name: &str,
        columns: &[&str],
        values: Vec<Value>,
    ) -> Result<u32> {
        let schema = self.table_schema(table_name)?;
        if columns.len() != values.len() {
            return Err(RelLiteError::InvalidSchema(format!(
                "{} columns named but {} values given",
                columns.len(),
                values.len()
            )));
        }
        let mut reordered = Vec::with_capacity(schema.columns.len());
        for column in &schema.columns {
            let slot = columns
                .iter()
                .position(|name| *name == column.name)
                .ok_or_else(|| {
                    RelLiteError::InvalidSchema(format!("no value for column `{}`", column.name))
                })?;
            reordered.push(values[slot].clone());
        }
        self.insert_record(&schema, reordered)
    }

    fn insert_record(&self, schema: &TableSchema, values: Vec<Value>) -> Result<u32> {
        if values.len() != schema.columns.len() {
            return Err(RelLiteError::InvalidSchema(format!(
                "expected {} values, got {}",
                schema.columns.len(),
                values.len()
            )));
        }
        let mut record = Vec::with_capacity(values.len());
        for (column, value) in schema.columns.iter().zip(values) {
            let value = value
                .coerce_to(column.data_type)
                .ok_or_else(|| RelLiteError::TypeMismatch {
                    column: column.name.clone(),
                    expected: column.data_type.name(),
                    found: value.type_name().to_string(),
                })?;
            record.push(value);
        }

        // the heap write comes first so a failed index insert never leaves a
        // dangling position in an index
        let heap = self.heap(schema)?;
        let pos = heap.append(&record)?;
        for (column, value) in schema.columns.iter().zip(&record) {
            let handle = self.index_for(schema, column)?;
            handle.lock().unwrap().insert(pos, value)?;
        }
        debug!(
            "table `{}`: inserted record at position {}",
            schema.table_name, pos
        );
        Ok(pos)
    }

    pub fn select(&self, query: &SelectQuery) -> Result<QueryResult> {
        let schema = self.table_schema(&query.table_name)?;
        let projection: Vec<usize> = match &query.columns {
            None => (0..schema.columns.len()).collect(),
            Some(names) => names
                .iter()
                .map(|name| {
                    schema
                        .column(name)
                        .map(|(i, _)| i)
                        .ok_or_else(|| RelLiteError::ColumnMissing(name.clone()))
                })
                .collect::<Result<_>>()?,
        };

        let heap = self.heap(&schema)?;
        let bitmap = self.eval_condition(&schema, &heap, query.condition.as_ref())?;
        let mut records = Vec::new();
        for pos in bitmap.to_positions(heap.max_position()?) {
            if let Some(values) = heap.read(pos)? {
                records.push(values);
            }
        }

        if let Some((column, order)) = &query.order_by {
            let sort_idx = schema
                .column(column)
                .map(|(i, _)| i)
                .ok_or_else(|| RelLiteError::ColumnMissing(column.clone()))?;
            sort_records(&mut records, sort_idx, *order, query.limit);
        }
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }

        let records = records
            .into_iter()
            .map(|record| projection.iter().map(|i| record[*i].clone()).collect())
            .collect();
        Ok(QueryResult {
            columns: projection
                .iter()
                .map(|i| schema.columns[*i].name.clone())
                .collect(),
            records,
        })
    }

    /// Deletes every matching record; returns how many went away.
    pub fn delete(&self, query: &DeleteQuery) -> Result<usize> {
        let schema = self.table_schema(&query.table_name)?;
        let heap = self.heap(&schema)?;
        let bitmap = self.eval_condition(&schema, &heap, query.condition.as_ref())?;
        let mut deleted = 0;
        for pos in bitmap.to_positions(heap.max_position()?) {
            if heap.read(pos)?.is_none() {
                continue;
            }
            let values = heap.delete(pos)?;
            for (column, value) in schema.columns.iter().zip(&values) {
                let handle = self.index_for(&schema, column)?;
                handle.lock().unwrap().delete(value)?;
            }
            deleted += 1;
        }
        debug!("table `{}`: deleted {} records", schema.table_name, deleted);
        Ok(deleted)
    }

    /// Creates a named single-column index and backfills it from the heap.
    pub fn create_index(
        &self,
        table_name: &str,
        index_name: &str,
        columns: &[&str],
        index_type: IndexType,
    ) -> Result<()> {
        if columns.len() != 1 {
            return Err(RelLiteError::MultiColumnIndex);
        }
        let mut schema = self.table_schema(table_name)?;
        let col_idx = schema
            .column(columns[0])
            .map(|(i, _)| i)
            .ok_or_else(|| RelLiteError::ColumnMissing(columns[0].to_string()))?;
        if schema.columns[col_idx].index_type != IndexType::None {
            return Err(RelLiteError::ColumnAlreadyIndexed(
                schema.columns[col_idx].name.clone(),
            ));
        }

        let mut updated = schema.clone();
        updated.columns[col_idx].index_type = index_type;
        updated.columns[col_idx].index_name = Some(index_name.to_string());
        updated.validate()?;

        // retire the column's position file before switching access paths
        let cache_key = (schema.table_name.clone(), schema.columns[col_idx].name.clone());
        open_column_index(&self.catalog, &schema, &schema.columns[col_idx])?.clear()?;
        self.indexes.remove(&cache_key);

        schema = updated;
        self.catalog.save_schema(&schema)?;

        let heap = self.heap(&schema)?;
        let mut entries = Vec::new();
        for item in heap.scan()? {
            let (pos, values) = item?;
            entries.push((values[col_idx].clone(), pos));
        }
        let handle = self.index_for(&schema, &schema.columns[col_idx])?;
        handle.lock().unwrap().build(&entries)?;
        info!(
            "table `{}`: index `{}` ({}) built over {} records",
            schema.table_name,
            index_name,
            index_type.file_tag(),
            entries.len()
        );
        Ok(())
    }

    /// Drops an index by the name `create_index` gave it.
    pub fn drop_index(&self, table_name: &str, index_name: &str) -> Result<()> {
        let mut schema = self.table_schema(table_name)?;
        let col_idx = schema
            .columns
            .iter()
            .position(|c| c.index_name.as_deref() == Some(index_name))
            .ok_or_else(|| RelLiteError::IndexMissing(index_name.to_string()))?;

        let cache_key = (schema.table_name.clone(), schema.columns[col_idx].name.clone());
        let handle = self.index_for(&schema, &schema.columns[col_idx])?;
        handle.lock().unwrap().clear()?;
        self.indexes.remove(&cache_key);

        schema.columns[col_idx].index_type = IndexType::None;
        schema.columns[col_idx].index_name = None;
        self.catalog.save_schema(&schema)?;

        // the column falls back to a position file, rebuilt from the heap
        let heap = self.heap(&schema)?;
        let handle = self.index_for(&schema, &schema.columns[col_idx])?;
        let mut guard = handle.lock().unwrap();
        for item in heap.scan()? {
            let (pos, values) = item?;
            guard.insert(pos, &values[col_idx])?;
        }
        info!("table `{}`: index `{}` dropped", schema.table_name, index_name);
        Ok(())
    }

    fn eval_condition(
        &self,
        schema: &TableSchema,
        heap: &RecordFile,
        condition: Option<&crate::query::Condition>,
    ) -> Result<Bitmap> {
        match condition {
            None => Ok(Bitmap::all()),
            Some(condition) => {
                let provider = |column: &Column| self.index_for(schema, column);
                Evaluator::new(schema, heap, &provider).eval(condition)
            }
        }
    }
}

/// ORDER BY comparator entry; `seq` keeps equal keys in materialization
/// order so sorting stays stable either way.
struct SortEntry {
    record: Vec<Value>,
    sort_idx: usize,
    seq: usize,
    descending: bool,
}

impl SortEntry {
    fn key_cmp(&self, other: &Self) -> Ordering {
        let ord = self.record[self.sort_idx].compare(&other.record[self.sort_idx]);
        let ord = if self.descending { ord.reverse() } else { ord };
        ord.then(self.seq.cmp(&other.seq))
    }
}

impl PartialEq for SortEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }
}

impl Eq for SortEntry {}

impl PartialOrd for SortEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.key_cmp(other))
    }
}

impl Ord for SortEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_cmp(other)
    }
}

/// Sorts for ORDER BY. With a small LIMIT a bounded binary heap keeps only
/// the best `limit` records; otherwise it's a plain full sort.
fn sort_records(
    records: &mut Vec<Vec<Value>>,
    sort_idx: usize,
    order: SortOrder,
    limit: Option<usize>,
) {
    let descending = order == SortOrder::Desc;
    match limit {
        Some(limit) if limit > 0 && limit <= records.len() / 2 => {
            let mut heap: BinaryHeap<SortEntry> = BinaryHeap::with_capacity(limit + 1);
            for (seq, record) in records.drain(..).enumerate() {
                heap.push(SortEntry {
                    record,
                    sort_idx,
                    seq,
                    descending,
                });
                if heap.len() > limit {
                    heap.pop();
                }
            }
            *records = heap
                .into_sorted_vec()
                .into_iter()
                .map(|entry| entry.record)
                .collect();
        }
        _ => {
            records.sort_by(|a, b| {
                let ord = a[sort_idx].compare(&b[sort_idx]);
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i32) -> Vec<Value> {
        vec![Value::Int(id), Value::Varchar(format!("n{}", id))]
    }

    #[test]
    fn test_sort_records_full_sort() {
        let mut records: Vec<Vec<Value>> = [3, 1, 4, 1, 5].iter().map(|i| row(*i)).collect();
        sort_records(&mut records, 0, SortOrder::Asc, None);
        let ids: Vec<i32> = records
            .iter()
            .map(|r| match r[0] {
                Value::Int(v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![1, 1, 3, 4, 5]);
    }

    #[test]
    fn test_sort_records_partial_heap() {
        let mut records: Vec<Vec<Value>> = (0..20).rev().map(row).collect();
        sort_records(&mut records, 0, SortOrder::Asc, Some(3));
        assert_eq!(records.len(), 3);
        assert_eq!(records[0][0], Value::Int(0));
        assert_eq!(records[2][0], Value::Int(2));

        let mut records: Vec<Vec<Value>> = (0..20).map(row).collect();
        sort_records(&mut records, 0, SortOrder::Desc, Some(2));
        assert_eq!(records[0][0], Value::Int(19));
        assert_eq!(records[1][0], Value::Int(18));
    }
}
