use crate::catalog::Catalog;
use crate::error::RelLiteError;
use crate::heap::RecordFile;
use crate::schema::{Column, DataType, IndexType, TableSchema, Value};
use crate::Result;
use std::sync::{Arc, Mutex};

pub mod avl;
pub mod btree;
pub mod exthash;
pub mod isam;
pub mod key;
pub mod noindex;
pub mod rtree;

pub use key::KeyCodec;

/// Axis-aligned query rectangle (`xmin <= x <= xmax`, `ymin <= y <= ymax`).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Rect {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Rect {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Rect {
        Rect {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn point(x: f32, y: f32) -> Rect {
        Rect::new(x, y, x, y)
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        self.xmin <= x && x <= self.xmax && self.ymin <= y && y <= self.ymax
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }

    pub fn expand(&mut self, other: &Rect) {
        self.xmin = self.xmin.min(other.xmin);
        self.ymin = self.ymin.min(other.ymin);
        self.xmax = self.xmax.max(other.xmax);
        self.ymax = self.ymax.max(other.ymax);
    }

    pub fn area(&self) -> f32 {
        (self.xmax - self.xmin) * (self.ymax - self.ymin)
    }

    /// Squared distance from a point to the nearest edge, 0 when inside.
    pub fn min_dist_sq(&self, x: f32, y: f32) -> f32 {
        let dx = (self.xmin - x).max(0.0).max(x - self.xmax);
        let dy = (self.ymin - y).max(0.0).max(y - self.ymax);
        dx * dx + dy * dy
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Circle {
    pub cx: f32,
    pub cy: f32,
    pub r: f32,
}

impl Circle {
    pub fn new(cx: f32, cy: f32, r: f32) -> Circle {
        Circle { cx, cy, r }
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        let dx = x - self.cx;
        let dy = y - self.cy;
        dx * dx + dy * dy <= self.r * self.r
    }

    pub fn mbr(&self) -> Rect {
        Rect::new(
            self.cx - self.r,
            self.cy - self.r,
            self.cx + self.r,
            self.cy + self.r,
        )
    }
}

/// Common surface of the single-column indexes. Every implementation maps
/// `(key, position)` pairs; duplicate keys are allowed and preserved.
pub trait ColumnIndex {
    fn kind(&self) -> IndexType;

    fn insert(&mut self, pos: u32, key: &Value) -> Result<()>;

    /// Removes one mapping for `key`; `false` when the key was absent.
    fn delete(&mut self, key: &Value) -> Result<bool>;

    /// All positions carrying exactly `key`.
    fn search(&self, key: &Value) -> Result<Vec<u32>>;

    /// All positions with `lo <= key <= hi`; `None` bounds are open.
    fn range_search(&self, lo: Option<&Value>, hi: Option<&Value>) -> Result<Vec<u32>>;

    fn get_all(&self) -> Result<Vec<u32>>;

    /// Removes the backing file(s).
    fn clear(&mut self) -> Result<()>;

    /// Bulk load used by `CREATE INDEX` backfill. The default just inserts
    /// one entry at a time; ISAM and the R-Tree override it.
    fn build(&mut self, entries: &[(Value, u32)]) -> Result<()> {
        for (key, pos) in entries {
            self.insert(*pos, key)?;
        }
        Ok(())
    }

    fn search_rect(&self, _rect: &Rect) -> Result<Vec<u32>> {
        Err(RelLiteError::UnsupportedOperation {
            index: self.kind().file_tag(),
            op: "rectangle search",
        })
    }

    fn search_circle(&self, _circle: &Circle) -> Result<Vec<u32>> {
        Err(RelLiteError::UnsupportedOperation {
            index: self.kind().file_tag(),
            op: "circle search",
        })
    }

    fn knn(&self, _x: f32, _y: f32, _k: usize) -> Result<Vec<u32>> {
        Err(RelLiteError::UnsupportedOperation {
            index: self.kind().file_tag(),
            op: "k-nearest-neighbors search",
        })
    }
}

/// Index handle shared through the manager's cache.
pub type SharedIndex = Arc<Mutex<Box<dyn ColumnIndex + Send>>>;

/// Opens (creating on first use) the index backing one column.
pub fn open_column_index(
    catalog: &Catalog,
    schema: &TableSchema,
    column: &Column,
) -> Result<Box<dyn ColumnIndex + Send>> {
    let path = catalog.index_path(&schema.table_name, &column.name, column.index_type);
    match column.index_type {
        IndexType::None => {
            let heap = RecordFile::open(catalog.heap_path(&schema.table_name), schema.clone())?;
            let col_idx = schema
                .column(&column.name)
                .map(|(i, _)| i)
                .ok_or_else(|| RelLiteError::ColumnMissing(column.name.clone()))?;
            Ok(Box::new(noindex::NoIndex::open(path, heap, col_idx)?))
        }
        IndexType::Avl => Ok(Box::new(avl::AvlIndex::open(
            path,
            KeyCodec::for_column(column)?,
        )?)),
        IndexType::Btree => Ok(Box::new(btree::BPlusTree::open(
            path,
            KeyCodec::for_column(column)?,
        )?)),
        IndexType::Isam => Ok(Box::new(isam::IsamIndex::open(
            path,
            KeyCodec::for_column(column)?,
        )?)),
        IndexType::Hash => Ok(Box::new(exthash::ExtHashIndex::open(
            path,
            KeyCodec::for_column(column)?,
        )?)),
        IndexType::Rtree => {
            if column.data_type != DataType::Point {
                return Err(RelLiteError::InvalidSchema(format!(
                    "RTREE index on `{}` needs a POINT column",
                    column.name
                )));
            }
            Ok(Box::new(rtree::RTreeIndex::open(path, column.name.clone())?))
        }
    }
}
