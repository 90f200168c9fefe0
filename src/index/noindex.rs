use crate::error::RelLiteError;
use crate::heap::RecordFile;
use crate::index::ColumnIndex;
use crate::ioutils::read_i32;
use crate::schema::{IndexType, Value};
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Degenerate access path for unindexed columns: a flat file of positions in
/// insertion order, no key material at all. Lookups must go through a heap
/// scan at the manager level; only `insert`, `delete` and `get_all` work.
pub struct NoIndex {
    path: PathBuf,
    heap: RecordFile,
    col_idx: usize,
}

impl NoIndex {
    pub fn open(path: impl Into<PathBuf>, heap: RecordFile, col_idx: usize) -> Result<NoIndex> {
        let path = path.into();
        if !path.exists() {
            File::create(&path)?;
        }
        Ok(NoIndex {
            path,
            heap,
            col_idx,
        })
    }

    fn positions(&self) -> Result<Vec<u32>> {
        let mut file = File::open(&self.path)?;
        let count = std::fs::metadata(&self.path)?.len() / 4;
        let mut positions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            positions.push(read_i32(&mut file)? as u32);
        }
        Ok(positions)
    }

    fn rewrite(&self, positions: &[u32]) -> Result<()> {
        let mut file = File::create(&self.path)?;
        for pos in positions {
            file.write_all(&(*pos as i32).to_le_bytes())?;
        }
        Ok(())
    }
}

impl ColumnIndex for NoIndex {
    fn kind(&self) -> IndexType {
        IndexType::None
    }

    fn insert(&mut self, pos: u32, _key: &Value) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&(pos as i32).to_le_bytes())?;
        Ok(())
    }

    fn delete(&mut self, key: &Value) -> Result<bool> {
        let mut positions = self.positions()?;
        let mut victim = None;
        for (i, pos) in positions.iter().enumerate() {
            match self.heap.read(*pos)? {
                // a slot freed by the caller no longer decodes; treat it as
                // the match
                None => {
                    victim = Some(i);
                    break;
                }
                Some(values) => {
                    if values[self.col_idx] == *key {
                        victim = Some(i);
                        break;
                    }
                }
            }
        }
        match victim {
            Some(i) => {
                positions.remove(i);
                self.rewrite(&positions)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn search(&self, _key: &Value) -> Result<Vec<u32>> {
        Err(RelLiteError::UnsupportedOperation {
            index: "none",
            op: "key search",
        })
    }

    fn range_search(&self, _lo: Option<&Value>, _hi: Option<&Value>) -> Result<Vec<u32>> {
        Err(RelLiteError::UnsupportedOperation {
            index: "none",
            op: "range search",
        })
    }

    fn get_all(&self) -> Result<Vec<u32>> {
        self.positions()
    }

    fn clear(&mut self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
