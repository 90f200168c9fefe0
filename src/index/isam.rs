use crate::index::{ColumnIndex, KeyCodec};
use crate::ioutils::{read_i32, write_i32, BufWriterWithPos};
use crate::schema::{DataType, IndexType, Value};
use crate::Result;
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

pub const DEFAULT_LEAF_FACTOR: usize = 32;
pub const DEFAULT_INDEX_FACTOR: usize = 4;

/// `(leaf_factor, index_factor)` as two LE i32.
const GLOBAL_HDR_SIZE: u64 = 8;

/// Static two-level sparse index over a sorted snapshot of the heap.
///
/// File layout: global header, one root index page, `I+1` level-1 index
/// pages, then `(I+1)^2` regular leaf pages followed by overflow pages.
/// Index pages hold `I` entries `| separator | left: i32 | right: i32 |`;
/// leaf pages hold a `| page_num | next_page | not_overflow |` header and
/// `L` slots `| key | position: i32 |` where `position = -1` marks an
/// empty (or logically deleted) slot.
///
/// `build` distributes the sorted snapshot evenly over the regular leaves;
/// later inserts drop into the owning region's overflow chain and deletes
/// are logical, so the structure never rebalances after the build.
pub struct IsamIndex {
    path: PathBuf,
    codec: KeyCodec,
    leaf_factor: usize,
    index_factor: usize,
}

struct IndexEntry {
    key: Vec<u8>,
    left: i32,
    right: i32,
}

struct LeafEntry {
    key: Vec<u8>,
    pos: i32,
}

struct LeafPage {
    page_num: i32,
    next_page: i32,
    not_overflow: bool,
    entries: Vec<LeafEntry>,
}

struct IsamFile {
    file: File,
    key_width: usize,
    leaf_factor: usize,
    index_factor: usize,
}

impl IsamFile {
    fn index_entry_size(&self) -> u64 {
        (self.key_width + 8) as u64
    }

    fn index_page_size(&self) -> u64 {
        self.index_factor as u64 * self.index_entry_size()
    }

    fn leaf_page_size(&self) -> u64 {
        12 + self.leaf_factor as u64 * (self.key_width + 4) as u64
    }

    fn leaf_base(&self) -> u64 {
        GLOBAL_HDR_SIZE + (self.index_factor as u64 + 2) * self.index_page_size()
    }

    fn regular_leaves(&self) -> usize {
        (self.index_factor + 1) * (self.index_factor + 1)
    }

    fn leaf_count(&mut self) -> Result<usize> {
        let end = self.file.seek(SeekFrom::End(0))?;
        Ok(((end - self.leaf_base()) / self.leaf_page_size()) as usize)
    }

    /// Index pages are numbered 0 (root) and 1..=I+1 (level-1).
    fn read_index_page(&mut self, page: usize) -> Result<Vec<IndexEntry>> {
        let offset = GLOBAL_HDR_SIZE + page as u64 * self.index_page_size();
        self.file.seek(SeekFrom::Start(offset))?;
        let mut entries = Vec::with_capacity(self.index_factor);
        for _ in 0..self.index_factor {
            let mut key = vec![0u8; self.key_width];
            self.file.read_exact(&mut key)?;
            let left = read_i32(&mut self.file)?;
            let right = read_i32(&mut self.file)?;
            entries.push(IndexEntry { key, left, right });
        }
        Ok(entries)
    }

    fn read_leaf(&mut self, page: i32) -> Result<LeafPage> {
        let offset = self.leaf_base() + page as u64 * self.leaf_page_size();
        self.file.seek(SeekFrom::Start(offset))?;
        let page_num = read_i32(&mut self.file)?;
        let next_page = read_i32(&mut self.file)?;
        let not_overflow = read_i32(&mut self.file)? != 0;
        let mut entries = Vec::with_capacity(self.leaf_factor);
        for _ in 0..self.leaf_factor {
            let mut key = vec![0u8; self.key_width];
            self.file.read_exact(&mut key)?;
            let pos = read_i32(&mut self.file)?;
            entries.push(LeafEntry { key, pos });
        }
        Ok(LeafPage {
            page_num,
            next_page,
            not_overflow,
            entries,
        })
    }

    fn write_leaf(&mut self, page: i32, leaf: &LeafPage) -> Result<()> {
        let offset = self.leaf_base() + page as u64 * self.leaf_page_size();
        self.file.seek(SeekFrom::Start(offset))?;
        write_i32(&mut self.file, leaf.page_num)?;
        write_i32(&mut self.file, leaf.next_page)?;
        write_i32(&mut self.file, leaf.not_overflow as i32)?;
        for entry in &leaf.entries {
            self.file.write_all(&entry.key)?;
            write_i32(&mut self.file, entry.pos)?;
        }
        Ok(())
    }

    /// Lower-boundary separators for every region `1..(I+1)^2`, gathered from
    /// the level-1 pages. `seps[0]` is a placeholder.
    fn boundary_separators(&mut self) -> Result<Vec<Vec<u8>>> {
        let fanout = self.index_factor + 1;
        let mut seps = vec![Vec::new(); self.regular_leaves()];
        for j in 0..fanout {
            let entries = self.read_index_page(1 + j)?;
            for (i, entry) in entries.iter().enumerate() {
                let boundary = j * fanout + i + 1;
                if boundary < seps.len() {
                    seps[boundary] = entry.key.clone();
                }
            }
        }
        Ok(seps)
    }
}

impl IsamIndex {
    pub fn open(path: impl Into<PathBuf>, codec: KeyCodec) -> Result<IsamIndex> {
        Self::with_factors(path, codec, DEFAULT_LEAF_FACTOR, DEFAULT_INDEX_FACTOR)
    }

    pub fn with_factors(
        path: impl Into<PathBuf>,
        codec: KeyCodec,
        leaf_factor: usize,
        index_factor: usize,
    ) -> Result<IsamIndex> {
        assert!(leaf_factor >= 1 && index_factor >= 1);
        let mut index = IsamIndex {
            path: path.into(),
            codec,
            leaf_factor,
            index_factor,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&index.path)?;
        if file.seek(SeekFrom::End(0))? == 0 {
            drop(file);
            index.build(&[])?;
        } else {
            // an existing file's factors win over the requested ones
            file.seek(SeekFrom::Start(0))?;
            index.leaf_factor = read_i32(&mut file)? as usize;
            index.index_factor = read_i32(&mut file)? as usize;
        }
        Ok(index)
    }

    fn open_file(&self) -> Result<IsamFile> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(IsamFile {
            file,
            key_width: self.codec.width(),
            leaf_factor: self.leaf_factor,
            index_factor: self.index_factor,
        })
    }

    fn empty_entry(&self) -> LeafEntry {
        LeafEntry {
            key: vec![0u8; self.codec.width()],
            pos: -1,
        }
    }

    fn default_key(&self) -> Value {
        match self.codec.data_type() {
            DataType::Int => Value::Int(0),
            DataType::Float => Value::Float(0.0),
            DataType::Bool => Value::Bool(false),
            DataType::Varchar => Value::Varchar(String::new()),
            DataType::Date => Value::Date(chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
            DataType::Point => unreachable!("POINT never backs an ISAM"),
        }
    }

    /// Separator for a boundary that falls past the data: numeric keys step
    /// beyond the maximum by `(max - min) / (count - 1)` per empty leaf,
    /// everything else repeats the maximum.
    fn synthetic_key(&self, sorted: &[(Vec<u8>, i32)], steps: usize) -> Result<Vec<u8>> {
        if sorted.is_empty() {
            return self.codec.encode(&self.default_key());
        }
        let min = self.codec.decode(&sorted[0].0)?;
        let max = self.codec.decode(&sorted[sorted.len() - 1].0)?;
        let count = sorted.len() as i64;
        match (min, max) {
            (Value::Int(min), Value::Int(max)) => {
                let step = if count > 1 {
                    (((max as i64) - (min as i64)) / (count - 1)).max(1)
                } else {
                    1
                };
                let v = ((max as i64) + step * steps as i64).min(i32::MAX as i64) as i32;
                self.codec.encode(&Value::Int(v))
            }
            (Value::Float(min), Value::Float(max)) => {
                let mut step = if count > 1 {
                    (max - min) / (count - 1) as f32
                } else {
                    1.0
                };
                if step <= 0.0 {
                    step = 1.0;
                }
                self.codec.encode(&Value::Float(max + step * steps as f32))
            }
            (_, _) => Ok(sorted[sorted.len() - 1].0.clone()),
        }
    }

    /// Routes a key to its owning region: separators route `key < sep` left
    /// and `key >= sep` right; `leftmost` relaxes the rule to `key <= sep`
    /// so searches start at the first region that may hold a duplicate.
    fn locate_region(&self, file: &mut IsamFile, key: &[u8], leftmost: bool) -> Result<usize> {
        let go_left = |cmp: Ordering| {
            if leftmost {
                cmp != Ordering::Greater
            } else {
                cmp == Ordering::Less
            }
        };
        let root = file.read_index_page(0)?;
        let mut child = root[self.index_factor - 1].right;
        for entry in &root {
            if go_left(self.codec.compare(key, &entry.key)?) {
                child = entry.left;
                break;
            }
        }
        let level1 = file.read_index_page(child as usize)?;
        let mut leaf = level1[self.index_factor - 1].right;
        for entry in &level1 {
            if go_left(self.codec.compare(key, &entry.key)?) {
                leaf = entry.left;
                break;
            }
        }
        Ok(leaf as usize)
    }

    /// Pages of one region's chain: the regular leaf plus its overflow pages,
    /// stopping before the next regular leaf.
    fn region_pages(&self, file: &mut IsamFile, region: usize) -> Result<Vec<(i32, LeafPage)>> {
        let mut pages = Vec::new();
        let mut page_num = region as i32;
        loop {
            let page = file.read_leaf(page_num)?;
            if page.not_overflow && page.page_num as usize != region {
                break;
            }
            let next = page.next_page;
            pages.push((page_num, page));
            if next == -1 {
                break;
            }
            page_num = next;
        }
        Ok(pages)
    }

    fn collect_range(
        &self,
        file: &mut IsamFile,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<Vec<u32>> {
        let start_region = match lo {
            Some(lo) => self.locate_region(file, lo, true)?,
            None => 0,
        };
        let seps = file.boundary_separators()?;
        let mut out = Vec::new();
        let mut page_num = start_region as i32;
        while page_num != -1 {
            let page = file.read_leaf(page_num)?;
            if page.not_overflow {
                let region = page.page_num as usize;
                if region != start_region {
                    if let Some(hi) = hi {
                        // regions partition the key space by their lower
                        // separator, so once it exceeds hi nothing follows
                        if self.codec.compare(&seps[region], hi)? == Ordering::Greater {
                            break;
                        }
                    }
                }
            }
            for entry in &page.entries {
                if entry.pos == -1 {
                    continue;
                }
                if let Some(lo) = lo {
                    if self.codec.compare(&entry.key, lo)? == Ordering::Less {
                        continue;
                    }
                }
                if let Some(hi) = hi {
                    if self.codec.compare(&entry.key, hi)? == Ordering::Greater {
                        continue;
                    }
                }
                out.push(entry.pos as u32);
            }
            page_num = page.next_page;
        }
        Ok(out)
    }

    fn encode_bound(&self, bound: Option<&Value>) -> Result<Option<Vec<u8>>> {
        match bound {
            Some(value) => Ok(Some(self.codec.encode(value)?)),
            None => Ok(None),
        }
    }
}

impl ColumnIndex for IsamIndex {
    fn kind(&self) -> IndexType {
        IndexType::Isam
    }

    /// Three-phase bulk build: sort the snapshot, lay the regular leaves,
    /// then derive the level-1 pages and the root from the region boundaries.
    fn build(&mut self, entries: &[(Value, u32)]) -> Result<()> {
        let mut sorted = Vec::with_capacity(entries.len());
        for (key, pos) in entries {
            sorted.push((self.codec.encode(key)?, *pos as i32));
        }
        {
            let codec = &self.codec;
            let mut sort_err = None;
            sorted.sort_by(|a, b| match codec.compare(&a.0, &b.0) {
                Ok(ord) => ord.then(a.1.cmp(&b.1)),
                Err(e) => {
                    sort_err.get_or_insert(e);
                    Ordering::Equal
                }
            });
            if let Some(e) = sort_err {
                return Err(e);
            }
        }

        let fanout = self.index_factor + 1;
        let regular = fanout * fanout;
        let per_region = if sorted.is_empty() {
            0
        } else {
            (sorted.len() + regular - 1) / regular
        };
        info!(
            "isam {:?}: building {} regular leaves over {} entries",
            self.path,
            regular,
            sorted.len()
        );

        // phase 1: slice the snapshot into regions and lay out every page
        let mut region_slices = Vec::with_capacity(regular);
        for r in 0..regular {
            let start = (r * per_region).min(sorted.len());
            let end = ((r + 1) * per_region).min(sorted.len());
            region_slices.push(&sorted[start..end]);
        }

        // overflow page numbers are assigned after the regular leaves
        let mut overflow_of: Vec<Vec<i32>> = vec![Vec::new(); regular];
        let mut next_overflow = regular as i32;
        for (r, slice) in region_slices.iter().enumerate() {
            let mut rest = slice.len().saturating_sub(self.leaf_factor);
            while rest > 0 {
                overflow_of[r].push(next_overflow);
                next_overflow += 1;
                rest = rest.saturating_sub(self.leaf_factor);
            }
        }

        // lower-boundary separator of every region
        let mut seps: Vec<Vec<u8>> = vec![Vec::new(); regular];
        let mut steps_past = 0usize;
        for r in 1..regular {
            seps[r] = if !region_slices[r].is_empty() {
                region_slices[r][0].0.clone()
            } else {
                steps_past += 1;
                self.synthetic_key(&sorted, steps_past)?
            };
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        let mut writer = BufWriterWithPos::new(file)?;
        write_i32(&mut writer, self.leaf_factor as i32)?;
        write_i32(&mut writer, self.index_factor as i32)?;

        // phase 3 output order puts the root first: its entry i separates
        // level-1 page i (file index page 1+i) from page i+1
        for i in 0..self.index_factor {
            writer.write_all(&seps[(i + 1) * fanout])?;
            write_i32(&mut writer, 1 + i as i32)?;
            write_i32(&mut writer, 2 + i as i32)?;
        }
        // phase 2: level-1 page j covers regions j*fanout ..= j*fanout+I
        for j in 0..fanout {
            for i in 0..self.index_factor {
                let boundary = j * fanout + i + 1;
                writer.write_all(&seps[boundary])?;
                write_i32(&mut writer, (j * fanout + i) as i32)?;
                write_i32(&mut writer, (j * fanout + i + 1) as i32)?;
            }
        }

        // regular leaves first, then the overflow pages in assignment order
        let mut write_page = |writer: &mut BufWriterWithPos<File>, page: &LeafPage| -> Result<()> {
            write_i32(writer, page.page_num)?;
            write_i32(writer, page.next_page)?;
            write_i32(writer, page.not_overflow as i32)?;
            for entry in &page.entries {
                writer.write_all(&entry.key)?;
                write_i32(writer, entry.pos)?;
            }
            Ok(())
        };

        let mut overflow_pages: Vec<LeafPage> = Vec::new();
        for (r, slice) in region_slices.iter().enumerate() {
            let head = &slice[..slice.len().min(self.leaf_factor)];
            let tail_next = if r + 1 < regular { (r + 1) as i32 } else { -1 };
            let first_next = overflow_of[r].first().copied().unwrap_or(tail_next);
            let mut page = LeafPage {
                page_num: r as i32,
                next_page: first_next,
                not_overflow: true,
                entries: Vec::with_capacity(self.leaf_factor),
            };
            for (key, pos) in head {
                page.entries.push(LeafEntry {
                    key: key.clone(),
                    pos: *pos,
                });
            }
            while page.entries.len() < self.leaf_factor {
                page.entries.push(self.empty_entry());
            }
            write_page(&mut writer, &page)?;

            for (k, chunk) in slice[head.len()..].chunks(self.leaf_factor).enumerate() {
                let next = overflow_of[r].get(k + 1).copied().unwrap_or(tail_next);
                let mut opage = LeafPage {
                    page_num: overflow_of[r][k],
                    next_page: next,
                    not_overflow: false,
                    entries: Vec::with_capacity(self.leaf_factor),
                };
                for (key, pos) in chunk {
                    opage.entries.push(LeafEntry {
                        key: key.clone(),
                        pos: *pos,
                    });
                }
                while opage.entries.len() < self.leaf_factor {
                    opage.entries.push(self.empty_entry());
                }
                overflow_pages.push(opage);
            }
        }
        for page in &overflow_pages {
            write_page(&mut writer, page)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn insert(&mut self, pos: u32, key: &Value) -> Result<()> {
        let key = self.codec.encode(key)?;
        let mut file = self.open_file()?;
        let region = self.locate_region(&mut file, &key, false)?;
        let mut pages = self.region_pages(&mut file, region)?;

        for (page_num, page) in pages.iter_mut() {
            if let Some(slot) = page.entries.iter().position(|e| e.pos == -1) {
                page.entries[slot] = LeafEntry {
                    key: key.clone(),
                    pos: pos as i32,
                };
                return file.write_leaf(*page_num, page);
            }
        }

        // region full: hang a fresh overflow page at the end of its chain
        let new_page_num = file.leaf_count()? as i32;
        let last = pages.last_mut().expect("region chain has a regular leaf");
        let mut entries = vec![LeafEntry {
            key,
            pos: pos as i32,
        }];
        while entries.len() < self.leaf_factor {
            entries.push(self.empty_entry());
        }
        let new_page = LeafPage {
            page_num: new_page_num,
            next_page: last.1.next_page,
            not_overflow: false,
            entries,
        };
        debug!(
            "isam {:?}: overflow page {} for region {}",
            self.path, new_page_num, region
        );
        last.1.next_page = new_page_num;
        file.write_leaf(last.0, &last.1)?;
        file.write_leaf(new_page_num, &new_page)?;
        Ok(())
    }

    fn delete(&mut self, key: &Value) -> Result<bool> {
        let key = self.codec.encode(key)?;
        let mut file = self.open_file()?;
        let seps = file.boundary_separators()?;
        let start_region = self.locate_region(&mut file, &key, true)?;
        let mut page_num = start_region as i32;
        while page_num != -1 {
            let mut page = file.read_leaf(page_num)?;
            if page.not_overflow {
                let region = page.page_num as usize;
                if region != start_region
                    && self.codec.compare(&seps[region], &key)? == Ordering::Greater
                {
                    break;
                }
            }
            for entry in &mut page.entries {
                if entry.pos != -1 && self.codec.compare(&entry.key, &key)? == Ordering::Equal {
                    entry.pos = -1;
                    file.write_leaf(page_num, &page)?;
                    return Ok(true);
                }
            }
            page_num = page.next_page;
        }
        Ok(false)
    }

    fn search(&self, key: &Value) -> Result<Vec<u32>> {
        self.range_search(Some(key), Some(key))
    }

    fn range_search(&self, lo: Option<&Value>, hi: Option<&Value>) -> Result<Vec<u32>> {
        let lo = self.encode_bound(lo)?;
        let hi = self.encode_bound(hi)?;
        let mut file = self.open_file()?;
        self.collect_range(&mut file, lo.as_deref(), hi.as_deref())
    }

    fn get_all(&self) -> Result<Vec<u32>> {
        let mut file = self.open_file()?;
        let count = file.leaf_count()?;
        let mut out = Vec::new();
        for page_num in 0..count {
            let page = file.read_leaf(page_num as i32)?;
            for entry in &page.entries {
                if entry.pos != -1 {
                    out.push(entry.pos as u32);
                }
            }
        }
        Ok(out)
    }

    fn clear(&mut self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use tempfile::TempDir;

    fn small_isam(dir: &TempDir) -> IsamIndex {
        let column = Column::new("id", DataType::Int);
        IsamIndex::with_factors(
            dir.path().join("t_id_isam.dat"),
            KeyCodec::for_column(&column).unwrap(),
            4,
            2,
        )
        .unwrap()
    }

    #[test]
    fn test_bulk_build_and_search() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = small_isam(&dir);
        let entries: Vec<(Value, u32)> = (0..40).map(|i| (Value::Int(i * 2), i as u32)).collect();
        index.build(&entries)?;

        assert_eq!(index.search(&Value::Int(20))?, vec![10]);
        assert_eq!(index.search(&Value::Int(21))?, Vec::<u32>::new());
        assert_eq!(index.get_all()?.len(), 40);
        Ok(())
    }

    #[test]
    fn test_range_search_follows_chains() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = small_isam(&dir);
        let entries: Vec<(Value, u32)> = (0..60).map(|i| (Value::Int(i), i as u32)).collect();
        index.build(&entries)?;

        let mut hits = index.range_search(Some(&Value::Int(10)), Some(&Value::Int(19)))?;
        hits.sort_unstable();
        assert_eq!(hits, (10..20).collect::<Vec<u32>>());

        let open = index.range_search(Some(&Value::Int(55)), None)?;
        assert_eq!(open.len(), 5);
        Ok(())
    }

    #[test]
    fn test_insert_goes_to_overflow() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = small_isam(&dir);
        let entries: Vec<(Value, u32)> = (0..30).map(|i| (Value::Int(i), i as u32)).collect();
        index.build(&entries)?;

        for i in 30..50 {
            index.insert(i as u32, &Value::Int(i))?;
        }
        for i in 0..50 {
            assert_eq!(index.search(&Value::Int(i))?, vec![i as u32], "key {}", i);
        }
        let mut hits = index.range_search(Some(&Value::Int(25)), Some(&Value::Int(44)))?;
        hits.sort_unstable();
        assert_eq!(hits, (25..45).collect::<Vec<u32>>());
        Ok(())
    }

    #[test]
    fn test_insert_into_empty_build() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = small_isam(&dir);
        for (pos, key) in [7, -3, 12, 0, 7].iter().enumerate() {
            index.insert(pos as u32, &Value::Int(*key))?;
        }
        let mut hits = index.search(&Value::Int(7))?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 4]);
        assert_eq!(index.search(&Value::Int(-3))?, vec![1]);
        assert_eq!(index.get_all()?.len(), 5);
        Ok(())
    }

    #[test]
    fn test_logical_delete() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = small_isam(&dir);
        let entries: Vec<(Value, u32)> = (0..20).map(|i| (Value::Int(i), i as u32)).collect();
        index.build(&entries)?;

        assert!(index.delete(&Value::Int(7))?);
        assert!(!index.delete(&Value::Int(7))?);
        assert_eq!(index.search(&Value::Int(7))?, Vec::<u32>::new());
        assert_eq!(index.get_all()?.len(), 19);

        // a freed slot is reused by the next insert into the region
        index.insert(99, &Value::Int(7))?;
        assert_eq!(index.search(&Value::Int(7))?, vec![99]);
        Ok(())
    }
}
