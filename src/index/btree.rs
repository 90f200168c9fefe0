use crate::index::{ColumnIndex, KeyCodec};
use crate::ioutils::{read_i32, read_i32_at, write_i32_at};
use crate::schema::{IndexType, Value};
use crate::Result;
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

const HEADER_SIZE: u64 = 4;

/// Branching factor used for real tables; unit tests shrink it to 3 to force
/// splits with a handful of keys.
pub const DEFAULT_BRANCH_FACTOR: usize = 32;

/// Disk-resident B+Tree. Page layout per node:
/// `| B keys | B+1 pointers: i32 | is_leaf: i32 | size: i32 | next: i32 |`,
/// with the file header holding the root page, -1 when empty. Leaf pages
/// chain through `next` in key order.
///
/// Deletion is the lazy variant: the entry is removed from its leaf and no
/// underflowed page is ever merged or borrowed from, so delete-heavy
/// workloads degrade but never corrupt the tree.
pub struct BPlusTree {
    path: PathBuf,
    codec: KeyCodec,
    branch_factor: usize,
}

struct BNode {
    keys: Vec<Vec<u8>>,
    pointers: Vec<i32>,
    is_leaf: bool,
    next: i32,
}

impl BNode {
    fn empty_leaf() -> BNode {
        BNode {
            keys: Vec::new(),
            pointers: Vec::new(),
            is_leaf: true,
            next: -1,
        }
    }

    fn size(&self) -> usize {
        self.keys.len()
    }
}

struct BFile {
    file: File,
    key_width: usize,
    branch_factor: usize,
}

impl BFile {
    fn node_size(&self) -> u64 {
        (self.branch_factor * self.key_width + (self.branch_factor + 1) * 4 + 12) as u64
    }

    fn read_root(&mut self) -> Result<i32> {
        read_i32_at(&mut self.file, 0)
    }

    fn write_root(&mut self, root: i32) -> Result<()> {
        write_i32_at(&mut self.file, 0, root)
    }

    fn read_node(&mut self, pos: i32) -> Result<BNode> {
        let offset = HEADER_SIZE + pos as u64 * self.node_size();
        self.file.seek(SeekFrom::Start(offset))?;
        let mut raw_keys = vec![0u8; self.branch_factor * self.key_width];
        self.file.read_exact(&mut raw_keys)?;
        let mut raw_pointers = Vec::with_capacity(self.branch_factor + 1);
        for _ in 0..self.branch_factor + 1 {
            raw_pointers.push(read_i32(&mut self.file)?);
        }
        let is_leaf = read_i32(&mut self.file)? != 0;
        let size = read_i32(&mut self.file)? as usize;
        let next = read_i32(&mut self.file)?;

        let keys = (0..size)
            .map(|i| raw_keys[i * self.key_width..(i + 1) * self.key_width].to_vec())
            .collect();
        let pointer_count = if is_leaf { size } else { size + 1 };
        raw_pointers.truncate(pointer_count);
        Ok(BNode {
            keys,
            pointers: raw_pointers,
            is_leaf,
            next,
        })
    }

    /// Writes at `pos`, or appends when `pos` is -1; returns the page used.
    fn write_node(&mut self, pos: i32, node: &BNode) -> Result<i32> {
        let pos = if pos == -1 {
            let end = self.file.seek(SeekFrom::End(0))?;
            ((end - HEADER_SIZE) / self.node_size()) as i32
        } else {
            let offset = HEADER_SIZE + pos as u64 * self.node_size();
            self.file.seek(SeekFrom::Start(offset))?;
            pos
        };
        for key in &node.keys {
            self.file.write_all(key)?;
        }
        let padding = vec![0u8; (self.branch_factor - node.size()) * self.key_width];
        self.file.write_all(&padding)?;
        for pointer in &node.pointers {
            self.file.write_all(&pointer.to_le_bytes())?;
        }
        for _ in node.pointers.len()..self.branch_factor + 1 {
            self.file.write_all(&(-1i32).to_le_bytes())?;
        }
        self.file.write_all(&(node.is_leaf as i32).to_le_bytes())?;
        self.file.write_all(&(node.size() as i32).to_le_bytes())?;
        self.file.write_all(&node.next.to_le_bytes())?;
        Ok(pos)
    }
}

impl BPlusTree {
    pub fn open(path: impl Into<PathBuf>, codec: KeyCodec) -> Result<BPlusTree> {
        Self::with_branch_factor(path, codec, DEFAULT_BRANCH_FACTOR)
    }

    pub fn with_branch_factor(
        path: impl Into<PathBuf>,
        codec: KeyCodec,
        branch_factor: usize,
    ) -> Result<BPlusTree> {
        assert!(branch_factor >= 3);
        let tree = BPlusTree {
            path: path.into(),
            codec,
            branch_factor,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&tree.path)?;
        if file.seek(SeekFrom::End(0))? == 0 {
            write_i32_at(&mut file, 0, -1)?;
        }
        Ok(tree)
    }

    fn open_file(&self) -> Result<BFile> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(BFile {
            file,
            key_width: self.codec.width(),
            branch_factor: self.branch_factor,
        })
    }

    /// Child slot to descend into: the first separator >= `key` routes left,
    /// so equal keys are always reachable from the leftmost candidate leaf.
    fn descend_slot(&self, node: &BNode, key: &[u8]) -> Result<usize> {
        for (i, sep) in node.keys.iter().enumerate() {
            if self.codec.compare(key, sep)? != Ordering::Greater {
                return Ok(i);
            }
        }
        Ok(node.size())
    }

    /// Leftmost leaf that may hold `key` (or the leftmost leaf overall).
    fn find_leaf(&self, file: &mut BFile, key: Option<&[u8]>) -> Result<Option<(i32, BNode)>> {
        let mut pos = file.read_root()?;
        if pos == -1 {
            return Ok(None);
        }
        let mut node = file.read_node(pos)?;
        while !node.is_leaf {
            let slot = match key {
                Some(key) => self.descend_slot(&node, key)?,
                None => 0,
            };
            pos = node.pointers[slot];
            node = file.read_node(pos)?;
        }
        Ok(Some((pos, node)))
    }

    fn insert_aux(
        &self,
        file: &mut BFile,
        node_pos: i32,
        key: &[u8],
        pointer: i32,
    ) -> Result<Option<(Vec<u8>, i32)>> {
        let mut node = file.read_node(node_pos)?;
        if node.is_leaf {
            // insert after any existing duplicates to preserve arrival order
            let mut slot = node.size();
            for i in 0..node.size() {
                if self.codec.compare(&node.keys[i], key)? == Ordering::Greater {
                    slot = i;
                    break;
                }
            }
            node.keys.insert(slot, key.to_vec());
            node.pointers.insert(slot, pointer);
            if node.size() < self.branch_factor {
                file.write_node(node_pos, &node)?;
                return Ok(None);
            }

            debug!("btree {:?}: splitting leaf page {}", self.path, node_pos);
            let mid = node.size() / 2;
            let right = BNode {
                keys: node.keys.split_off(mid),
                pointers: node.pointers.split_off(mid),
                is_leaf: true,
                next: node.next,
            };
            let separator = right.keys[0].clone();
            let right_pos = file.write_node(-1, &right)?;
            node.next = right_pos;
            file.write_node(node_pos, &node)?;
            return Ok(Some((separator, right_pos)));
        }

        let slot = self.descend_slot(&node, key)?;
        let split = self.insert_aux(file, node.pointers[slot], key, pointer)?;
        let (up_key, up_pointer) = match split {
            Some(split) => split,
            None => return Ok(None),
        };

        let mut slot = node.size();
        for i in 0..node.size() {
            if self.codec.compare(&node.keys[i], &up_key)? == Ordering::Greater {
                slot = i;
                break;
            }
        }
        node.keys.insert(slot, up_key);
        node.pointers.insert(slot + 1, up_pointer);
        if node.size() < self.branch_factor {
            file.write_node(node_pos, &node)?;
            return Ok(None);
        }

        debug!("btree {:?}: splitting internal page {}", self.path, node_pos);
        let mid = node.size() / 2;
        let mut right_keys = node.keys.split_off(mid);
        let promoted = right_keys.remove(0);
        let right = BNode {
            keys: right_keys,
            pointers: node.pointers.split_off(mid + 1),
            is_leaf: false,
            next: -1,
        };
        let right_pos = file.write_node(-1, &right)?;
        file.write_node(node_pos, &node)?;
        Ok(Some((promoted, right_pos)))
    }

    /// Walks the leaf chain from the lower bound, collecting matches until a
    /// key exceeds `hi`.
    fn collect_range(
        &self,
        file: &mut BFile,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut current = self.find_leaf(file, lo)?;
        while let Some((_, node)) = current {
            for (i, key) in node.keys.iter().enumerate() {
                if let Some(lo) = lo {
                    if self.codec.compare(key, lo)? == Ordering::Less {
                        continue;
                    }
                }
                if let Some(hi) = hi {
                    if self.codec.compare(key, hi)? == Ordering::Greater {
                        return Ok(out);
                    }
                }
                out.push(node.pointers[i] as u32);
            }
            if node.next == -1 {
                break;
            }
            let next = node.next;
            current = Some((next, file.read_node(next)?));
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

impl ColumnIndex for BPlusTree {
    fn kind(&self) -> IndexType {
        IndexType::Btree
    }

    fn insert(&mut self, pos: u32, key: &Value) -> Result<()> {
        let key = self.codec.encode(key)?;
        let mut file = self.open_file()?;
        let root = file.read_root()?;
        if root == -1 {
            let mut leaf = BNode::empty_leaf();
            leaf.keys.push(key);
            leaf.pointers.push(pos as i32);
            let root = file.write_node(-1, &leaf)?;
            file.write_root(root)?;
            return Ok(());
        }

        if let Some((separator, right_pos)) = self.insert_aux(&mut file, root, &key, pos as i32)? {
            debug!("btree {:?}: root split, growing a level", self.path);
            let new_root = BNode {
                keys: vec![separator],
                pointers: vec![root, right_pos],
                is_leaf: false,
                next: -1,
            };
            let new_root_pos = file.write_node(-1, &new_root)?;
            file.write_root(new_root_pos)?;
        }
        Ok(())
    }

    fn delete(&mut self, key: &Value) -> Result<bool> {
        let key = self.codec.encode(key)?;
        let mut file = self.open_file()?;
        let mut current = self.find_leaf(&mut file, Some(&key))?;
        while let Some((pos, mut node)) = current {
            for i in 0..node.size() {
                match self.codec.compare(&node.keys[i], &key)? {
                    Ordering::Less => continue,
                    Ordering::Greater => return Ok(false),
                    Ordering::Equal => {
                        node.keys.remove(i);
                        node.pointers.remove(i);
                        file.write_node(pos, &node)?;
                        return Ok(true);
                    }
                }
            }
            if node.next == -1 {
                break;
            }
            let next = node.next;
            current = Some((next, file.read_node(next)?));
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
        self.collect_range(&mut file, None, None)
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
    use crate::schema::{Column, DataType};
    use tempfile::TempDir;

    fn small_tree(dir: &TempDir) -> BPlusTree {
        let column = Column::new("id", DataType::Int);
        BPlusTree::with_branch_factor(
            dir.path().join("t_id_btree.dat"),
            KeyCodec::for_column(&column).unwrap(),
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_insert_splits_and_search() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir);
        let keys = [4, 6, 2, 5, 8, 7, 40, 11, 3, 9];
        for (pos, key) in keys.iter().enumerate() {
            tree.insert(pos as u32, &Value::Int(*key))?;
        }
        for (pos, key) in keys.iter().enumerate() {
            assert_eq!(tree.search(&Value::Int(*key))?, vec![pos as u32]);
        }
        assert_eq!(tree.search(&Value::Int(999))?, Vec::<u32>::new());
        Ok(())
    }

    #[test]
    fn test_leaf_chain_order() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir);
        for key in (0..50).rev() {
            tree.insert(key as u32, &Value::Int(key))?;
        }
        // get_all walks the leaf chain, so the result arrives key-ordered
        assert_eq!(tree.get_all()?, (0..50).collect::<Vec<u32>>());
        Ok(())
    }

    #[test]
    fn test_range_search() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir);
        for key in 0..30 {
            tree.insert(key as u32, &Value::Int(key))?;
        }
        assert_eq!(
            tree.range_search(Some(&Value::Int(10)), Some(&Value::Int(14)))?,
            vec![10, 11, 12, 13, 14]
        );
        assert_eq!(
            tree.range_search(None, Some(&Value::Int(2)))?,
            vec![0, 1, 2]
        );
        assert_eq!(
            tree.range_search(Some(&Value::Int(27)), None)?,
            vec![27, 28, 29]
        );
        Ok(())
    }

    #[test]
    fn test_duplicate_keys_span_leaves() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir);
        for pos in 0..8 {
            tree.insert(pos, &Value::Int(5))?;
        }
        tree.insert(8, &Value::Int(1))?;
        tree.insert(9, &Value::Int(9))?;
        let mut hits = tree.search(&Value::Int(5))?;
        hits.sort_unstable();
        assert_eq!(hits, (0..8).collect::<Vec<u32>>());
        Ok(())
    }

    #[test]
    fn test_lazy_delete() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut tree = small_tree(&dir);
        for key in 0..10 {
            tree.insert(key as u32, &Value::Int(key))?;
        }
        assert!(tree.delete(&Value::Int(4))?);
        assert!(!tree.delete(&Value::Int(4))?);
        assert_eq!(tree.search(&Value::Int(4))?, Vec::<u32>::new());
        assert_eq!(
            tree.range_search(Some(&Value::Int(3)), Some(&Value::Int(5)))?,
            vec![3, 5]
        );
        Ok(())
    }

    #[test]
    fn test_varchar_keys() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut column = Column::new("name", DataType::Varchar);
        column.varchar_length = 20;
        let mut tree = BPlusTree::with_branch_factor(
            dir.path().join("t_name_btree.dat"),
            KeyCodec::for_column(&column).unwrap(),
            3,
        )?;
        let names = [
            "sergod2", "paca", "sergod5", "sergod3", "sergod1", "eduardo", "hola", "sergod4",
        ];
        for (pos, name) in names.iter().enumerate() {
            tree.insert(pos as u32, &Value::Varchar((*name).into()))?;
        }
        assert_eq!(tree.search(&Value::Varchar("paca".into()))?, vec![1]);
        assert_eq!(tree.search(&Value::Varchar("ono".into()))?, Vec::<u32>::new());
        let hits = tree.range_search(
            Some(&Value::Varchar("sergod".into())),
            Some(&Value::Varchar("sergod9".into())),
        )?;
        assert_eq!(hits.len(), 5);
        Ok(())
    }
}
