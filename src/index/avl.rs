use crate::index::{ColumnIndex, KeyCodec};
use crate::ioutils::{read_i32, read_i32_at, write_i32_at};
use crate::schema::{IndexType, Value};
use crate::Result;
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

const HEADER_SIZE: u64 = 4;

/// Disk-resident AVL tree, one node per file slot:
/// `| key | position: i32 | left: i32 | right: i32 | height: i32 |`.
/// The file header holds the root slot, -1 when empty.
///
/// Nodes are ordered on `(key, position)` so duplicate keys stay
/// well-defined; `search` and `range_search` match on the key alone.
/// Removed slots are tombstoned with `height = -1` and not reclaimed.
pub struct AvlIndex {
    path: PathBuf,
    codec: KeyCodec,
}

#[derive(Clone)]
struct AvlNode {
    key: Vec<u8>,
    position: i32,
    left: i32,
    right: i32,
    height: i32,
}

impl AvlNode {
    fn new(key: Vec<u8>, position: i32) -> AvlNode {
        AvlNode {
            key,
            position,
            left: -1,
            right: -1,
            height: 0,
        }
    }
}

/// One open file handle for the duration of a single index operation.
struct AvlFile {
    file: File,
    key_width: usize,
}

impl AvlFile {
    fn node_size(&self) -> u64 {
        (self.key_width + 16) as u64
    }

    fn read_root(&mut self) -> Result<i32> {
        read_i32_at(&mut self.file, 0)
    }

    fn write_root(&mut self, root: i32) -> Result<()> {
        write_i32_at(&mut self.file, 0, root)
    }

    fn read_node(&mut self, pos: i32) -> Result<AvlNode> {
        let offset = HEADER_SIZE + pos as u64 * self.node_size();
        self.file.seek(SeekFrom::Start(offset))?;
        let mut key = vec![0u8; self.key_width];
        self.file.read_exact(&mut key)?;
        let position = read_i32(&mut self.file)?;
        let left = read_i32(&mut self.file)?;
        let right = read_i32(&mut self.file)?;
        let height = read_i32(&mut self.file)?;
        Ok(AvlNode {
            key,
            position,
            left,
            right,
            height,
        })
    }

    /// Writes at `pos`, or appends when `pos` is -1; returns the slot used.
    fn write_node(&mut self, pos: i32, node: &AvlNode) -> Result<i32> {
        let pos = if pos == -1 {
            let end = self.file.seek(SeekFrom::End(0))?;
            ((end - HEADER_SIZE) / self.node_size()) as i32
        } else {
            let offset = HEADER_SIZE + pos as u64 * self.node_size();
            self.file.seek(SeekFrom::Start(offset))?;
            pos
        };
        self.file.write_all(&node.key)?;
        self.file.write_all(&node.position.to_le_bytes())?;
        self.file.write_all(&node.left.to_le_bytes())?;
        self.file.write_all(&node.right.to_le_bytes())?;
        self.file.write_all(&node.height.to_le_bytes())?;
        Ok(pos)
    }

    fn tombstone(&mut self, pos: i32) -> Result<()> {
        let mut node = AvlNode::new(vec![0u8; self.key_width], -1);
        node.height = -1;
        self.write_node(pos, &node)?;
        Ok(())
    }

    fn height_of(&mut self, pos: i32) -> Result<i32> {
        if pos == -1 {
            return Ok(-1);
        }
        Ok(self.read_node(pos)?.height)
    }
}

impl AvlIndex {
    pub fn open(path: impl Into<PathBuf>, codec: KeyCodec) -> Result<AvlIndex> {
        let path = path.into();
        let index = AvlIndex { path, codec };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&index.path)?;
        if file.seek(SeekFrom::End(0))? == 0 {
            write_i32_at(&mut file, 0, -1)?;
        }
        Ok(index)
    }

    fn open_file(&self) -> Result<AvlFile> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(AvlFile {
            file,
            key_width: self.codec.width(),
        })
    }

    /// `(key, position)` composite order.
    fn cmp_entry(&self, key: &[u8], pos: i32, node: &AvlNode) -> Result<Ordering> {
        Ok(self
            .codec
            .compare(key, &node.key)?
            .then(pos.cmp(&node.position)))
    }

    fn update_height(&self, file: &mut AvlFile, node: &AvlNode) -> Result<i32> {
        let left = file.height_of(node.left)?;
        let right = file.height_of(node.right)?;
        Ok(left.max(right) + 1)
    }

    fn balance_factor(&self, file: &mut AvlFile, node: &AvlNode) -> Result<i32> {
        let left = file.height_of(node.left)?;
        let right = file.height_of(node.right)?;
        Ok(left - right)
    }

    fn right_rotate(
        &self,
        file: &mut AvlFile,
        y: &mut AvlNode,
        pos_y: i32,
        x: &mut AvlNode,
        pos_x: i32,
    ) -> Result<i32> {
        let t2 = x.right;
        x.right = pos_y;
        y.left = t2;
        y.height = self.update_height(file, y)?;
        file.write_node(pos_y, y)?;
        x.height = self.update_height(file, x)?;
        file.write_node(pos_x, x)?;
        Ok(pos_x)
    }

    fn left_rotate(
        &self,
        file: &mut AvlFile,
        x: &mut AvlNode,
        pos_x: i32,
        y: &mut AvlNode,
        pos_y: i32,
    ) -> Result<i32> {
        let t2 = y.left;
        y.left = pos_x;
        x.right = t2;
        x.height = self.update_height(file, x)?;
        file.write_node(pos_x, x)?;
        y.height = self.update_height(file, y)?;
        file.write_node(pos_y, y)?;
        Ok(pos_y)
    }

    /// Rebalances one node, returning the slot now rooting the subtree.
    fn balance(&self, file: &mut AvlFile, mut node: AvlNode, pos: i32) -> Result<i32> {
        node.height = self.update_height(file, &node)?;
        let factor = self.balance_factor(file, &node)?;

        if factor > 1 {
            let left_pos = node.left;
            let mut left = file.read_node(left_pos)?;
            if self.balance_factor(file, &left)? >= 0 {
                debug!("avl {:?}: right rotate at slot {}", self.path, pos);
                return self.right_rotate(file, &mut node, pos, &mut left, left_pos);
            }
            debug!("avl {:?}: left-right rotate at slot {}", self.path, pos);
            let lr_pos = left.right;
            let mut left_right = file.read_node(lr_pos)?;
            node.left = self.left_rotate(file, &mut left, left_pos, &mut left_right, lr_pos)?;
            let new_left = node.left;
            return self.right_rotate(file, &mut node, pos, &mut left_right, new_left);
        }

        if factor < -1 {
            let right_pos = node.right;
            let mut right = file.read_node(right_pos)?;
            if self.balance_factor(file, &right)? <= 0 {
                debug!("avl {:?}: left rotate at slot {}", self.path, pos);
                return self.left_rotate(file, &mut node, pos, &mut right, right_pos);
            }
            debug!("avl {:?}: right-left rotate at slot {}", self.path, pos);
            let rl_pos = right.left;
            let mut right_left = file.read_node(rl_pos)?;
            node.right = self.right_rotate(file, &mut right, right_pos, &mut right_left, rl_pos)?;
            let new_right = node.right;
            return self.left_rotate(file, &mut node, pos, &mut right_left, new_right);
        }

        file.write_node(pos, &node)?;
        Ok(pos)
    }

    fn add_aux(&self, file: &mut AvlFile, node_pos: i32, key: &[u8], pos: i32) -> Result<i32> {
        if node_pos == -1 {
            return file.write_node(-1, &AvlNode::new(key.to_vec(), pos));
        }
        let mut node = file.read_node(node_pos)?;
        match self.cmp_entry(key, pos, &node)? {
            Ordering::Less => node.left = self.add_aux(file, node.left, key, pos)?,
            Ordering::Greater => node.right = self.add_aux(file, node.right, key, pos)?,
            Ordering::Equal => return Ok(node_pos),
        }
        self.balance(file, node, node_pos)
    }

    /// Rightmost node of a subtree, used as the in-order predecessor.
    fn predecessor(&self, file: &mut AvlFile, pos: i32) -> Result<AvlNode> {
        let node = file.read_node(pos)?;
        if node.right != -1 {
            return self.predecessor(file, node.right);
        }
        Ok(node)
    }

    fn delete_aux(&self, file: &mut AvlFile, node_pos: i32, key: &[u8], pos: i32) -> Result<i32> {
        if node_pos == -1 {
            return Ok(node_pos);
        }
        let mut node = file.read_node(node_pos)?;
        match self.cmp_entry(key, pos, &node)? {
            Ordering::Less => node.left = self.delete_aux(file, node.left, key, pos)?,
            Ordering::Greater => node.right = self.delete_aux(file, node.right, key, pos)?,
            Ordering::Equal => {
                if node.left == -1 {
                    file.tombstone(node_pos)?;
                    return Ok(node.right);
                }
                if node.right == -1 {
                    file.tombstone(node_pos)?;
                    return Ok(node.left);
                }
                let pred = self.predecessor(file, node.left)?;
                let pred_key = pred.key.clone();
                let pred_position = pred.position;
                node.key = pred.key;
                node.position = pred.position;
                node.left = self.delete_aux(file, node.left, &pred_key, pred_position)?;
            }
        }
        self.balance(file, node, node_pos)
    }

    /// First node carrying `key` (any position), or None.
    fn find_any(&self, file: &mut AvlFile, node_pos: i32, key: &[u8]) -> Result<Option<AvlNode>> {
        if node_pos == -1 {
            return Ok(None);
        }
        let node = file.read_node(node_pos)?;
        match self.codec.compare(key, &node.key)? {
            Ordering::Less => self.find_any(file, node.left, key),
            Ordering::Greater => self.find_any(file, node.right, key),
            Ordering::Equal => Ok(Some(node)),
        }
    }

    fn range_aux(
        &self,
        file: &mut AvlFile,
        node_pos: i32,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        out: &mut Vec<u32>,
    ) -> Result<()> {
        if node_pos == -1 {
            return Ok(());
        }
        let node = file.read_node(node_pos)?;
        let above_lo = match lo {
            Some(lo) => self.codec.compare(lo, &node.key)? != Ordering::Greater,
            None => true,
        };
        let below_hi = match hi {
            Some(hi) => self.codec.compare(&node.key, hi)? != Ordering::Greater,
            None => true,
        };
        // equal keys sit on both sides of a matching node, so the bounds are
        // inclusive in both descent directions
        if above_lo {
            self.range_aux(file, node.left, lo, hi, out)?;
        }
        if above_lo && below_hi {
            out.push(node.position as u32);
        }
        if below_hi {
            self.range_aux(file, node.right, lo, hi, out)?;
        }
        Ok(())
    }

    fn in_order(&self, file: &mut AvlFile, node_pos: i32, out: &mut Vec<u32>) -> Result<()> {
        if node_pos == -1 {
            return Ok(());
        }
        let node = file.read_node(node_pos)?;
        self.in_order(file, node.left, out)?;
        out.push(node.position as u32);
        self.in_order(file, node.right, out)?;
        Ok(())
    }

    fn encode_bound(&self, bound: Option<&Value>) -> Result<Option<Vec<u8>>> {
        match bound {
            Some(value) => Ok(Some(self.codec.encode(value)?)),
            None => Ok(None),
        }
    }
}

impl ColumnIndex for AvlIndex {
    fn kind(&self) -> IndexType {
        IndexType::Avl
    }

    fn insert(&mut self, pos: u32, key: &Value) -> Result<()> {
        let key = self.codec.encode(key)?;
        let mut file = self.open_file()?;
        let root = file.read_root()?;
        let new_root = self.add_aux(&mut file, root, &key, pos as i32)?;
        if new_root != root {
            file.write_root(new_root)?;
        }
        Ok(())
    }

    fn delete(&mut self, key: &Value) -> Result<bool> {
        let key = self.codec.encode(key)?;
        let mut file = self.open_file()?;
        let root = file.read_root()?;
        let target = match self.find_any(&mut file, root, &key)? {
            Some(node) => node,
            None => return Ok(false),
        };
        let new_root = self.delete_aux(&mut file, root, &target.key, target.position)?;
        if new_root != root {
            file.write_root(new_root)?;
        }
        Ok(true)
    }

    fn search(&self, key: &Value) -> Result<Vec<u32>> {
        self.range_search(Some(key), Some(key))
    }

    fn range_search(&self, lo: Option<&Value>, hi: Option<&Value>) -> Result<Vec<u32>> {
        let lo = self.encode_bound(lo)?;
        let hi = self.encode_bound(hi)?;
        let mut file = self.open_file()?;
        let root = file.read_root()?;
        let mut out = Vec::new();
        self.range_aux(&mut file, root, lo.as_deref(), hi.as_deref(), &mut out)?;
        Ok(out)
    }

    fn get_all(&self) -> Result<Vec<u32>> {
        let mut file = self.open_file()?;
        let root = file.read_root()?;
        let mut out = Vec::new();
        self.in_order(&mut file, root, &mut out)?;
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
    use crate::schema::{Column, DataType};
    use tempfile::TempDir;

    fn int_index(dir: &TempDir) -> AvlIndex {
        let column = Column::new("id", DataType::Int);
        AvlIndex::open(
            dir.path().join("t_id_avl.dat"),
            KeyCodec::for_column(&column).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_insert_search() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = int_index(&dir);
        for (pos, key) in [4i32, 6, 2, 5, 8, 7, 40, 11, 3, 9].iter().enumerate() {
            index.insert(pos as u32, &Value::Int(*key))?;
        }
        assert_eq!(index.search(&Value::Int(8))?, vec![4]);
        assert_eq!(index.search(&Value::Int(99))?, Vec::<u32>::new());
        // rotations must keep the in-order walk sorted by key
        let all = index.get_all()?;
        assert_eq!(all.len(), 10);
        assert_eq!(all[0], 2); // key 2
        assert_eq!(all[9], 6); // key 40
        Ok(())
    }

    #[test]
    fn test_range_search() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = int_index(&dir);
        for key in 0..20 {
            index.insert(key as u32, &Value::Int(key))?;
        }
        let mut hits = index.range_search(Some(&Value::Int(5)), Some(&Value::Int(9)))?;
        hits.sort_unstable();
        assert_eq!(hits, vec![5, 6, 7, 8, 9]);
        let open = index.range_search(Some(&Value::Int(17)), None)?;
        assert_eq!(open.len(), 3);
        Ok(())
    }

    #[test]
    fn test_duplicate_keys() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = int_index(&dir);
        for pos in 0..5 {
            index.insert(pos, &Value::Int(7))?;
        }
        index.insert(5, &Value::Int(3))?;
        let mut hits = index.search(&Value::Int(7))?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2, 3, 4]);

        assert!(index.delete(&Value::Int(7))?);
        assert_eq!(index.search(&Value::Int(7))?.len(), 4);
        assert_eq!(index.search(&Value::Int(3))?, vec![5]);
        Ok(())
    }

    #[test]
    fn test_delete_rebalances() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = int_index(&dir);
        for key in 0..32 {
            index.insert(key as u32, &Value::Int(key))?;
        }
        for key in 0..16 {
            assert!(index.delete(&Value::Int(key))?);
        }
        assert!(!index.delete(&Value::Int(0))?);
        let mut rest = index.get_all()?;
        rest.sort_unstable();
        assert_eq!(rest, (16..32).collect::<Vec<u32>>());
        Ok(())
    }

    #[test]
    fn test_varchar_keys() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut column = Column::new("name", DataType::Varchar);
        column.varchar_length = 12;
        let mut index = AvlIndex::open(
            dir.path().join("t_name_avl.dat"),
            KeyCodec::for_column(&column).unwrap(),
        )?;
        for (pos, name) in ["paca", "sergod", "eduardo", "hola"].iter().enumerate() {
            index.insert(pos as u32, &Value::Varchar((*name).into()))?;
        }
        assert_eq!(index.search(&Value::Varchar("eduardo".into()))?, vec![2]);
        let hits = index.range_search(
            Some(&Value::Varchar("a".into())),
            Some(&Value::Varchar("i".into())),
        )?;
        assert_eq!(hits.len(), 2); // eduardo, hola
        Ok(())
    }
}
