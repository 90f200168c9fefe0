use crate::error::RelLiteError;
use crate::index::{Circle, ColumnIndex, Rect};
use crate::ioutils::{read_f32, read_i32, write_f32, write_i32};
use crate::schema::{IndexType, Value};
use crate::Result;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

const MAX_NODE_ENTRIES: usize = 8;

/// 2-D point index. The durable form is a flat entry file of
/// `| x: f32 | y: f32 | position: i32 |` records (`position = -1` marks a
/// dead entry); opening rebuilds an in-memory R-tree over the live entries
/// plus a `point → positions` map for exact search and deletion. Nodes
/// split along their wider axis at the median once they exceed
/// `MAX_NODE_ENTRIES`.
pub struct RTreeIndex {
    path: PathBuf,
    column: String,
    entries: Vec<(f32, f32, i32)>,
    root: Option<RNode>,
    exact: HashMap<(u32, u32), Vec<u32>>,
}

struct RNode {
    mbr: Rect,
    is_leaf: bool,
    children: Vec<RNode>,
    points: Vec<(f32, f32, u32)>,
}

impl RNode {
    fn leaf(x: f32, y: f32, pos: u32) -> RNode {
        RNode {
            mbr: Rect::point(x, y),
            is_leaf: true,
            children: Vec::new(),
            points: vec![(x, y, pos)],
        }
    }

    fn refit_mbr(&mut self) {
        let mut rects = Vec::new();
        if self.is_leaf {
            rects.extend(self.points.iter().map(|(x, y, _)| Rect::point(*x, *y)));
        } else {
            rects.extend(self.children.iter().map(|c| c.mbr));
        }
        let mut mbr = rects[0];
        for rect in &rects[1..] {
            mbr.expand(rect);
        }
        self.mbr = mbr;
    }
}

fn key_bits(x: f32, y: f32) -> (u32, u32) {
    (x.to_bits(), y.to_bits())
}

/// Best-first queue entry for kNN; ordered so the nearest candidate pops
/// first out of a max-heap.
enum HeapItem<'a> {
    Node(&'a RNode),
    Point(u32),
}

struct Candidate<'a> {
    dist_sq: f32,
    item: HeapItem<'a>,
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.dist_sq == other.dist_sq
    }
}

impl Eq for Candidate<'_> {}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.dist_sq.total_cmp(&self.dist_sq)
    }
}

impl RTreeIndex {
    pub fn open(path: impl Into<PathBuf>, column: impl Into<String>) -> Result<RTreeIndex> {
        let path = path.into();
        let mut index = RTreeIndex {
            path,
            column: column.into(),
            entries: Vec::new(),
            root: None,
            exact: HashMap::new(),
        };
        if !index.path.exists() {
            File::create(&index.path)?;
        } else {
            let mut file = File::open(&index.path)?;
            let count = std::fs::metadata(&index.path)?.len() / 12;
            for _ in 0..count {
                let x = read_f32(&mut file)?;
                let y = read_f32(&mut file)?;
                let pos = read_i32(&mut file)?;
                index.entries.push((x, y, pos));
            }
        }
        index.rebuild();
        Ok(index)
    }

    fn as_point(&self, key: &Value) -> Result<(f32, f32)> {
        match key {
            Value::Point(x, y) => Ok((*x, *y)),
            other => Err(RelLiteError::TypeMismatch {
                column: self.column.clone(),
                expected: "POINT",
                found: other.type_name().to_string(),
            }),
        }
    }

    /// Reconstructs the tree and the exact-match map from the live entries.
    fn rebuild(&mut self) {
        self.root = None;
        self.exact.clear();
        let live: Vec<(f32, f32, u32)> = self
            .entries
            .iter()
            .filter(|(_, _, pos)| *pos != -1)
            .map(|(x, y, pos)| (*x, *y, *pos as u32))
            .collect();
        for (x, y, pos) in live {
            self.tree_insert(x, y, pos);
            self.exact.entry(key_bits(x, y)).or_insert_with(Vec::new).push(pos);
        }
    }

    fn tree_insert(&mut self, x: f32, y: f32, pos: u32) {
        match self.root.take() {
            None => self.root = Some(RNode::leaf(x, y, pos)),
            Some(mut root) => {
                if let Some(sibling) = Self::insert_rec(&mut root, x, y, pos) {
                    let mut mbr = root.mbr;
                    mbr.expand(&sibling.mbr);
                    self.root = Some(RNode {
                        mbr,
                        is_leaf: false,
                        children: vec![root, sibling],
                        points: Vec::new(),
                    });
                } else {
                    self.root = Some(root);
                }
            }
        }
    }

    fn insert_rec(node: &mut RNode, x: f32, y: f32, pos: u32) -> Option<RNode> {
        node.mbr.expand(&Rect::point(x, y));
        if node.is_leaf {
            node.points.push((x, y, pos));
            if node.points.len() > MAX_NODE_ENTRIES {
                return Some(Self::split_leaf(node));
            }
            return None;
        }
        let slot = Self::choose_subtree(node, x, y);
        if let Some(sibling) = Self::insert_rec(&mut node.children[slot], x, y, pos) {
            node.children.push(sibling);
            if node.children.len() > MAX_NODE_ENTRIES {
                return Some(Self::split_internal(node));
            }
        }
        None
    }

    /// Child whose rectangle grows the least by taking the point.
    fn choose_subtree(node: &RNode, x: f32, y: f32) -> usize {
        let mut best = 0;
        let mut best_growth = f32::INFINITY;
        let mut best_area = f32::INFINITY;
        for (i, child) in node.children.iter().enumerate() {
            let mut grown = child.mbr;
            grown.expand(&Rect::point(x, y));
            let growth = grown.area() - child.mbr.area();
            let area = child.mbr.area();
            if growth < best_growth || (growth == best_growth && area < best_area) {
                best = i;
                best_growth = growth;
                best_area = area;
            }
        }
        best
    }

    fn split_leaf(node: &mut RNode) -> RNode {
        let wide_x = node.mbr.xmax - node.mbr.xmin >= node.mbr.ymax - node.mbr.ymin;
        node.points.sort_by(|a, b| {
            if wide_x {
                a.0.total_cmp(&b.0)
            } else {
                a.1.total_cmp(&b.1)
            }
        });
        let right = node.points.split_off(node.points.len() / 2);
        let mut sibling = RNode {
            mbr: Rect::point(right[0].0, right[0].1),
            is_leaf: true,
            children: Vec::new(),
            points: right,
        };
        sibling.refit_mbr();
        node.refit_mbr();
        sibling
    }

    fn split_internal(node: &mut RNode) -> RNode {
        let wide_x = node.mbr.xmax - node.mbr.xmin >= node.mbr.ymax - node.mbr.ymin;
        node.children.sort_by(|a, b| {
            let ca = if wide_x {
                a.mbr.xmin + a.mbr.xmax
            } else {
                a.mbr.ymin + a.mbr.ymax
            };
            let cb = if wide_x {
                b.mbr.xmin + b.mbr.xmax
            } else {
                b.mbr.ymin + b.mbr.ymax
            };
            ca.total_cmp(&cb)
        });
        let right = node.children.split_off(node.children.len() / 2);
        let mut sibling = RNode {
            mbr: right[0].mbr,
            is_leaf: false,
            children: right,
            points: Vec::new(),
        };
        sibling.refit_mbr();
        node.refit_mbr();
        sibling
    }

    fn query_rect(node: &RNode, rect: &Rect, out: &mut Vec<u32>) {
        if !node.mbr.intersects(rect) {
            return;
        }
        if node.is_leaf {
            for (x, y, pos) in &node.points {
                if rect.contains(*x, *y) {
                    out.push(*pos);
                }
            }
            return;
        }
        for child in &node.children {
            Self::query_rect(child, rect, out);
        }
    }

    fn append_entry(&self, x: f32, y: f32, pos: i32) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        write_f32(&mut file, x)?;
        write_f32(&mut file, y)?;
        write_i32(&mut file, pos)?;
        Ok(())
    }
}

impl ColumnIndex for RTreeIndex {
    fn kind(&self) -> IndexType {
        IndexType::Rtree
    }

    fn insert(&mut self, pos: u32, key: &Value) -> Result<()> {
        let (x, y) = self.as_point(key)?;
        self.append_entry(x, y, pos as i32)?;
        self.entries.push((x, y, pos as i32));
        self.tree_insert(x, y, pos);
        self.exact
            .entry(key_bits(x, y))
            .or_insert_with(Vec::new)
            .push(pos);
        Ok(())
    }

    fn delete(&mut self, key: &Value) -> Result<bool> {
        let (x, y) = self.as_point(key)?;
        let bits = key_bits(x, y);
        let victim = match self.exact.get_mut(&bits) {
            Some(positions) if !positions.is_empty() => positions.remove(0),
            _ => return Ok(false),
        };
        if self.exact.get(&bits).map_or(false, Vec::is_empty) {
            self.exact.remove(&bits);
        }
        let slot = self
            .entries
            .iter()
            .position(|(ex, ey, pos)| *pos == victim as i32 && key_bits(*ex, *ey) == bits)
            .expect("exact map references a live entry");
        self.entries[slot].2 = -1;

        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(slot as u64 * 12 + 8))?;
        write_i32(&mut file, -1)?;

        self.rebuild();
        Ok(true)
    }

    fn search(&self, key: &Value) -> Result<Vec<u32>> {
        let (x, y) = self.as_point(key)?;
        Ok(self
            .exact
            .get(&key_bits(x, y))
            .cloned()
            .unwrap_or_default())
    }

    fn range_search(&self, _lo: Option<&Value>, _hi: Option<&Value>) -> Result<Vec<u32>> {
        Err(RelLiteError::UnsupportedOperation {
            index: "rtree",
            op: "ordered range search",
        })
    }

    fn get_all(&self) -> Result<Vec<u32>> {
        Ok(self
            .entries
            .iter()
            .filter(|(_, _, pos)| *pos != -1)
            .map(|(_, _, pos)| *pos as u32)
            .collect())
    }

    fn clear(&mut self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        self.entries.clear();
        self.root = None;
        self.exact.clear();
        Ok(())
    }

    fn build(&mut self, entries: &[(Value, u32)]) -> Result<()> {
        let mut file = File::create(&self.path)?;
        self.entries.clear();
        for (key, pos) in entries {
            let (x, y) = self.as_point(key)?;
            write_f32(&mut file, x)?;
            write_f32(&mut file, y)?;
            write_i32(&mut file, *pos as i32)?;
            self.entries.push((x, y, *pos as i32));
        }
        self.rebuild();
        Ok(())
    }

    fn search_rect(&self, rect: &Rect) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            Self::query_rect(root, rect, &mut out);
        }
        Ok(out)
    }

    /// MBR filter first, then the exact distance check.
    fn search_circle(&self, circle: &Circle) -> Result<Vec<u32>> {
        let candidates = self.search_rect(&circle.mbr())?;
        let mut out = Vec::new();
        for pos in candidates {
            if let Some((x, y, _)) = self
                .entries
                .iter()
                .find(|(_, _, p)| *p == pos as i32)
                .copied()
            {
                if circle.contains(x, y) {
                    out.push(pos);
                }
            }
        }
        Ok(out)
    }

    /// Best-first traversal ordered by minimum distance to each rectangle.
    fn knn(&self, x: f32, y: f32, k: usize) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let root = match &self.root {
            Some(root) => root,
            None => return Ok(out),
        };
        if k == 0 {
            return Ok(out);
        }
        let mut heap = BinaryHeap::new();
        heap.push(Candidate {
            dist_sq: root.mbr.min_dist_sq(x, y),
            item: HeapItem::Node(root),
        });
        while let Some(candidate) = heap.pop() {
            match candidate.item {
                HeapItem::Point(pos) => {
                    out.push(pos);
                    if out.len() == k {
                        break;
                    }
                }
                HeapItem::Node(node) => {
                    if node.is_leaf {
                        for (px, py, pos) in &node.points {
                            let dx = px - x;
                            let dy = py - y;
                            heap.push(Candidate {
                                dist_sq: dx * dx + dy * dy,
                                item: HeapItem::Point(*pos),
                            });
                        }
                    } else {
                        for child in &node.children {
                            heap.push(Candidate {
                                dist_sq: child.mbr.min_dist_sq(x, y),
                                item: HeapItem::Node(child),
                            });
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_index(dir: &TempDir) -> RTreeIndex {
        RTreeIndex::open(dir.path().join("t_coord_rtree.dat"), "coord").unwrap()
    }

    #[test]
    fn test_rect_search() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = open_index(&dir);
        let points = [(10.0, 20.0), (5.5, 5.5), (15.0, 15.0), (12.0, 22.0)];
        for (pos, (x, y)) in points.iter().enumerate() {
            index.insert(pos as u32, &Value::Point(*x, *y))?;
        }
        let mut hits = index.search_rect(&Rect::new(9.0, 19.0, 13.0, 23.0))?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 3]);
        Ok(())
    }

    #[test]
    fn test_circle_search() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = open_index(&dir);
        // the corner point sits inside the MBR of the circle but outside it
        index.insert(0, &Value::Point(0.0, 0.0))?;
        index.insert(1, &Value::Point(2.9, 2.9))?;
        index.insert(2, &Value::Point(3.0, 0.0))?;
        let hits = index.search_circle(&Circle::new(0.0, 0.0, 3.0))?;
        assert_eq!(hits, vec![0, 2]);
        Ok(())
    }

    #[test]
    fn test_knn() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = open_index(&dir);
        for i in 0..50 {
            let offset = i as f32;
            index.insert(i, &Value::Point(offset, offset))?;
        }
        assert_eq!(index.knn(0.0, 0.0, 3)?, vec![0, 1, 2]);
        assert_eq!(index.knn(49.0, 49.0, 2)?, vec![49, 48]);
        assert_eq!(index.knn(0.0, 0.0, 0)?, Vec::<u32>::new());
        Ok(())
    }

    #[test]
    fn test_exact_search_and_delete() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let mut index = open_index(&dir);
        index.insert(0, &Value::Point(1.0, 1.0))?;
        index.insert(1, &Value::Point(1.0, 1.0))?;
        index.insert(2, &Value::Point(2.0, 2.0))?;

        assert_eq!(index.search(&Value::Point(1.0, 1.0))?, vec![0, 1]);
        assert!(index.delete(&Value::Point(1.0, 1.0))?);
        assert_eq!(index.search(&Value::Point(1.0, 1.0))?, vec![1]);
        assert!(!index.delete(&Value::Point(9.0, 9.0))?);
        assert_eq!(index.get_all()?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_reopen_restores_state() -> crate::Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t_coord_rtree.dat");
        {
            let mut index = RTreeIndex::open(&path, "coord")?;
            index.insert(0, &Value::Point(4.0, 4.0))?;
            index.insert(1, &Value::Point(8.0, 8.0))?;
            index.delete(&Value::Point(4.0, 4.0))?;
        }
        let index = RTreeIndex::open(&path, "coord")?;
        assert_eq!(index.get_all()?, vec![1]);
        assert_eq!(index.search(&Value::Point(8.0, 8.0))?, vec![1]);
        assert_eq!(index.search(&Value::Point(4.0, 4.0))?, Vec::<u32>::new());
        Ok(())
    }

    #[test]
    fn test_scalar_key_rejected() {
        let dir = TempDir::new().unwrap();
        let mut index = open_index(&dir);
        assert!(matches!(
            index.insert(0, &Value::Int(3)),
            Err(RelLiteError::TypeMismatch { .. })
        ));
    }
}
