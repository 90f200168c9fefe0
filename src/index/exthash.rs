use crate::error::RelLiteError;
use crate::hash::murmur_hash;
use crate::index::{ColumnIndex, KeyCodec};
use crate::ioutils::{read_i32, write_i32};
use crate::schema::{IndexType, Value};
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

pub const DEFAULT_BUCKET_CAPACITY: usize = 32;

/// Splitting can't go past this directory depth; a bucket that still
/// overflows there (e.g. one key repeated more than `B` times) grows an
/// overflow chain instead.
const MAX_GLOBAL_DEPTH: u32 = 12;

const HASH_SEED: u32 = 0xbc9f1d34;

/// Extendible hash over the low bits of a murmur hash of the encoded key.
///
/// Two files: the directory (`.dat`) holding
/// `| global_depth: i32 | bucket_capacity: i32 | 2^d bucket ids: i32 |`,
/// and a bucket file (`.bkt`) of fixed pages, each
/// `| local_depth: i32 | size: i32 | next: i32 | B entries |` with entries
/// `| key | position: i32 |`. Bucket ids are page numbers in the bucket
/// file; several directory slots may share one bucket until it splits.
pub struct ExtHashIndex {
    dir_path: PathBuf,
    bkt_path: PathBuf,
    codec: KeyCodec,
    bucket_capacity: usize,
}

struct Bucket {
    local_depth: i32,
    next: i32,
    entries: Vec<(Vec<u8>, i32)>,
}

impl Bucket {
    fn empty(local_depth: i32) -> Bucket {
        Bucket {
            local_depth,
            next: -1,
            entries: Vec::new(),
        }
    }
}

impl ExtHashIndex {
    pub fn open(path: impl Into<PathBuf>, codec: KeyCodec) -> Result<ExtHashIndex> {
        Self::with_capacity(path, codec, DEFAULT_BUCKET_CAPACITY)
    }

    pub fn with_capacity(
        path: impl Into<PathBuf>,
        codec: KeyCodec,
        bucket_capacity: usize,
    ) -> Result<ExtHashIndex> {
        assert!(bucket_capacity >= 1);
        let dir_path = path.into();
        let bkt_path = dir_path.with_extension("bkt");
        let mut index = ExtHashIndex {
            dir_path,
            bkt_path,
            codec,
            bucket_capacity,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&index.dir_path)?;
        if file.seek(SeekFrom::End(0))? == 0 {
            index.write_directory(1, &[0, 1])?;
            let mut bkt = File::create(&index.bkt_path)?;
            index.write_bucket_to(&mut bkt, 0, &Bucket::empty(1))?;
            index.write_bucket_to(&mut bkt, 1, &Bucket::empty(1))?;
        } else {
            // an existing file's capacity wins over the requested one
            file.seek(SeekFrom::Start(4))?;
            index.bucket_capacity = read_i32(&mut file)? as usize;
        }
        Ok(index)
    }

    fn bucket_page_size(&self) -> u64 {
        12 + self.bucket_capacity as u64 * (self.codec.width() + 4) as u64
    }

    fn hash(&self, key: &[u8]) -> u32 {
        murmur_hash(key, HASH_SEED)
    }

    fn read_directory(&self) -> Result<(u32, Vec<i32>)> {
        let mut file = File::open(&self.dir_path)?;
        let depth = read_i32(&mut file)? as u32;
        let _capacity = read_i32(&mut file)?;
        let mut slots = Vec::with_capacity(1 << depth);
        for _ in 0..1u64 << depth {
            slots.push(read_i32(&mut file)?);
        }
        Ok((depth, slots))
    }

    fn write_directory(&self, depth: u32, slots: &[i32]) -> Result<()> {
        let mut file = File::create(&self.dir_path)?;
        write_i32(&mut file, depth as i32)?;
        write_i32(&mut file, self.bucket_capacity as i32)?;
        for id in slots {
            write_i32(&mut file, *id)?;
        }
        Ok(())
    }

    fn bucket_count(&self) -> Result<i32> {
        let len = std::fs::metadata(&self.bkt_path)?.len();
        Ok((len / self.bucket_page_size()) as i32)
    }

    fn read_bucket(&self, id: i32) -> Result<Bucket> {
        let mut file = File::open(&self.bkt_path)?;
        file.seek(SeekFrom::Start(id as u64 * self.bucket_page_size()))?;
        let local_depth = read_i32(&mut file)?;
        let size = read_i32(&mut file)? as usize;
        let next = read_i32(&mut file)?;
        let mut entries = Vec::with_capacity(size);
        for i in 0..self.bucket_capacity {
            let mut key = vec![0u8; self.codec.width()];
            file.read_exact(&mut key)?;
            let pos = read_i32(&mut file)?;
            if i < size {
                entries.push((key, pos));
            }
        }
        Ok(Bucket {
            local_depth,
            next,
            entries,
        })
    }

    fn write_bucket(&self, id: i32, bucket: &Bucket) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.bkt_path)?;
        self.write_bucket_to(&mut file, id, bucket)
    }

    fn write_bucket_to(&self, file: &mut File, id: i32, bucket: &Bucket) -> Result<()> {
        debug_assert!(bucket.entries.len() <= self.bucket_capacity);
        file.seek(SeekFrom::Start(id as u64 * self.bucket_page_size()))?;
        write_i32(file, bucket.local_depth)?;
        write_i32(file, bucket.entries.len() as i32)?;
        write_i32(file, bucket.next)?;
        for (key, pos) in &bucket.entries {
            file.write_all(key)?;
            write_i32(file, *pos)?;
        }
        let empty = vec![0u8; self.codec.width() + 4];
        for _ in bucket.entries.len()..self.bucket_capacity {
            file.write_all(&empty)?;
        }
        Ok(())
    }

    /// Splits bucket `id` on its next discriminating bit, fixing up every
    /// directory slot that now points at the new sibling.
    fn split_bucket(&self, id: i32, mut bucket: Bucket, depth: u32, dir: &mut [i32]) -> Result<()> {
        debug_assert!(bucket.next == -1, "chained buckets never split");
        let bit = bucket.local_depth as u32;
        bucket.local_depth += 1;
        let mut sibling = Bucket::empty(bucket.local_depth);
        let (stay, moved): (Vec<_>, Vec<_>) = bucket
            .entries
            .drain(..)
            .partition(|(key, _)| (self.hash(key) >> bit) & 1 == 0);
        bucket.entries = stay;
        sibling.entries = moved;

        let sibling_id = self.bucket_count()?;
        debug!(
            "exthash {:?}: split bucket {} -> {} at bit {}",
            self.dir_path, id, sibling_id, bit
        );
        self.write_bucket(id, &bucket)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.bkt_path)?;
        self.write_bucket_to(&mut file, sibling_id, &sibling)?;

        for (slot, bucket_id) in dir.iter_mut().enumerate() {
            if *bucket_id == id && (slot >> bit) & 1 == 1 {
                *bucket_id = sibling_id;
            }
        }
        self.write_directory(depth, dir)?;
        Ok(())
    }

    fn double_directory(&self, depth: u32, dir: &[i32]) -> Result<()> {
        let new_depth = depth + 1;
        info!(
            "exthash {:?}: doubling directory to depth {}",
            self.dir_path, new_depth
        );
        let mask = (1usize << depth) - 1;
        let slots: Vec<i32> = (0..1usize << new_depth).map(|i| dir[i & mask]).collect();
        self.write_directory(new_depth, &slots)
    }

    fn slot_of(&self, hash: u32, depth: u32) -> usize {
        (hash & ((1u32 << depth) - 1)) as usize
    }
}

impl ColumnIndex for ExtHashIndex {
    fn kind(&self) -> IndexType {
        IndexType::Hash
    }

    fn insert(&mut self, pos: u32, key: &Value) -> Result<()> {
        let key = self.codec.encode(key)?;
        let hash = self.hash(&key);
        loop {
            let (depth, mut dir) = self.read_directory()?;
            let id = dir[self.slot_of(hash, depth)];
            let bucket = self.read_bucket(id)?;
            if bucket.entries.len() < self.bucket_capacity {
                let mut bucket = bucket;
                bucket.entries.push((key, pos as i32));
                return self.write_bucket(id, &bucket);
            }
            if (bucket.local_depth as u32) < depth {
                self.split_bucket(id, bucket, depth, &mut dir)?;
                continue;
            }
            if depth < MAX_GLOBAL_DEPTH {
                self.double_directory(depth, &dir)?;
                continue;
            }

            // depth capped: chase the overflow chain
            let mut chain_id = id;
            let mut chain = bucket;
            loop {
                if chain.entries.len() < self.bucket_capacity {
                    chain.entries.push((key, pos as i32));
                    return self.write_bucket(chain_id, &chain);
                }
                if chain.next == -1 {
                    let new_id = self.bucket_count()?;
                    let mut overflow = Bucket::empty(chain.local_depth);
                    overflow.entries.push((key, pos as i32));
                    chain.next = new_id;
                    self.write_bucket(chain_id, &chain)?;
                    let mut file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(&self.bkt_path)?;
                    return self.write_bucket_to(&mut file, new_id, &overflow);
                }
                chain_id = chain.next;
                chain = self.read_bucket(chain_id)?;
            }
        }
    }

    fn delete(&mut self, key: &Value) -> Result<bool> {
        let key = self.codec.encode(key)?;
        let (depth, dir) = self.read_directory()?;
        let mut id = dir[self.slot_of(self.hash(&key), depth)];
        loop {
            let mut bucket = self.read_bucket(id)?;
            if let Some(slot) = bucket.entries.iter().position(|(k, _)| *k == key) {
                bucket.entries.swap_remove(slot);
                self.write_bucket(id, &bucket)?;
                return Ok(true);
            }
            if bucket.next == -1 {
                return Ok(false);
            }
            id = bucket.next;
        }
    }

    fn search(&self, key: &Value) -> Result<Vec<u32>> {
        let key = self.codec.encode(key)?;
        let (depth, dir) = self.read_directory()?;
        let mut id = dir[self.slot_of(self.hash(&key), depth)];
        let mut out = Vec::new();
        loop {
            let bucket = self.read_bucket(id)?;
            for (k, pos) in &bucket.entries {
                if *k == key {
                    out.push(*pos as u32);
                }
            }
            if bucket.next == -1 {
                return Ok(out);
            }
            id = bucket.next;
        }
    }

    fn range_search(&self, _lo: Option<&Value>, _hi: Option<&Value>) -> Result<Vec<u32>> {
        Err(RelLiteError::UnsupportedOperation {
            index: "hash",
            op: "range search",
        })
    }

    fn get_all(&self) -> Result<Vec<u32>> {
        let count = self.bucket_count()?;
        let mut out = Vec::new();
        for id in 0..count {
            let bucket = self.read_bucket(id)?;
            for (_, pos) in &bucket.entries {
                out.push(*pos as u32);
            }
        }
        Ok(out)
    }

    fn clear(&mut self) -> Result<()> {
        for path in [&self.dir_path, &self.bkt_path] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
