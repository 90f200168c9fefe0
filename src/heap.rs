use crate::error::RelLiteError;
use crate::ioutils::{read_i32, read_i32_at, write_i32_at, BufReaderWithPos};
use crate::schema::value::{decode_record, encode_record};
use crate::schema::{TableSchema, Value};
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// One `i32` at offset 0: head of the free list, -1 when no slot is free.
const HEADER_SIZE: u64 = 4;

/// Fixed-slot record file. Each slot is the packed record followed by a
/// `next_deleted: i32` trailer; -1 marks a live record, anything else chains
/// the slot into the LIFO free list rooted at the file header.
pub struct RecordFile {
    path: PathBuf,
    schema: TableSchema,
    record_size: usize,
}

impl RecordFile {
    pub fn open(path: impl Into<PathBuf>, schema: TableSchema) -> Result<RecordFile> {
        let path = path.into();
        let record_size = schema.record_size();
        let rf = RecordFile {
            path,
            schema,
            record_size,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&rf.path)?;
        if file.seek(SeekFrom::End(0))? == 0 {
            debug!("initializing heap file {:?}", rf.path);
            write_i32_at(&mut file, 0, -1)?;
        }
        Ok(rf)
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn slot_size(&self) -> u64 {
        (self.record_size + 4) as u64
    }

    fn open_rw(&self) -> Result<File> {
        Ok(OpenOptions::new().read(true).write(true).open(&self.path)?)
    }

    /// Count of slots ever written, live or deleted.
    pub fn max_position(&self) -> Result<u32> {
        let len = std::fs::metadata(&self.path)?.len();
        Ok(((len - HEADER_SIZE) / self.slot_size()) as u32)
    }

    /// Appends a record, reusing the most recently freed slot when one
    /// exists. Returns the record's stable position.
    pub fn append(&self, values: &[Value]) -> Result<u32> {
        let bytes = encode_record(&self.schema, values)?;
        let mut file = self.open_rw()?;
        let head = read_i32_at(&mut file, 0)?;
        let pos = if head == -1 {
            let end = file.seek(SeekFrom::End(0))?;
            let pos = ((end - HEADER_SIZE) / self.slot_size()) as u32;
            file.write_all(&bytes)?;
            file.write_all(&(-1i32).to_le_bytes())?;
            pos
        } else {
            let pos = head as u32;
            let offset = HEADER_SIZE + u64::from(pos) * self.slot_size();
            file.seek(SeekFrom::Start(offset + self.record_size as u64))?;
            let next = read_i32(&mut file)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&bytes)?;
            file.write_all(&(-1i32).to_le_bytes())?;
            write_i32_at(&mut file, 0, next)?;
            pos
        };
        debug!("heap {:?}: wrote record at position {}", self.path, pos);
        Ok(pos)
    }

    /// Reads the record at `pos`. `Ok(None)` when the slot is on the free
    /// list; `PositionOutOfRange` when the slot was never written.
    pub fn read(&self, pos: u32) -> Result<Option<Vec<Value>>> {
        if pos >= self.max_position()? {
            return Err(RelLiteError::PositionOutOfRange(pos));
        }
        let mut file = File::open(&self.path)?;
        let offset = HEADER_SIZE + u64::from(pos) * self.slot_size();
        file.seek(SeekFrom::Start(offset))?;
        let mut slot = vec![0u8; self.slot_size() as usize];
        file.read_exact(&mut slot)?;
        let next_deleted = i32::from_le_bytes([
            slot[self.record_size],
            slot[self.record_size + 1],
            slot[self.record_size + 2],
            slot[self.record_size + 3],
        ]);
        if next_deleted != -1 {
            return Ok(None);
        }
        Ok(Some(decode_record(&self.schema, &slot[..self.record_size])?))
    }

    /// Unlinks the record at `pos`, pushing its slot onto the free list.
    /// Returns the removed record so the caller can update the indexes.
    pub fn delete(&self, pos: u32) -> Result<Vec<Value>> {
        let values = self.read(pos)?.ok_or(RelLiteError::DeletedSlot(pos))?;
        let mut file = self.open_rw()?;
        let head = read_i32_at(&mut file, 0)?;
        let offset = HEADER_SIZE + u64::from(pos) * self.slot_size();
        write_i32_at(&mut file, offset + self.record_size as u64, head)?;
        write_i32_at(&mut file, 0, pos as i32)?;
        debug!("heap {:?}: freed position {}", self.path, pos);
        Ok(values)
    }

    /// Sequential scan over live records.
    pub fn scan(&self) -> Result<ScanIter> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(ScanIter {
            reader: BufReaderWithPos::new(file)?,
            schema: self.schema.clone(),
            slot_size: self.slot_size() as usize,
            record_size: self.record_size,
            pos: 0,
        })
    }
}

pub struct ScanIter {
    reader: BufReaderWithPos<File>,
    schema: TableSchema,
    slot_size: usize,
    record_size: usize,
    pos: u32,
}

impl Iterator for ScanIter {
    type Item = Result<(u32, Vec<Value>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut slot = vec![0u8; self.slot_size];
            match self.reader.read_exact(&mut slot) {
                Ok(()) => {}
                Err(_) => return None,
            }
            let pos = self.pos;
            self.pos += 1;
            let next_deleted = i32::from_le_bytes([
                slot[self.record_size],
                slot[self.record_size + 1],
                slot[self.record_size + 2],
                slot[self.record_size + 3],
            ]);
            if next_deleted != -1 {
                continue;
            }
            return Some(decode_record(&self.schema, &slot[..self.record_size]).map(|r| (pos, r)));
        }
    }
}
