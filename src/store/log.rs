//! Append-only log backing one record class.
//!
//! Each class ("events", "profile_updates") is a single framed binary
//! file plus an in-memory index rebuilt by scanning at open. Deletions
//! rewrite the file from the retained rows; queues stay small because
//! every successful flush drains them, so the rewrite is bounded.

use crate::error::{QueueError, Result};
use crate::types::{QueuedRecord, ReadBatch, RecordClass, RecordId, Timestamp};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes prefixing every row.
const ROW_MAGIC: &[u8; 4] = b"QRC\0";

/// Current row format version.
const ROW_VERSION: u8 = 1;

/// Flag bit: record was produced automatically.
const FLAG_AUTOMATIC: u8 = 0b0000_0001;

/// Fixed part of a row: magic + version + flags + id + created_at.
const ROW_HEADER_SIZE: u64 = 4 + 1 + 1 + 8 + 8;

/// Index entry for one row. Owners are short tokens, so keeping them
/// in memory costs little and makes per-owner reads index-only.
#[derive(Clone, Debug)]
pub(crate) struct IndexEntry {
    pub id: RecordId,
    pub offset: u64,
    pub frame_len: u64,
    pub created_at: Timestamp,
    pub owner: String,
    pub is_automatic: bool,
}

/// Append-only log for one record class.
pub struct ClassLog {
    class: RecordClass,
    path: PathBuf,
    file: File,
    /// Rows in id order (append order).
    entries: Vec<IndexEntry>,
    /// Next record id to assign.
    next_id: u64,
    /// Logical end of the file (end of the last intact row).
    file_size: u64,
}

impl ClassLog {
    /// Open or create the log for a class, rebuilding the index by
    /// scanning the file. Rows with bad checksums are left out of the
    /// index; a torn tail is truncated away.
    pub fn open(dir: impl AsRef<Path>, class: RecordClass) -> Result<Self> {
        let path = dir.as_ref().join(format!("{}.log", class.table_name()));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let actual_size = file.metadata()?.len();
        let (entries, scanned_end) = Self::scan(&mut file, actual_size)?;

        if scanned_end < actual_size {
            warn!(
                class = %class,
                lost = actual_size - scanned_end,
                "truncating torn tail of record log"
            );
            file.set_len(scanned_end)?;
        }

        let next_id = entries.iter().map(|e| e.id.0).max().unwrap_or(0) + 1;

        Ok(Self {
            class,
            path,
            file,
            entries,
            next_id,
            file_size: scanned_end,
        })
    }

    /// Append a record. Returns the assigned id and the owner's
    /// resulting row count.
    pub fn append(
        &mut self,
        payload: &[u8],
        owner: &str,
        is_automatic: bool,
        created_at: Timestamp,
    ) -> Result<(RecordId, u64)> {
        let id = RecordId(self.next_id);

        let mut frame = Vec::with_capacity(ROW_HEADER_SIZE as usize + owner.len() + payload.len() + 10);
        frame.extend_from_slice(ROW_MAGIC);
        frame.push(ROW_VERSION);
        frame.push(if is_automatic { FLAG_AUTOMATIC } else { 0 });
        frame.extend_from_slice(&id.0.to_le_bytes());
        frame.extend_from_slice(&created_at.0.to_le_bytes());
        frame.extend_from_slice(&(owner.len() as u16).to_le_bytes());
        frame.extend_from_slice(owner.as_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());

        let offset = self.file_size;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;

        self.file_size = offset + frame.len() as u64;
        self.next_id += 1;
        self.entries.push(IndexEntry {
            id,
            offset,
            frame_len: frame.len() as u64,
            created_at,
            owner: owner.to_string(),
            is_automatic,
        });

        Ok((id, self.count_for_owner(owner)))
    }

    /// Oldest-first bounded read for one owner.
    ///
    /// Returns `None` when the owner has nothing queued or when every
    /// candidate row failed to deserialize. Corrupt rows are skipped,
    /// never fatal; they leave the store via a later cutoff or the
    /// expiry sweep.
    pub fn read_batch(
        &mut self,
        owner: &str,
        limit: u64,
        include_automatic: bool,
    ) -> Result<Option<ReadBatch>> {
        let matching: Vec<IndexEntry> = self
            .entries
            .iter()
            .filter(|e| e.owner == owner && (include_automatic || !e.is_automatic))
            .cloned()
            .collect();

        if matching.is_empty() {
            return Ok(None);
        }

        let owner_total = matching.len() as u64;
        let mut records = Vec::new();

        for entry in &matching {
            if records.len() as u64 >= limit {
                break;
            }
            match self.read_row(entry) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(class = %self.class, id = %entry.id, error = %e,
                          "skipping malformed stored record");
                }
            }
        }

        match records.last() {
            Some(last) => {
                let cutoff = last.id;
                Ok(Some(ReadBatch {
                    records,
                    owner_total,
                    cutoff,
                }))
            }
            None => Ok(None),
        }
    }

    /// Delete same-owner rows with id ≤ cutoff, optionally sparing
    /// automatic ones. Idempotent: a repeat call with the same cutoff
    /// removes nothing further.
    pub fn delete_up_to(
        &mut self,
        cutoff: RecordId,
        owner: &str,
        include_automatic: bool,
    ) -> Result<u64> {
        self.rewrite_retaining(|e| {
            !(e.owner == owner && e.id <= cutoff && (include_automatic || !e.is_automatic))
        })
    }

    /// Owner-independent expiry sweep: delete rows created at or before
    /// the given time.
    pub fn delete_older_than(&mut self, timestamp: Timestamp) -> Result<u64> {
        self.rewrite_retaining(|e| e.created_at > timestamp)
    }

    /// Delete every row belonging to an owner.
    pub fn delete_all_for_owner(&mut self, owner: &str) -> Result<u64> {
        self.rewrite_retaining(|e| e.owner != owner)
    }

    /// Delete an owner's automatically-produced rows.
    pub fn delete_automatic_for_owner(&mut self, owner: &str) -> Result<u64> {
        self.rewrite_retaining(|e| !(e.owner == owner && e.is_automatic))
    }

    /// Number of rows queued for an owner.
    pub fn count_for_owner(&self, owner: &str) -> u64 {
        self.entries.iter().filter(|e| e.owner == owner).count() as u64
    }

    /// Distinct owners with queued rows, in first-seen order.
    pub fn owners(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for entry in &self.entries {
            if !seen.iter().any(|o| o == &entry.owner) {
                seen.push(entry.owner.clone());
            }
        }
        seen
    }

    /// Total row count.
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes occupied on disk.
    pub fn size_bytes(&self) -> u64 {
        self.file_size
    }

    /// Read and verify one row.
    fn read_row(&mut self, entry: &IndexEntry) -> Result<QueuedRecord> {
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let mut frame = vec![0u8; entry.frame_len as usize];
        self.file.read_exact(&mut frame)?;
        let (parsed, _) = parse_frame(&frame)?;
        Ok(QueuedRecord {
            id: parsed.id,
            class: self.class,
            created_at: parsed.created_at,
            is_automatic: parsed.is_automatic,
            owner: parsed.owner,
            payload: parsed.payload,
        })
    }

    /// Rewrite the file keeping only rows the predicate accepts.
    /// Returns the number of rows removed. Any I/O fault here leaves
    /// the log unusable; the owning store responds by wiping.
    fn rewrite_retaining(&mut self, keep: impl Fn(&IndexEntry) -> bool) -> Result<u64> {
        let removed = self.entries.iter().filter(|e| !keep(e)).count() as u64;
        if removed == 0 {
            return Ok(0);
        }

        let retained: Vec<IndexEntry> = self.entries.iter().filter(|e| keep(e)).cloned().collect();

        // Copy retained frames verbatim into a replacement file, then
        // swap it in. Ids survive the rewrite; only offsets change.
        let tmp_path = self.path.with_extension("log.compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut new_entries = Vec::with_capacity(retained.len());
        let mut new_offset = 0u64;
        for entry in &retained {
            self.file.seek(SeekFrom::Start(entry.offset))?;
            let mut frame = vec![0u8; entry.frame_len as usize];
            self.file.read_exact(&mut frame)?;
            tmp.write_all(&frame)?;

            let mut moved = entry.clone();
            moved.offset = new_offset;
            new_offset += entry.frame_len;
            new_entries.push(moved);
        }
        tmp.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;
        self.file = tmp;
        self.entries = new_entries;
        self.file_size = new_offset;

        Ok(removed)
    }

    /// Scan the file from the start, indexing intact rows. Returns the
    /// entries and the offset of the first broken frame (the logical
    /// end). Rows with bad checksums are skipped but scanning continues
    /// past them, since their frame is intact.
    fn scan(file: &mut File, size: u64) -> Result<(Vec<IndexEntry>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(size as usize);
        file.read_to_end(&mut buf)?;

        let mut entries = Vec::new();
        let mut offset = 0u64;

        while (offset as usize) < buf.len() {
            match parse_frame(&buf[offset as usize..]) {
                Ok((parsed, frame_len)) => {
                    entries.push(IndexEntry {
                        id: parsed.id,
                        offset,
                        frame_len,
                        created_at: parsed.created_at,
                        owner: parsed.owner,
                        is_automatic: parsed.is_automatic,
                    });
                    offset += frame_len;
                }
                Err(e @ (QueueError::ChecksumMismatch { .. } | QueueError::Deserialization(_))) => {
                    // Frame intact, contents rotten: step over it.
                    match frame_len(&buf[offset as usize..]) {
                        Some(len) => {
                            warn!(offset, error = %e, "skipping unreadable row");
                            offset += len;
                        }
                        None => break,
                    }
                }
                Err(_) => break,
            }
        }

        Ok((entries, offset))
    }
}

/// A row parsed out of a frame.
struct ParsedRow {
    id: RecordId,
    created_at: Timestamp,
    is_automatic: bool,
    owner: String,
    payload: Vec<u8>,
}

/// Length of the frame starting at `buf`, if its envelope is intact.
fn frame_len(buf: &[u8]) -> Option<u64> {
    let header = ROW_HEADER_SIZE as usize;
    if buf.len() < header + 2 {
        return None;
    }
    let owner_len = u16::from_le_bytes([buf[header], buf[header + 1]]) as usize;
    let payload_len_at = header + 2 + owner_len;
    if buf.len() < payload_len_at + 4 {
        return None;
    }
    let payload_len = u32::from_le_bytes([
        buf[payload_len_at],
        buf[payload_len_at + 1],
        buf[payload_len_at + 2],
        buf[payload_len_at + 3],
    ]) as usize;
    let total = payload_len_at + 4 + payload_len + 4;
    if buf.len() < total {
        return None;
    }
    Some(total as u64)
}

/// Parse one frame from the start of `buf`. Returns the row and the
/// frame length.
fn parse_frame(buf: &[u8]) -> Result<(ParsedRow, u64)> {
    if buf.len() < ROW_HEADER_SIZE as usize {
        return Err(QueueError::InvalidFormat("truncated row header".into()));
    }
    if &buf[0..4] != ROW_MAGIC {
        return Err(QueueError::InvalidFormat("bad row magic".into()));
    }
    if buf[4] != ROW_VERSION {
        return Err(QueueError::InvalidFormat(format!(
            "unsupported row version: {}",
            buf[4]
        )));
    }
    let flags = buf[5];
    let id = RecordId(u64::from_le_bytes(buf[6..14].try_into().unwrap()));
    let created_at = Timestamp(i64::from_le_bytes(buf[14..22].try_into().unwrap()));

    let total = frame_len(buf)
        .ok_or_else(|| QueueError::InvalidFormat("truncated row body".into()))?
        as usize;

    let header = ROW_HEADER_SIZE as usize;
    let owner_len = u16::from_le_bytes([buf[header], buf[header + 1]]) as usize;
    let owner_start = header + 2;
    let owner = std::str::from_utf8(&buf[owner_start..owner_start + owner_len])
        .map_err(|_| QueueError::Deserialization("owner token is not UTF-8".into()))?
        .to_string();

    let payload_start = owner_start + owner_len + 4;
    let payload = buf[payload_start..total - 4].to_vec();

    let stored_crc = u32::from_le_bytes(buf[total - 4..total].try_into().unwrap());
    let computed_crc = crc32fast::hash(&payload);
    if stored_crc != computed_crc {
        return Err(QueueError::ChecksumMismatch {
            expected: stored_crc,
            got: computed_crc,
        });
    }

    Ok((
        ParsedRow {
            id,
            created_at,
            is_automatic: flags & FLAG_AUTOMATIC != 0,
            owner,
            payload,
        },
        total as u64,
    ))
}
