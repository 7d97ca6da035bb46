//! Capture file format for market-data record and replay.
//!
//! A capture file is a fixed 16-byte header followed by a stream of frames:
//!
//! ```text
//! header:  magic "RMD" | major:u8 | minor:u8 | reserved[11]
//! frame:   len:u32 | type:u16 | shard:u8 | _:u8 | seq_no:u64 | body[len]
//! ```
//!
//! All integers are little-endian. The writer appends through a buffered
//! file; the replay reader maps the file and iterates zero-copy. A running
//! crc32 digest over the bodies is maintained on both sides so an archiver
//! can record end-to-end integrity out of band (the wire format itself
//! carries no checksum field).

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::pqueue::Item;
use crate::seq::SeqNo;

pub const CAPTURE_MAGIC: [u8; 3] = *b"RMD";
pub const CAPTURE_MAJOR: u8 = 1;
pub const CAPTURE_MINOR: u8 = 0;

pub const HEADER_LEN: usize = 16;
pub const FRAME_HDR_LEN: usize = 16;

const LEN_OFFSET: usize = 0;
const TYPE_OFFSET: usize = 4;
const SHARD_OFFSET: usize = 6;
const SEQ_OFFSET: usize = 8;

fn file_header() -> [u8; HEADER_LEN] {
    let mut hdr = [0u8; HEADER_LEN];
    hdr[..3].copy_from_slice(&CAPTURE_MAGIC);
    hdr[3] = CAPTURE_MAJOR;
    hdr[4] = CAPTURE_MINOR;
    hdr
}

fn validate_header(hdr: &[u8; HEADER_LEN]) -> Result<()> {
    if hdr[..3] != CAPTURE_MAGIC {
        return Err(Error::Corrupt("capture header magic mismatch"));
    }
    if hdr[3] != CAPTURE_MAJOR {
        return Err(Error::UnsupportedVersion(hdr[3] as u32));
    }
    Ok(())
}

/// Append-side of a capture file.
pub struct CaptureWriter {
    out: BufWriter<File>,
    digest: crc32fast::Hasher,
    frames: u64,
}

impl CaptureWriter {
    /// Creates a new capture file, truncating any existing one.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&file_header())?;
        Ok(Self {
            out,
            digest: crc32fast::Hasher::new(),
            frames: 0,
        })
    }

    /// Opens an existing capture file for appending, validating its header.
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut hdr = [0u8; HEADER_LEN];
        file.read_exact(&mut hdr)
            .map_err(|_| Error::Corrupt("capture file shorter than header"))?;
        validate_header(&hdr)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            out: BufWriter::new(file),
            digest: crc32fast::Hasher::new(),
            frames: 0,
        })
    }

    pub fn write(
        &mut self,
        type_id: u16,
        shard_id: u8,
        seq_no: SeqNo,
        body: &[u8],
    ) -> Result<()> {
        let len = u32::try_from(body.len()).map_err(|_| Error::PayloadTooLarge)?;
        let mut hdr = [0u8; FRAME_HDR_LEN];
        hdr[LEN_OFFSET..LEN_OFFSET + 4].copy_from_slice(&len.to_le_bytes());
        hdr[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&type_id.to_le_bytes());
        hdr[SHARD_OFFSET] = shard_id;
        hdr[SEQ_OFFSET..SEQ_OFFSET + 8].copy_from_slice(&seq_no.to_le_bytes());
        self.out.write_all(&hdr)?;
        self.out.write_all(body)?;
        self.digest.update(body);
        self.frames += 1;
        Ok(())
    }

    /// Records a queued item: its payload under its sequence number.
    pub fn write_item(&mut self, type_id: u16, shard_id: u8, item: &Item) -> Result<()> {
        self.write(type_id, shard_id, item.key(), item.buf.data())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs.
    pub fn sync(&mut self) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Running crc32 over all bodies written by this handle.
    pub fn digest(&self) -> u32 {
        self.digest.clone().finalize()
    }
}

/// One decoded frame, borrowing the mapped file.
#[derive(Debug, PartialEq, Eq)]
pub struct CaptureFrame<'a> {
    pub type_id: u16,
    pub shard_id: u8,
    pub seq_no: SeqNo,
    pub body: &'a [u8],
}

/// Replay-side of a capture file: maps the file and iterates frames.
pub struct CaptureReader {
    map: Mmap,
    pos: usize,
    digest: crc32fast::Hasher,
}

impl CaptureReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only; truncating a capture file while
        // it is being replayed is operator misuse.
        let map = unsafe { Mmap::map(&file)? };
        if map.len() < HEADER_LEN {
            return Err(Error::Corrupt("capture file shorter than header"));
        }
        let mut hdr = [0u8; HEADER_LEN];
        hdr.copy_from_slice(&map[..HEADER_LEN]);
        validate_header(&hdr)?;
        Ok(Self {
            map,
            pos: HEADER_LEN,
            digest: crc32fast::Hasher::new(),
        })
    }

    /// Returns the next frame, or `None` at end of file.
    pub fn next(&mut self) -> Result<Option<CaptureFrame<'_>>> {
        if self.pos == self.map.len() {
            return Ok(None);
        }
        if self.pos + FRAME_HDR_LEN > self.map.len() {
            return Err(Error::Corrupt("truncated capture frame header"));
        }
        let hdr = &self.map[self.pos..self.pos + FRAME_HDR_LEN];
        let len = u32::from_le_bytes(hdr[LEN_OFFSET..LEN_OFFSET + 4].try_into().expect("4 bytes"))
            as usize;
        let type_id =
            u16::from_le_bytes(hdr[TYPE_OFFSET..TYPE_OFFSET + 2].try_into().expect("2 bytes"));
        let shard_id = hdr[SHARD_OFFSET];
        let seq_no =
            u64::from_le_bytes(hdr[SEQ_OFFSET..SEQ_OFFSET + 8].try_into().expect("8 bytes"));
        let body_start = self.pos + FRAME_HDR_LEN;
        let body_end = body_start
            .checked_add(len)
            .ok_or(Error::Corrupt("capture frame length overflow"))?;
        if body_end > self.map.len() {
            return Err(Error::Corrupt("truncated capture frame body"));
        }
        let body = &self.map[body_start..body_end];
        self.digest.update(body);
        self.pos = body_end;
        Ok(Some(CaptureFrame {
            type_id,
            shard_id,
            seq_no,
            body,
        }))
    }

    /// Scans forward until a frame with `seq_no >= target` is next. Returns
    /// `false` (positioned at EOF) when no such frame exists. Used by the
    /// replayer to resume mid-file.
    pub fn seek_seq(&mut self, target: SeqNo) -> Result<bool> {
        loop {
            let mark = self.pos;
            let seq_no = match self.next()? {
                None => return Ok(false),
                Some(frame) => frame.seq_no,
            };
            if seq_no >= target {
                self.pos = mark;
                return Ok(true);
            }
        }
    }

    pub fn rewind(&mut self) {
        self.pos = HEADER_LEN;
        self.digest = crc32fast::Hasher::new();
    }

    /// Running crc32 over all bodies read so far; comparable with the
    /// writer's digest after a full pass.
    pub fn digest(&self) -> u32 {
        self.digest.clone().finalize()
    }
}
