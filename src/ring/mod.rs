//! Shared-memory byte ring with futex blocking and reader liveness.
//!
//! The ring carries length-framed messages between threads or processes.
//! Writers reserve a frame, fill it, then commit by publishing the tail;
//! each attached reader consumes with an independent head cursor and the
//! writer only reclaims space every reader has passed. Blocking follows a
//! spin-then-futex protocol with signal suppression on both notify words.
//!
//! Storage is private or named POSIX shared memory (`<name>` for data,
//! `<name>.ctrl` for control). When mirror mapping is available a frame is
//! always virtually contiguous; otherwise an explicit wrap record (size
//! sentinel `0xFFFF_FFFF`) skips the reader to the start of the ring.

pub mod control;
pub mod liveness;
pub mod mem;
mod ringfn;
pub mod wait;

pub use ringfn::RingFn;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;

use crate::error::{Error, Result};
use control::{
    ControlMem, RingControl, MAX_READERS, OPEN_EOF, PARAM_MIRRORED, PARAM_MULTI_READER,
    PARAM_MULTI_WRITER, SLOT_ATTACHED,
};
use mem::RingMem;
use wait::{futex_wait, mark_waiting, wake_waiters};

/// Wrap record: a frame header of this value sends the reader back to the
/// start of the ring (only used when mirror mapping is off).
pub const WRAP_SENTINEL: u32 = 0xFFFF_FFFF;

/// Frame header: `[size:u32][reserved:u32]`. Eight bytes keep every payload
/// 8-aligned, which serialized callables rely on.
pub(crate) const FRAME_HDR: usize = 8;
const FRAME_ALIGN: usize = 8;

/// Writer/reader multiplicity of a ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    /// Single writer, single reader.
    Spsc,
    /// Multi writer, single reader.
    Mpsc,
    /// Single writer, multi reader (broadcast).
    Spmc,
    /// Multi writer, multi reader.
    Mpmc,
}

impl Topology {
    pub fn multi_writer(self) -> bool {
        matches!(self, Topology::Mpsc | Topology::Mpmc)
    }

    pub fn multi_reader(self) -> bool {
        matches!(self, Topology::Spmc | Topology::Mpmc)
    }
}

/// What the writer does about a dead reader blocking the ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reclaim {
    /// Silently reclaim slots whose process is gone (source behavior).
    #[default]
    Lenient,
    /// Leave the slot; the stalled push returns `NotReady` and the operator
    /// decides (e.g. via `ring::liveness::kill`).
    Strict,
}

/// How a blocked side burns cycles before parking in the kernel.
#[derive(Clone, Copy, Debug)]
pub enum WaitStrategy {
    /// True busy-spinning. Burns 100% of a core for minimum wake latency.
    BusySpin,
    /// Spin for a bounded number of iterations, then futex-park.
    SpinThenPark { spin: u32 },
    /// Periodic polling; highest latency, no futex traffic.
    Sleep(Duration),
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::SpinThenPark { spin: 1024 }
    }
}

#[derive(Clone, Debug)]
pub struct RingConfig {
    /// Shared-memory name; `None` keeps the ring process-private.
    pub name: Option<String>,
    /// Data region size in bytes; rounded up to a page-aligned power of two.
    pub size: usize,
    pub topology: Topology,
    /// Mirror-map the data region. Without it, wrap records are used.
    pub mirror: bool,
    pub reclaim: Reclaim,
    pub wait: WaitStrategy,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            name: None,
            size: 64 * 1024,
            topology: Topology::Spsc,
            mirror: true,
            reclaim: Reclaim::default(),
            wait: WaitStrategy::default(),
        }
    }
}

/// Point-in-time control-word snapshot, for telemetry and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingStats {
    pub head: u64,
    pub tail: u64,
    pub size: u64,
    pub readers: u32,
    pub writers: u32,
}

struct Shared {
    ctrl: ControlMem,
    data: RingMem,
    config: RingConfig,
}

impl Shared {
    fn block(&self) -> &RingControl {
        self.ctrl.block()
    }

    fn size(&self) -> u64 {
        self.data.size() as u64
    }

    /// Min head over attached readers, or the tail when none are attached
    /// (an unobserved broadcast never blocks its writer). Refreshes the
    /// cached `head` control word.
    fn consumed_head(&self) -> u64 {
        let block = self.block();
        let mask = block.reader_mask.load(Ordering::Acquire);
        if mask == 0 {
            let tail = block.tail.load(Ordering::Acquire);
            block.head.store(tail, Ordering::Release);
            return tail;
        }
        let mut min = u64::MAX;
        for index in 0..MAX_READERS {
            if mask & (1u64 << index) == 0 {
                continue;
            }
            min = min.min(block.slots[index].head.load(Ordering::Acquire));
        }
        block.head.store(min, Ordering::Release);
        min
    }

    fn writer_alive(&self) -> bool {
        let block = self.block();
        if block.writer_count.load(Ordering::Acquire) == 0 {
            return false;
        }
        let pid = block.writer_pid.load(Ordering::Acquire);
        let start = block.writer_start.load(Ordering::Acquire);
        liveness::process_alive(pid, start)
    }
}

/// A ring handle. Cheap to clone; writers and readers are created from it.
#[derive(Clone)]
pub struct Ring {
    shared: Arc<Shared>,
}

impl Ring {
    /// Creates or attaches the ring described by `config`. Idempotent for
    /// shared rings: the first opener initializes, later openers validate
    /// size and topology against the existing control block.
    pub fn open(config: RingConfig) -> Result<Self> {
        let (ctrl, data) = match &config.name {
            Some(name) => (
                ControlMem::shared(name)?,
                RingMem::shared(name, config.size, config.mirror)?,
            ),
            None => (
                ControlMem::private()?,
                RingMem::private(config.size, config.mirror)?,
            ),
        };
        let mut params = 0;
        if config.topology.multi_writer() {
            params |= PARAM_MULTI_WRITER;
        }
        if config.topology.multi_reader() {
            params |= PARAM_MULTI_READER;
        }
        if data.mirrored() {
            params |= PARAM_MIRRORED;
        }
        ctrl.init(params, data.size() as u64)?;
        Ok(Self {
            shared: Arc::new(Shared { ctrl, data, config }),
        })
    }

    /// Removes a named ring's shared-memory objects. Existing mappings stay
    /// valid until their handles drop.
    pub fn unlink(name: &str) -> Result<()> {
        RingMem::unlink(name)?;
        ControlMem::unlink(name)
    }

    /// Creates a writer endpoint. On a single-writer ring only one writer
    /// may exist across all processes.
    pub fn writer(&self) -> Result<RingWriter> {
        let block = self.shared.block();
        if self.shared.config.topology.multi_writer() {
            block.writer_count.fetch_add(1, Ordering::AcqRel);
        } else if block
            .writer_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::WriterAlreadyActive);
        }
        let pid = std::process::id();
        block.writer_pid.store(pid, Ordering::Relaxed);
        block.writer_start.store(
            liveness::process_start_time(pid).unwrap_or(0),
            Ordering::Release,
        );
        Ok(RingWriter {
            shared: Arc::clone(&self.shared),
            last_raw: None,
        })
    }

    /// Whether a writer endpoint currently exists and its process is alive.
    /// Readers use this to tell a quiet stream from a dead publisher.
    pub fn writer_alive(&self) -> bool {
        self.shared.writer_alive()
    }

    /// Attaches a reader, claiming a slot in the reader table. The reader
    /// starts at the current tail (new data only).
    pub fn attach(&self) -> Result<RingReader> {
        let block = self.shared.block();
        if !self.shared.config.topology.multi_reader()
            && block.reader_mask.load(Ordering::Acquire) != 0
        {
            return Err(Error::Unsupported("single-reader ring already has a reader"));
        }
        let pid = std::process::id();
        let start_time = liveness::process_start_time(pid).unwrap_or(0);
        for (index, slot) in block.slots.iter().enumerate() {
            if slot
                .pid
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            slot.start_time.store(start_time, Ordering::Relaxed);
            slot.head
                .store(block.tail.load(Ordering::Acquire), Ordering::Relaxed);
            slot.flags.store(SLOT_ATTACHED, Ordering::Release);
            block
                .reader_mask
                .fetch_or(1u64 << index, Ordering::AcqRel);
            return Ok(RingReader {
                shared: Arc::clone(&self.shared),
                slot: index,
                head: slot.head.load(Ordering::Relaxed),
                pending: None,
            });
        }
        Err(Error::Unsupported("ring reader table full"))
    }

    /// Toggles end-of-file. Readers draining past the final message observe
    /// `EndOfFile` once their head reaches the tail.
    pub fn eof(&self, on: bool) -> Result<()> {
        let block = self.shared.block();
        if on {
            block.open_flags.fetch_or(OPEN_EOF, Ordering::AcqRel);
        } else {
            block.open_flags.fetch_and(!OPEN_EOF, Ordering::AcqRel);
        }
        wake_waiters(&block.tail_notify)
    }

    /// Returns the ring to its initial state. Only permitted while no
    /// readers are attached.
    pub fn reset(&self) -> Result<()> {
        let block = self.shared.block();
        if block.reader_mask.load(Ordering::Acquire) != 0 {
            return Err(Error::Unsupported("reset with readers attached"));
        }
        block.tail.store(0, Ordering::Relaxed);
        block.reserve.store(0, Ordering::Relaxed);
        block.head.store(0, Ordering::Relaxed);
        block.open_flags.store(0, Ordering::Release);
        Ok(())
    }

    pub fn stats(&self) -> RingStats {
        let block = self.shared.block();
        RingStats {
            head: self.shared.consumed_head(),
            tail: block.tail.load(Ordering::Acquire),
            size: self.shared.size(),
            readers: block.reader_mask.load(Ordering::Acquire).count_ones(),
            writers: block.writer_count.load(Ordering::Acquire),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.data.size()
    }
}

fn align_frame(len: usize) -> usize {
    (FRAME_HDR + len + FRAME_ALIGN - 1) & !(FRAME_ALIGN - 1)
}

/// Writer endpoint. One per producing thread (multi-writer rings coordinate
/// through the shared reservation cursor).
pub struct RingWriter {
    shared: Arc<Shared>,
    /// Most recent raw reservation: (start, end, payload offset).
    last_raw: Option<(u64, u64, usize)>,
}

/// An uncommitted frame: a reserved, writable payload slice. Committing
/// publishes the frame to readers; dropping commits as well, so fill the
/// slice first.
pub struct Reservation<'a> {
    writer: &'a RingWriter,
    start: u64,
    end: u64,
    payload_pos: usize,
    len: usize,
    committed: bool,
}

impl Reservation<'_> {
    pub fn payload(&mut self) -> &mut [u8] {
        // SAFETY: [start, end) is exclusively reserved by this writer.
        unsafe { self.writer.shared.data.slice_mut(self.payload_pos, self.len) }
    }

    /// Publishes the frame (`push2`).
    pub fn commit(mut self) -> Result<()> {
        self.publish()
    }

    fn publish(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;
        let block = self.writer.shared.block();
        if self.writer.shared.config.topology.multi_writer() {
            // The published tail advances strictly in reservation order: wait
            // for predecessors, then commit our range.
            loop {
                match block.tail.compare_exchange(
                    self.start,
                    self.end,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(_) => std::hint::spin_loop(),
                }
            }
        } else {
            block.tail.store(self.end, Ordering::Release);
        }
        wake_waiters(&block.tail_notify)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let _ = self.publish();
    }
}

impl RingWriter {
    /// Reserves a frame for `len` payload bytes without blocking. Returns
    /// `Ok(None)` if the ring is full.
    pub fn try_push(&mut self, len: usize) -> Result<Option<Reservation<'_>>> {
        self.check_len(len)?;
        self.reserve(len)
    }

    /// Reserves a frame for `len` payload bytes, blocking (per the ring's
    /// wait strategy) while the ring is full. `timeout` elapsing yields
    /// `NotReady`.
    pub fn push(&mut self, len: usize, timeout: Option<Duration>) -> Result<Reservation<'_>> {
        self.check_len(len)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.reserve_raw(len)?.is_some() {
                break;
            }
            self.stall(deadline)?;
        }
        let raw = self
            .last_raw
            .take()
            .ok_or(Error::Corrupt("lost ring reservation"))?;
        Ok(Reservation {
            writer: self,
            start: raw.0,
            end: raw.1,
            payload_pos: raw.2,
            len,
            committed: false,
        })
    }

    /// Convenience: copies `payload` into a frame and commits it.
    pub fn push_bytes(&mut self, payload: &[u8], timeout: Option<Duration>) -> Result<()> {
        let mut reservation = self.push(payload.len(), timeout)?;
        reservation.payload().copy_from_slice(payload);
        reservation.commit()
    }

    /// Non-blocking `push_bytes`; `RingFull` if there is no space.
    pub fn try_push_bytes(&mut self, payload: &[u8]) -> Result<()> {
        match self.try_push(payload.len())? {
            Some(mut reservation) => {
                reservation.payload().copy_from_slice(payload);
                reservation.commit()
            }
            None => Err(Error::RingFull),
        }
    }

    fn check_len(&self, len: usize) -> Result<()> {
        // A frame must leave room for a wrap record.
        if align_frame(len) + FRAME_ALIGN > self.shared.data.size() {
            return Err(Error::PayloadTooLarge);
        }
        Ok(())
    }

    fn reserve(&mut self, len: usize) -> Result<Option<Reservation<'_>>> {
        if self.reserve_raw(len)?.is_none() {
            return Ok(None);
        }
        let raw = self
            .last_raw
            .take()
            .ok_or(Error::Corrupt("lost ring reservation"))?;
        Ok(Some(Reservation {
            writer: self,
            start: raw.0,
            end: raw.1,
            payload_pos: raw.2,
            len,
            committed: false,
        }))
    }

    fn stall(&mut self, deadline: Option<Instant>) -> Result<()> {
        if self.shared.config.reclaim == Reclaim::Lenient {
            self.reclaim_dead_readers();
        }
        let block = self.shared.block();
        match self.shared.config.wait {
            WaitStrategy::BusySpin => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(Error::NotReady);
                }
                std::hint::spin_loop();
                Ok(())
            }
            WaitStrategy::Sleep(period) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(Error::NotReady);
                }
                std::thread::sleep(period);
                Ok(())
            }
            WaitStrategy::SpinThenPark { spin } => {
                for _ in 0..spin {
                    if self.space_available() {
                        return Ok(());
                    }
                    std::hint::spin_loop();
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(Error::NotReady);
                }
                let seen = mark_waiting(&block.head_notify);
                if self.space_available() {
                    return Ok(());
                }
                let chunk = remaining(deadline).map(|r| r.min(LIVENESS_PERIOD));
                futex_wait(&block.head_notify, seen, chunk.or(Some(LIVENESS_PERIOD)))
            }
        }
    }

    fn space_available(&self) -> bool {
        let block = self.shared.block();
        let cursor = if self.shared.config.topology.multi_writer() {
            block.reserve.load(Ordering::Acquire)
        } else {
            block.tail.load(Ordering::Acquire)
        };
        cursor < self.consumed_head() + self.shared.size()
    }

    fn consumed_head(&self) -> u64 {
        self.shared.consumed_head()
    }

    fn reclaim_dead_readers(&self) {
        let block = self.shared.block();
        let mask = block.reader_mask.load(Ordering::Acquire);
        for index in 0..MAX_READERS {
            if mask & (1u64 << index) == 0 {
                continue;
            }
            let slot = &block.slots[index];
            let pid = slot.pid.load(Ordering::Acquire);
            let start_time = slot.start_time.load(Ordering::Acquire);
            if liveness::process_alive(pid, start_time) {
                continue;
            }
            warn!("ring: reclaiming dead reader slot {index} (pid {pid})");
            block
                .reader_mask
                .fetch_and(!(1u64 << index), Ordering::AcqRel);
            slot.flags.store(0, Ordering::Release);
            slot.pid.store(0, Ordering::Release);
        }
    }

    fn reserve_raw(&mut self, len: usize) -> Result<Option<()>> {
        let block = self.shared.block();
        let size = self.shared.size();
        let frame = align_frame(len) as u64;
        let mirrored = self.shared.data.mirrored();
        let multi = self.shared.config.topology.multi_writer();

        loop {
            let start = if multi {
                block.reserve.load(Ordering::Acquire)
            } else {
                block.tail.load(Ordering::Acquire)
            };
            let pos = (start % size) as usize;
            // Wrap filler when the frame cannot sit contiguously.
            let filler = if !mirrored && pos + frame as usize > size as usize {
                size - pos as u64
            } else {
                0
            };
            let total = filler + frame;
            let consumed = self.consumed_head();
            debug_assert!(start - consumed <= size);
            if start + total > consumed + size {
                return Ok(None);
            }
            if multi {
                if block
                    .reserve
                    .compare_exchange(start, start + total, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
            } else {
                block.reserve.store(start + total, Ordering::Relaxed);
            }

            // The range [start, start + total) is ours. Lay down the wrap
            // record, then the frame header.
            if filler > 0 {
                // SAFETY: pos..pos+4 is inside our reservation; size - pos is
                // at least one frame slot (frames are 8-aligned).
                unsafe {
                    self.shared
                        .data
                        .slice_mut(pos, 4)
                        .copy_from_slice(&WRAP_SENTINEL.to_le_bytes());
                }
            }
            let frame_start = start + filler;
            let frame_pos = (frame_start % size) as usize;
            let mut hdr = [0u8; FRAME_HDR];
            hdr[..4].copy_from_slice(&(len as u32).to_le_bytes());
            // SAFETY: the frame is inside our reservation.
            unsafe {
                self.shared
                    .data
                    .slice_mut(frame_pos, FRAME_HDR)
                    .copy_from_slice(&hdr);
            }
            debug_assert!(mirrored || frame_pos + FRAME_HDR + len <= size as usize);
            let payload_pos = ((frame_start + FRAME_HDR as u64) % size) as usize;
            self.last_raw = Some((start, start + total, payload_pos));
            return Ok(Some(()));
        }
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

/// How often a parked writer re-probes reader liveness.
const LIVENESS_PERIOD: Duration = Duration::from_millis(100);

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.shared
            .block()
            .writer_count
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reader endpoint bound to one slot of the reader table.
pub struct RingReader {
    shared: Arc<Shared>,
    slot: usize,
    head: u64,
    /// Frame length awaiting release by `shift2`.
    pending: Option<u64>,
}

impl RingReader {
    /// Returns the next message without consuming it, or `None` when the
    /// ring is drained. After `EndOfFile` the stream is over.
    pub fn shift(&mut self) -> Result<Option<&[u8]>> {
        if self.pending.is_some() {
            return Err(Error::Unsupported("shift before releasing previous frame"));
        }
        let size = self.shared.size();
        loop {
            let block = self.shared.block();
            let tail = block.tail.load(Ordering::Acquire);
            debug_assert!(tail >= self.head);
            if self.head == tail {
                if block.open_flags.load(Ordering::Acquire) & OPEN_EOF != 0 {
                    return Err(Error::EndOfFile);
                }
                return Ok(None);
            }
            let pos = (self.head % size) as usize;
            let mut hdr = [0u8; 4];
            // SAFETY: [head, tail) is published; pos+4 is within it.
            hdr.copy_from_slice(unsafe { self.shared.data.slice(pos, 4) });
            let len = u32::from_le_bytes(hdr);
            if len == WRAP_SENTINEL {
                // Wrap record: release the filler and continue at offset 0.
                self.advance(size - pos as u64)?;
                continue;
            }
            let len = len as usize;
            let frame = align_frame(len) as u64;
            if self.head + frame > tail || frame > size {
                return Err(Error::Corrupt("ring frame exceeds published region"));
            }
            self.pending = Some(frame);
            let payload_pos = ((self.head + FRAME_HDR as u64) % size) as usize;
            // SAFETY: the frame is fully published; mirror (or wrap records)
            // guarantees contiguity.
            let payload = unsafe { self.shared.data.slice(payload_pos, len) };
            return Ok(Some(payload));
        }
    }

    /// Releases the message returned by the last `shift`, passing its
    /// payload length back.
    pub fn shift2(&mut self, len: usize) -> Result<()> {
        let Some(frame) = self.pending.take() else {
            return Err(Error::Unsupported("shift2 without a pending frame"));
        };
        if frame != align_frame(len) as u64 {
            self.pending = Some(frame);
            return Err(Error::Corrupt("shift2 length mismatch"));
        }
        self.advance(frame)
    }

    /// Blocks until a message is available, EOF, or `timeout`. `NotReady`
    /// on timeout.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        let block = self.shared.block();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.readable()? {
                return Ok(());
            }
            match self.shared.config.wait {
                WaitStrategy::BusySpin => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(Error::NotReady);
                    }
                    std::hint::spin_loop();
                }
                WaitStrategy::Sleep(period) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(Error::NotReady);
                    }
                    std::thread::sleep(period);
                }
                WaitStrategy::SpinThenPark { spin } => {
                    let mut ready = false;
                    for _ in 0..spin {
                        if self.readable()? {
                            ready = true;
                            break;
                        }
                        std::hint::spin_loop();
                    }
                    if ready {
                        return Ok(());
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(Error::NotReady);
                    }
                    let seen = mark_waiting(&block.tail_notify);
                    if self.readable()? {
                        return Ok(());
                    }
                    futex_wait(&block.tail_notify, seen, remaining(deadline))?;
                }
            }
        }
    }

    /// Consumes the next message into a callback, blocking if necessary.
    pub fn recv<T>(
        &mut self,
        timeout: Option<Duration>,
        f: impl FnOnce(&[u8]) -> T,
    ) -> Result<T> {
        loop {
            if let Some(payload) = self.shift()? {
                let len = payload.len();
                let out = f(payload);
                self.shift2(len)?;
                return Ok(out);
            }
            self.wait(timeout)?;
        }
    }

    /// Detaches from the ring (`detach()`), freeing the reader slot.
    pub fn detach(self) {
        drop(self);
    }

    /// Whether the ring's writer process is still alive. Distinguishes a
    /// quiet stream from a dead publisher.
    pub fn writer_alive(&self) -> bool {
        self.shared.writer_alive()
    }

    fn readable(&self) -> Result<bool> {
        let block = self.shared.block();
        let tail = block.tail.load(Ordering::Acquire);
        if tail != self.head {
            return Ok(true);
        }
        if block.open_flags.load(Ordering::Acquire) & OPEN_EOF != 0 {
            return Err(Error::EndOfFile);
        }
        Ok(false)
    }

    fn advance(&mut self, bytes: u64) -> Result<()> {
        self.head += bytes;
        let block = self.shared.block();
        block.slots[self.slot].head.store(self.head, Ordering::Release);
        wake_waiters(&block.head_notify)
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        let block = self.shared.block();
        let slot = &block.slots[self.slot];
        block
            .reader_mask
            .fetch_and(!(1u64 << self.slot), Ordering::AcqRel);
        slot.flags.store(0, Ordering::Release);
        slot.pid.store(0, Ordering::Release);
        // A stalled writer may be blocked on this reader's head.
        let _ = wake_waiters(&block.head_notify);
    }
}
