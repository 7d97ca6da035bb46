//! Shared ring control block.
//!
//! Lives at the start of the control mapping (`<name>.ctrl` for shared
//! rings). Hot fields are padded to their own cache lines so writer-side and
//! reader-side updates do not false-share.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::ring::mem::RingMem;

pub const RING_MAGIC: u32 = 0x534C_524E; // 'SLRN'
pub const RING_VERSION: u32 = 1;

/// Fixed width of the reader slot table.
pub const MAX_READERS: usize = 16;

pub const OPEN_EOF: u32 = 1 << 0;

/// Slot flag: reader attached and live.
pub const SLOT_ATTACHED: u32 = 1 << 0;

#[repr(C, align(128))]
pub struct ReaderSlot {
    pub pid: AtomicU32,
    pub flags: AtomicU32,
    /// Process start time, for pid-reuse detection.
    pub start_time: AtomicU64,
    /// This reader's consume cursor (monotonic byte count).
    pub head: AtomicU64,
    pub _pad: [u8; 104],
}

#[repr(C, align(128))]
pub struct RingControl {
    // Constant / low-frequency fields (avoid sharing with hot fields).
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    pub params: AtomicU32,
    pub size: AtomicU64,
    pub open_flags: AtomicU32,
    pub writer_count: AtomicU32,
    /// Most recent writer's identity, for liveness reporting to readers.
    pub writer_pid: AtomicU32,
    pub _pad_pid: [u8; 4],
    pub writer_start: AtomicU64,
    pub _pad0: [u8; 80],

    // Writer-hot.
    /// Published tail: readers may consume up to here.
    pub tail: AtomicU64,
    /// Reservation cursor for multi-writer rings; equals `tail` for SW.
    pub reserve: AtomicU64,
    pub _pad1: [u8; 112],

    // Reader-hot.
    /// Consumed watermark: min reader head, maintained by the writer.
    pub head: AtomicU64,
    pub reader_mask: AtomicU64,
    pub _pad2: [u8; 112],

    // Coordination. Separate lines so a reader registering to wait does not
    // bounce the writer's commit line.
    pub tail_notify: AtomicU32,
    pub _pad3: [u8; 124],
    pub head_notify: AtomicU32,
    pub _pad4: [u8; 124],

    pub slots: [ReaderSlot; MAX_READERS],
}

/// Packed topology/params word.
pub const PARAM_MULTI_WRITER: u32 = 1 << 0;
pub const PARAM_MULTI_READER: u32 = 1 << 1;
pub const PARAM_MIRRORED: u32 = 1 << 2;

pub struct ControlMem {
    mem: RingMem,
}

impl ControlMem {
    pub fn control_len() -> usize {
        size_of::<RingControl>()
    }

    pub fn private() -> Result<Self> {
        let mem = RingMem::private(Self::control_len(), false)?;
        Ok(Self { mem })
    }

    pub fn shared(name: &str) -> Result<Self> {
        let mem = RingMem::shared(&format!("{name}.ctrl"), Self::control_len(), false)?;
        Ok(Self { mem })
    }

    pub fn unlink(name: &str) -> Result<()> {
        RingMem::unlink(&format!("{name}.ctrl"))
    }

    pub fn created(&self) -> bool {
        self.mem.created()
    }

    pub fn block(&self) -> &RingControl {
        // SAFETY: the mapping is at least control_len() bytes and the block
        // is composed entirely of atomics, valid for any bit pattern.
        unsafe { &*(self.mem.as_ptr() as *const RingControl) }
    }

    /// First-creator initialization with an init-state handshake: 0 = raw,
    /// 1 = initializing, 2 = ready. The first caller to move 0 -> 1 seeds
    /// the block; everyone else spins for 2 and validates magic/version.
    pub fn init(&self, params: u32, size: u64) -> Result<()> {
        let block = self.block();
        match block
            .init_state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                block.version.store(RING_VERSION, Ordering::Relaxed);
                block.params.store(params, Ordering::Relaxed);
                block.size.store(size, Ordering::Relaxed);
                block.open_flags.store(0, Ordering::Relaxed);
                block.writer_count.store(0, Ordering::Relaxed);
                block.writer_pid.store(0, Ordering::Relaxed);
                block.writer_start.store(0, Ordering::Relaxed);
                block.tail.store(0, Ordering::Relaxed);
                block.reserve.store(0, Ordering::Relaxed);
                block.head.store(0, Ordering::Relaxed);
                block.reader_mask.store(0, Ordering::Relaxed);
                block.tail_notify.store(0, Ordering::Relaxed);
                block.head_notify.store(0, Ordering::Relaxed);
                for slot in &block.slots {
                    slot.pid.store(0, Ordering::Relaxed);
                    slot.flags.store(0, Ordering::Relaxed);
                    slot.start_time.store(0, Ordering::Relaxed);
                    slot.head.store(0, Ordering::Relaxed);
                }
                block.magic.store(RING_MAGIC, Ordering::Relaxed);
                block.init_state.store(2, Ordering::Release);
                Ok(())
            }
            Err(_) => self.wait_ready(params, size),
        }
    }

    fn wait_ready(&self, params: u32, size: u64) -> Result<()> {
        let block = self.block();
        loop {
            if block.init_state.load(Ordering::Acquire) == 2 {
                break;
            }
            std::thread::yield_now();
        }
        if block.magic.load(Ordering::Acquire) != RING_MAGIC {
            return Err(Error::CorruptMetadata("ring control magic mismatch"));
        }
        let version = block.version.load(Ordering::Acquire);
        if version != RING_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        if block.params.load(Ordering::Acquire) != params {
            return Err(Error::Config("ring params mismatch with existing ring"));
        }
        if block.size.load(Ordering::Acquire) != size {
            return Err(Error::Config("ring size mismatch with existing ring"));
        }
        Ok(())
    }
}
