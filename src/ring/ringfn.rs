//! Type-erased move-only callables serialized into ring slots.
//!
//! A `RingFn` turns a closure into bytes a ring can carry: an invoke pointer
//! followed by the (8-aligned) capture. Stateless closures take the fast
//! path, costing one pointer and no allocation; over-aligned captures fall
//! back to a single heap allocation whose pointer rides in the slot. The
//! reader side invokes the slot in place, which runs the closure, destroys
//! the capture, and reports the bytes consumed.
//!
//! Only meaningful for process-private rings: function pointers do not
//! survive an address-space boundary.

use std::mem::{align_of, size_of, MaybeUninit};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ring::{RingReader, RingWriter};

const PTR_BYTES: usize = size_of::<usize>();
const INLINE_HOME: usize = 64;

type InvokeFn<A> = unsafe fn(*mut u8, A) -> usize;

/// 8-aligned scratch space holding a capture until it is pushed.
#[repr(C, align(8))]
struct HomeBuf([MaybeUninit<u8>; INLINE_HOME]);

impl HomeBuf {
    fn new() -> Box<Self> {
        Box::new(Self([MaybeUninit::uninit(); INLINE_HOME]))
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr() as *mut u8
    }
}

enum Home {
    /// Stateless fast path: nothing to carry.
    None,
    /// Capture (or the pointer to its heap box) awaiting a push.
    Inline(Box<HomeBuf>),
}

/// A one-shot callable ready to be serialized into a ring slot.
pub struct RingFn<A> {
    invoke: InvokeFn<A>,
    /// Moves the capture from `home` into the slot, freeing the home.
    relocate: unsafe fn(*mut u8, *mut u8),
    /// Drops a never-pushed capture still in its home.
    drop_home: unsafe fn(*mut u8),
    /// Capture bytes occupied in the slot, 8-aligned; zero for stateless.
    slot_bytes: usize,
    home: Home,
}

// SAFETY: construction requires F: Send, and the capture is owned.
unsafe impl<A> Send for RingFn<A> {}

fn aligned<T>() -> usize {
    (size_of::<T>() + 7) & !7
}

unsafe fn invoke_inline<A, F: FnOnce(A)>(capture: *mut u8, args: A) -> usize {
    let f = std::ptr::read(capture as *mut F);
    f(args);
    PTR_BYTES + aligned::<F>()
}

unsafe fn invoke_boxed<A, F: FnOnce(A)>(capture: *mut u8, args: A) -> usize {
    let boxed = Box::from_raw(std::ptr::read(capture as *mut *mut F));
    (*boxed)(args);
    PTR_BYTES + aligned::<*mut F>()
}

unsafe fn relocate_bytes<F>(src: *mut u8, dst: *mut u8) {
    std::ptr::copy_nonoverlapping(src, dst, size_of::<F>());
}

unsafe fn relocate_none(_src: *mut u8, _dst: *mut u8) {}

unsafe fn drop_in_home<F>(home: *mut u8) {
    std::ptr::drop_in_place(home as *mut F);
}

unsafe fn drop_none(_home: *mut u8) {}

unsafe fn drop_boxed<F>(home: *mut u8) {
    drop(Box::from_raw(std::ptr::read(home as *mut *mut F)));
}

impl<A> RingFn<A> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(A) + Send + 'static,
    {
        if size_of::<F>() == 0 {
            // Stateless lambda: the invoke pointer is the whole message.
            std::mem::forget(f);
            return Self {
                invoke: invoke_inline::<A, F>,
                relocate: relocate_none,
                drop_home: drop_none,
                slot_bytes: 0,
                home: Home::None,
            };
        }
        if size_of::<F>() <= INLINE_HOME && align_of::<F>() <= 8 {
            let mut home = HomeBuf::new();
            // SAFETY: the home is 8-aligned and sized for F.
            unsafe {
                std::ptr::write(home.as_mut_ptr() as *mut F, f);
            }
            return Self {
                invoke: invoke_inline::<A, F>,
                relocate: relocate_bytes::<F>,
                drop_home: drop_in_home::<F>,
                slot_bytes: aligned::<F>(),
                home: Home::Inline(home),
            };
        }
        // Escaped or over-aligned capture: one heap allocation, the slot
        // carries only its pointer.
        let raw = Box::into_raw(Box::new(f));
        let mut home = HomeBuf::new();
        // SAFETY: a thin pointer always fits the home.
        unsafe {
            std::ptr::write(home.as_mut_ptr() as *mut *mut F, raw);
        }
        Self {
            invoke: invoke_boxed::<A, F>,
            relocate: relocate_bytes::<*mut F>,
            drop_home: drop_boxed::<F>,
            slot_bytes: aligned::<*mut F>(),
            home: Home::Inline(home),
        }
    }

    /// Bytes this callable occupies in a ring slot: the invoke pointer plus
    /// the capture (zero for stateless lambdas).
    pub fn push_size(&self) -> usize {
        PTR_BYTES + self.slot_bytes
    }

    /// Serializes into `dst`, which must be 8-aligned and `push_size()`
    /// bytes. Returns the bytes written.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `push_size()` writes and 8-aligned.
    pub unsafe fn push(mut self, dst: *mut u8) -> usize {
        debug_assert_eq!(dst as usize & 7, 0);
        std::ptr::write(dst as *mut usize, self.invoke as usize);
        if self.slot_bytes > 0 {
            if let Home::Inline(home) = &mut self.home {
                (self.relocate)(home.as_mut_ptr() as *mut u8, dst.add(PTR_BYTES));
            }
        }
        let written = self.push_size();
        // The capture now lives in the slot; do not drop it from the home.
        self.home = Home::None;
        std::mem::forget(self);
        written
    }

    /// Invokes a serialized callable in place: runs the closure with `args`,
    /// destroys the capture, and returns the bytes consumed from the slot.
    ///
    /// # Safety
    ///
    /// `slot` must hold bytes produced by `push` of a `RingFn<A>`, not yet
    /// invoked.
    pub unsafe fn invoke(slot: *mut u8, args: A) -> usize {
        let raw = std::ptr::read(slot as *const usize);
        let invoke: InvokeFn<A> = std::mem::transmute(raw);
        invoke(slot.add(PTR_BYTES), args)
    }
}

impl<A> Drop for RingFn<A> {
    fn drop(&mut self) {
        if self.slot_bytes == 0 {
            return;
        }
        if let Home::Inline(home) = &mut self.home {
            // SAFETY: the capture was written into the home and never moved
            // out (push forgets self).
            unsafe { (self.drop_home)(home.as_mut_ptr() as *mut u8) };
        }
    }
}

impl RingWriter {
    /// Serializes a callable into the ring as one message.
    pub fn push_fn<A>(&mut self, f: RingFn<A>, timeout: Option<Duration>) -> Result<()> {
        let size = f.push_size();
        let mut reservation = self.push(size, timeout)?;
        let payload = reservation.payload();
        // Frame headers are 8 bytes and frames 8-aligned, so payloads are
        // always aligned for the invoke pointer.
        debug_assert_eq!(payload.as_ptr() as usize & 7, 0);
        // SAFETY: the reservation is exclusive, `size` bytes, 8-aligned.
        unsafe {
            f.push(payload.as_mut_ptr());
        }
        reservation.commit()
    }
}

impl RingReader {
    /// Invokes the next serialized callable, if any. Returns `Ok(false)`
    /// when the ring is drained.
    pub fn invoke_fn<A>(&mut self, args: A) -> Result<bool> {
        let base = self.shared.data.as_ptr() as usize;
        let (len, offset) = match self.shift()? {
            Some(payload) => (payload.len(), payload.as_ptr() as usize - base),
            None => return Ok(false),
        };
        // SAFETY: shift returned a published `len`-byte frame at `offset`;
        // this reader owns its consumption and the mapping is writable.
        let slot = unsafe { self.shared.data.slice_mut(offset, len) };
        let consumed = unsafe { RingFn::<A>::invoke(slot.as_mut_ptr(), args) };
        if consumed != len {
            return Err(Error::Corrupt("callable frame length mismatch"));
        }
        self.shift2(len)?;
        Ok(true)
    }
}
