//! Isochronous data buffers
//!
//! An isochronous stream rotates through a small ring of buffers. Each
//! buffer is owned either by the hardware or by the application. The
//! host only issues a token into a hardware-owned buffer, so the
//! hardware never touches a buffer the application is working with.

use crate::buffer::{Allocator, Buffer};

/// Most buffers in one set
pub const MAX_ISOCHRONOUS_BUFFERS: usize = 4;
/// Fewest buffers in one set
pub const MIN_ISOCHRONOUS_BUFFERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Hardware,
    Application,
}

struct Slot {
    buffer: Buffer,
    /// Valid bytes
    len: usize,
    owner: Owner,
}

/// A ring of isochronous buffers
///
/// For an IN stream, the hardware fills buffers and passes them to the
/// application, which [releases](IsochronousBuffers::release) them back.
/// For an OUT stream, the application fills buffers and releases them
/// to the hardware, which sends them and passes them back.
pub struct IsochronousBuffers {
    slots: [Option<Slot>; MAX_ISOCHRONOUS_BUFFERS],
    count: usize,
    hardware: usize,
    application: usize,
    read: bool,
    overruns: u32,
}

impl IsochronousBuffers {
    /// Allocate `count` buffers of `size` bytes
    ///
    /// `read` selects an IN stream. Returns `None` if host memory is
    /// exhausted; `count` is clamped to the supported range.
    pub(crate) fn allocate(
        allocator: &mut Allocator,
        count: usize,
        size: usize,
        read: bool,
    ) -> Option<Self> {
        let count = count.clamp(MIN_ISOCHRONOUS_BUFFERS, MAX_ISOCHRONOUS_BUFFERS);
        let mut slots: [Option<Slot>; MAX_ISOCHRONOUS_BUFFERS] = Default::default();
        for slot in slots.iter_mut().take(count) {
            *slot = Some(Slot {
                buffer: allocator.allocate(size)?,
                len: 0,
                owner: Owner::Hardware,
            });
        }
        let mut buffers = IsochronousBuffers {
            slots,
            count,
            hardware: 0,
            application: 0,
            read,
            overruns: 0,
        };
        buffers.reset();
        Some(buffers)
    }

    /// Return every buffer to its initial owner, and rewind both indices
    ///
    /// IN streams start with all buffers owned by the hardware; OUT streams
    /// start with all buffers owned by the application.
    pub fn reset(&mut self) {
        let owner = if self.read { Owner::Hardware } else { Owner::Application };
        for slot in self.slots.iter_mut().flatten() {
            slot.owner = owner;
            slot.len = 0;
        }
        self.hardware = 0;
        self.application = 0;
        self.overruns = 0;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Intervals skipped because no buffer was available to the hardware
    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    /// The owner of buffer `index`
    pub fn owner(&self, index: usize) -> Option<Owner> {
        Some(self.slots.get(index)?.as_ref()?.owner)
    }

    /// Index of the buffer the application works on next
    pub fn application_index(&self) -> usize {
        self.application
    }

    /// The valid data of the application's current buffer
    ///
    /// `None` if the hardware still owns it.
    pub fn data(&self) -> Option<&[u8]> {
        let slot = self.slots[self.application].as_ref()?;
        if slot.owner != Owner::Application {
            return None;
        }
        // Safety: the hardware never uses an application-owned buffer.
        let bytes = unsafe { slot.buffer.as_slice() };
        bytes.get(..slot.len)
    }

    /// The whole of the application's current buffer, for filling
    ///
    /// `None` if the hardware still owns it.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let slot = self.slots[self.application].as_mut()?;
        if slot.owner != Owner::Application {
            return None;
        }
        // Safety: the hardware never uses an application-owned buffer.
        Some(unsafe { slot.buffer.as_mut_slice() })
    }

    /// Hand the application's current buffer to the hardware
    ///
    /// For an OUT stream, `len` is the number of bytes to send. It's
    /// ignored for IN streams. Returns `false` if the application
    /// doesn't own the current buffer.
    pub fn release(&mut self, len: usize) -> bool {
        let Some(slot) = self.slots[self.application].as_mut() else {
            return false;
        };
        if slot.owner != Owner::Application {
            return false;
        }
        slot.owner = Owner::Hardware;
        slot.len = if self.read { 0 } else { len.min(slot.buffer.len()) };
        self.application = (self.application + 1) % self.count;
        true
    }

    /// The buffer for this interval's transaction
    ///
    /// `None`, and an overrun, if the hardware owns no buffer.
    pub(crate) fn hardware_buffer(&mut self) -> Option<(*mut u8, usize)> {
        match self.slots[self.hardware].as_ref() {
            Some(slot) if slot.owner == Owner::Hardware => {
                let len = if self.read { slot.buffer.len() } else { slot.len };
                Some((slot.buffer.ptr_at(0), len))
            }
            _ => {
                self.overruns = self.overruns.wrapping_add(1);
                None
            }
        }
    }

    /// The hardware finished a transaction moving `count` bytes
    ///
    /// Passes the buffer to the application and returns its index.
    pub(crate) fn hardware_done(&mut self, count: usize) -> u8 {
        let index = self.hardware;
        if let Some(slot) = self.slots[index].as_mut() {
            if self.read {
                slot.len = count.min(slot.buffer.len());
            }
            slot.owner = Owner::Application;
        }
        self.hardware = (self.hardware + 1) % self.count;
        index as u8
    }

    /// The hardware's transaction failed
    ///
    /// An IN buffer stays with the hardware for the next interval. An OUT
    /// buffer's data is lost, and the buffer returns to the application.
    pub(crate) fn hardware_failed(&mut self) -> u8 {
        let index = self.hardware;
        if !self.read {
            self.hardware_done(0);
        }
        index as u8
    }
}
