//! Buffer descriptors (BD) and the buffer descriptor table (BDT)
//!
//! The module implements a RAL-compatible interface for working
//! with buffer descriptors. The host core arms a descriptor before
//! issuing a token; the peripheral writes the handshake PID and the
//! byte count back, then releases ownership.

#![allow(non_snake_case, non_upper_case_globals)]

use core::cell::UnsafeCell;

use crate::{endpoint::Toggle, ral, Pid};

/// Volatile cell that conforms to the RAL's register API
#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
}

/// A buffer descriptor
///
/// Armed by the host core, completed by the [`Peripheral`](crate::Peripheral).
#[repr(C)]
pub struct BufferDescriptor {
    pub STATUS: VCell<u32>,
    pub ADDRESS: VCell<usize>,
}

pub mod STATUS {
    /// Returned handshake or data PID; valid once `UOWN` is clear
    pub mod PID {
        pub const offset: u32 = 2;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Enable DATA toggle synchronization for this transaction
    pub mod DTSEN {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DATA01 {
        pub const offset: u32 = 6;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Set: the peripheral owns the descriptor
    pub mod UOWN {
        pub const offset: u32 = 7;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Byte count
    pub mod BC {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x3FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// The largest byte count a descriptor can carry
pub(crate) const MAX_BYTE_COUNT: u16 = (STATUS::BC::mask >> STATUS::BC::offset) as u16;

/// The PID a device answered with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Handshake {
    /// No response before the bus turnaround timeout
    Timeout = 0x0,
    Ack = 0x2,
    Data0 = 0x3,
    Nak = 0xA,
    Data1 = 0xB,
    Stall = 0xE,
}

impl Handshake {
    fn from_pid(pid: u32) -> Result<Self, u8> {
        Ok(match pid {
            0x0 => Handshake::Timeout,
            0x2 => Handshake::Ack,
            0x3 => Handshake::Data0,
            0xA => Handshake::Nak,
            0xB => Handshake::Data1,
            0xE => Handshake::Stall,
            pid => return Err(pid as u8),
        })
    }

    /// Data PIDs carry the DATA toggle of the received packet
    pub fn toggle(self) -> Option<Toggle> {
        match self {
            Handshake::Data0 => Some(Toggle::Data0),
            Handshake::Data1 => Some(Toggle::Data1),
            _ => None,
        }
    }
}

impl BufferDescriptor {
    pub const fn new() -> Self {
        BufferDescriptor {
            STATUS: VCell::new(0),
            ADDRESS: VCell::new(0),
        }
    }

    /// Prepare the descriptor for the next token, and hand it to the peripheral
    pub(crate) fn arm(&self, buffer: *mut u8, len: usize, toggle: Toggle, check_toggle: bool) {
        self.ADDRESS.write(buffer as usize);
        ral::write_reg!(
            crate::bd,
            self,
            STATUS,
            BC: len as u32,
            DATA01: toggle as u32,
            DTSEN: check_toggle as u32,
            UOWN: 1
        );
    }

    /// Returns `true` while the peripheral owns this descriptor
    pub fn is_owned_by_hardware(&self) -> bool {
        ral::read_reg!(crate::bd, self, STATUS, UOWN == 1)
    }

    /// The armed buffer address and its length, in bytes
    ///
    /// A peripheral reads OUT / SETUP data from, or writes IN data to,
    /// this memory.
    pub fn buffer(&self) -> (*mut u8, usize) {
        (
            self.ADDRESS.read() as *mut u8,
            ral::read_reg!(crate::bd, self, STATUS, BC) as usize,
        )
    }

    /// The DATA toggle armed by the host
    pub fn data_toggle(&self) -> Toggle {
        if ral::read_reg!(crate::bd, self, STATUS, DATA01 == 1) {
            Toggle::Data1
        } else {
            Toggle::Data0
        }
    }

    /// Record the outcome of a transaction, and return the descriptor to the host
    ///
    /// `count` is the number of bytes actually transferred.
    pub fn complete(&self, handshake: Handshake, count: usize) {
        ral::write_reg!(
            crate::bd,
            self,
            STATUS,
            BC: count as u32,
            PID: handshake as u32,
            UOWN: 0
        );
    }

    /// Read back the completed transaction
    ///
    /// An unrecognized PID is returned as the error.
    pub(crate) fn result(&self) -> (Result<Handshake, u8>, usize) {
        let (pid, count) = ral::read_reg!(crate::bd, self, STATUS, PID, BC);
        (Handshake::from_pid(pid), count as usize)
    }
}

/// The buffer descriptor table
///
/// One descriptor per direction, and the storage for the SETUP
/// packet of the in-progress control transfer.
#[repr(C, align(512))]
pub struct Bdt {
    rx: BufferDescriptor,
    tx: BufferDescriptor,
    setup: UnsafeCell<[u8; 8]>,
}

// Safety: the table is only mutated by the host core, which is never
// shared across contexts without a critical section, and by the
// peripheral through the armed descriptor.
unsafe impl Sync for Bdt {}

impl Bdt {
    pub(crate) const fn new() -> Self {
        Bdt {
            rx: BufferDescriptor::new(),
            tx: BufferDescriptor::new(),
            setup: UnsafeCell::new([0; 8]),
        }
    }

    /// The descriptor used for a token with this PID
    pub fn descriptor(&self, pid: Pid) -> &BufferDescriptor {
        match pid {
            Pid::In => &self.rx,
            Pid::Out | Pid::Setup => &self.tx,
        }
    }

    pub(crate) fn setup_packet(&self, packet: &[u8; 8]) -> *mut u8 {
        let ptr = self.setup.get();
        // Safety: only the host core writes the SETUP area, and only
        // while no SETUP token is outstanding.
        unsafe { ptr.write_volatile(*packet) };
        ptr.cast()
    }

    pub(crate) fn as_ptr(&self) -> *const () {
        (self as *const Self).cast()
    }
}
