//! A USB host controller core for embedded USB / OTG peripherals
//!
//! `usbh-core` discovers, enumerates and manages transfers with a single
//! USB device attached to the root port. Class and vendor drivers plug in
//! through [`ClientDriver`], and are matched to devices through a targeted
//! peripheral list of [`TplEntry`]s.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripheral`] for your USB controller. Then
//!
//! - call [`Host::interrupt`] from the USB interrupt handler, and
//! - call [`Host::tasks`] from your main loop.
//!
//! Use [`SharedHost`] when both contexts need the same host.
//!
//! ```no_run
//! use usbh_core::{Host, HostConfig, HostMemory, TplEntry, DriverId};
//! # struct Controller;
//! # unsafe impl usbh_core::Peripheral for Controller {
//! #   fn set_bdt_address(&mut self, _: *const ()) {}
//! #   fn enable_interrupts(&mut self, _: usbh_core::Interrupts) {}
//! #   fn interrupts(&self) -> usbh_core::Interrupts { usbh_core::Interrupts::empty() }
//! #   fn clear_interrupts(&mut self, _: usbh_core::Interrupts) {}
//! #   fn bus_errors(&self) -> usbh_core::BusErrors { usbh_core::BusErrors::empty() }
//! #   fn clear_bus_errors(&mut self, _: usbh_core::BusErrors) {}
//! #   fn set_vbus(&mut self, _: bool) {}
//! #   fn set_reset_signalling(&mut self, _: bool) {}
//! #   fn set_resume_signalling(&mut self, _: bool) {}
//! #   fn set_sof(&mut self, _: bool) {}
//! #   fn is_low_speed(&self) -> bool { false }
//! #   fn set_address(&mut self, _: u8, _: bool) {}
//! #   fn is_token_busy(&self) -> bool { false }
//! #   fn issue_token(&mut self, _: usbh_core::Token, _: &usbh_core::BufferDescriptor) {}
//! # }
//!
//! static MEMORY: HostMemory<2048> = HostMemory::new();
//! static TPL: [TplEntry; 1] = [TplEntry::class(0x08, 0x06, 0x50, DriverId(0))];
//!
//! let mut host = Host::new(Controller, &MEMORY, &TPL, HostConfig::new());
//! host.initialize();
//! loop {
//!     host.tasks();
//! #   break;
//! }
//! ```

#![no_std]

#[macro_use]
mod log;

mod bd;
mod buffer;
mod bus;
mod client;
mod config;
mod descriptor;
mod device;
mod endpoint;
mod error;
mod event;
mod host;
mod isochronous;
mod request;
mod state;
mod transfer;

#[cfg(test)]
mod sim;

use ral_registers as ral;

pub use bd::{Bdt, BufferDescriptor, Handshake};
pub use buffer::HostMemory;
pub use bus::SharedHost;
pub use client::{
    AppEvent, ApplicationHandler, ClientDriver, DeviceEvent, DeviceMatch, DriverId, TplEntry,
    TplFlags, MAX_CLIENT_DRIVERS,
};
pub use config::HostConfig;
pub use descriptor::{
    ConfigurationHeader, Descriptor, DescriptorError, Descriptors, DeviceDescriptor,
    EndpointDescriptor, InterfaceDescriptor, OtgDescriptor,
};
pub use device::DEVICE_ADDRESS;
pub use endpoint::{Client, Endpoint, EndpointStatus, Toggle, MAX_ENDPOINTS};
pub use error::{HoldReason, HostError, Rejected, TransferError};
pub use event::{Consumer, Event, EventKind, EventQueue, Producer, TransferEvent, EVENT_QUEUE_DEPTH};
pub use host::{Host, VbusEvent};
pub use isochronous::{IsochronousBuffers, Owner};
pub use request::DeviceRequest;
pub use state::{DeviceStatus, HostState};
pub use transfer::{TransferKind, TransferStatus};

bitflags::bitflags! {
    /// Host interrupt causes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupts : u16 {
        /// The device left the root port
        const DETACH = 1 << 0;
        /// See [`BusErrors`] for the cause
        const BUS_ERROR = 1 << 1;
        /// A frame started
        const SOF = 1 << 2;
        /// The issued token finished
        const TRANSFER_DONE = 1 << 3;
        const IDLE = 1 << 4;
        /// The device signalled remote wakeup
        const RESUME = 1 << 5;
        /// A device connected to the root port
        const ATTACH = 1 << 6;
        const STALL = 1 << 7;
        /// The 1 ms tick
        const TICK = 1 << 8;
    }
}

bitflags::bitflags! {
    /// Bus error causes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusErrors : u8 {
        const PID_CHECK = 1 << 0;
        const CRC5_EOF = 1 << 1;
        const CRC16 = 1 << 2;
        const DATA_FIELD = 1 << 3;
        const BUS_TIMEOUT = 1 << 4;
        const DMA = 1 << 5;
        const BUS_MATRIX = 1 << 6;
        const BIT_STUFF = 1 << 7;
    }
}

impl BusErrors {
    /// The transfer error these causes amount to
    ///
    /// When several bits are set, the first one in declaration order wins.
    pub fn transfer_error(self) -> Option<TransferError> {
        const MAP: [(BusErrors, TransferError); 8] = [
            (BusErrors::PID_CHECK, TransferError::PidCheck),
            (BusErrors::CRC5_EOF, TransferError::EndOfFrame),
            (BusErrors::CRC16, TransferError::Crc16),
            (BusErrors::DATA_FIELD, TransferError::DataField),
            (BusErrors::BUS_TIMEOUT, TransferError::Timeout),
            (BusErrors::DMA, TransferError::Dma),
            (BusErrors::BUS_MATRIX, TransferError::Dma),
            (BusErrors::BIT_STUFF, TransferError::BitStuff),
        ];
        MAP.iter()
            .find(|(bits, _)| self.contains(*bits))
            .map(|&(_, error)| error)
    }
}

/// Token packet identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pid {
    Out = 0x1,
    In = 0x9,
    Setup = 0xD,
}

/// A token for the peripheral to put on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub pid: Pid,
    /// Endpoint number, without the direction bit
    pub endpoint: u8,
    /// `false` for isochronous transactions, which have no handshake phase
    pub handshake: bool,
}

/// A USB host controller
///
/// The host core drives the controller through this interface. It never
/// touches registers itself.
///
/// # Safety
///
/// `Peripheral` should only be implemented on a type that owns the USB
/// controller. The host core relies on the following behavior:
///
/// - [`issue_token`](Peripheral::issue_token) moves data only through the
///   buffer that the core armed in the descriptor, and never more than the
///   armed byte count.
/// - Every issued token eventually finishes with
///   [`TRANSFER_DONE`](Interrupts::TRANSFER_DONE), after the peripheral
///   [completed](BufferDescriptor::complete) the descriptor. A transaction
///   without a response completes with [`Handshake::Timeout`].
/// - An IN transaction completes with the received DATA PID. Other
///   transactions, including isochronous OUT, complete with the handshake
///   PID; an isochronous OUT that went out reports [`Handshake::Ack`].
/// - The descriptor table's address, once set, is used for all
///   transactions.
///
/// # Example
///
/// A sketch of an implementation over a hypothetical register block.
///
/// ```
/// # mod regs { pub struct Usb; impl Usb {
/// #   pub fn write_bdt(&self, _: u32) {} pub fn istat(&self) -> u16 { 0 }
/// #   pub fn write_istat(&self, _: u16) {} pub fn write_inten(&self, _: u16) {}
/// #   pub fn errstat(&self) -> u8 { 0 } pub fn write_errstat(&self, _: u8) {}
/// #   pub fn ctl(&self) -> u8 { 0 } pub fn write_ctl(&self, _: u8) {}
/// #   pub fn write_addr(&self, _: u8) {}
/// #   pub fn write_token(&self, _: u8) {} pub fn set_vbus(&self, _: bool) {}
/// # } }
/// use usbh_core::{BufferDescriptor, BusErrors, Interrupts, Peripheral, Token};
///
/// struct Controller(regs::Usb);
///
/// unsafe impl Peripheral for Controller {
///     fn set_bdt_address(&mut self, bdt: *const ()) {
///         self.0.write_bdt(bdt as u32);
///     }
///     fn enable_interrupts(&mut self, interrupts: Interrupts) {
///         self.0.write_inten(interrupts.bits());
///     }
///     fn interrupts(&self) -> Interrupts {
///         Interrupts::from_bits_truncate(self.0.istat())
///     }
///     fn clear_interrupts(&mut self, interrupts: Interrupts) {
///         self.0.write_istat(interrupts.bits());
///     }
///     fn bus_errors(&self) -> BusErrors {
///         BusErrors::from_bits_truncate(self.0.errstat())
///     }
///     fn clear_bus_errors(&mut self, errors: BusErrors) {
///         self.0.write_errstat(errors.bits());
///     }
///     fn set_vbus(&mut self, on: bool) {
///         self.0.set_vbus(on);
///     }
///     fn set_reset_signalling(&mut self, on: bool) {
///         let ctl = self.0.ctl();
///         self.0.write_ctl(if on { ctl | 0x10 } else { ctl & !0x10 });
///     }
///     fn set_resume_signalling(&mut self, on: bool) {
///         let ctl = self.0.ctl();
///         self.0.write_ctl(if on { ctl | 0x04 } else { ctl & !0x04 });
///     }
///     fn set_sof(&mut self, enable: bool) {
///         let ctl = self.0.ctl();
///         self.0.write_ctl(if enable { ctl | 0x01 } else { ctl & !0x01 });
///     }
///     fn is_low_speed(&self) -> bool {
///         self.0.ctl() & 0x80 == 0
///     }
///     fn set_address(&mut self, address: u8, low_speed: bool) {
///         self.0.write_addr(address | ((low_speed as u8) << 7));
///     }
///     fn is_token_busy(&self) -> bool {
///         self.0.ctl() & 0x20 != 0
///     }
///     fn issue_token(&mut self, token: Token, _: &BufferDescriptor) {
///         self.0.write_token((token.pid as u8) << 4 | token.endpoint);
///     }
/// }
/// ```
pub unsafe trait Peripheral {
    /// Point the controller at the buffer descriptor table
    fn set_bdt_address(&mut self, bdt: *const ());
    fn enable_interrupts(&mut self, interrupts: Interrupts);
    /// Pending interrupt causes
    fn interrupts(&self) -> Interrupts;
    fn clear_interrupts(&mut self, interrupts: Interrupts);
    /// Pending bus error causes
    fn bus_errors(&self) -> BusErrors;
    fn clear_bus_errors(&mut self, errors: BusErrors);
    /// Switch VBUS on the root port
    fn set_vbus(&mut self, on: bool);
    /// Drive, or release, bus reset (SE0)
    fn set_reset_signalling(&mut self, on: bool);
    /// Drive, or release, resume (K state)
    fn set_resume_signalling(&mut self, on: bool);
    /// Enable or disable start-of-frame generation
    fn set_sof(&mut self, enable: bool);
    /// Is the attached device low speed?
    fn is_low_speed(&self) -> bool;
    /// The device address, and speed, for following tokens
    fn set_address(&mut self, address: u8, low_speed: bool);
    /// Is a token still being processed?
    fn is_token_busy(&self) -> bool;
    /// Put a token on the bus
    ///
    /// `descriptor` is armed, and owned by the peripheral until it's completed.
    fn issue_token(&mut self, token: Token, descriptor: &BufferDescriptor);
}
