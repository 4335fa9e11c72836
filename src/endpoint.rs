//! Endpoint records, and the table that holds them

use usb_device::endpoint::{EndpointAddress, EndpointType};

use crate::{
    buffer::Buffer, client::DriverId, config::HostConfig, descriptor::EndpointDescriptor,
    error::TransferError, isochronous::IsochronousBuffers, transfer::Transfer,
};

/// Endpoint records the host can track at once
pub const MAX_ENDPOINTS: usize = 32;

bitflags::bitflags! {
    /// Endpoint status flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EndpointStatus : u16 {
        /// The device halted the endpoint
        const STALLED = 1 << 0;
        /// The last transfer failed
        const ERROR = 1 << 1;
        /// The last transfer was terminated
        const USER_ABORT = 1 << 2;
        /// The last transfer succeeded
        const SUCCESSFUL = 1 << 3;
        /// The last transfer reached a terminal state
        const COMPLETE = 1 << 4;
        /// Received DATA PIDs are checked against the toggle
        const USE_DTS = 1 << 5;
        /// The last transaction was NAK'd
        const LAST_NAKD = 1 << 6;
        /// NAKs are counted against the NAK limit
        const NAK_TIMEOUT = 1 << 7;
    }
}

/// The DATA PID toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Toggle {
    Data0 = 0,
    Data1 = 1,
}

impl Toggle {
    pub fn flip(self) -> Self {
        match self {
            Toggle::Data0 => Toggle::Data1,
            Toggle::Data1 => Toggle::Data0,
        }
    }
}

/// Who receives the events of an endpoint's transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Client {
    /// The host itself, during enumeration; never queued
    Host,
    Driver(DriverId),
    Application,
}

/// An endpoint of the attached device
pub struct Endpoint {
    pub(crate) address: EndpointAddress,
    pub(crate) kind: EndpointType,
    pub(crate) max_packet_size: u16,
    /// Frames between interrupt / isochronous transactions
    pub(crate) interval: u16,
    pub(crate) countdown: u16,
    pub(crate) status: EndpointStatus,
    pub(crate) toggle: Toggle,
    pub(crate) error_count: u8,
    pub(crate) error: Option<TransferError>,
    pub(crate) nak_count: u16,
    pub(crate) nak_limit: u16,
    pub(crate) client: Client,
    pub(crate) transfer: Transfer,
    pub(crate) isochronous: Option<IsochronousBuffers>,
}

impl Endpoint {
    /// The default control endpoint
    pub(crate) fn control(max_packet_size: u16, config: &HostConfig) -> Self {
        let mut ep = Endpoint::new(
            EndpointAddress::from(0),
            EndpointType::Control,
            max_packet_size,
            0,
            config,
        );
        ep.client = Client::Host;
        ep
    }

    pub(crate) fn from_descriptor(
        descriptor: &EndpointDescriptor,
        client: Client,
        config: &HostConfig,
    ) -> Self {
        let mut ep = Endpoint::new(
            descriptor.address,
            descriptor.kind,
            descriptor.max_packet_size,
            descriptor.interval,
            config,
        );
        ep.client = client;
        ep
    }

    fn new(
        address: EndpointAddress,
        kind: EndpointType,
        max_packet_size: u16,
        interval: u8,
        config: &HostConfig,
    ) -> Self {
        let handshaking = EndpointStatus::NAK_TIMEOUT | EndpointStatus::USE_DTS;
        let (nak_limit, status) = match kind {
            EndpointType::Control => (config.control_naks, handshaking),
            EndpointType::Bulk => (config.bulk_naks, handshaking),
            EndpointType::Interrupt => (config.interrupt_naks, handshaking),
            EndpointType::Isochronous { .. } => (0, EndpointStatus::empty()),
        };
        let interval = match kind {
            EndpointType::Interrupt => interval.max(1) as u16,
            EndpointType::Isochronous { .. } => 1u16 << (interval.clamp(1, 16) - 1),
            _ => 0,
        };
        Endpoint {
            address,
            kind,
            max_packet_size: max_packet_size.max(1),
            interval,
            countdown: 0,
            status: status | EndpointStatus::COMPLETE,
            toggle: Toggle::Data0,
            error_count: 0,
            error: None,
            nak_count: 0,
            nak_limit,
            client: Client::Host,
            transfer: Transfer::new(),
            isochronous: None,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.address
    }

    pub fn kind(&self) -> EndpointType {
        self.kind
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    pub fn toggle(&self) -> Toggle {
        self.toggle
    }

    pub(crate) fn is_control(&self) -> bool {
        self.kind == EndpointType::Control
    }

    pub(crate) fn is_isochronous(&self) -> bool {
        matches!(self.kind, EndpointType::Isochronous { .. })
    }

    pub(crate) fn is_periodic(&self) -> bool {
        matches!(self.kind, EndpointType::Interrupt | EndpointType::Isochronous { .. })
    }

    /// Does `address` name this endpoint?
    ///
    /// Control endpoints answer to both directions.
    pub(crate) fn answers_to(&self, address: EndpointAddress) -> bool {
        if self.is_control() {
            self.address.index() == address.index()
        } else {
            self.address == address
        }
    }

    pub(crate) fn reset_toggle(&mut self) {
        self.toggle = Toggle::Data0;
    }

    pub(crate) fn clear_errors(&mut self) {
        self.status.remove(EndpointStatus::STALLED | EndpointStatus::ERROR);
        self.error_count = 0;
        self.error = None;
    }

    /// Enable NAK counting with `limit`, or disable it
    pub(crate) fn set_nak_timeout(&mut self, limit: Option<u16>) {
        match limit {
            Some(limit) => {
                self.status.insert(EndpointStatus::NAK_TIMEOUT);
                self.nak_limit = limit;
            }
            None => self.status.remove(EndpointStatus::NAK_TIMEOUT),
        }
    }

    /// Advance the interval countdown by one frame
    pub(crate) fn tick(&mut self) {
        self.countdown = self.countdown.saturating_sub(1);
    }

    pub(crate) fn is_due(&self) -> bool {
        !self.is_periodic() || self.countdown == 0
    }

    pub(crate) fn restart_interval(&mut self) {
        self.countdown = self.interval;
    }
}

/// Fixed-size storage for endpoint records
///
/// Slot zero always holds the default control endpoint while a device
/// is attached. When a record is dropped, the caller's buffer it held is
/// parked until the caller takes it back.
pub struct EndpointTable {
    slots: [Option<Endpoint>; MAX_ENDPOINTS],
    parked: [Option<(EndpointAddress, Buffer)>; MAX_ENDPOINTS],
}

impl EndpointTable {
    pub(crate) fn new() -> Self {
        EndpointTable {
            slots: core::array::from_fn(|_| None),
            parked: core::array::from_fn(|_| None),
        }
    }

    /// Store a record, returning its slot
    pub(crate) fn insert(&mut self, endpoint: Endpoint) -> Option<usize> {
        let slot = self.slots.iter().position(Option::is_none)?;
        self.slots[slot] = Some(endpoint);
        Some(slot)
    }

    pub(crate) fn set_control(&mut self, endpoint: Endpoint) {
        self.slots[0] = Some(endpoint);
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&Endpoint> {
        self.slots.get(slot)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut Endpoint> {
        self.slots.get_mut(slot)?.as_mut()
    }

    pub(crate) fn control_mut(&mut self) -> Option<&mut Endpoint> {
        self.get_mut(0)
    }

    /// Drop every record except the default control endpoint
    pub(crate) fn release_configuration(&mut self) {
        (1..MAX_ENDPOINTS).for_each(|slot| self.remove(slot));
    }

    pub(crate) fn clear(&mut self) {
        (0..MAX_ENDPOINTS).for_each(|slot| self.remove(slot));
    }

    fn remove(&mut self, slot: usize) {
        let Some(mut ep) = self.slots[slot].take() else {
            return;
        };
        let Some(buffer) = ep.abandon_lease() else {
            return;
        };
        match self.parked.iter_mut().find(|parked| parked.is_none()) {
            Some(free) => *free = Some((ep.address, buffer)),
            None => {
                warn!("Dropping the buffer of endpoint {=u8:#X}", u8::from(ep.address));
            }
        }
    }

    /// Take back the buffer of a dropped record for `address`
    pub(crate) fn take_parked(&mut self, address: EndpointAddress) -> Option<Buffer> {
        let parked = self.parked.iter_mut().find(|parked| {
            parked.as_ref().is_some_and(|(parked, _)| {
                *parked == address || (parked.index() == 0 && address.index() == 0)
            })
        })?;
        parked.take().map(|(_, buffer)| buffer)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Endpoint)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, ep)| Some((slot, ep.as_mut()?)))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &Endpoint)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, ep)| Some((slot, ep.as_ref()?)))
    }
}
