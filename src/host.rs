//! The host controller core
//!
//! `Host` owns the peripheral, the endpoint table and the attached device.
//! Its API is split across three modules:
//!
//! - this module: construction, and the transfer API for client drivers
//!   and the application.
//! - `schedule`: the interrupt path. Completes transactions, and puts the
//!   next token on the bus.
//! - `enumeration`: the task loop. Delivers events, and advances the host
//!   state machine.

mod enumeration;
mod schedule;

use usb_device::{endpoint::EndpointAddress, endpoint::EndpointType, UsbDirection};

use crate::{
    bd::Bdt,
    buffer::{Allocator, Buffer, Checkpoint, HostMemory},
    client::{
        AppEvent, ApplicationHandler, ClientDriver, DeviceEvent, DriverId, DriverTable, TplEntry,
    },
    config::HostConfig,
    device::{Device, DeviceFlags, DEVICE_ADDRESS},
    endpoint::{Client, Endpoint, EndpointStatus, EndpointTable},
    error::{HostError, Rejected},
    event::{EventQueue, EVENT_QUEUE_DEPTH},
    isochronous::IsochronousBuffers,
    request::DeviceRequest,
    state::{Attached, Configuring, Detached, DeviceStatus, HostState, Reset, Running, Select},
    transfer::{TransferKind, TransferStatus},
    BusErrors, Interrupts, Peripheral, Pid,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct HostFlags : u8 {
        /// Set by `initialize`, cleared by `shutdown`
        const ENABLED = 1 << 0;
        /// VBUS may be switched on
        const POWER_GOOD = 1 << 1;
        const ATTACH = 1 << 2;
        const DETACH = 1 << 3;
        const REMOTE_WAKEUP = 1 << 4;
    }
}

/// A VBUS condition detected by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbusEvent {
    /// The root port draws too much current; power is removed
    Overcurrent,
    /// The root port may be powered again
    PowerAvailable,
}

/// The token on the bus
#[derive(Debug, Clone, Copy)]
struct InFlight {
    slot: usize,
    pid: Pid,
}

/// Per-frame scheduling budget
#[derive(Debug, Default, Clone, Copy)]
struct Frame {
    /// Endpoint slots that are done for this frame
    serviced: u32,
    transactions: u8,
}

/// A USB host
///
/// `EVENTS` is the depth of the queue that carries transfer events from
/// [`interrupt`](Host::interrupt) to [`tasks`](Host::tasks).
pub struct Host<'a, P: Peripheral, const EVENTS: usize = EVENT_QUEUE_DEPTH> {
    peripheral: P,
    config: HostConfig,
    tpl: &'a [TplEntry],
    drivers: DriverTable<'a>,
    app: Option<&'a mut dyn ApplicationHandler>,
    bdt: &'static Bdt,
    allocator: Allocator,
    /// Everything allocated after this belongs to the attached device
    checkpoint: Checkpoint,
    state: HostState,
    device: Option<Device>,
    endpoints: EndpointTable,
    events: EventQueue<EVENTS>,
    /// Milliseconds since initialization
    ticks: u32,
    /// End of the current timed wait, in ticks
    deadline: u32,
    in_flight: Option<InFlight>,
    frame: Frame,
    bulk_cursor: usize,
    command_tries: u8,
    enumeration_tries: u8,
    /// The configuration descriptor being read
    config_index: u8,
    flags: HostFlags,
    bus_errors: BusErrors,
}

impl<'a, P: Peripheral> Host<'a, P> {
    /// Create a host with the default event queue depth
    ///
    /// The host allocates descriptor and isochronous buffers from `memory`.
    /// `tpl` lists the devices that the host supports. Call
    /// [`initialize`](Host::initialize) to start the host.
    ///
    /// # Panics
    ///
    /// Panics if `memory` is already used by another host.
    pub fn new<const SIZE: usize>(
        peripheral: P,
        memory: &'static HostMemory<SIZE>,
        tpl: &'a [TplEntry],
        config: HostConfig,
    ) -> Self {
        Host::with_event_queue(peripheral, memory, tpl, config)
    }
}

impl<'a, P: Peripheral, const EVENTS: usize> Host<'a, P, EVENTS> {
    /// Create a host with an event queue of `EVENTS` entries
    ///
    /// # Panics
    ///
    /// Panics if `memory` is already used by another host.
    pub fn with_event_queue<const SIZE: usize>(
        peripheral: P,
        memory: &'static HostMemory<SIZE>,
        tpl: &'a [TplEntry],
        config: HostConfig,
    ) -> Self {
        let Some((bdt, allocator)) = memory.take() else {
            panic!("Host memory already taken");
        };
        let checkpoint = allocator.checkpoint();
        Host {
            peripheral,
            config,
            tpl,
            drivers: DriverTable::new(),
            app: None,
            bdt,
            allocator,
            checkpoint,
            state: HostState::Detached(Detached::Initialize),
            device: None,
            endpoints: EndpointTable::new(),
            events: EventQueue::new(),
            ticks: 0,
            deadline: 0,
            in_flight: None,
            frame: Frame::default(),
            bulk_cursor: 0,
            command_tries: 0,
            enumeration_tries: 0,
            config_index: 0,
            flags: HostFlags::empty(),
            bus_errors: BusErrors::empty(),
        }
    }

    /// Add a client driver
    ///
    /// `flags` are passed to the driver's
    /// [`initialize`](ClientDriver::initialize). Drivers are numbered in
    /// registration order; TPL entries refer to them by that [`DriverId`].
    pub fn register_driver(
        &mut self,
        driver: &'a mut dyn ClientDriver,
        flags: u32,
    ) -> Result<DriverId, HostError> {
        self.drivers.register(driver, flags).ok_or(HostError::DriverTableFull)
    }

    /// Receive application events
    ///
    /// Without a handler, VBUS power requests are granted, and client
    /// driver overrides are declined.
    pub fn set_application_handler(&mut self, handler: &'a mut dyn ApplicationHandler) {
        self.app = Some(handler);
    }

    /// Start the host, or restart it after [`shutdown`](Host::shutdown)
    ///
    /// Forgets any attached device without notifying its drivers.
    pub fn initialize(&mut self) {
        self.peripheral.set_bdt_address(self.bdt.as_ptr());
        self.peripheral.clear_interrupts(Interrupts::all());
        self.peripheral.clear_bus_errors(BusErrors::all());
        self.peripheral.enable_interrupts(Interrupts::all());
        self.release_device();
        self.events.clear();
        self.flags = HostFlags::ENABLED | HostFlags::POWER_GOOD;
        self.bus_errors = BusErrors::empty();
        self.state = HostState::Detached(Detached::Initialize);
        debug!("INITIALIZE");
    }

    /// Stop the host
    ///
    /// Detaches the device, and removes VBUS. The host stays idle until
    /// it's initialized again.
    pub fn shutdown(&mut self) {
        self.detach_device();
        self.peripheral.set_vbus(false);
        self.flags.remove(HostFlags::ENABLED | HostFlags::ATTACH);
        self.state = HostState::Detached(Detached::Initialize);
        debug!("SHUTDOWN");
    }

    /// Report a VBUS condition on the root port
    pub fn vbus_event(&mut self, event: VbusEvent) {
        match event {
            VbusEvent::Overcurrent => {
                warn!("VBUS OVERCURRENT");
                self.flags.remove(HostFlags::POWER_GOOD);
                self.detach_device();
                self.peripheral.set_vbus(false);
                self.state = HostState::Detached(Detached::Initialize);
            }
            VbusEvent::PowerAvailable => self.flags.insert(HostFlags::POWER_GOOD),
        }
    }

    /// The host state
    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    pub fn peripheral_mut(&mut self) -> &mut P {
        &mut self.peripheral
    }

    /// The status of the device at `address`
    ///
    /// The host supports one device, at [`DEVICE_ADDRESS`].
    pub fn device_status(&self, address: u8) -> Result<DeviceStatus, HostError> {
        if address != DEVICE_ADDRESS {
            return Err(HostError::UnknownDevice);
        }
        Ok(self.state.device_status())
    }

    /// The raw device descriptor
    pub fn device_descriptor(&self, address: u8) -> Result<&[u8], HostError> {
        self.device(address)?.raw_descriptor().ok_or(HostError::InvalidState)
    }

    /// The raw configuration descriptor set of the active configuration
    pub fn current_configuration_descriptor(&self, address: u8) -> Result<&[u8], HostError> {
        self.device(address)?
            .current_configuration_descriptor()
            .ok_or(HostError::InvalidState)
    }

    /// Does a single device-level driver serve the whole device?
    pub fn device_specific_client_driver(&self, address: u8) -> Result<bool, HostError> {
        Ok(self
            .device(address)?
            .flags
            .contains(DeviceFlags::USE_DEVICE_CLIENT_DRIVER))
    }

    /// Inspect an endpoint of the active configuration
    pub fn endpoint(&self, address: u8, endpoint: EndpointAddress) -> Result<&Endpoint, HostError> {
        let device = self.device(address)?;
        let slot = device
            .endpoint_slot(endpoint, &self.endpoints)
            .ok_or(HostError::EndpointNotFound)?;
        self.endpoints.get(slot).ok_or(HostError::EndpointNotFound)
    }

    /// Issue a request on the default control endpoint
    ///
    /// `data` is the data stage buffer, if the request has one. The data
    /// stage moves `min(wLength, data.len())` bytes. When the request
    /// finishes, `client` receives a transfer event; get `data` back with
    /// [`take_buffer`](Host::take_buffer).
    ///
    /// SET_CONFIGURATION is refused; use
    /// [`set_device_configuration`](Host::set_device_configuration).
    /// SET_INTERFACE and CLEAR_FEATURE(ENDPOINT_HALT) reset the DATA
    /// toggle of the affected endpoints when the request is issued.
    pub fn issue_device_request(
        &mut self,
        address: u8,
        request: DeviceRequest,
        data: Option<&'static mut [u8]>,
        client: Client,
    ) -> Result<(), Rejected> {
        if let Err(error) = self.running(address) {
            return Err(Rejected::new(error, data));
        }
        if request.is_set_configuration() {
            return Err(Rejected::new(HostError::IllegalRequest, data));
        }
        match self.endpoints.get(0) {
            None => return Err(Rejected::new(HostError::EndpointNotFound, data)),
            Some(ep0) if ep0.is_busy() || self.token_on_bus(0) => {
                return Err(Rejected::new(HostError::EndpointBusy, data))
            }
            Some(_) => {}
        }

        let Some(device) = self.device.as_mut() else {
            return Err(Rejected::new(HostError::UnknownDevice, data));
        };
        if let Some((interface, alternate)) = request.interface_selection() {
            if let Some(slots) = device.select_interface_setting(interface, alternate) {
                for (slot, ep) in self.endpoints.iter_mut() {
                    if slots & (1 << slot) != 0 {
                        ep.reset_toggle();
                    }
                }
            }
        }
        if let Some(halted) = request.cleared_halt() {
            if let Some(slot) = device.endpoint_slot(halted, &self.endpoints) {
                if let Some(ep) = self.endpoints.get_mut(slot) {
                    ep.reset_toggle();
                    ep.clear_errors();
                }
            }
        }

        let Some(ep0) = self.endpoints.control_mut() else {
            return Err(Rejected::new(HostError::EndpointNotFound, data));
        };
        ep0.client = client;
        ep0.clear_errors();
        ep0.start_control(request.to_bytes(), data.map(Buffer::from_static), true);
        Ok(())
    }

    /// Start a bulk or interrupt IN transfer into `data`
    ///
    /// The transfer ends when `data` is full, or on a short packet. An
    /// interrupt IN transfer that's NAK'd finishes with no data.
    pub fn read(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
        data: &'static mut [u8],
    ) -> Result<(), Rejected> {
        self.start_transfer(address, endpoint, UsbDirection::In, data)
    }

    /// Start a bulk or interrupt OUT transfer of `data`
    pub fn write(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
        data: &'static mut [u8],
    ) -> Result<(), Rejected> {
        self.start_transfer(address, endpoint, UsbDirection::Out, data)
    }

    fn start_transfer(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
        direction: UsbDirection,
        data: &'static mut [u8],
    ) -> Result<(), Rejected> {
        let ep = match self.transfer_endpoint(address, endpoint, direction) {
            Ok(ep) => ep,
            Err(error) => return Err(Rejected::new(error, Some(data))),
        };
        let kind = match (ep.kind, direction) {
            (EndpointType::Bulk, UsbDirection::In) => TransferKind::BulkRead,
            (EndpointType::Bulk, UsbDirection::Out) => TransferKind::BulkWrite,
            (EndpointType::Interrupt, UsbDirection::In) => TransferKind::InterruptRead,
            (EndpointType::Interrupt, UsbDirection::Out) => TransferKind::InterruptWrite,
            _ => return Err(Rejected::new(HostError::EndpointIllegalType, Some(data))),
        };
        ep.start(kind, Buffer::from_static(data), true);
        Ok(())
    }

    /// Start streaming an isochronous IN endpoint into its buffer set
    ///
    /// The stream runs until [`terminate_transfer`](Host::terminate_transfer).
    pub fn read_isochronous(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
    ) -> Result<(), HostError> {
        self.start_isochronous(address, endpoint, UsbDirection::In)
    }

    /// Start streaming an isochronous OUT endpoint from its buffer set
    pub fn write_isochronous(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
    ) -> Result<(), HostError> {
        self.start_isochronous(address, endpoint, UsbDirection::Out)
    }

    fn start_isochronous(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
        direction: UsbDirection,
    ) -> Result<(), HostError> {
        let ep = self.transfer_endpoint(address, endpoint, direction)?;
        if !ep.is_isochronous() {
            return Err(HostError::EndpointIllegalType);
        }
        if ep.isochronous.is_none() {
            return Err(HostError::NoBuffers);
        }
        ep.start_isochronous(match direction {
            UsbDirection::In => TransferKind::IsochronousRead,
            UsbDirection::Out => TransferKind::IsochronousWrite,
        });
        Ok(())
    }

    /// Allocate `count` buffers for an isochronous endpoint
    ///
    /// Each buffer holds one max-size packet. Replaces any previous set;
    /// the memory of a replaced set is reclaimed when the device detaches.
    pub fn create_isochronous_buffers(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
        count: usize,
    ) -> Result<(), HostError> {
        let slot = self.slot(address, endpoint)?;
        let on_bus = self.token_on_bus(slot);
        let Some(ep) = self.endpoints.get_mut(slot) else {
            return Err(HostError::EndpointNotFound);
        };
        if !ep.is_isochronous() {
            return Err(HostError::EndpointIllegalType);
        }
        if ep.is_busy() || on_bus {
            return Err(HostError::EndpointBusy);
        }
        let read = ep.address.direction() == UsbDirection::In;
        let size = ep.max_packet_size as usize;
        let buffers = IsochronousBuffers::allocate(&mut self.allocator, count, size, read)
            .ok_or(HostError::OutOfMemory)?;
        ep.isochronous = Some(buffers);
        Ok(())
    }

    /// Detach the buffer set from an isochronous endpoint
    pub fn destroy_isochronous_buffers(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
    ) -> Result<(), HostError> {
        let slot = self.slot(address, endpoint)?;
        let on_bus = self.token_on_bus(slot);
        let ep = self.endpoints.get_mut(slot).ok_or(HostError::EndpointNotFound)?;
        if ep.is_busy() || on_bus {
            return Err(HostError::EndpointBusy);
        }
        ep.isochronous = None;
        Ok(())
    }

    /// The buffer set of an isochronous endpoint
    ///
    /// Only touch the buffers that the set gives to the application.
    pub fn isochronous_buffers(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
    ) -> Result<&mut IsochronousBuffers, HostError> {
        let slot = self.slot(address, endpoint)?;
        self.endpoints
            .get_mut(slot)
            .ok_or(HostError::EndpointNotFound)?
            .isochronous
            .as_mut()
            .ok_or(HostError::NoBuffers)
    }

    /// The outcome of the last transfer on an endpoint
    ///
    /// Doesn't change until the endpoint's next transfer starts.
    pub fn transfer_is_complete(
        &self,
        address: u8,
        endpoint: EndpointAddress,
    ) -> Result<TransferStatus, HostError> {
        let slot = self.slot(address, endpoint)?;
        self.endpoints
            .get(slot)
            .map(Endpoint::completion)
            .ok_or(HostError::EndpointNotFound)
    }

    /// Get back the buffer of a finished transfer
    ///
    /// Returns `None` while the transfer is running, while the token of a
    /// terminated transfer is still on the bus, or if the buffer was already
    /// taken. Buffers of transfers that the device took with it when it
    /// detached, or that a reset dropped, can still be taken at
    /// [`DEVICE_ADDRESS`].
    pub fn take_buffer(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
    ) -> Option<&'static mut [u8]> {
        if let Ok(slot) = self.slot(address, endpoint) {
            if self.token_on_bus(slot) {
                return None;
            }
            if let Some(data) = self.endpoints.get_mut(slot).and_then(|ep| ep.take_buffer()) {
                return Some(data);
            }
        }
        if address != DEVICE_ADDRESS {
            return None;
        }
        let buffer = self.endpoints.take_parked(endpoint)?;
        // Safety: only leased buffers are parked, and their records are gone.
        Some(unsafe { buffer.into_static() })
    }

    /// Cancel the transfer on an endpoint
    ///
    /// Isochronous streams only stop this way. If the endpoint's token is on
    /// the bus, the endpoint stays busy, and keeps its buffer, until the
    /// token completes.
    pub fn terminate_transfer(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
    ) -> Result<(), HostError> {
        let slot = self.slot(address, endpoint)?;
        let ep = self.endpoints.get_mut(slot).ok_or(HostError::EndpointNotFound)?;
        ep.terminate();
        Ok(())
    }

    /// Clear the STALLED and ERROR flags of an endpoint
    ///
    /// Doesn't clear the halt on the device side; issue
    /// [`DeviceRequest::clear_endpoint_halt`] for that.
    pub fn clear_endpoint_errors(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
    ) -> Result<(), HostError> {
        let slot = self.slot(address, endpoint)?;
        self.endpoints
            .get_mut(slot)
            .ok_or(HostError::EndpointNotFound)?
            .clear_errors();
        Ok(())
    }

    /// Fail transfers after `limit` NAKs, or let them retry forever with `None`
    pub fn set_nak_timeout(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
        limit: Option<u16>,
    ) -> Result<(), HostError> {
        let slot = self.slot(address, endpoint)?;
        self.endpoints
            .get_mut(slot)
            .ok_or(HostError::EndpointNotFound)?
            .set_nak_timeout(limit);
        Ok(())
    }

    /// Switch the device to another configuration
    ///
    /// The host detaches the device's drivers, issues SET_CONFIGURATION, then
    /// initializes the drivers of the new configuration. No transfer may be
    /// running.
    pub fn set_device_configuration(&mut self, address: u8, value: u8) -> Result<(), HostError> {
        self.device(address)?;
        if self.state != HostState::Running(Running::Normal) {
            return Err(HostError::InvalidState);
        }
        if self.endpoints.iter().any(|(_, ep)| ep.is_busy()) {
            return Err(HostError::Busy);
        }
        self.notify_drivers(DeviceEvent::Detach);
        if let Some(device) = self.device.as_mut() {
            device.requested_configuration = Some(value);
            device.initialized = Default::default();
        }
        self.command_tries = self.config.command_tries();
        self.state = HostState::Configuring(Configuring::SelectConfiguration(Select::Select));
        Ok(())
    }

    /// Suspend the bus
    pub fn suspend_device(&mut self, address: u8) -> Result<(), HostError> {
        self.device(address)?;
        if self.state != HostState::Running(Running::Normal) {
            return Err(HostError::InvalidState);
        }
        self.state = HostState::Running(Running::Suspend);
        Ok(())
    }

    /// Resume a suspended bus
    pub fn resume_device(&mut self, address: u8) -> Result<(), HostError> {
        self.device(address)?;
        if self.state != HostState::Running(Running::Suspended) {
            return Err(HostError::InvalidState);
        }
        self.state = HostState::Running(Running::Resume);
        Ok(())
    }

    /// Reset the device, and enumerate it again
    ///
    /// This is the way out of [`Holding`](HostState::Holding).
    pub fn reset_device(&mut self, address: u8) -> Result<(), HostError> {
        self.device(address)?;
        self.notify_drivers(DeviceEvent::Detach);
        self.enumeration_tries = self.config.enumeration_tries();
        self.state = HostState::Attached(Attached::ResetDevice(Reset::SetReset));
        debug!("RESET DEVICE");
        Ok(())
    }

    /// The attached device, if it has `address`
    ///
    /// A device that's still enumerating answers to [`DEVICE_ADDRESS`] too.
    fn device(&self, address: u8) -> Result<&Device, HostError> {
        match &self.device {
            Some(device) if address == DEVICE_ADDRESS || address == device.address => Ok(device),
            _ => Err(HostError::UnknownDevice),
        }
    }

    /// Check that the device is running, and may take transfers
    fn running(&self, address: u8) -> Result<(), HostError> {
        self.device(address)?;
        match self.state {
            HostState::Running(_) => Ok(()),
            _ => Err(HostError::InvalidState),
        }
    }

    fn slot(&self, address: u8, endpoint: EndpointAddress) -> Result<usize, HostError> {
        self.device(address)?
            .endpoint_slot(endpoint, &self.endpoints)
            .ok_or(HostError::EndpointNotFound)
    }

    /// An idle, healthy endpoint in `direction`
    fn transfer_endpoint(
        &mut self,
        address: u8,
        endpoint: EndpointAddress,
        direction: UsbDirection,
    ) -> Result<&mut Endpoint, HostError> {
        self.running(address)?;
        let slot = self.slot(address, endpoint)?;
        let on_bus = self.token_on_bus(slot);
        let ep = self.endpoints.get_mut(slot).ok_or(HostError::EndpointNotFound)?;
        if !ep.is_control() && ep.address.direction() != direction {
            return Err(HostError::EndpointIllegalDirection);
        }
        if ep.is_busy() || on_bus {
            return Err(HostError::EndpointBusy);
        }
        if ep.status.contains(EndpointStatus::STALLED) {
            return Err(HostError::EndpointStalled);
        }
        if ep.status.contains(EndpointStatus::ERROR) {
            return Err(HostError::EndpointError);
        }
        Ok(ep)
    }

    /// Is the token of the endpoint in `slot` still on the bus?
    fn token_on_bus(&self, slot: usize) -> bool {
        self.in_flight.is_some_and(|token| token.slot == slot)
    }

    /// Send a device event to every initialized driver
    fn notify_drivers(&mut self, event: DeviceEvent) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        let address = device.address;
        for id in device.initialized.iter() {
            self.drivers.event(id, address, event);
        }
    }

    /// Forget the device, after telling its drivers and the application
    fn detach_device(&mut self) {
        if let Some(device) = self.device.as_ref() {
            let address = device.address;
            self.notify_drivers(DeviceEvent::Detach);
            enumeration::notify_app(&mut self.app, address, AppEvent::Detach);
            enumeration::notify_app(&mut self.app, address, AppEvent::VbusReleasePower { port: 0 });
        }
        self.release_device();
    }

    /// Drop all device state, and reclaim its memory
    fn release_device(&mut self) {
        self.device = None;
        self.endpoints.clear();
        self.in_flight = None;
        self.frame = Frame::default();
        // Safety: the device and the endpoints held every buffer allocated
        // after the checkpoint, and they're gone. Leased caller buffers
        // aren't pool memory; the endpoint table parks them.
        unsafe { self.allocator.restore(self.checkpoint) };
        self.peripheral.set_sof(false);
        self.peripheral.set_address(0, false);
    }
}
