//! A simulated controller, with one simulated device on its root port
//!
//! Tokens complete as soon as they're issued. Tests drive the host one
//! frame at a time with [`frame`].

extern crate std;

use std::vec::Vec;

use usb_device::UsbDirection;

use crate::{
    bd::{BufferDescriptor, Handshake},
    endpoint::Toggle,
    BusErrors, Host, Interrupts, Peripheral, Pid, Token,
};

/// How a simulated endpoint answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Nak,
    Stall,
    /// IN tokens receive this data; OUT tokens are acknowledged
    Data(&'static [u8]),
    /// IN tokens receive empty packets; OUT tokens are acknowledged
    Ack,
    /// Isochronous traffic; IN packets are filled to the token's length
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlStage {
    Idle,
    /// Sending `response` to the host
    DataIn { sent: usize },
    /// The next IN token is the status stage
    StatusIn,
}

pub struct SimDevice {
    pub attached: bool,
    /// An unresponsive device lets every token time out
    pub responsive: bool,
    pub address: u8,
    pending_address: Option<u8>,
    pub configuration: u8,
    pub device_descriptor: &'static [u8],
    pub configuration_descriptor: &'static [u8],
    /// Every SETUP packet the device received
    pub requests: Vec<[u8; 8]>,
    /// Indexed by endpoint number
    pub behaviour: [Behaviour; 16],
    toggles: [[Toggle; 2]; 16],
    stage: ControlStage,
    setup: [u8; 8],
    ep0_toggle: Toggle,
    /// Fills isochronous IN packets
    counter: u8,
}

impl SimDevice {
    pub fn new(device_descriptor: &'static [u8], configuration_descriptor: &'static [u8]) -> Self {
        SimDevice {
            attached: true,
            responsive: true,
            address: 0,
            pending_address: None,
            configuration: 0,
            device_descriptor,
            configuration_descriptor,
            requests: Vec::new(),
            behaviour: [Behaviour::Ack; 16],
            toggles: [[Toggle::Data0; 2]; 16],
            stage: ControlStage::Idle,
            setup: [0; 8],
            ep0_toggle: Toggle::Data1,
            counter: 0,
        }
    }

    fn reset(&mut self) {
        self.address = 0;
        self.pending_address = None;
        self.configuration = 0;
        self.toggles = [[Toggle::Data0; 2]; 16];
        self.stage = ControlStage::Idle;
    }

    /// Requests the device received with this `bRequest`
    pub fn requests_of(&self, request: u8) -> impl Iterator<Item = &[u8; 8]> + '_ {
        self.requests.iter().filter(move |setup| setup[1] == request)
    }

    /// The data stage of the current IN request; `None` stalls it
    fn response(&self) -> Option<&'static [u8]> {
        const STATUS: &[u8] = &[0, 0];
        match (self.setup[1], self.setup[3]) {
            (0x06, 0x01) => Some(self.device_descriptor),
            (0x06, 0x02) => Some(self.configuration_descriptor),
            (0x00, _) => Some(STATUS),
            _ => None,
        }
    }

    fn transaction(
        &mut self,
        address: u8,
        token: Token,
        bd: &BufferDescriptor,
    ) -> (Handshake, usize) {
        if !self.attached || !self.responsive || address != self.address {
            return (Handshake::Timeout, 0);
        }
        let (ptr, len) = bd.buffer();
        if token.endpoint == 0 {
            self.control(token.pid, ptr, len)
        } else {
            self.data(token, ptr, len)
        }
    }

    fn control(&mut self, pid: Pid, ptr: *mut u8, len: usize) -> (Handshake, usize) {
        match pid {
            Pid::Setup => {
                // Safety: the host armed the 8 byte SETUP packet.
                let setup = unsafe { core::slice::from_raw_parts(ptr, 8) };
                self.setup.copy_from_slice(setup);
                self.requests.push(self.setup);
                self.ep0_toggle = Toggle::Data1;
                let length = u16::from_le_bytes([self.setup[6], self.setup[7]]);
                let reads = UsbDirection::from(self.setup[0]) == UsbDirection::In;
                self.stage = if reads && length > 0 {
                    ControlStage::DataIn { sent: 0 }
                } else {
                    ControlStage::StatusIn
                };
                (Handshake::Ack, 8)
            }
            Pid::In => match self.stage {
                ControlStage::DataIn { sent } => {
                    let Some(response) = self.response() else {
                        return (Handshake::Stall, 0);
                    };
                    let length = u16::from_le_bytes([self.setup[6], self.setup[7]]) as usize;
                    let response = &response[..response.len().min(length)];
                    let count = len.min(response.len().saturating_sub(sent));
                    // Safety: the host armed `len` bytes, and count <= len.
                    unsafe {
                        core::ptr::copy_nonoverlapping(response[sent..].as_ptr(), ptr, count)
                    };
                    self.stage = ControlStage::DataIn { sent: sent + count };
                    let handshake = data_pid(self.ep0_toggle);
                    self.ep0_toggle = self.ep0_toggle.flip();
                    (handshake, count)
                }
                ControlStage::StatusIn => {
                    match (self.setup[0], self.setup[1]) {
                        (_, 0x05) => self.pending_address = Some(self.setup[2]),
                        (_, 0x09) => self.configuration = self.setup[2],
                        (_, 0x0B) => self.toggles = [[Toggle::Data0; 2]; 16],
                        // CLEAR_FEATURE(ENDPOINT_HALT)
                        (0x02, 0x01) => {
                            let endpoint = self.setup[4];
                            let direction = (endpoint & 0x80 != 0) as usize;
                            self.toggles[endpoint as usize & 0xF][direction] = Toggle::Data0;
                        }
                        _ => {}
                    }
                    if let Some(address) = self.pending_address.take() {
                        self.address = address;
                    }
                    self.stage = ControlStage::Idle;
                    (Handshake::Data1, 0)
                }
                ControlStage::Idle => (Handshake::Stall, 0),
            },
            // A data OUT packet, or the status stage of an IN request
            Pid::Out => {
                if matches!(self.stage, ControlStage::DataIn { .. }) {
                    self.stage = ControlStage::Idle;
                }
                (Handshake::Ack, len)
            }
        }
    }

    fn data(&mut self, token: Token, ptr: *mut u8, len: usize) -> (Handshake, usize) {
        let index = token.endpoint as usize & 0xF;
        let direction = (token.pid == Pid::In) as usize;
        match (self.behaviour[index], token.pid) {
            (Behaviour::Nak, _) => (Handshake::Nak, 0),
            (Behaviour::Stall, _) => (Handshake::Stall, 0),
            (Behaviour::Stream, Pid::In) => {
                self.counter = self.counter.wrapping_add(1);
                // Safety: the host armed `len` bytes.
                unsafe { core::ptr::write_bytes(ptr, self.counter, len) };
                (Handshake::Data0, len)
            }
            (Behaviour::Data(bytes), Pid::In) => {
                let count = len.min(bytes.len());
                // Safety: the host armed `len` bytes, and count <= len.
                unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, count) };
                let toggle = &mut self.toggles[index][direction];
                let handshake = data_pid(*toggle);
                *toggle = toggle.flip();
                (handshake, count)
            }
            (Behaviour::Ack, Pid::In) => {
                let toggle = &mut self.toggles[index][direction];
                let handshake = data_pid(*toggle);
                *toggle = toggle.flip();
                (handshake, 0)
            }
            (_, _) => (Handshake::Ack, len),
        }
    }
}

fn data_pid(toggle: Toggle) -> Handshake {
    match toggle {
        Toggle::Data0 => Handshake::Data0,
        Toggle::Data1 => Handshake::Data1,
    }
}

/// A controller whose tokens complete immediately
pub struct SimPeripheral {
    pub pending: Interrupts,
    pub enabled: Interrupts,
    pub bus_errors: BusErrors,
    pub vbus: bool,
    pub reset: bool,
    pub resume: bool,
    pub sof: bool,
    pub address: u8,
    pub low_speed: bool,
    pub bdt: *const (),
    pub device: SimDevice,
    pub tokens: Vec<Token>,
    /// The DATA toggle armed with each token
    pub toggles: Vec<Toggle>,
}

impl SimPeripheral {
    pub fn new(device: SimDevice) -> Self {
        SimPeripheral {
            pending: Interrupts::empty(),
            enabled: Interrupts::empty(),
            bus_errors: BusErrors::empty(),
            vbus: false,
            reset: false,
            resume: false,
            sof: false,
            address: 0,
            low_speed: false,
            bdt: core::ptr::null(),
            device,
            tokens: Vec::new(),
            toggles: Vec::new(),
        }
    }

    pub fn raise(&mut self, interrupts: Interrupts) {
        self.pending |= interrupts;
    }

    /// Pull the device off the root port
    pub fn unplug(&mut self) {
        self.device.attached = false;
        self.raise(Interrupts::DETACH);
    }
}

unsafe impl Peripheral for SimPeripheral {
    fn set_bdt_address(&mut self, bdt: *const ()) {
        self.bdt = bdt;
    }
    fn enable_interrupts(&mut self, interrupts: Interrupts) {
        self.enabled |= interrupts;
    }
    fn interrupts(&self) -> Interrupts {
        self.pending & self.enabled
    }
    fn clear_interrupts(&mut self, interrupts: Interrupts) {
        self.pending.remove(interrupts);
    }
    fn bus_errors(&self) -> BusErrors {
        self.bus_errors
    }
    fn clear_bus_errors(&mut self, errors: BusErrors) {
        self.bus_errors.remove(errors);
    }
    fn set_vbus(&mut self, on: bool) {
        if on && !self.vbus && self.device.attached {
            self.raise(Interrupts::ATTACH);
        }
        self.vbus = on;
    }
    fn set_reset_signalling(&mut self, on: bool) {
        if on {
            self.device.reset();
        }
        self.reset = on;
    }
    fn set_resume_signalling(&mut self, on: bool) {
        self.resume = on;
    }
    fn set_sof(&mut self, enable: bool) {
        self.sof = enable;
    }
    fn is_low_speed(&self) -> bool {
        self.low_speed
    }
    fn set_address(&mut self, address: u8, low_speed: bool) {
        self.address = address;
        self.low_speed = low_speed;
    }
    fn is_token_busy(&self) -> bool {
        false
    }
    fn issue_token(&mut self, token: Token, descriptor: &BufferDescriptor) {
        assert!(descriptor.is_owned_by_hardware());
        self.tokens.push(token);
        self.toggles.push(descriptor.data_toggle());
        let (handshake, count) = if self.vbus {
            self.device.transaction(self.address, token, descriptor)
        } else {
            (Handshake::Timeout, 0)
        };
        descriptor.complete(handshake, count);
        self.raise(Interrupts::TRANSFER_DONE);
    }
}

/// Service interrupts until none are pending
pub fn interrupts<const N: usize>(host: &mut Host<'_, SimPeripheral, N>) {
    while !host.peripheral().interrupts().is_empty() {
        host.interrupt();
    }
}

/// One millisecond: a tick, a start of frame if enabled, then the task loop
pub fn frame<const N: usize>(host: &mut Host<'_, SimPeripheral, N>) {
    let sof = host.peripheral().sof;
    let peripheral = host.peripheral_mut();
    peripheral.raise(Interrupts::TICK);
    if sof {
        peripheral.raise(Interrupts::SOF);
    }
    interrupts(host);
    host.tasks();
}

pub fn run<const N: usize>(host: &mut Host<'_, SimPeripheral, N>, frames: usize) {
    for _ in 0..frames {
        frame(host);
    }
}

/// A static buffer for a transfer
pub fn leak(len: usize) -> &'static mut [u8] {
    std::boxed::Box::leak(std::vec![0u8; len].into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::{frame, interrupts, leak, run, Behaviour, SimDevice, SimPeripheral};
    use crate::{
        client::{
            AppEvent, ApplicationHandler, ClientDriver, DeviceEvent, DriverId, TplEntry, TplFlags,
        },
        endpoint::Toggle,
        descriptor::tests::{CONFIGURATION, DEVICE},
        error::{HoldReason, HostError, TransferError},
        state::{Detached, DeviceStatus, HostState, Running},
        DeviceRequest, Host, HostConfig, HostMemory, Client, TransferStatus, VbusEvent,
    };
    use core::sync::atomic::{AtomicU32, Ordering};
    use usb_device::endpoint::EndpointAddress;

    const BULK_IN: u8 = 0x81;
    const BULK_OUT: u8 = 0x02;

    static ISOCHRONOUS_CONFIGURATION: [u8; 25] = [
        9, 2, 25, 0, 1, 1, 0, 0x80, 50, // configuration 1, 100 mA
        9, 4, 0, 0, 1, 0xFF, 0x01, 0x02, 0, // vendor interface
        7, 5, 0x81, 1, 16, 0, 1, // isochronous IN, every frame
    ];

    #[rustfmt::skip]
    const OTG_CONFIGURATION: [u8; 35] = [
        9, 2, 35, 0, 1, 1, 0, 0x80, 50, // configuration 1, 100 mA
        3, 9, 0x03, // OTG, SRP and HNP
        9, 4, 0, 0, 2, 0xFF, 0x01, 0x02, 0, // vendor interface
        7, 5, 0x81, 2, 64, 0, 0, // bulk IN
        7, 5, 0x02, 2, 64, 0, 0, // bulk OUT
    ];

    static HUB_DEVICE: [u8; 18] = {
        let mut device = DEVICE;
        device[4] = 0x09;
        device
    };

    static DEVICE_DESCRIPTOR: [u8; 18] = DEVICE;
    static CONFIGURATION_DESCRIPTOR: [u8; 32] = CONFIGURATION;

    #[derive(Default)]
    struct Counters {
        inits: AtomicU32,
        attach: AtomicU32,
        detach: AtomicU32,
        suspend: AtomicU32,
        resume: AtomicU32,
        transfers: AtomicU32,
        failures: AtomicU32,
        last_byte_count: AtomicU32,
    }

    impl Counters {
        fn get(counter: &AtomicU32) -> u32 {
            counter.load(Ordering::SeqCst)
        }
    }

    struct Driver<'a> {
        counters: &'a Counters,
        accept: bool,
    }

    impl<'a> Driver<'a> {
        fn new(counters: &'a Counters) -> Self {
            Driver { counters, accept: true }
        }
    }

    impl ClientDriver for Driver<'_> {
        fn initialize(&mut self, address: u8, _: u32, _: DriverId) -> bool {
            assert_eq!(address, 1);
            self.counters.inits.fetch_add(1, Ordering::SeqCst);
            self.accept
        }
        fn event(&mut self, _: u8, event: DeviceEvent) -> bool {
            let counter = match event {
                DeviceEvent::Attach => &self.counters.attach,
                DeviceEvent::Detach => &self.counters.detach,
                DeviceEvent::Suspend => &self.counters.suspend,
                DeviceEvent::Resume => &self.counters.resume,
                DeviceEvent::Transfer(transfer) => {
                    if transfer.error.is_some() {
                        self.counters.failures.fetch_add(1, Ordering::SeqCst);
                    }
                    self.counters
                        .last_byte_count
                        .store(transfer.byte_count as u32, Ordering::SeqCst);
                    &self.counters.transfers
                }
            };
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[derive(Default)]
    struct AppLog {
        power_requests: AtomicU32,
        detach: AtomicU32,
        transfers: AtomicU32,
        holds: AtomicU32,
    }

    struct App<'a> {
        log: &'a AppLog,
        /// Largest current the application grants, in mA
        budget_ma: u16,
    }

    impl ApplicationHandler for App<'_> {
        fn event(&mut self, _: u8, event: AppEvent<'_>) -> bool {
            match event {
                AppEvent::VbusRequestPower { current_ma, .. } => {
                    self.log.power_requests.fetch_add(1, Ordering::SeqCst);
                    return current_ma <= self.budget_ma;
                }
                AppEvent::Detach => self.log.detach.fetch_add(1, Ordering::SeqCst),
                AppEvent::Transfer(_) => self.log.transfers.fetch_add(1, Ordering::SeqCst),
                AppEvent::Holding(_) => self.log.holds.fetch_add(1, Ordering::SeqCst),
                AppEvent::VbusReleasePower { .. } | AppEvent::OverrideClientDriverSelection(_) => {
                    return false
                }
            };
            true
        }
    }

    fn vendor_device() -> SimPeripheral {
        SimPeripheral::new(SimDevice::new(&DEVICE_DESCRIPTOR, &CONFIGURATION_DESCRIPTOR))
    }

    fn ep(address: u8) -> EndpointAddress {
        EndpointAddress::from(address)
    }

    static VENDOR_TPL: [TplEntry; 1] =
        [TplEntry::vid_pid(0x04D8, 0x0001, DriverId(0)).with_configuration(1)];

    /// Enumerate the vendor device with one driver
    macro_rules! running_host {
        ($host:ident, $counters:ident, $peripheral:expr) => {
            static MEMORY: HostMemory<1024> = HostMemory::new();
            let $counters = Counters::default();
            let mut driver = Driver::new(&$counters);
            let mut $host = Host::new($peripheral, &MEMORY, &VENDOR_TPL, HostConfig::new());
            assert_eq!($host.register_driver(&mut driver, 0), Ok(DriverId(0)));
            $host.initialize();
            run(&mut $host, 1000);
            assert_eq!($host.state(), HostState::Running(Running::Normal));
        };
    }

    #[test]
    fn enumerates_vendor_device() {
        running_host!(host, counters, vendor_device());
        assert_eq!(Counters::get(&counters.inits), 1);
        assert_eq!(Counters::get(&counters.attach), 1);
        assert_eq!(host.device_status(1), Ok(DeviceStatus::Attached));
        assert_eq!(host.device_status(2), Err(HostError::UnknownDevice));
        assert_eq!(host.device_descriptor(1), Ok(&DEVICE[..]));
        assert_eq!(host.current_configuration_descriptor(1), Ok(&CONFIGURATION[..]));
        assert_eq!(host.device_specific_client_driver(1), Ok(true));

        let peripheral = host.peripheral();
        assert!(peripheral.vbus && peripheral.sof && !peripheral.reset);
        assert_eq!(peripheral.address, 1);
        let device = &peripheral.device;
        assert_eq!((device.address, device.configuration), (1, 1));
        assert_eq!(device.requests_of(0x05).count(), 1);
        assert_eq!(device.requests_of(0x09).count(), 1);
        assert_eq!(device.requests_of(0x09).next(), Some(&[0, 0x09, 1, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn class_drivers_claim_interfaces() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        static TPL: [TplEntry; 1] = [TplEntry::class(0xFF, 0x01, 0x02, DriverId(0))];
        let counters = Counters::default();
        let mut driver = Driver::new(&counters);
        let mut host = Host::new(vendor_device(), &MEMORY, &TPL, HostConfig::new());
        host.register_driver(&mut driver, 0).unwrap();
        host.initialize();
        run(&mut host, 1000);
        assert_eq!(host.state(), HostState::Running(Running::Normal));
        assert_eq!(host.device_specific_client_driver(1), Ok(false));
        assert_eq!(Counters::get(&counters.inits), 1);
        assert!(host.endpoint(1, ep(BULK_IN)).is_ok());
        assert_eq!(host.endpoint(1, ep(0x83)).err(), Some(HostError::EndpointNotFound));
    }

    #[test]
    fn bulk_read_and_write() {
        let mut peripheral = vendor_device();
        peripheral.device.behaviour[1] = Behaviour::Data(b"hello");
        running_host!(host, counters, peripheral);

        host.read(1, ep(BULK_IN), leak(64)).unwrap();
        assert_eq!(host.transfer_is_complete(1, ep(BULK_IN)), Ok(TransferStatus::Pending));
        assert!(host.take_buffer(1, ep(BULK_IN)).is_none());
        run(&mut host, 2);
        let status = host.transfer_is_complete(1, ep(BULK_IN));
        assert_eq!(status, Ok(TransferStatus::Complete { byte_count: 5 }));
        assert_eq!(host.transfer_is_complete(1, ep(BULK_IN)), status);
        assert_eq!(Counters::get(&counters.transfers), 1);
        assert_eq!(Counters::get(&counters.last_byte_count), 5);
        let data = host.take_buffer(1, ep(BULK_IN)).unwrap();
        assert_eq!(&data[..5], b"hello");
        assert!(host.take_buffer(1, ep(BULK_IN)).is_none());

        host.write(1, ep(BULK_OUT), leak(100)).unwrap();
        run(&mut host, 2);
        assert_eq!(
            host.transfer_is_complete(1, ep(BULK_OUT)),
            Ok(TransferStatus::Complete { byte_count: 100 })
        );
        assert_eq!(Counters::get(&counters.transfers), 2);
    }

    #[test]
    fn transfers_are_checked() {
        running_host!(host, counters, vendor_device());
        let rejected = host.read(1, ep(BULK_OUT), leak(8)).unwrap_err();
        assert_eq!(rejected.error, HostError::EndpointIllegalDirection);
        assert_eq!(rejected.buffer.map(|buffer| buffer.len()), Some(8));
        let rejected = host.write(1, ep(0x82), leak(8)).unwrap_err();
        assert_eq!(rejected.error, HostError::EndpointNotFound);
        let rejected = host.read(1, ep(0x80), leak(8)).unwrap_err();
        assert_eq!(rejected.error, HostError::EndpointIllegalType);
        assert_eq!(host.read(2, ep(BULK_IN), leak(8)).unwrap_err().error, HostError::UnknownDevice);

        host.read(1, ep(BULK_IN), leak(8)).unwrap();
        assert_eq!(host.read(1, ep(BULK_IN), leak(8)).unwrap_err().error, HostError::EndpointBusy);
        assert_eq!(host.set_device_configuration(1, 1), Err(HostError::Busy));
        assert_eq!(Counters::get(&counters.transfers), 0);
    }

    #[test]
    fn bulk_nak_timeout() {
        let mut peripheral = vendor_device();
        peripheral.device.behaviour[1] = Behaviour::Nak;
        running_host!(host, counters, peripheral);

        host.read(1, ep(BULK_IN), leak(64)).unwrap();
        run(&mut host, 10_000);
        assert_eq!(host.transfer_is_complete(1, ep(BULK_IN)), Ok(TransferStatus::Pending));
        run(&mut host, 10);
        assert_eq!(
            host.transfer_is_complete(1, ep(BULK_IN)),
            Ok(TransferStatus::Failed {
                error: TransferError::NakTimeout,
                byte_count: 0
            })
        );
        assert_eq!(Counters::get(&counters.failures), 1);

        assert_eq!(host.read(1, ep(BULK_IN), leak(8)).unwrap_err().error, HostError::EndpointError);
        host.clear_endpoint_errors(1, ep(BULK_IN)).unwrap();
        host.set_nak_timeout(1, ep(BULK_IN), None).unwrap();
        host.read(1, ep(BULK_IN), leak(8)).unwrap();
        run(&mut host, 20_000);
        assert_eq!(host.transfer_is_complete(1, ep(BULK_IN)), Ok(TransferStatus::Pending));
        host.terminate_transfer(1, ep(BULK_IN)).unwrap();
        assert!(matches!(
            host.transfer_is_complete(1, ep(BULK_IN)),
            Ok(TransferStatus::Failed {
                error: TransferError::Terminated,
                ..
            })
        ));
    }

    #[test]
    fn stalled_endpoint_needs_clearing() {
        running_host!(host, counters, vendor_device());
        host.write(1, ep(BULK_OUT), leak(8)).unwrap();
        run(&mut host, 2);
        assert_eq!(host.endpoint(1, ep(BULK_OUT)).unwrap().toggle(), Toggle::Data1);

        host.peripheral_mut().device.behaviour[2] = Behaviour::Stall;
        host.write(1, ep(BULK_OUT), leak(8)).unwrap();
        run(&mut host, 2);
        assert!(matches!(
            host.transfer_is_complete(1, ep(BULK_OUT)),
            Ok(TransferStatus::Failed {
                error: TransferError::Stall,
                ..
            })
        ));
        assert_eq!(Counters::get(&counters.failures), 1);
        let rejected = host.write(1, ep(BULK_OUT), leak(8)).unwrap_err();
        assert_eq!(rejected.error, HostError::EndpointStalled);

        host.peripheral_mut().device.behaviour[2] = Behaviour::Ack;
        let clear = DeviceRequest::clear_endpoint_halt(ep(BULK_OUT));
        host.issue_device_request(1, clear, None, Client::Driver(DriverId(0)))
            .unwrap();
        assert_eq!(host.endpoint(1, ep(BULK_OUT)).unwrap().toggle(), Toggle::Data0);
        run(&mut host, 2);
        host.write(1, ep(BULK_OUT), leak(8)).unwrap();
        run(&mut host, 2);
        assert_eq!(
            host.transfer_is_complete(1, ep(BULK_OUT)),
            Ok(TransferStatus::Complete { byte_count: 8 })
        );
        assert_eq!(host.peripheral().toggles.last(), Some(&Toggle::Data0));
    }

    #[test]
    fn set_interface_resets_toggles() {
        let mut peripheral = vendor_device();
        peripheral.device.behaviour[1] = Behaviour::Data(b"hello");
        running_host!(host, counters, peripheral);

        host.read(1, ep(BULK_IN), leak(64)).unwrap();
        run(&mut host, 2);
        assert_eq!(host.endpoint(1, ep(BULK_IN)).unwrap().toggle(), Toggle::Data1);
        assert!(host.take_buffer(1, ep(BULK_IN)).is_some());

        let select = DeviceRequest::set_interface(0, 0);
        host.issue_device_request(1, select, None, Client::Driver(DriverId(0)))
            .unwrap();
        assert_eq!(host.endpoint(1, ep(BULK_IN)).unwrap().toggle(), Toggle::Data0);
        run(&mut host, 2);
        assert_eq!(host.peripheral().device.requests_of(0x0B).count(), 1);

        // The device restarted at DATA0 too, so one token does it
        let tokens = host.peripheral().tokens.len();
        host.read(1, ep(BULK_IN), leak(64)).unwrap();
        run(&mut host, 2);
        assert_eq!(
            host.transfer_is_complete(1, ep(BULK_IN)),
            Ok(TransferStatus::Complete { byte_count: 5 })
        );
        let peripheral = host.peripheral();
        assert_eq!(peripheral.tokens.len(), tokens + 1);
        assert_eq!(peripheral.toggles.last(), Some(&Toggle::Data0));
        assert_eq!(Counters::get(&counters.failures), 0);
    }

    #[test]
    fn terminated_token_keeps_buffer() {
        let mut peripheral = vendor_device();
        peripheral.device.behaviour[1] = Behaviour::Data(b"hello");
        running_host!(host, counters, peripheral);

        host.read(1, ep(BULK_IN), leak(8)).unwrap();
        host.peripheral_mut().raise(crate::Interrupts::SOF);
        // Issues the token; its completion is still pending
        host.interrupt();
        assert!(host.peripheral().pending.contains(crate::Interrupts::TRANSFER_DONE));

        host.terminate_transfer(1, ep(BULK_IN)).unwrap();
        assert!(matches!(
            host.transfer_is_complete(1, ep(BULK_IN)),
            Ok(TransferStatus::Failed {
                error: TransferError::Terminated,
                ..
            })
        ));
        assert!(host.take_buffer(1, ep(BULK_IN)).is_none());
        let rejected = host.read(1, ep(BULK_IN), leak(8)).unwrap_err();
        assert_eq!(rejected.error, HostError::EndpointBusy);

        // The late completion goes nowhere
        interrupts(&mut host);
        assert_eq!(Counters::get(&counters.transfers), 0);
        let old = host.take_buffer(1, ep(BULK_IN)).unwrap();
        assert_eq!(&old[..5], b"hello");

        // The device already moved on to DATA1, so the first try mismatches
        host.read(1, ep(BULK_IN), leak(8)).unwrap();
        assert_eq!(host.transfer_is_complete(1, ep(BULK_IN)), Ok(TransferStatus::Pending));
        run(&mut host, 3);
        assert_eq!(
            host.transfer_is_complete(1, ep(BULK_IN)),
            Ok(TransferStatus::Complete { byte_count: 5 })
        );
        let new = host.take_buffer(1, ep(BULK_IN)).unwrap();
        assert_eq!(&new[..5], b"hello");
    }

    #[test]
    fn otg_device_learns_hnp_support() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        static OTG_CONFIGURATION_DESCRIPTOR: [u8; 35] = OTG_CONFIGURATION;
        static OTG_TPL: [TplEntry; 1] = [TplEntry::vid_pid(0x04D8, 0x0001, DriverId(0))
            .with_configuration(1)
            .with_flags(TplFlags::ALLOW_HNP)];
        let counters = Counters::default();
        let mut driver = Driver::new(&counters);
        let peripheral = SimPeripheral::new(SimDevice::new(
            &DEVICE_DESCRIPTOR,
            &OTG_CONFIGURATION_DESCRIPTOR,
        ));
        let mut host = Host::new(peripheral, &MEMORY, &OTG_TPL, HostConfig::new());
        host.register_driver(&mut driver, 0).unwrap();
        host.initialize();
        run(&mut host, 1000);
        assert_eq!(host.state(), HostState::Running(Running::Normal));

        let requests = &host.peripheral().device.requests;
        let hnp = requests
            .iter()
            .position(|setup| setup == &[0x00, 0x03, 0x04, 0, 0, 0, 0, 0])
            .unwrap();
        let configure = requests.iter().position(|setup| setup[1] == 0x09).unwrap();
        assert!(hnp < configure);
        assert_eq!(Counters::get(&counters.inits), 1);
    }

    #[test]
    fn otg_device_without_hnp_permission() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        static OTG_CONFIGURATION_DESCRIPTOR: [u8; 35] = OTG_CONFIGURATION;
        let counters = Counters::default();
        let mut driver = Driver::new(&counters);
        let peripheral = SimPeripheral::new(SimDevice::new(
            &DEVICE_DESCRIPTOR,
            &OTG_CONFIGURATION_DESCRIPTOR,
        ));
        let mut host = Host::new(peripheral, &MEMORY, &VENDOR_TPL, HostConfig::new());
        host.register_driver(&mut driver, 0).unwrap();
        host.initialize();
        run(&mut host, 1000);
        assert_eq!(host.state(), HostState::Running(Running::Normal));
        assert!(host.peripheral().device.requests_of(0x03).next().is_none());
    }

    #[test]
    fn application_control_requests() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        let log = AppLog::default();
        let mut app = App { log: &log, budget_ma: 500 };
        let counters = Counters::default();
        let mut driver = Driver::new(&counters);
        let mut host = Host::new(vendor_device(), &MEMORY, &VENDOR_TPL, HostConfig::new());
        host.register_driver(&mut driver, 0).unwrap();
        host.set_application_handler(&mut app);
        host.initialize();
        run(&mut host, 1000);
        assert_eq!(host.state(), HostState::Running(Running::Normal));
        // The port, then the configuration
        assert_eq!(Counters::get(&log.power_requests), 2);

        let rejected = host
            .issue_device_request(1, DeviceRequest::set_configuration(1), None, Client::Application)
            .unwrap_err();
        assert_eq!(rejected.error, HostError::IllegalRequest);

        let request = DeviceRequest::get_device_descriptor(18);
        host.issue_device_request(1, request, Some(leak(64)), Client::Application)
            .unwrap();
        let rejected = host
            .issue_device_request(1, request, Some(leak(64)), Client::Application)
            .unwrap_err();
        assert_eq!(rejected.error, HostError::EndpointBusy);
        run(&mut host, 2);
        assert_eq!(Counters::get(&log.transfers), 1);
        assert_eq!(
            host.transfer_is_complete(1, ep(0x80)),
            Ok(TransferStatus::Complete { byte_count: 18 })
        );
        let data = host.take_buffer(1, ep(0x00)).unwrap();
        assert_eq!(&data[..18], &DEVICE[..]);
    }

    #[test]
    fn hubs_are_held() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        let peripheral = SimPeripheral::new(SimDevice::new(&HUB_DEVICE, &CONFIGURATION_DESCRIPTOR));
        let mut host = Host::new(peripheral, &MEMORY, &VENDOR_TPL, HostConfig::new());
        host.initialize();
        run(&mut host, 1000);
        assert_eq!(host.device_status(1), Ok(DeviceStatus::Holding(HoldReason::UnsupportedHub)));
        assert!(host.peripheral().device.requests_of(0x05).next().is_none());
    }

    #[test]
    fn unmatched_devices_are_held() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        let mut host = Host::new(vendor_device(), &MEMORY, &[], HostConfig::new());
        host.initialize();
        run(&mut host, 1000);
        assert_eq!(
            host.device_status(1),
            Ok(DeviceStatus::Holding(HoldReason::UnsupportedDevice))
        );
    }

    #[test]
    fn configuration_exceeds_power_budget() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        let counters = Counters::default();
        let mut driver = Driver::new(&counters);
        let config = HostConfig {
            max_vbus_current_ma: 50,
            ..HostConfig::new()
        };
        let mut host = Host::new(vendor_device(), &MEMORY, &VENDOR_TPL, config);
        host.register_driver(&mut driver, 0).unwrap();
        host.initialize();
        run(&mut host, 1000);
        assert_eq!(
            host.device_status(1),
            Ok(DeviceStatus::Holding(HoldReason::PowerRequirement))
        );
        assert_eq!(Counters::get(&counters.inits), 0);
        assert!(host.peripheral().device.requests_of(0x09).next().is_none());
    }

    #[test]
    fn application_refuses_power() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        let log = AppLog::default();
        let mut app = App { log: &log, budget_ma: 99 };
        let mut host = Host::new(vendor_device(), &MEMORY, &VENDOR_TPL, HostConfig::new());
        host.set_application_handler(&mut app);
        host.initialize();
        run(&mut host, 100);
        assert_eq!(host.state(), HostState::Detached(Detached::WaitForPower));
        assert!(!host.peripheral().vbus);
        assert!(Counters::get(&log.power_requests) >= 1);
    }

    #[test]
    fn refused_client_driver() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        let counters = Counters::default();
        let mut driver = Driver {
            counters: &counters,
            accept: false,
        };
        let mut host = Host::new(vendor_device(), &MEMORY, &VENDOR_TPL, HostConfig::new());
        host.register_driver(&mut driver, 0).unwrap();
        host.initialize();
        run(&mut host, 1000);
        assert_eq!(
            host.device_status(1),
            Ok(DeviceStatus::Holding(HoldReason::ClientInitError))
        );
        assert_eq!(Counters::get(&counters.attach), 0);
    }

    #[test]
    fn unresponsive_device() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        let mut peripheral = vendor_device();
        peripheral.device.responsive = false;
        let config = HostConfig {
            transaction_retries: 3,
            ..HostConfig::new()
        };
        let mut host = Host::new(peripheral, &MEMORY, &VENDOR_TPL, config);
        host.initialize();
        run(&mut host, 2000);
        assert_eq!(
            host.device_status(1),
            Ok(DeviceStatus::Holding(HoldReason::CannotEnumerate))
        );
        // Three enumeration tries, three commands each, three transactions each
        let setups = host.peripheral().tokens.len();
        assert_eq!(setups, 27);

        // A held device gets no traffic
        run(&mut host, 100);
        assert_eq!(host.peripheral().tokens.len(), setups);
    }

    #[test]
    fn detach_notifies_clients() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        let log = AppLog::default();
        let mut app = App { log: &log, budget_ma: 500 };
        let counters = Counters::default();
        let mut driver = Driver::new(&counters);
        let mut host = Host::new(vendor_device(), &MEMORY, &VENDOR_TPL, HostConfig::new());
        host.register_driver(&mut driver, 0).unwrap();
        host.set_application_handler(&mut app);
        host.initialize();
        run(&mut host, 1000);
        assert_eq!(host.state(), HostState::Running(Running::Normal));

        host.read(1, ep(BULK_IN), leak(8)).unwrap();
        host.peripheral_mut().device.behaviour[1] = Behaviour::Nak;
        run(&mut host, 2);
        assert_eq!(host.transfer_is_complete(1, ep(BULK_IN)), Ok(TransferStatus::Pending));
        host.peripheral_mut().unplug();
        run(&mut host, 10);
        assert_eq!(host.device_status(1), Ok(DeviceStatus::Detached));
        assert_eq!(host.state(), HostState::Detached(Detached::WaitForDevice));
        assert_eq!(Counters::get(&counters.detach), 1);
        assert_eq!(Counters::get(&log.detach), 1);
        assert!(!host.peripheral().sof);
        assert_eq!(host.read(1, ep(BULK_IN), leak(8)).unwrap_err().error, HostError::UnknownDevice);

        // The unfinished read's buffer outlives the device
        assert_eq!(host.take_buffer(1, ep(BULK_IN)).map(|data| data.len()), Some(8));
        assert!(host.take_buffer(1, ep(BULK_IN)).is_none());
        assert!(host.take_buffer(2, ep(BULK_IN)).is_none());
    }

    #[test]
    fn event_queue_overflow_holds_device() {
        let mut peripheral = vendor_device();
        peripheral.device.behaviour[1] = Behaviour::Data(b"x");
        running_host!(host, counters, peripheral);

        for _ in 0..5 {
            host.read(1, ep(BULK_IN), leak(8)).unwrap();
            host.peripheral_mut().raise(crate::Interrupts::SOF);
            interrupts(&mut host);
            assert_eq!(
                host.transfer_is_complete(1, ep(BULK_IN)),
                Ok(TransferStatus::Complete { byte_count: 1 })
            );
        }
        frame(&mut host);
        assert_eq!(Counters::get(&counters.transfers), 4);
        assert_eq!(
            host.device_status(1),
            Ok(DeviceStatus::Holding(HoldReason::EventQueueOverflow))
        );
    }

    #[test]
    fn suspend_and_resume() {
        running_host!(host, counters, vendor_device());
        assert_eq!(host.resume_device(1), Err(HostError::InvalidState));
        host.suspend_device(1).unwrap();
        run(&mut host, 2);
        assert_eq!(host.device_status(1), Ok(DeviceStatus::Suspended));
        assert_eq!(Counters::get(&counters.suspend), 1);
        assert!(!host.peripheral().sof);

        host.resume_device(1).unwrap();
        run(&mut host, 5);
        assert!(host.peripheral().resume);
        run(&mut host, 50);
        assert!(!host.peripheral().resume && host.peripheral().sof);
        assert_eq!(host.device_status(1), Ok(DeviceStatus::Attached));
        assert_eq!(Counters::get(&counters.resume), 1);

        // Remote wakeup
        host.suspend_device(1).unwrap();
        run(&mut host, 2);
        host.peripheral_mut().raise(crate::Interrupts::RESUME);
        run(&mut host, 50);
        assert_eq!(host.device_status(1), Ok(DeviceStatus::Attached));
        assert_eq!(Counters::get(&counters.resume), 2);
    }

    #[test]
    fn overcurrent_removes_power() {
        running_host!(host, counters, vendor_device());
        host.vbus_event(VbusEvent::Overcurrent);
        assert!(!host.peripheral().vbus);
        assert_eq!(Counters::get(&counters.detach), 1);
        run(&mut host, 100);
        assert_eq!(host.state(), HostState::Detached(Detached::WaitForPower));

        host.vbus_event(VbusEvent::PowerAvailable);
        run(&mut host, 1000);
        assert_eq!(host.state(), HostState::Running(Running::Normal));
        assert_eq!(Counters::get(&counters.inits), 2);
    }

    #[test]
    fn change_configuration() {
        running_host!(host, counters, vendor_device());
        assert_eq!(host.set_device_configuration(1, 1), Ok(()));
        run(&mut host, 20);
        assert_eq!(host.state(), HostState::Running(Running::Normal));
        assert_eq!(Counters::get(&counters.detach), 1);
        assert_eq!(Counters::get(&counters.inits), 2);
        assert_eq!(Counters::get(&counters.attach), 2);
        assert_eq!(host.peripheral().device.requests_of(0x09).count(), 2);

        assert_eq!(host.set_device_configuration(1, 7), Ok(()));
        run(&mut host, 20);
        assert_eq!(
            host.device_status(1),
            Ok(DeviceStatus::Holding(HoldReason::InvalidConfiguration))
        );

        host.reset_device(1).unwrap();
        run(&mut host, 1000);
        assert_eq!(host.state(), HostState::Running(Running::Normal));
        assert_eq!(Counters::get(&counters.inits), 3);
    }

    #[test]
    fn isochronous_stream() {
        static MEMORY: HostMemory<1024> = HostMemory::new();
        static DESCRIPTOR: [u8; 18] = DEVICE;
        let mut peripheral =
            SimPeripheral::new(SimDevice::new(&DESCRIPTOR, &ISOCHRONOUS_CONFIGURATION));
        peripheral.device.behaviour[1] = Behaviour::Stream;
        let counters = Counters::default();
        let mut driver = Driver::new(&counters);
        let mut host = Host::new(peripheral, &MEMORY, &VENDOR_TPL, HostConfig::new());
        host.register_driver(&mut driver, 0).unwrap();
        host.initialize();
        run(&mut host, 1000);
        assert_eq!(host.state(), HostState::Running(Running::Normal));

        let iso = ep(0x81);
        assert_eq!(host.read_isochronous(1, iso), Err(HostError::NoBuffers));
        assert_eq!(host.read(1, iso, leak(16)).unwrap_err().error, HostError::EndpointIllegalType);
        host.create_isochronous_buffers(1, iso, 2).unwrap();
        host.read_isochronous(1, iso).unwrap();
        assert_eq!(host.create_isochronous_buffers(1, iso, 2), Err(HostError::EndpointBusy));

        run(&mut host, 10);
        assert_eq!(host.transfer_is_complete(1, iso), Ok(TransferStatus::Pending));
        assert_eq!(Counters::get(&counters.transfers), 2);
        assert_eq!(Counters::get(&counters.last_byte_count), 16);
        let buffers = host.isochronous_buffers(1, iso).unwrap();
        assert_eq!(buffers.overruns(), 8);
        assert_eq!(buffers.data(), Some(&[1u8; 16][..]));
        assert!(buffers.release(0));

        run(&mut host, 1);
        assert_eq!(Counters::get(&counters.transfers), 3);
        assert_eq!(host.isochronous_buffers(1, iso).unwrap().data(), Some(&[2u8; 16][..]));

        host.terminate_transfer(1, iso).unwrap();
        assert_eq!(host.destroy_isochronous_buffers(1, iso), Ok(()));
        assert_eq!(host.read_isochronous(1, iso), Err(HostError::NoBuffers));
    }
}
