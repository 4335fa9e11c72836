//! The task loop, and the host state machine
//!
//! Each call to [`Host::tasks`] takes at most one step. Timed waits are
//! counted in ticks, so the loop never blocks.

use super::{Host, HostFlags};
use crate::{
    buffer::Buffer,
    client::{
        default_answer, AppEvent, ApplicationHandler, DeviceEvent, DriverTable, TplEntry, TplFlags,
    },
    descriptor::{ConfigurationHeader, DeviceDescriptor, HUB_CLASS},
    device::{
        ConfigurationNode, Device, DeviceFlags, LoadError, DEVICE_ADDRESS, MAX_CONFIGURATIONS,
    },
    endpoint::{Client, Endpoint},
    error::{HoldReason, TransferError},
    request::{DeviceRequest, FEATURE_A_HNP_SUPPORT},
    state::{
        Addressing, Attached, Command, Configuring, Delay, Detached, HostState, Holding, Reset,
        Running, Select, SetConfiguration,
    },
    transfer::TransferStatus,
    Peripheral,
};

/// Device classes that defer to interface classes
const INTERFACE_DEFINED_CLASSES: [u8; 2] = [0x00, 0xEF];

/// Where a host command keeps its buffer between tries
#[derive(Debug, Clone, Copy)]
enum Scratch {
    DeviceDescriptor,
    ConfigurationHeader,
    Configuration,
}

impl Scratch {
    fn of(self, device: &mut Device) -> &mut Option<Buffer> {
        match self {
            Scratch::DeviceDescriptor => &mut device.raw_descriptor,
            Scratch::ConfigurationHeader => &mut device.scratch,
            Scratch::Configuration => &mut device.pending,
        }
    }
}

/// Send an application event, or assume the default answer
pub(super) fn notify_app(
    app: &mut Option<&mut dyn ApplicationHandler>,
    address: u8,
    event: AppEvent<'_>,
) -> bool {
    match app {
        Some(app) => app.event(address, event),
        None => default_answer(&event),
    }
}

/// The first class entry that matches, and that the application doesn't override
fn find_class_driver(
    tpl: &[TplEntry],
    drivers: &DriverTable<'_>,
    app: &mut Option<&mut dyn ApplicationHandler>,
    address: u8,
    (class, subclass, protocol): (u8, u8, u8),
) -> Option<TplEntry> {
    tpl.iter()
        .filter(|entry| {
            entry.matches_class(class, subclass, protocol) && drivers.contains(entry.driver)
        })
        .find(|entry| !notify_app(app, address, AppEvent::OverrideClientDriverSelection(entry)))
        .copied()
}

impl<P: Peripheral, const EVENTS: usize> Host<'_, P, EVENTS> {
    /// Run the host's task loop
    ///
    /// Delivers queued transfer events to client drivers and the
    /// application, then advances enumeration. Call this regularly from
    /// thread mode; there's no minimum rate, but timed waits only end
    /// when this runs.
    pub fn tasks(&mut self) {
        self.dispatch_events();
        if self.events.take_overflow() && self.device.is_some() {
            warn!("Event queue overflow; holding the device");
            self.hold(HoldReason::EventQueueOverflow);
        }
        if self.flags.contains(HostFlags::DETACH) {
            self.handle_detach();
        }

        let before = self.state;
        match self.state {
            HostState::Detached(step) => self.detached(step),
            HostState::Attached(step) => self.attached(step),
            HostState::Addressing(step) => self.addressing(step),
            HostState::Configuring(step) => self.configuring(step),
            HostState::Running(step) => self.running_step(step),
            HostState::Holding(step, reason) => self.holding(step, reason),
        }
        if self.state != before {
            trace!("STATE {=u16:#X}", self.state.code());
        }
    }

    fn dispatch_events(&mut self) {
        while let Some(event) = self.events.pop() {
            match event.client {
                Client::Driver(id) => {
                    self.drivers
                        .event(id, event.address, DeviceEvent::Transfer(event.transfer));
                }
                Client::Application => {
                    notify_app(&mut self.app, event.address, AppEvent::Transfer(event.transfer));
                }
                Client::Host => {}
            }
        }
    }

    fn handle_detach(&mut self) {
        self.flags.remove(HostFlags::DETACH);
        if matches!(self.state, HostState::Detached(_)) && self.device.is_none() {
            return;
        }
        debug!("DETACH");
        self.detach_device();
        self.state = HostState::Detached(Detached::Initialize);
    }

    fn hold(&mut self, reason: HoldReason) {
        if !matches!(self.state, HostState::Holding(..)) {
            self.state = HostState::Holding(Holding::Init, reason);
        }
    }

    fn detached(&mut self, step: Detached) {
        match step {
            Detached::Initialize => {
                if self.flags.contains(HostFlags::ENABLED) {
                    self.peripheral.set_sof(false);
                    self.state = HostState::Detached(Detached::WaitForPower);
                }
            }
            Detached::WaitForPower => {
                if !self.flags.contains(HostFlags::POWER_GOOD) {
                    return;
                }
                let current_ma = self.config.initial_vbus_current_ma;
                let request = AppEvent::VbusRequestPower { port: 0, current_ma };
                if notify_app(&mut self.app, 0, request) {
                    self.state = HostState::Detached(Detached::TurnOnPower);
                }
            }
            Detached::TurnOnPower => {
                self.peripheral.set_vbus(true);
                self.state = HostState::Detached(Detached::WaitForDevice);
            }
            Detached::WaitForDevice => {
                if self.flags.contains(HostFlags::ATTACH) {
                    debug!("ATTACH");
                    self.flags.remove(HostFlags::ATTACH | HostFlags::REMOTE_WAKEUP);
                    self.enumeration_tries = self.config.enumeration_tries();
                    self.state = HostState::Attached(Attached::Settle(Delay::Start));
                }
            }
        }
    }

    fn attached(&mut self, step: Attached) {
        match step {
            Attached::Settle(delay) => {
                let insert_time = self.config.insert_time_ms;
                if self.delay(delay, insert_time, |d| HostState::Attached(Attached::Settle(d))) {
                    self.state = HostState::Attached(Attached::ResetDevice(Reset::SetReset));
                }
            }
            Attached::ResetDevice(step) => self.reset(step),
            Attached::GetDeviceDescriptorSize(Command::Send) => {
                let size = DeviceDescriptor::LENGTH;
                let Some(buffer) = self.scratch_buffer(Scratch::DeviceDescriptor, size) else {
                    return self.hold(HoldReason::OutOfMemory);
                };
                let length = DeviceDescriptor::PREFIX_LENGTH as u16;
                self.send_command(DeviceRequest::get_device_descriptor(length), Some(buffer));
                self.state = HostState::Attached(Attached::GetDeviceDescriptorSize(Command::Wait));
            }
            Attached::GetDeviceDescriptorSize(Command::Wait) => {
                match self.finish_command(Some(Scratch::DeviceDescriptor)) {
                    None => {}
                    Some(Ok(count)) if count >= DeviceDescriptor::PREFIX_LENGTH => {
                        self.state = HostState::Attached(Attached::GetDeviceDescriptorSize(
                            Command::Complete,
                        ));
                    }
                    Some(_) => self.command_failed(HostState::Attached(
                        Attached::GetDeviceDescriptorSize(Command::Send),
                    )),
                }
            }
            Attached::GetDeviceDescriptorSize(Command::Complete) => {
                let max_packet_size = self
                    .device
                    .as_ref()
                    .and_then(|device| device.raw_descriptor.as_ref())
                    // Safety: the transfer is over.
                    .map(|buffer| {
                        DeviceDescriptor::parse_max_packet_size(unsafe { buffer.as_slice() })
                    });
                match max_packet_size {
                    Some(Ok(max_packet_size)) => {
                        debug!("EP0 MAX PACKET SIZE {=u8}", max_packet_size);
                        if let Some(ep0) = self.endpoints.control_mut() {
                            ep0.max_packet_size = max_packet_size as u16;
                        }
                        self.command_succeeded(HostState::Attached(
                            Attached::GetDeviceDescriptor(Command::Send),
                        ));
                    }
                    _ => self.command_failed(HostState::Attached(
                        Attached::GetDeviceDescriptorSize(Command::Send),
                    )),
                }
            }
            Attached::GetDeviceDescriptor(Command::Send) => {
                let size = DeviceDescriptor::LENGTH;
                let Some(buffer) = self.scratch_buffer(Scratch::DeviceDescriptor, size) else {
                    return self.hold(HoldReason::OutOfMemory);
                };
                let length = DeviceDescriptor::LENGTH as u16;
                self.send_command(DeviceRequest::get_device_descriptor(length), Some(buffer));
                self.state = HostState::Attached(Attached::GetDeviceDescriptor(Command::Wait));
            }
            Attached::GetDeviceDescriptor(Command::Wait) => {
                match self.finish_command(Some(Scratch::DeviceDescriptor)) {
                    None => {}
                    Some(Ok(count)) if count >= DeviceDescriptor::LENGTH => {
                        self.state =
                            HostState::Attached(Attached::GetDeviceDescriptor(Command::Complete));
                    }
                    Some(_) => self.command_failed(HostState::Attached(
                        Attached::GetDeviceDescriptor(Command::Send),
                    )),
                }
            }
            Attached::GetDeviceDescriptor(Command::Complete) => {
                let Some(device) = self.device.as_mut() else {
                    return;
                };
                let parsed = device
                    .raw_descriptor
                    .as_ref()
                    // Safety: the transfer is over.
                    .map(|buffer| DeviceDescriptor::parse(unsafe { buffer.as_slice() }));
                match parsed {
                    Some(Ok(descriptor)) => {
                        debug!(
                            "DEVICE {=u16:#06X}:{=u16:#06X} CLASS {=u8:#X}",
                            descriptor.vendor_id,
                            descriptor.product_id,
                            descriptor.class
                        );
                        device.descriptor = Some(descriptor);
                        self.command_succeeded(HostState::Attached(Attached::ValidateVidPid));
                    }
                    _ => self.command_failed(HostState::Attached(Attached::GetDeviceDescriptor(
                        Command::Send,
                    ))),
                }
            }
            Attached::ValidateVidPid => self.validate_device(),
        }
    }

    fn reset(&mut self, step: Reset) {
        match step {
            Reset::SetReset => {
                // A fresh device record; everything from the last try is released
                self.release_device();
                let low_speed = self.peripheral.is_low_speed();
                self.device = Some(Device::new(low_speed));
                self.endpoints.set_control(Endpoint::control(8, &self.config));
                self.peripheral.set_address(0, low_speed);
                self.peripheral.set_reset_signalling(true);
                self.start_delay(self.config.reset_time());
                self.state = HostState::Attached(Attached::ResetDevice(Reset::ResetWait));
            }
            Reset::ResetWait => {
                if self.delay_elapsed() {
                    self.peripheral.set_reset_signalling(false);
                    self.peripheral.set_sof(true);
                    self.state = HostState::Attached(Attached::ResetDevice(Reset::ResetRecovery));
                }
            }
            Reset::ResetRecovery => {
                self.start_delay(self.config.reset_recovery_ms);
                self.state = HostState::Attached(Attached::ResetDevice(Reset::RecoveryWait));
            }
            Reset::RecoveryWait => {
                if self.delay_elapsed() {
                    self.state = HostState::Attached(Attached::ResetDevice(Reset::Complete));
                }
            }
            Reset::Complete => {
                self.command_tries = self.config.command_tries();
                self.state = HostState::Attached(Attached::GetDeviceDescriptorSize(Command::Send));
            }
        }
    }

    /// Match the device against the targeted peripheral list
    fn validate_device(&mut self) {
        let tpl = self.tpl;
        let Some(descriptor) = self.device.as_ref().and_then(|device| device.descriptor) else {
            let retry = HostState::Attached(Attached::GetDeviceDescriptor(Command::Send));
            return self.command_failed(retry);
        };
        if descriptor.class == HUB_CLASS {
            warn!("Hubs aren't supported");
            return self.hold(HoldReason::UnsupportedHub);
        }

        let by_vid_pid = tpl
            .iter()
            .filter(|entry| {
                entry.matches_vid_pid(descriptor.vendor_id, descriptor.product_id)
                    && self.drivers.contains(entry.driver)
            })
            .find(|entry| {
                !notify_app(&mut self.app, 0, AppEvent::OverrideClientDriverSelection(entry))
            });
        let mut by_class = || {
            if INTERFACE_DEFINED_CLASSES.contains(&descriptor.class) {
                None
            } else {
                let class = (descriptor.class, descriptor.subclass, descriptor.protocol);
                find_class_driver(tpl, &self.drivers, &mut self.app, 0, class)
            }
        };

        let Some(device) = self.device.as_mut() else {
            return;
        };
        let mut device_level = false;
        match by_vid_pid.copied() {
            Some(entry) if entry.flags.contains(TplFlags::EP0_ONLY_CUSTOM_DRIVER) => {
                device.ep0_driver = Some(entry.driver);
                device.flags.insert(DeviceFlags::USE_EP0_DRIVER);
                device.requested_configuration = entry.initial_configuration();
                device.tpl_flags = entry.flags;
            }
            Some(entry) => {
                device.device_driver = Some(entry.driver);
                device.requested_configuration = entry.initial_configuration();
                device.tpl_flags = entry.flags;
                device_level = true;
            }
            None => {}
        }
        if !device_level {
            if let Some(entry) = by_class() {
                device.device_driver = Some(entry.driver);
                device.requested_configuration =
                    device.requested_configuration.or(entry.initial_configuration());
                device.tpl_flags |= entry.flags;
                device_level = true;
            }
        }
        if device_level {
            device.flags.insert(DeviceFlags::USE_DEVICE_CLIENT_DRIVER);
        } else if device.ep0_driver.is_none()
            && (!INTERFACE_DEFINED_CLASSES.contains(&descriptor.class)
                || !tpl.iter().any(|entry| entry.flags.contains(TplFlags::CLASS_DRIVER)))
        {
            // Nothing could claim the device, even per interface
            return self.hold(HoldReason::UnsupportedDevice);
        }
        if device.tpl_flags.contains(TplFlags::ALLOW_HNP) {
            device.flags.insert(DeviceFlags::ALLOW_HNP);
        }
        self.command_succeeded(HostState::Addressing(Addressing::SetDeviceAddress(Command::Send)));
    }

    fn addressing(&mut self, step: Addressing) {
        match step {
            Addressing::SetDeviceAddress(Command::Send) => {
                self.send_command(DeviceRequest::set_address(DEVICE_ADDRESS), None);
                self.state = HostState::Addressing(Addressing::SetDeviceAddress(Command::Wait));
            }
            Addressing::SetDeviceAddress(Command::Wait) => match self.finish_command(None) {
                None => {}
                Some(Ok(_)) => {
                    self.state =
                        HostState::Addressing(Addressing::SetDeviceAddress(Command::Complete));
                }
                Some(Err(_)) => self.command_failed(HostState::Addressing(
                    Addressing::SetDeviceAddress(Command::Send),
                )),
            },
            Addressing::SetDeviceAddress(Command::Complete) => {
                self.command_succeeded(HostState::Addressing(Addressing::Recovery(Delay::Start)));
            }
            Addressing::Recovery(delay) => {
                let recovery = self.config.set_address_recovery_ms;
                if self.delay(delay, recovery, |d| HostState::Addressing(Addressing::Recovery(d))) {
                    let Some(device) = self.device.as_mut() else {
                        return;
                    };
                    device.address = DEVICE_ADDRESS;
                    let low_speed = device.is_low_speed();
                    self.peripheral.set_address(DEVICE_ADDRESS, low_speed);
                    debug!("ADDRESS {=u8}", DEVICE_ADDRESS);
                    self.state = HostState::Configuring(Configuring::InitConfiguration);
                }
            }
        }
    }

    fn configuring(&mut self, step: Configuring) {
        match step {
            Configuring::InitConfiguration => {
                let configurations = self
                    .device
                    .as_ref()
                    .and_then(|device| device.descriptor)
                    .map_or(0, |descriptor| descriptor.num_configurations);
                if configurations == 0 {
                    return self.hold(HoldReason::InvalidConfiguration);
                }
                self.config_index = 0;
                self.command_succeeded(HostState::Configuring(
                    Configuring::GetConfigDescriptorSize(Command::Send),
                ));
            }
            Configuring::GetConfigDescriptorSize(Command::Send) => {
                let size = ConfigurationHeader::LENGTH;
                let Some(buffer) = self.scratch_buffer(Scratch::ConfigurationHeader, size) else {
                    return self.hold(HoldReason::OutOfMemory);
                };
                let request =
                    DeviceRequest::get_configuration_descriptor(self.config_index, size as u16);
                self.send_command(request, Some(buffer));
                self.state =
                    HostState::Configuring(Configuring::GetConfigDescriptorSize(Command::Wait));
            }
            Configuring::GetConfigDescriptorSize(Command::Wait) => {
                match self.finish_command(Some(Scratch::ConfigurationHeader)) {
                    None => {}
                    Some(Ok(count)) if count >= ConfigurationHeader::LENGTH => {
                        self.state = HostState::Configuring(Configuring::GetConfigDescriptorSize(
                            Command::Complete,
                        ));
                    }
                    Some(_) => self.command_failed(HostState::Configuring(
                        Configuring::GetConfigDescriptorSize(Command::Send),
                    )),
                }
            }
            Configuring::GetConfigDescriptorSize(Command::Complete) => {
                if self.configuration_header().is_none() {
                    return self.hold(HoldReason::InvalidConfiguration);
                }
                self.command_succeeded(HostState::Configuring(Configuring::GetConfigDescriptor(
                    Command::Send,
                )));
            }
            Configuring::GetConfigDescriptor(Command::Send) => {
                let Some(header) = self.configuration_header() else {
                    return self.hold(HoldReason::InvalidConfiguration);
                };
                let total_length = header.total_length as usize;
                let Some(buffer) = self.scratch_buffer(Scratch::Configuration, total_length) else {
                    return self.hold(HoldReason::OutOfMemory);
                };
                let (index, length) = (self.config_index, header.total_length);
                let request = DeviceRequest::get_configuration_descriptor(index, length);
                self.send_command(request, Some(buffer));
                self.state =
                    HostState::Configuring(Configuring::GetConfigDescriptor(Command::Wait));
            }
            Configuring::GetConfigDescriptor(Command::Wait) => {
                let total_length = self
                    .configuration_header()
                    .map_or(0, |header| header.total_length as usize);
                match self.finish_command(Some(Scratch::Configuration)) {
                    None => {}
                    Some(Ok(count)) if count >= total_length => {
                        self.state = HostState::Configuring(Configuring::GetConfigDescriptor(
                            Command::Complete,
                        ));
                    }
                    Some(_) => self.command_failed(HostState::Configuring(
                        Configuring::GetConfigDescriptor(Command::Send),
                    )),
                }
            }
            Configuring::GetConfigDescriptor(Command::Complete) => self.store_configuration(),
            Configuring::SelectConfiguration(Select::Select) => self.select_configuration(),
            Configuring::SelectConfiguration(Select::SendSetOtg) => {
                self.send_command(DeviceRequest::set_device_feature(FEATURE_A_HNP_SUPPORT), None);
                self.state = HostState::Configuring(Configuring::SelectConfiguration(
                    Select::WaitForSetOtg,
                ));
            }
            Configuring::SelectConfiguration(Select::WaitForSetOtg) => {
                match self.finish_command(None) {
                    None => {}
                    Some(Ok(_)) => {
                        self.state = HostState::Configuring(Configuring::SelectConfiguration(
                            Select::SetOtgComplete,
                        ));
                    }
                    Some(Err(_)) => self.command_failed(HostState::Configuring(
                        Configuring::SelectConfiguration(Select::SendSetOtg),
                    )),
                }
            }
            Configuring::SelectConfiguration(Select::SetOtgComplete) => {
                if let Some(device) = self.device.as_mut() {
                    device.flags.insert(DeviceFlags::CONFIGURED_OTG);
                }
                self.command_succeeded(HostState::Configuring(Configuring::SetConfiguration(
                    SetConfiguration::Send,
                )));
            }
            Configuring::SetConfiguration(step) => self.set_configuration(step),
        }
    }

    /// The header of the configuration descriptor being read
    fn configuration_header(&self) -> Option<ConfigurationHeader> {
        let buffer = self.device.as_ref()?.scratch.as_ref()?;
        // Safety: the header transfer is over.
        let header = ConfigurationHeader::parse(unsafe { buffer.as_slice() }).ok()?;
        (header.total_length as usize >= ConfigurationHeader::LENGTH).then_some(header)
    }

    /// Keep the configuration descriptor that was just read, and read the next one
    fn store_configuration(&mut self) {
        let index = self.config_index as usize;
        let Some(device) = self.device.as_mut() else {
            return;
        };
        let Some(buffer) = device.pending.take() else {
            return self.hold(HoldReason::InvalidConfiguration);
        };
        // Safety: the transfer is over.
        let value = match ConfigurationHeader::parse(unsafe { buffer.as_slice() }) {
            Ok(header) => header.value,
            Err(_) => return self.hold(HoldReason::InvalidConfiguration),
        };
        if let Some(node) = device.configurations.get_mut(index) {
            *node = Some(ConfigurationNode { value, buffer });
        }
        let count = device
            .descriptor
            .map_or(0, |descriptor| descriptor.num_configurations as usize)
            .min(MAX_CONFIGURATIONS);
        self.config_index += 1;
        if (self.config_index as usize) < count {
            self.command_succeeded(HostState::Configuring(Configuring::GetConfigDescriptorSize(
                Command::Send,
            )));
        } else {
            self.command_succeeded(HostState::Configuring(Configuring::SelectConfiguration(
                Select::Select,
            )));
        }
    }

    /// Pick a configuration, and build its interfaces and endpoints
    fn select_configuration(&mut self) {
        let Host {
            device,
            endpoints,
            config,
            tpl,
            drivers,
            app,
            ..
        } = self;
        let Some(device) = device.as_mut() else {
            return;
        };
        let address = device.address;
        let requested = device.requested_configuration;

        let mut selected = None;
        for index in 0..MAX_CONFIGURATIONS {
            let Some(node) = device.configurations[index].take() else {
                continue;
            };
            if requested.is_some_and(|value| value != node.value) {
                device.configurations[index] = Some(node);
                continue;
            }
            // Safety: stored configuration descriptors aren't transfer targets.
            let bytes = unsafe { node.buffer.as_slice() };
            let result = device.load_configuration(bytes, endpoints, config, |interface| {
                let class = (interface.class, interface.subclass, interface.protocol);
                find_class_driver(tpl, drivers, app, address, class).map(|entry| entry.driver)
            });
            device.configurations[index] = Some(node);
            match result {
                Err(LoadError::NoDriver) if requested.is_none() => continue,
                result => {
                    selected = Some(result);
                    break;
                }
            }
        }

        let loaded = match selected {
            Some(Ok(loaded)) => loaded,
            Some(Err(LoadError::Hold(reason))) => return self.hold(reason),
            Some(Err(LoadError::NoDriver)) => return self.hold(HoldReason::UnsupportedDevice),
            None if requested.is_some() => return self.hold(HoldReason::InvalidConfiguration),
            None => return self.hold(HoldReason::UnsupportedDevice),
        };

        let current_ma = loaded.power_ma;
        let request = AppEvent::VbusRequestPower { port: 0, current_ma };
        if current_ma > self.config.max_vbus_current_ma
            || !notify_app(&mut self.app, address, request)
        {
            warn!("Device needs {=u16} mA", current_ma);
            return self.hold(HoldReason::PowerRequirement);
        }
        let Some(device) = self.device.as_mut() else {
            return;
        };
        device.current_configuration = loaded.value;
        device.configuration_power_ma = current_ma;
        debug!("CONFIGURATION {=u8}", loaded.value);
        self.state = if loaded.hnp && device.flags.contains(DeviceFlags::ALLOW_HNP) {
            HostState::Configuring(Configuring::SelectConfiguration(Select::SendSetOtg))
        } else {
            HostState::Configuring(Configuring::SetConfiguration(SetConfiguration::Send))
        };
    }

    fn set_configuration(&mut self, step: SetConfiguration) {
        match step {
            SetConfiguration::Send => {
                let value = self.device.as_ref().map_or(0, |device| device.current_configuration);
                self.send_command(DeviceRequest::set_configuration(value), None);
                self.state =
                    HostState::Configuring(Configuring::SetConfiguration(SetConfiguration::Wait));
            }
            SetConfiguration::Wait => match self.finish_command(None) {
                None => {}
                Some(Ok(_)) => {
                    self.state = HostState::Configuring(Configuring::SetConfiguration(
                        SetConfiguration::Complete,
                    ));
                }
                Some(Err(_)) => self.command_failed(HostState::Configuring(
                    Configuring::SetConfiguration(SetConfiguration::Send),
                )),
            },
            SetConfiguration::Complete => {
                self.command_succeeded(HostState::Configuring(Configuring::SetConfiguration(
                    SetConfiguration::InitClientDrivers,
                )));
            }
            SetConfiguration::InitClientDrivers => {
                let Some(device) = self.device.as_ref() else {
                    return;
                };
                let (address, wanted) = (device.address, device.drivers());
                for id in wanted.iter() {
                    if !self.drivers.initialize(id, address) {
                        warn!("Driver {=u8} refused the device", id.0);
                        return self.hold(HoldReason::ClientInitError);
                    }
                    if let Some(device) = self.device.as_mut() {
                        device.initialized.insert(id);
                    }
                }
                for id in wanted.iter() {
                    self.drivers.event(id, address, DeviceEvent::Attach);
                }
                debug!("RUNNING");
                self.state = HostState::Running(Running::Normal);
            }
        }
    }

    fn running_step(&mut self, step: Running) {
        match step {
            Running::Normal => {
                self.flags.remove(HostFlags::REMOTE_WAKEUP);
            }
            Running::Suspend => {
                self.peripheral.set_sof(false);
                self.notify_drivers(DeviceEvent::Suspend);
                self.flags.remove(HostFlags::REMOTE_WAKEUP);
                debug!("SUSPENDED");
                self.state = HostState::Running(Running::Suspended);
            }
            Running::Suspended => {
                if self.flags.contains(HostFlags::REMOTE_WAKEUP) {
                    debug!("REMOTE WAKEUP");
                    self.flags.remove(HostFlags::REMOTE_WAKEUP);
                    self.state = HostState::Running(Running::Resume);
                }
            }
            Running::Resume => {
                self.peripheral.set_resume_signalling(true);
                self.start_delay(self.config.resume_time());
                self.state = HostState::Running(Running::ResumeWait);
            }
            Running::ResumeWait => {
                if self.delay_elapsed() {
                    self.peripheral.set_resume_signalling(false);
                    self.peripheral.set_sof(true);
                    self.state = HostState::Running(Running::ResumeRecovery);
                }
            }
            Running::ResumeRecovery => {
                self.start_delay(self.config.resume_recovery());
                self.state = HostState::Running(Running::ResumeRecoveryWait);
            }
            Running::ResumeRecoveryWait => {
                if self.delay_elapsed() {
                    self.state = HostState::Running(Running::ResumeComplete);
                }
            }
            Running::ResumeComplete => {
                self.notify_drivers(DeviceEvent::Resume);
                self.state = HostState::Running(Running::Normal);
            }
        }
    }

    fn holding(&mut self, step: Holding, reason: HoldReason) {
        match step {
            Holding::Init => {
                warn!("HOLDING {=u8}", reason as u8);
                for (_, ep) in self.endpoints.iter_mut() {
                    ep.terminate();
                }
                let address = self.device.as_ref().map_or(0, |device| device.address);
                notify_app(&mut self.app, address, AppEvent::Holding(reason));
                self.state = HostState::Holding(Holding::Hold, reason);
            }
            Holding::Hold => {}
        }
    }

    /// Start a control transfer on EP0 for the host itself
    fn send_command(&mut self, request: DeviceRequest, buffer: Option<Buffer>) {
        if let Some(ep0) = self.endpoints.control_mut() {
            ep0.client = Client::Host;
            ep0.clear_errors();
            ep0.start_control(request.to_bytes(), buffer, false);
        }
    }

    /// The outcome of the host's control transfer, once it's over
    ///
    /// Returns the transfer's buffer to `scratch`.
    fn finish_command(&mut self, scratch: Option<Scratch>) -> Option<Result<usize, TransferError>> {
        let ep0 = self.endpoints.control_mut()?;
        let result = match ep0.completion() {
            TransferStatus::Pending => return None,
            TransferStatus::Complete { byte_count } => Ok(byte_count),
            TransferStatus::Failed { error, .. } => Err(error),
        };
        let buffer = ep0.release_buffer();
        if let (Some(scratch), Some(device)) = (scratch, self.device.as_mut()) {
            *scratch.of(device) = buffer;
        }
        Some(result)
    }

    /// A buffer of at least `size` bytes for a host command
    ///
    /// Reuses the buffer of a previous try.
    fn scratch_buffer(&mut self, scratch: Scratch, size: usize) -> Option<Buffer> {
        let previous = scratch.of(self.device.as_mut()?).take();
        match previous {
            Some(buffer) if buffer.len() >= size => Some(buffer),
            _ => self.allocator.allocate(size),
        }
    }

    fn command_succeeded(&mut self, next: HostState) {
        self.command_tries = self.config.command_tries();
        self.state = next;
    }

    /// Try the command again, or the whole enumeration, or give up
    fn command_failed(&mut self, retry: HostState) {
        self.command_tries = self.command_tries.saturating_sub(1);
        if self.command_tries > 0 {
            self.state = retry;
            return;
        }
        self.enumeration_tries = self.enumeration_tries.saturating_sub(1);
        if self.enumeration_tries > 0 {
            debug!("Enumeration failed; resetting the device");
            self.state = HostState::Attached(Attached::ResetDevice(Reset::SetReset));
        } else {
            self.hold(HoldReason::CannotEnumerate);
        }
    }

    fn start_delay(&mut self, ms: u16) {
        self.deadline = self.ticks.wrapping_add(ms as u32);
    }

    fn delay_elapsed(&self) -> bool {
        self.ticks.wrapping_sub(self.deadline) < u32::MAX / 2
    }

    /// Step a timed wait; returns `true` once it's over
    fn delay(&mut self, delay: Delay, ms: u16, state: fn(Delay) -> HostState) -> bool {
        match delay {
            Delay::Start => {
                self.start_delay(ms);
                self.state = state(Delay::Wait);
                false
            }
            Delay::Wait => {
                if self.delay_elapsed() {
                    self.state = state(Delay::Done);
                }
                false
            }
            Delay::Done => true,
        }
    }
}
