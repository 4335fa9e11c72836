//! The attached device, its configurations and interfaces

use usb_device::endpoint::EndpointAddress;

use crate::{
    bd::MAX_BYTE_COUNT,
    buffer::Buffer,
    client::{DriverId, DriverSet, TplFlags},
    config::HostConfig,
    descriptor::{Descriptor, DescriptorError, DeviceDescriptor, Descriptors, InterfaceDescriptor},
    endpoint::{Client, Endpoint, EndpointTable},
    error::HoldReason,
};

/// The address the host assigns to the device
pub const DEVICE_ADDRESS: u8 = 1;
/// Configuration descriptors kept per device
pub const MAX_CONFIGURATIONS: usize = 4;
/// Interfaces per configuration
pub const MAX_INTERFACES: usize = 8;
/// Alternate settings per interface
pub const MAX_ALTERNATE_SETTINGS: usize = 4;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags : u8 {
        const LOW_SPEED = 1 << 0;
        /// The configuration carries an OTG descriptor
        const SUPPORTS_OTG = 1 << 1;
        /// HNP support was announced to the device
        const CONFIGURED_OTG = 1 << 2;
        const ALLOW_HNP = 1 << 3;
        /// One driver owns the whole device
        const USE_DEVICE_CLIENT_DRIVER = 1 << 4;
        /// A custom driver owns the default control endpoint
        const USE_EP0_DRIVER = 1 << 5;
    }
}

/// A configuration descriptor set, held in host memory
pub(crate) struct ConfigurationNode {
    pub(crate) value: u8,
    pub(crate) buffer: Buffer,
}

/// One alternate setting of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InterfaceSetting {
    pub(crate) alternate: u8,
    /// Endpoint table slots, one bit per slot
    pub(crate) endpoints: u32,
}

pub(crate) struct Interface {
    pub(crate) number: u8,
    /// Index into `settings`
    pub(crate) current: usize,
    pub(crate) settings: [Option<InterfaceSetting>; MAX_ALTERNATE_SETTINGS],
    pub(crate) driver: Option<DriverId>,
}

impl Interface {
    fn current_setting(&self) -> Option<&InterfaceSetting> {
        self.settings.get(self.current)?.as_ref()
    }
}

/// What the host needs from a configuration to select it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoadedConfiguration {
    pub(crate) value: u8,
    pub(crate) power_ma: u16,
    /// The device announced HNP support in an OTG descriptor
    pub(crate) hnp: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadError {
    /// No client driver wants any interface
    NoDriver,
    Hold(HoldReason),
}

impl From<DescriptorError> for LoadError {
    fn from(_: DescriptorError) -> Self {
        LoadError::Hold(HoldReason::InvalidConfiguration)
    }
}

/// The attached device
pub(crate) struct Device {
    pub(crate) address: u8,
    pub(crate) flags: DeviceFlags,
    pub(crate) descriptor: Option<DeviceDescriptor>,
    pub(crate) raw_descriptor: Option<Buffer>,
    /// Holds configuration descriptor headers during enumeration
    pub(crate) scratch: Option<Buffer>,
    /// The configuration descriptor being read
    pub(crate) pending: Option<Buffer>,
    pub(crate) configurations: [Option<ConfigurationNode>; MAX_CONFIGURATIONS],
    pub(crate) current_configuration: u8,
    pub(crate) configuration_power_ma: u16,
    /// Configuration chosen by the TPL, or by the application
    pub(crate) requested_configuration: Option<u8>,
    pub(crate) tpl_flags: TplFlags,
    pub(crate) device_driver: Option<DriverId>,
    pub(crate) ep0_driver: Option<DriverId>,
    pub(crate) interfaces: [Option<Interface>; MAX_INTERFACES],
    /// Drivers that were successfully initialized
    pub(crate) initialized: DriverSet,
}

impl Device {
    pub(crate) fn new(low_speed: bool) -> Self {
        Device {
            address: 0,
            flags: if low_speed {
                DeviceFlags::LOW_SPEED
            } else {
                DeviceFlags::empty()
            },
            descriptor: None,
            raw_descriptor: None,
            scratch: None,
            pending: None,
            configurations: Default::default(),
            current_configuration: 0,
            configuration_power_ma: 0,
            requested_configuration: None,
            tpl_flags: TplFlags::empty(),
            device_driver: None,
            ep0_driver: None,
            interfaces: Default::default(),
            initialized: DriverSet::default(),
        }
    }

    pub(crate) fn is_low_speed(&self) -> bool {
        self.flags.contains(DeviceFlags::LOW_SPEED)
    }

    /// Find the endpoint table slot for `address` in the active settings
    pub(crate) fn endpoint_slot(
        &self,
        address: EndpointAddress,
        endpoints: &EndpointTable,
    ) -> Option<usize> {
        if address.index() == 0 {
            return endpoints.get(0).map(|_| 0);
        }
        self.interfaces
            .iter()
            .flatten()
            .filter_map(Interface::current_setting)
            .flat_map(|setting| slots(setting.endpoints))
            .find(|&slot| endpoints.get(slot).is_some_and(|ep| ep.answers_to(address)))
    }

    /// Make `alternate` the current setting of `interface`
    ///
    /// Returns the endpoint slots of the new setting, or `None` if there's
    /// no such setting.
    pub(crate) fn select_interface_setting(&mut self, interface: u8, alternate: u8) -> Option<u32> {
        let interface = self
            .interfaces
            .iter_mut()
            .flatten()
            .find(|iface| iface.number == interface)?;
        let (index, setting) = interface
            .settings
            .iter()
            .enumerate()
            .find_map(|(index, setting)| {
                Some((index, (*setting)?)).filter(|(_, s)| s.alternate == alternate)
            })?;
        interface.current = index;
        Some(setting.endpoints)
    }

    /// The configuration node holding `value`
    pub(crate) fn configuration_index(&self, value: u8) -> Option<usize> {
        self.configurations
            .iter()
            .position(|node| node.as_ref().is_some_and(|node| node.value == value))
    }

    pub(crate) fn current_configuration_descriptor(&self) -> Option<&[u8]> {
        let index = self.configuration_index(self.current_configuration)?;
        let node = self.configurations[index].as_ref()?;
        // Safety: configuration descriptors aren't transfer targets once stored.
        Some(unsafe { node.buffer.as_slice() })
    }

    pub(crate) fn raw_descriptor(&self) -> Option<&[u8]> {
        self.descriptor?;
        // Safety: the device descriptor isn't a transfer target once parsed.
        self.raw_descriptor.as_ref().map(|buffer| unsafe { buffer.as_slice() })
    }

    /// Forget the interfaces of the active configuration
    pub(crate) fn clear_interfaces(&mut self) {
        self.interfaces.iter_mut().for_each(|iface| *iface = None);
    }

    /// The drivers that serve this device
    ///
    /// A device-level driver excludes all others.
    pub(crate) fn drivers(&self) -> DriverSet {
        let mut set = DriverSet::default();
        if self.flags.contains(DeviceFlags::USE_DEVICE_CLIENT_DRIVER) {
            if let Some(driver) = self.device_driver {
                set.insert(driver);
            }
            return set;
        }
        if let Some(driver) = self.ep0_driver {
            set.insert(driver);
        }
        for driver in self.interfaces.iter().flatten().filter_map(|iface| iface.driver) {
            set.insert(driver);
        }
        set
    }

    /// Build interfaces and endpoint records from a configuration descriptor set
    ///
    /// `class_driver` picks the driver for an interface when no device-level
    /// driver owns the device. Replaces the previous configuration's records.
    pub(crate) fn load_configuration(
        &mut self,
        bytes: &[u8],
        endpoints: &mut EndpointTable,
        config: &HostConfig,
        mut class_driver: impl FnMut(&InterfaceDescriptor) -> Option<DriverId>,
    ) -> Result<LoadedConfiguration, LoadError> {
        self.clear_interfaces();
        endpoints.release_configuration();

        let device_driver = self
            .flags
            .contains(DeviceFlags::USE_DEVICE_CLIENT_DRIVER)
            .then_some(self.device_driver)
            .flatten();
        let mut header = None;
        let mut hnp = false;
        let mut current: Option<(usize, usize)> = None;

        for descriptor in Descriptors::new(bytes) {
            match descriptor? {
                Descriptor::Configuration(h) => {
                    if header.replace(h).is_some() {
                        return Err(LoadError::Hold(HoldReason::InvalidConfiguration));
                    }
                }
                Descriptor::Otg(otg) => {
                    self.flags.insert(DeviceFlags::SUPPORTS_OTG);
                    hnp = otg.supports_hnp();
                }
                Descriptor::Interface(descriptor) => {
                    let index = match self.interfaces.iter().position(|iface| {
                        iface
                            .as_ref()
                            .is_some_and(|iface| iface.number == descriptor.number)
                    }) {
                        Some(index) => index,
                        None => {
                            let index = self
                                .interfaces
                                .iter()
                                .position(Option::is_none)
                                .ok_or(LoadError::Hold(HoldReason::ProcessingCapacity))?;
                            let driver = device_driver.or_else(|| class_driver(&descriptor));
                            self.interfaces[index] = Some(Interface {
                                number: descriptor.number,
                                current: 0,
                                settings: [None; MAX_ALTERNATE_SETTINGS],
                                driver,
                            });
                            index
                        }
                    };
                    let interface = self.interfaces[index]
                        .as_mut()
                        .ok_or(LoadError::Hold(HoldReason::InvalidConfiguration))?;
                    let setting = interface
                        .settings
                        .iter()
                        .position(Option::is_none)
                        .ok_or(LoadError::Hold(HoldReason::ProcessingCapacity))?;
                    interface.settings[setting] = Some(InterfaceSetting {
                        alternate: descriptor.alternate_setting,
                        endpoints: 0,
                    });
                    // Alternate setting zero is active after SET_CONFIGURATION
                    if descriptor.alternate_setting == 0 {
                        interface.current = setting;
                    }
                    current = Some((index, setting));
                }
                Descriptor::Endpoint(descriptor) => {
                    let (index, setting) =
                        current.ok_or(LoadError::Hold(HoldReason::InvalidConfiguration))?;
                    if descriptor.address.index() == 0
                        || descriptor.max_packet_size > MAX_BYTE_COUNT
                    {
                        return Err(LoadError::Hold(HoldReason::InvalidConfiguration));
                    }
                    let interface = self.interfaces[index]
                        .as_mut()
                        .ok_or(LoadError::Hold(HoldReason::InvalidConfiguration))?;
                    let client = interface.driver.map_or(Client::Application, Client::Driver);
                    let slot = endpoints
                        .insert(Endpoint::from_descriptor(&descriptor, client, config))
                        .ok_or(LoadError::Hold(HoldReason::ProcessingCapacity))?;
                    if let Some(setting) = interface.settings[setting].as_mut() {
                        setting.endpoints |= 1 << slot;
                    }
                }
                Descriptor::Other(_) => {}
            }
        }

        let header = header.ok_or(LoadError::Hold(HoldReason::InvalidConfiguration))?;
        if bytes.len() < header.total_length as usize {
            return Err(LoadError::Hold(HoldReason::InvalidConfiguration));
        }
        if self.drivers().is_empty() {
            return Err(LoadError::NoDriver);
        }
        Ok(LoadedConfiguration {
            value: header.value,
            power_ma: header.max_power_ma(),
            hnp,
        })
    }
}

/// Iterate the set bits of a slot mask
fn slots(mask: u32) -> impl Iterator<Item = usize> {
    (0..u32::BITS as usize).filter(move |slot| mask & (1 << slot) != 0)
}

const _: [(); 1] = [(); (crate::endpoint::MAX_ENDPOINTS <= u32::BITS as usize) as usize];
