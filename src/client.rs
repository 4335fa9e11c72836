//! Client drivers, the targeted peripheral list, and the application handler

use crate::{error::HoldReason, event::TransferEvent};

/// Most client drivers a host can register
pub const MAX_CLIENT_DRIVERS: usize = 8;

/// Identifies a registered client driver
///
/// Drivers are numbered in registration order, starting at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverId(pub u8);

/// A device-level event for a client driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device is configured, and the driver may start transfers
    Attach,
    Detach,
    Suspend,
    Resume,
    Transfer(TransferEvent),
}

/// A class or vendor driver
///
/// `initialize` may be called more than once for the same device, for
/// example after the configuration changes. It must be idempotent.
pub trait ClientDriver: Send {
    /// Prepare to serve the device at `address`
    ///
    /// `flags` are the flags the driver was registered with. Returns
    /// `false` if the driver can't support the device.
    fn initialize(&mut self, address: u8, flags: u32, id: DriverId) -> bool;

    /// Handle an event for the device at `address`
    ///
    /// Returns `true` if the driver handled the event.
    fn event(&mut self, address: u8, event: DeviceEvent) -> bool;
}

/// An event for the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent<'a> {
    /// A device needs VBUS current, in mA; return `false` to refuse
    VbusRequestPower { port: u8, current_ma: u16 },
    VbusReleasePower { port: u8 },
    /// The host is about to use this TPL entry; return `true` to skip it
    OverrideClientDriverSelection(&'a TplEntry),
    /// The device was held; see the reason
    Holding(HoldReason),
    Detach,
    /// A transfer the application requested finished
    Transfer(TransferEvent),
}

/// Receives application events
pub trait ApplicationHandler: Send {
    fn event(&mut self, address: u8, event: AppEvent<'_>) -> bool;
}

/// The answer the host assumes when there's no application handler
pub(crate) fn default_answer(event: &AppEvent<'_>) -> bool {
    !matches!(event, AppEvent::OverrideClientDriverSelection(_))
}

bitflags::bitflags! {
    /// Targeted peripheral list entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TplFlags : u8 {
        /// The device may become host through HNP
        const ALLOW_HNP = 0x01;
        /// Match on class, subclass and protocol, not on VID and PID
        const CLASS_DRIVER = 0x02;
        /// Use the entry's configuration
        const SET_CONFIGURATION = 0x04;
        const IGNORE_PROTOCOL = 0x08;
        const IGNORE_SUBCLASS = 0x10;
        const IGNORE_CLASS = 0x20;
        const IGNORE_PID = 0x40;
        /// The driver only takes over the default control endpoint; the
        /// interfaces still get class drivers
        const EP0_ONLY_CUSTOM_DRIVER = 0x80;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMatch {
    VidPid { vendor_id: u16, product_id: u16 },
    Class { class: u8, subclass: u8, protocol: u8 },
}

/// One entry in the targeted peripheral list (TPL)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TplEntry {
    pub device: DeviceMatch,
    /// Configuration value to select, with [`TplFlags::SET_CONFIGURATION`]
    pub configuration: u8,
    pub driver: DriverId,
    pub flags: TplFlags,
}

impl TplEntry {
    pub const fn vid_pid(vendor_id: u16, product_id: u16, driver: DriverId) -> Self {
        TplEntry {
            device: DeviceMatch::VidPid { vendor_id, product_id },
            configuration: 0,
            driver,
            flags: TplFlags::empty(),
        }
    }

    pub const fn class(class: u8, subclass: u8, protocol: u8, driver: DriverId) -> Self {
        TplEntry {
            device: DeviceMatch::Class {
                class,
                subclass,
                protocol,
            },
            configuration: 0,
            driver,
            flags: TplFlags::CLASS_DRIVER,
        }
    }

    /// Select configuration `value` for the device
    pub const fn with_configuration(mut self, value: u8) -> Self {
        self.configuration = value;
        self.flags = self.flags.union(TplFlags::SET_CONFIGURATION);
        self
    }

    pub const fn with_flags(mut self, flags: TplFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    pub(crate) fn initial_configuration(&self) -> Option<u8> {
        self.flags
            .contains(TplFlags::SET_CONFIGURATION)
            .then_some(self.configuration)
    }

    pub fn matches_vid_pid(&self, vendor_id: u16, product_id: u16) -> bool {
        match self.device {
            DeviceMatch::VidPid {
                vendor_id: vid,
                product_id: pid,
            } if !self.flags.contains(TplFlags::CLASS_DRIVER) => {
                vid == vendor_id && (self.flags.contains(TplFlags::IGNORE_PID) || pid == product_id)
            }
            _ => false,
        }
    }

    pub fn matches_class(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        match self.device {
            DeviceMatch::Class {
                class: c,
                subclass: s,
                protocol: p,
            } if self.flags.contains(TplFlags::CLASS_DRIVER) => {
                (self.flags.contains(TplFlags::IGNORE_CLASS) || c == class)
                    && (self.flags.contains(TplFlags::IGNORE_SUBCLASS) || s == subclass)
                    && (self.flags.contains(TplFlags::IGNORE_PROTOCOL) || p == protocol)
            }
            _ => false,
        }
    }
}

struct DriverEntry<'a> {
    driver: &'a mut dyn ClientDriver,
    flags: u32,
}

/// Registered client drivers
pub(crate) struct DriverTable<'a> {
    drivers: [Option<DriverEntry<'a>>; MAX_CLIENT_DRIVERS],
}

impl<'a> DriverTable<'a> {
    pub(crate) fn new() -> Self {
        DriverTable {
            drivers: Default::default(),
        }
    }

    pub(crate) fn register(
        &mut self,
        driver: &'a mut dyn ClientDriver,
        flags: u32,
    ) -> Option<DriverId> {
        let index = self.drivers.iter().position(Option::is_none)?;
        self.drivers[index] = Some(DriverEntry { driver, flags });
        Some(DriverId(index as u8))
    }

    pub(crate) fn contains(&self, id: DriverId) -> bool {
        matches!(self.drivers.get(id.0 as usize), Some(Some(_)))
    }

    /// Returns `false` if the driver refused, or doesn't exist
    pub(crate) fn initialize(&mut self, id: DriverId, address: u8) -> bool {
        match self.drivers.get_mut(id.0 as usize) {
            Some(Some(entry)) => entry.driver.initialize(address, entry.flags, id),
            _ => false,
        }
    }

    pub(crate) fn event(&mut self, id: DriverId, address: u8, event: DeviceEvent) -> bool {
        match self.drivers.get_mut(id.0 as usize) {
            Some(Some(entry)) => entry.driver.event(address, event),
            _ => false,
        }
    }
}

/// A set of driver IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct DriverSet(u8);

impl DriverSet {
    pub(crate) fn insert(&mut self, id: DriverId) -> bool {
        let bit = 1 << id.0;
        let new = self.0 & bit == 0;
        self.0 |= bit;
        new
    }

    pub(crate) fn iter(self) -> impl Iterator<Item = DriverId> {
        (0..MAX_CLIENT_DRIVERS as u8)
            .filter(move |id| self.0 & (1 << id) != 0)
            .map(DriverId)
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }
}

const _: [(); 1] = [(); (MAX_CLIENT_DRIVERS <= u8::BITS as usize) as usize];
