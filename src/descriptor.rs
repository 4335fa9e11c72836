//! Standard USB descriptors
//!
//! Parsers for the descriptors the host reads during enumeration.

use usb_device::{
    descriptor::descriptor_type,
    endpoint::{EndpointAddress, EndpointType, IsochronousSynchronizationType, IsochronousUsageType},
};

/// The OTG descriptor type
pub const OTG: u8 = 0x09;
/// The hub device class
pub const HUB_CLASS: u8 = 0x09;

/// A malformed descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    /// Fewer bytes than the descriptor needs
    Truncated,
    /// The descriptor's length field is inconsistent
    InvalidLength,
    /// The descriptor type isn't the one that was requested
    UnexpectedType,
}

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn check(bytes: &[u8], length: usize, kind: u8) -> Result<(), DescriptorError> {
    if bytes.len() < length {
        return Err(DescriptorError::Truncated);
    }
    if (bytes[0] as usize) < length {
        return Err(DescriptorError::InvalidLength);
    }
    if bytes[1] != kind {
        return Err(DescriptorError::UnexpectedType);
    }
    Ok(())
}

/// A device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LENGTH: usize = 18;
    /// Bytes the host reads to learn the control endpoint's packet size
    pub const PREFIX_LENGTH: usize = 8;

    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        check(bytes, Self::LENGTH, descriptor_type::DEVICE)?;
        Ok(DeviceDescriptor {
            usb_version: le16(bytes, 2),
            class: bytes[4],
            subclass: bytes[5],
            protocol: bytes[6],
            max_packet_size_0: bytes[7],
            vendor_id: le16(bytes, 8),
            product_id: le16(bytes, 10),
            device_version: le16(bytes, 12),
            manufacturer: bytes[14],
            product: bytes[15],
            serial_number: bytes[16],
            num_configurations: bytes[17],
        })
    }

    /// Parse the first eight bytes, returning bMaxPacketSize0
    ///
    /// Only 8, 16, 32 and 64 are valid full-speed control packet sizes.
    pub fn parse_max_packet_size(bytes: &[u8]) -> Result<u8, DescriptorError> {
        if bytes.len() < Self::PREFIX_LENGTH {
            return Err(DescriptorError::Truncated);
        }
        if bytes[1] != descriptor_type::DEVICE {
            return Err(DescriptorError::UnexpectedType);
        }
        match bytes[7] {
            mps @ (8 | 16 | 32 | 64) => Ok(mps),
            _ => Err(DescriptorError::InvalidLength),
        }
    }
}

/// The fixed part of a configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationHeader {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub value: u8,
    pub attributes: u8,
    /// bMaxPower, in 2 mA units
    pub max_power: u8,
}

impl ConfigurationHeader {
    pub const LENGTH: usize = 9;

    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        check(bytes, Self::LENGTH, descriptor_type::CONFIGURATION)?;
        let total_length = le16(bytes, 2);
        if (total_length as usize) < Self::LENGTH {
            return Err(DescriptorError::InvalidLength);
        }
        Ok(ConfigurationHeader {
            total_length,
            num_interfaces: bytes[4],
            value: bytes[5],
            attributes: bytes[7],
            max_power: bytes[8],
        })
    }

    pub fn max_power_ma(&self) -> u16 {
        self.max_power as u16 * 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceDescriptor {
    pub const LENGTH: usize = 9;

    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        check(bytes, Self::LENGTH, descriptor_type::INTERFACE)?;
        Ok(InterfaceDescriptor {
            number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            class: bytes[5],
            subclass: bytes[6],
            protocol: bytes[7],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub kind: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const LENGTH: usize = 7;

    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        check(bytes, Self::LENGTH, descriptor_type::ENDPOINT)?;
        Ok(EndpointDescriptor {
            address: EndpointAddress::from(bytes[2]),
            kind: endpoint_type(bytes[3]),
            max_packet_size: le16(bytes, 4) & 0x7FF,
            interval: bytes[6],
        })
    }
}

/// Decode bmAttributes
pub fn endpoint_type(attributes: u8) -> EndpointType {
    match attributes & 0b11 {
        0 => EndpointType::Control,
        1 => EndpointType::Isochronous {
            synchronization: match (attributes >> 2) & 0b11 {
                0 => IsochronousSynchronizationType::NoSynchronization,
                1 => IsochronousSynchronizationType::Asynchronous,
                2 => IsochronousSynchronizationType::Adaptive,
                _ => IsochronousSynchronizationType::Synchronous,
            },
            usage: match (attributes >> 4) & 0b11 {
                1 => IsochronousUsageType::Feedback,
                2 => IsochronousUsageType::ImplicitFeedbackData,
                _ => IsochronousUsageType::Data,
            },
        },
        2 => EndpointType::Bulk,
        _ => EndpointType::Interrupt,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtgDescriptor {
    pub attributes: u8,
}

impl OtgDescriptor {
    pub const LENGTH: usize = 3;

    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        check(bytes, Self::LENGTH, OTG)?;
        Ok(OtgDescriptor {
            attributes: bytes[2],
        })
    }
    pub fn supports_srp(&self) -> bool {
        self.attributes & 0b01 != 0
    }
    pub fn supports_hnp(&self) -> bool {
        self.attributes & 0b10 != 0
    }
}

/// One descriptor from a configuration descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    Configuration(ConfigurationHeader),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    Otg(OtgDescriptor),
    /// Class-specific, or otherwise ignored by the host
    Other(u8),
}

/// Walks the descriptors in a full configuration descriptor
///
/// Stops at the first malformed descriptor, yielding its error.
pub struct Descriptors<'a> {
    bytes: &'a [u8],
}

impl<'a> Descriptors<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Descriptors { bytes }
    }
}

impl Iterator for Descriptors<'_> {
    type Item = Result<Descriptor, DescriptorError>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }
        let length = self.bytes[0] as usize;
        if length < 2 || length > self.bytes.len() {
            self.bytes = &[];
            return Some(Err(if length < 2 {
                DescriptorError::InvalidLength
            } else {
                DescriptorError::Truncated
            }));
        }
        let (bytes, rest) = self.bytes.split_at(length);
        self.bytes = rest;
        let descriptor = match bytes[1] {
            descriptor_type::CONFIGURATION => {
                ConfigurationHeader::parse(bytes).map(Descriptor::Configuration)
            }
            descriptor_type::INTERFACE => {
                InterfaceDescriptor::parse(bytes).map(Descriptor::Interface)
            }
            descriptor_type::ENDPOINT => EndpointDescriptor::parse(bytes).map(Descriptor::Endpoint),
            OTG => OtgDescriptor::parse(bytes).map(Descriptor::Otg),
            other => Ok(Descriptor::Other(other)),
        };
        if descriptor.is_err() {
            self.bytes = &[];
        }
        Some(descriptor)
    }
}
