//! Standard device requests

use usb_device::{
    control::Request, descriptor::descriptor_type, endpoint::EndpointAddress, UsbDirection,
};

/// bmRequestType direction bit: device to host
pub const DEVICE_TO_HOST: u8 = 0x80;
/// bmRequestType recipient: interface
pub const RECIPIENT_INTERFACE: u8 = 0x01;
/// bmRequestType recipient: endpoint
pub const RECIPIENT_ENDPOINT: u8 = 0x02;
/// bmRequestType type mask; zero for standard requests
pub const TYPE_MASK: u8 = 0x60;
/// OTG feature selector: the A-device supports HNP
pub const FEATURE_A_HNP_SUPPORT: u16 = 4;
/// US English language ID for string descriptors
pub const LANGUAGE_ID_EN_US: u16 = 0x0409;

/// An eight byte SETUP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl DeviceRequest {
    pub const fn get_descriptor(kind: u8, index: u8, language: u16, length: u16) -> Self {
        DeviceRequest {
            request_type: DEVICE_TO_HOST,
            request: Request::GET_DESCRIPTOR,
            value: (kind as u16) << 8 | index as u16,
            index: language,
            length,
        }
    }

    pub const fn get_device_descriptor(length: u16) -> Self {
        Self::get_descriptor(descriptor_type::DEVICE, 0, 0, length)
    }

    pub const fn get_configuration_descriptor(index: u8, length: u16) -> Self {
        Self::get_descriptor(descriptor_type::CONFIGURATION, index, 0, length)
    }

    pub const fn get_string_descriptor(index: u8, language: u16, length: u16) -> Self {
        Self::get_descriptor(descriptor_type::STRING, index, language, length)
    }

    pub const fn set_address(address: u8) -> Self {
        DeviceRequest {
            request_type: 0,
            request: Request::SET_ADDRESS,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    pub const fn set_configuration(value: u8) -> Self {
        DeviceRequest {
            request_type: 0,
            request: Request::SET_CONFIGURATION,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub const fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        DeviceRequest {
            request_type: RECIPIENT_INTERFACE,
            request: Request::SET_INTERFACE,
            value: alternate_setting as u16,
            index: interface as u16,
            length: 0,
        }
    }

    pub fn clear_endpoint_halt(endpoint: EndpointAddress) -> Self {
        DeviceRequest {
            request_type: RECIPIENT_ENDPOINT,
            request: Request::CLEAR_FEATURE,
            value: Request::FEATURE_ENDPOINT_HALT,
            index: u8::from(endpoint) as u16,
            length: 0,
        }
    }

    pub const fn set_device_feature(feature: u16) -> Self {
        DeviceRequest {
            request_type: 0,
            request: Request::SET_FEATURE,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.request_type)
    }

    pub(crate) fn is_standard(&self) -> bool {
        self.request_type & TYPE_MASK == 0
    }

    pub(crate) fn is_set_configuration(&self) -> bool {
        self.is_standard() && self.request == Request::SET_CONFIGURATION
    }

    /// For SET_INTERFACE, the (interface, alternate setting) pair
    pub(crate) fn interface_selection(&self) -> Option<(u8, u8)> {
        (self.is_standard()
            && self.request == Request::SET_INTERFACE
            && self.request_type & 0x1F == RECIPIENT_INTERFACE)
            .then_some((self.index as u8, self.value as u8))
    }

    /// For CLEAR_FEATURE(ENDPOINT_HALT), the endpoint
    pub(crate) fn cleared_halt(&self) -> Option<EndpointAddress> {
        (self.is_standard()
            && self.request == Request::CLEAR_FEATURE
            && self.request_type & 0x1F == RECIPIENT_ENDPOINT
            && self.value == Request::FEATURE_ENDPOINT_HALT)
            .then_some(EndpointAddress::from(self.index as u8))
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let [value_lo, value_hi] = self.value.to_le_bytes();
        let [index_lo, index_hi] = self.index.to_le_bytes();
        let [length_lo, length_hi] = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value_lo,
            value_hi,
            index_lo,
            index_hi,
            length_lo,
            length_hi,
        ]
    }
}
