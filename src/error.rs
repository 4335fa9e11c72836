//! Host errors

/// A refused host operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// No device with this address
    UnknownDevice,
    /// The device isn't in a state that supports the operation
    InvalidState,
    /// A transfer is already in progress on the endpoint
    EndpointBusy,
    /// The request must go through a dedicated host operation
    IllegalRequest,
    /// The operation doesn't apply to this transfer type
    EndpointIllegalType,
    /// The endpoint has the other direction
    EndpointIllegalDirection,
    /// The endpoint is halted; clear it first
    EndpointStalled,
    /// The endpoint's last transfer failed; clear it first
    EndpointError,
    /// The endpoint isn't part of the active configuration
    EndpointNotFound,
    /// Transfers are active on the device
    Busy,
    /// Host memory is exhausted
    OutOfMemory,
    /// No room for another client driver
    DriverTableFull,
    /// The isochronous endpoint has no buffer set
    NoBuffers,
}

/// Why a transfer finished without success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferError {
    /// The device answered STALL
    Stall = 1,
    /// The device NAK'd more than the endpoint's limit
    NakTimeout,
    /// The device answered with a PID that doesn't belong in the transaction
    IllegalPid,
    BitStuff,
    Dma,
    /// Bus turnaround timeout
    Timeout,
    DataField,
    Crc16,
    EndOfFrame,
    PidCheck,
    /// The received DATA PID didn't match the expected toggle
    DataToggle,
    /// The control status stage didn't finish in time
    StatusTimeout,
    /// The transfer was terminated by the host or the application
    Terminated,
}

/// Why a device is held
///
/// A held device receives no traffic until it's reset, or detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HoldReason {
    OutOfMemory = 1,
    /// No client driver supports the device
    UnsupportedDevice,
    /// Hubs aren't supported
    UnsupportedHub,
    /// A configuration descriptor is malformed, or doesn't exist
    InvalidConfiguration,
    /// The configuration exceeds the host's endpoint or interface tables
    ProcessingCapacity,
    /// The device needs more VBUS current than the host may supply
    PowerRequirement,
    /// A client driver failed to initialize
    ClientInitError,
    /// Enumeration failed after all retries
    CannotEnumerate,
    /// The interrupt path produced events faster than the task loop drained them
    EventQueueOverflow,
}

/// A transfer the host refused to start
///
/// Carries the caller's buffer back, if there was one.
#[derive(Debug)]
pub struct Rejected {
    pub error: HostError,
    pub buffer: Option<&'static mut [u8]>,
}

impl Rejected {
    pub(crate) fn new(error: HostError, buffer: Option<&'static mut [u8]>) -> Self {
        Rejected { error, buffer }
    }
}

impl From<HostError> for Rejected {
    fn from(error: HostError) -> Self {
        Rejected {
            error,
            buffer: None,
        }
    }
}
