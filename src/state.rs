//! Host state machine states
//!
//! Three levels: state, substate, and the step within a substate.

use crate::error::HoldReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Detached(Detached),
    Attached(Attached),
    Addressing(Addressing),
    Configuring(Configuring),
    Running(Running),
    Holding(Holding, HoldReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    Initialize,
    WaitForPower,
    TurnOnPower,
    WaitForDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attached {
    Settle(Delay),
    ResetDevice(Reset),
    GetDeviceDescriptorSize(Command),
    GetDeviceDescriptor(Command),
    ValidateVidPid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    SetDeviceAddress(Command),
    Recovery(Delay),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Configuring {
    InitConfiguration,
    GetConfigDescriptorSize(Command),
    GetConfigDescriptor(Command),
    SelectConfiguration(Select),
    SetConfiguration(SetConfiguration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Running {
    Normal,
    Suspend,
    Suspended,
    Resume,
    ResumeWait,
    ResumeRecovery,
    ResumeRecoveryWait,
    ResumeComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holding {
    Init,
    Hold,
}

/// A timed wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Start,
    Wait,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reset {
    SetReset,
    ResetWait,
    ResetRecovery,
    RecoveryWait,
    Complete,
}

/// A control transfer issued by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Send,
    Wait,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Select {
    Select,
    SendSetOtg,
    WaitForSetOtg,
    SetOtgComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetConfiguration {
    Send,
    Wait,
    Complete,
    InitClientDrivers,
}

/// The device status, as the application sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Detached,
    Enumerating,
    /// Configured and running
    Attached,
    Suspended,
    Holding(HoldReason),
}

impl HostState {
    pub fn device_status(&self) -> DeviceStatus {
        match self {
            HostState::Detached(_) => DeviceStatus::Detached,
            HostState::Attached(_) | HostState::Addressing(_) | HostState::Configuring(_) => {
                DeviceStatus::Enumerating
            }
            HostState::Running(Running::Normal) => DeviceStatus::Attached,
            HostState::Running(_) => DeviceStatus::Suspended,
            HostState::Holding(_, reason) => DeviceStatus::Holding(*reason),
        }
    }

    /// Is the host enumerating a device?
    pub(crate) fn is_enumerating(&self) -> bool {
        matches!(
            self,
            HostState::Attached(_) | HostState::Addressing(_) | HostState::Configuring(_)
        )
    }

    /// May the host put tokens on the bus?
    pub(crate) fn allows_traffic(&self) -> bool {
        match self {
            HostState::Attached(Attached::Settle(_) | Attached::ResetDevice(_)) => false,
            HostState::Attached(_) | HostState::Addressing(_) | HostState::Configuring(_) => true,
            HostState::Running(Running::Normal) => true,
            _ => false,
        }
    }

    /// Encode as `0xSSUV`: state, substate, step
    ///
    /// Only for logging.
    pub(crate) fn code(&self) -> u16 {
        fn command(command: Command) -> u16 {
            command as u16
        }
        match *self {
            HostState::Detached(sub) => sub as u16,
            HostState::Attached(sub) => {
                0x100
                    | match sub {
                        Attached::Settle(delay) => delay as u16,
                        Attached::ResetDevice(reset) => 0x10 | reset as u16,
                        Attached::GetDeviceDescriptorSize(cmd) => 0x20 | command(cmd),
                        Attached::GetDeviceDescriptor(cmd) => 0x30 | command(cmd),
                        Attached::ValidateVidPid => 0x40,
                    }
            }
            HostState::Addressing(sub) => {
                0x200
                    | match sub {
                        Addressing::SetDeviceAddress(cmd) => command(cmd),
                        Addressing::Recovery(delay) => 0x10 | delay as u16,
                    }
            }
            HostState::Configuring(sub) => {
                0x300
                    | match sub {
                        Configuring::InitConfiguration => 0,
                        Configuring::GetConfigDescriptorSize(cmd) => 0x10 | command(cmd),
                        Configuring::GetConfigDescriptor(cmd) => 0x20 | command(cmd),
                        Configuring::SelectConfiguration(select) => 0x30 | select as u16,
                        Configuring::SetConfiguration(set) => 0x40 | set as u16,
                    }
            }
            HostState::Running(sub) => 0x400 | sub as u16,
            HostState::Holding(sub, reason) => 0x500 | (sub as u16) << 4 | reason as u16,
        }
    }
}
