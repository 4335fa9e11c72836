//! Per-endpoint transfer state machine
//!
//! A transfer is a sequence of transactions. The host asks an endpoint for
//! its next transaction, issues the token, then feeds the outcome back with
//! [`Endpoint::on_transaction`]. The endpoint decides whether the transfer
//! continues, waits for a later frame, or is done.

use core::ptr::NonNull;

use usb_device::UsbDirection;

use crate::{
    bd::Handshake,
    buffer::Buffer,
    config::HostConfig,
    endpoint::{Endpoint, EndpointStatus, Toggle},
    error::TransferError,
    Pid,
};

/// The kind of transfer running on an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    ControlNoData,
    ControlRead,
    ControlWrite,
    InterruptRead,
    InterruptWrite,
    IsochronousRead,
    IsochronousWrite,
    BulkRead,
    BulkWrite,
}

impl TransferKind {
    fn is_control(self) -> bool {
        matches!(
            self,
            TransferKind::ControlNoData | TransferKind::ControlRead | TransferKind::ControlWrite
        )
    }

    fn is_isochronous(self) -> bool {
        matches!(self, TransferKind::IsochronousRead | TransferKind::IsochronousWrite)
    }

    /// Direction of the data stage
    fn is_read(self) -> bool {
        matches!(
            self,
            TransferKind::ControlRead
                | TransferKind::InterruptRead
                | TransferKind::IsochronousRead
                | TransferKind::BulkRead
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Data,
    Status,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Active { kind: TransferKind, stage: Stage },
}

/// The outcome of the last transfer on an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer hasn't reached a terminal state
    Pending,
    Complete { byte_count: usize },
    Failed { error: TransferError, byte_count: usize },
}

/// Bookkeeping for the transfer running on an endpoint
pub(crate) struct Transfer {
    pub(crate) state: TransferState,
    setup: [u8; 8],
    buffer: Option<Buffer>,
    leased: bool,
    length: usize,
    count: usize,
    /// Tick at which the status stage gives up
    deadline: Option<u32>,
}

impl Transfer {
    pub(crate) const fn new() -> Self {
        Transfer {
            state: TransferState::Idle,
            setup: [0; 8],
            buffer: None,
            leased: false,
            length: 0,
            count: 0,
            deadline: None,
        }
    }
}

/// The payload of a transaction
pub(crate) enum Packet {
    Setup([u8; 8]),
    Data { ptr: *mut u8, len: usize },
}

/// The next token an endpoint wants on the bus
pub(crate) struct Transaction {
    pub(crate) pid: Pid,
    pub(crate) toggle: Toggle,
    /// Check the received DATA PID
    pub(crate) check_toggle: bool,
    /// The transaction has a handshake phase
    pub(crate) handshake: bool,
    pub(crate) packet: Packet,
}

/// What the peripheral reported for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionResult {
    Handshake(Handshake, usize),
    Error(TransferError),
}

/// What the host should do after a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Issue the next transaction as soon as possible
    Continue,
    /// Try again in a later frame
    Retry,
    /// The transfer reached a terminal state
    Done,
    /// An isochronous interval finished; the stream continues
    Interval {
        byte_count: usize,
        error: Option<TransferError>,
        buffer: u8,
    },
}

fn empty_packet() -> Packet {
    Packet::Data {
        ptr: NonNull::<u8>::dangling().as_ptr(),
        len: 0,
    }
}

impl Endpoint {
    /// Is a transfer still running?
    pub fn is_busy(&self) -> bool {
        matches!(
            self.transfer.state,
            TransferState::Active {
                stage: Stage::Setup | Stage::Data | Stage::Status,
                ..
            }
        )
    }

    fn begin(
        &mut self,
        kind: TransferKind,
        stage: Stage,
        buffer: Option<Buffer>,
        leased: bool,
        length: usize,
    ) {
        self.transfer = Transfer {
            state: TransferState::Active { kind, stage },
            setup: self.transfer.setup,
            buffer,
            leased,
            length,
            count: 0,
            deadline: None,
        };
        self.nak_count = 0;
        self.error_count = 0;
        self.error = None;
        self.status.remove(
            EndpointStatus::COMPLETE
                | EndpointStatus::SUCCESSFUL
                | EndpointStatus::USER_ABORT
                | EndpointStatus::LAST_NAKD,
        );
    }

    /// Start a control transfer
    ///
    /// The data stage moves `min(wLength, buffer length)` bytes.
    pub(crate) fn start_control(&mut self, setup: [u8; 8], buffer: Option<Buffer>, leased: bool) {
        let requested = u16::from_le_bytes([setup[6], setup[7]]) as usize;
        let length = requested.min(buffer.as_ref().map_or(0, Buffer::len));
        let kind = if length == 0 {
            TransferKind::ControlNoData
        } else if UsbDirection::from(setup[0]) == UsbDirection::In {
            TransferKind::ControlRead
        } else {
            TransferKind::ControlWrite
        };
        self.transfer.setup = setup;
        self.begin(kind, Stage::Setup, buffer, leased, length);
        self.toggle = Toggle::Data0;
    }

    /// Start a bulk or interrupt transfer of the whole buffer
    pub(crate) fn start(&mut self, kind: TransferKind, buffer: Buffer, leased: bool) {
        let length = buffer.len();
        self.begin(kind, Stage::Data, Some(buffer), leased, length);
    }

    /// Start streaming through the endpoint's isochronous buffers
    pub(crate) fn start_isochronous(&mut self, kind: TransferKind) {
        self.begin(kind, Stage::Data, None, false, 0);
    }

    /// Cancel the transfer
    ///
    /// Does nothing if no transfer is running.
    pub(crate) fn terminate(&mut self) {
        if self.is_busy() {
            self.finish(Some(TransferError::Terminated));
        }
    }

    fn finish(&mut self, error: Option<TransferError>) {
        let TransferState::Active { kind, .. } = self.transfer.state else {
            return;
        };
        self.transfer.deadline = None;
        self.status.insert(EndpointStatus::COMPLETE);
        match error {
            None => {
                self.status.insert(EndpointStatus::SUCCESSFUL);
                self.transfer.state = TransferState::Active {
                    kind,
                    stage: Stage::Complete,
                };
            }
            Some(error) => {
                self.status.insert(match error {
                    TransferError::Stall => EndpointStatus::STALLED,
                    TransferError::Terminated => EndpointStatus::USER_ABORT,
                    _ => EndpointStatus::ERROR,
                });
                self.error = Some(error);
                self.transfer.state = TransferState::Active {
                    kind,
                    stage: Stage::Error,
                };
            }
        }
    }

    /// The outcome of the last transfer
    ///
    /// Stays the same until the next transfer starts.
    pub fn completion(&self) -> TransferStatus {
        let byte_count = self.transfer.count;
        match self.transfer.state {
            TransferState::Idle => TransferStatus::Complete { byte_count: 0 },
            TransferState::Active {
                stage: Stage::Complete,
                ..
            } => TransferStatus::Complete { byte_count },
            TransferState::Active {
                stage: Stage::Error, ..
            } => TransferStatus::Failed {
                error: self.error.unwrap_or(TransferError::Terminated),
                byte_count,
            },
            TransferState::Active { .. } => TransferStatus::Pending,
        }
    }

    /// Return a leased buffer once the transfer is over
    pub(crate) fn take_buffer(&mut self) -> Option<&'static mut [u8]> {
        if self.is_busy() || !self.transfer.leased {
            return None;
        }
        self.transfer.leased = false;
        let buffer = self.transfer.buffer.take()?;
        // Safety: leased buffers come from a static slice, and the transfer is over.
        Some(unsafe { buffer.into_static() })
    }

    /// Give up a leased buffer, whatever the state of the transfer
    ///
    /// Only for records that are being dropped with no token on the bus.
    pub(crate) fn abandon_lease(&mut self) -> Option<Buffer> {
        if !self.transfer.leased {
            return None;
        }
        self.transfer.leased = false;
        self.transfer.buffer.take()
    }

    /// View the data of a finished transfer that used host memory
    pub(crate) fn received(&self) -> Option<&[u8]> {
        if self.is_busy() {
            return None;
        }
        let buffer = self.transfer.buffer.as_ref()?;
        // Safety: the transfer is over, so nothing writes the buffer.
        let bytes = unsafe { buffer.as_slice() };
        bytes.get(..self.transfer.count)
    }

    /// Return a host memory buffer once the transfer is over
    pub(crate) fn release_buffer(&mut self) -> Option<Buffer> {
        if self.is_busy() || self.transfer.leased {
            return None;
        }
        self.transfer.buffer.take()
    }

    /// The transaction the endpoint wants next, if any
    pub(crate) fn next_transaction(&mut self) -> Option<Transaction> {
        let TransferState::Active { kind, stage } = self.transfer.state else {
            return None;
        };
        if kind.is_isochronous() {
            let (ptr, len) = self.isochronous.as_mut()?.hardware_buffer()?;
            return Some(Transaction {
                pid: if kind.is_read() { Pid::In } else { Pid::Out },
                toggle: Toggle::Data0,
                check_toggle: false,
                handshake: false,
                packet: Packet::Data { ptr, len },
            });
        }
        let check_toggle = self.status.contains(EndpointStatus::USE_DTS);
        match stage {
            Stage::Setup => Some(Transaction {
                pid: Pid::Setup,
                toggle: Toggle::Data0,
                check_toggle: false,
                handshake: true,
                packet: Packet::Setup(self.transfer.setup),
            }),
            Stage::Data => {
                let remaining = self.transfer.length.saturating_sub(self.transfer.count);
                let len = remaining.min(self.max_packet_size as usize);
                let ptr = self.transfer.buffer.as_ref().map_or_else(
                    || NonNull::<u8>::dangling().as_ptr(),
                    |buffer| buffer.ptr_at(self.transfer.count),
                );
                Some(Transaction {
                    pid: if kind.is_read() { Pid::In } else { Pid::Out },
                    toggle: self.toggle,
                    check_toggle: check_toggle && kind.is_read(),
                    handshake: true,
                    packet: Packet::Data { ptr, len },
                })
            }
            Stage::Status => {
                // Opposite the data stage, zero length, always DATA1
                let status_in = kind != TransferKind::ControlRead;
                Some(Transaction {
                    pid: if status_in { Pid::In } else { Pid::Out },
                    toggle: Toggle::Data1,
                    check_toggle: status_in,
                    handshake: true,
                    packet: empty_packet(),
                })
            }
            Stage::Complete | Stage::Error => None,
        }
    }

    /// Arm the status stage deadline, if configured
    fn enter_status(&mut self, kind: TransferKind, config: &HostConfig, now: u32) {
        self.transfer.state = TransferState::Active {
            kind,
            stage: Stage::Status,
        };
        self.transfer.deadline = config
            .control_status_timeout_ms
            .map(|timeout| now.wrapping_add(timeout as u32));
    }

    /// Fail a control transfer that's been stuck in the status stage
    ///
    /// Returns `true` if the transfer timed out.
    pub(crate) fn check_status_timeout(&mut self, now: u32) -> bool {
        match self.transfer.deadline {
            Some(deadline) if self.is_busy() && now.wrapping_sub(deadline) < u32::MAX / 2 => {
                self.finish(Some(TransferError::StatusTimeout));
                true
            }
            _ => false,
        }
    }

    fn transaction_error(&mut self, error: TransferError, config: &HostConfig) -> Progress {
        self.error_count = self.error_count.saturating_add(1);
        if self.error_count >= config.transaction_retries.max(1) {
            self.finish(Some(error));
            Progress::Done
        } else {
            Progress::Retry
        }
    }

    /// Account for the outcome of the last transaction
    ///
    /// `now` is the host's tick count.
    pub(crate) fn on_transaction(
        &mut self,
        result: TransactionResult,
        config: &HostConfig,
        now: u32,
    ) -> Progress {
        let TransferState::Active { kind, stage } = self.transfer.state else {
            return Progress::Done;
        };
        if !self.is_busy() {
            return Progress::Done;
        }
        if kind.is_isochronous() {
            return self.on_isochronous(kind, result);
        }

        let (handshake, count) = match result {
            TransactionResult::Error(error) => return self.transaction_error(error, config),
            TransactionResult::Handshake(Handshake::Timeout, _) => {
                return self.transaction_error(TransferError::Timeout, config)
            }
            TransactionResult::Handshake(Handshake::Stall, _) => {
                self.status.remove(EndpointStatus::LAST_NAKD);
                self.finish(Some(TransferError::Stall));
                return Progress::Done;
            }
            TransactionResult::Handshake(Handshake::Nak, _) => {
                self.status.insert(EndpointStatus::LAST_NAKD);
                if kind == TransferKind::InterruptRead {
                    // Nothing to report this interval
                    self.finish(None);
                    return Progress::Done;
                }
                if self.status.contains(EndpointStatus::NAK_TIMEOUT) {
                    self.nak_count = self.nak_count.saturating_add(1);
                    if self.nak_count > self.nak_limit {
                        warn!("NAK timeout on endpoint {=u8:#X}", u8::from(self.address));
                        self.finish(Some(TransferError::NakTimeout));
                        return Progress::Done;
                    }
                }
                return Progress::Retry;
            }
            TransactionResult::Handshake(handshake, count) => (handshake, count),
        };
        self.status.remove(EndpointStatus::LAST_NAKD);
        self.nak_count = 0;

        match stage {
            Stage::Setup => {
                if handshake != Handshake::Ack {
                    return self.transaction_error(TransferError::IllegalPid, config);
                }
                self.toggle = Toggle::Data1;
                if kind == TransferKind::ControlNoData {
                    self.enter_status(kind, config, now);
                } else {
                    self.transfer.state = TransferState::Active {
                        kind,
                        stage: Stage::Data,
                    };
                }
                Progress::Continue
            }
            Stage::Data => {
                let remaining = self.transfer.length.saturating_sub(self.transfer.count);
                let expected = remaining.min(self.max_packet_size as usize);
                if kind.is_read() {
                    let Some(toggle) = handshake.toggle() else {
                        return self.transaction_error(TransferError::IllegalPid, config);
                    };
                    if self.status.contains(EndpointStatus::USE_DTS) && toggle != self.toggle {
                        // A retransmission of a packet we already have
                        return self.transaction_error(TransferError::DataToggle, config);
                    }
                    let count = count.min(expected);
                    self.transfer.count += count;
                    self.toggle = self.toggle.flip();
                    let short = count < self.max_packet_size as usize;
                    if short || self.transfer.count >= self.transfer.length {
                        return self.end_data_stage(kind, config, now);
                    }
                } else {
                    if handshake != Handshake::Ack {
                        return self.transaction_error(TransferError::IllegalPid, config);
                    }
                    self.transfer.count += count.min(expected);
                    self.toggle = self.toggle.flip();
                    if self.transfer.count >= self.transfer.length {
                        return self.end_data_stage(kind, config, now);
                    }
                }
                Progress::Continue
            }
            Stage::Status => {
                let ok = if kind == TransferKind::ControlRead {
                    handshake == Handshake::Ack
                } else {
                    handshake == Handshake::Data1
                };
                if ok {
                    self.finish(None);
                    Progress::Done
                } else if handshake == Handshake::Data0 {
                    self.transaction_error(TransferError::DataToggle, config)
                } else {
                    self.transaction_error(TransferError::IllegalPid, config)
                }
            }
            Stage::Complete | Stage::Error => Progress::Done,
        }
    }

    fn end_data_stage(&mut self, kind: TransferKind, config: &HostConfig, now: u32) -> Progress {
        if kind.is_control() {
            self.enter_status(kind, config, now);
            Progress::Continue
        } else {
            self.finish(None);
            Progress::Done
        }
    }

    fn on_isochronous(&mut self, kind: TransferKind, result: TransactionResult) -> Progress {
        let Some(buffers) = self.isochronous.as_mut() else {
            self.finish(Some(TransferError::Dma));
            return Progress::Done;
        };
        let outcome = match result {
            TransactionResult::Handshake(Handshake::Data0 | Handshake::Data1, count)
                if kind.is_read() =>
            {
                Ok(count)
            }
            TransactionResult::Handshake(Handshake::Ack, count) if !kind.is_read() => Ok(count),
            TransactionResult::Handshake(Handshake::Timeout, _) => Err(TransferError::Timeout),
            TransactionResult::Handshake(_, _) => Err(TransferError::IllegalPid),
            TransactionResult::Error(error) => Err(error),
        };
        match outcome {
            Ok(count) => {
                let buffer = buffers.hardware_done(count);
                self.transfer.count = self.transfer.count.wrapping_add(count);
                Progress::Interval {
                    byte_count: count,
                    error: None,
                    buffer,
                }
            }
            Err(error) => Progress::Interval {
                byte_count: 0,
                error: Some(error),
                buffer: buffers.hardware_failed(),
            },
        }
    }
}
