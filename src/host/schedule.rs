//! The interrupt path
//!
//! One token is on the bus at a time. When it finishes, the host accounts
//! for the result, then picks the next endpoint. Control transfers go first,
//! then isochronous and interrupt endpoints whose interval expired, then
//! bulk endpoints in turn.

use usb_device::endpoint::EndpointType;

use super::{Frame, Host, HostFlags, InFlight};
use crate::{
    endpoint::{Client, Endpoint, MAX_ENDPOINTS},
    error::TransferError,
    event::{Event, EventQueue, TransferEvent},
    transfer::{Packet, Progress, Transaction, TransactionResult, TransferStatus},
    Interrupts, Peripheral, Token,
};

impl<P: Peripheral, const EVENTS: usize> Host<'_, P, EVENTS> {
    /// Service the USB interrupt
    ///
    /// Call this from the USB interrupt handler, or whenever the peripheral
    /// has pending interrupts.
    pub fn interrupt(&mut self) {
        let pending = self.peripheral.interrupts();
        self.peripheral.clear_interrupts(pending);

        if pending.contains(Interrupts::TICK) {
            self.ticks = self.ticks.wrapping_add(1);
        }
        if pending.contains(Interrupts::DETACH) {
            self.flags.insert(HostFlags::DETACH);
            self.flags.remove(HostFlags::ATTACH);
            self.in_flight = None;
        }
        if pending.contains(Interrupts::ATTACH) {
            self.flags.insert(HostFlags::ATTACH);
        }
        if pending.contains(Interrupts::RESUME) {
            self.flags.insert(HostFlags::REMOTE_WAKEUP);
        }
        if pending.contains(Interrupts::BUS_ERROR) {
            let errors = self.peripheral.bus_errors();
            self.peripheral.clear_bus_errors(errors);
            self.bus_errors |= errors;
        }
        if pending.contains(Interrupts::TRANSFER_DONE) {
            self.complete_transaction();
        }
        if pending.contains(Interrupts::SOF) {
            self.start_frame();
        }
        self.schedule();
    }

    fn complete_transaction(&mut self) {
        let Some(InFlight { slot, pid }) = self.in_flight.take() else {
            return;
        };
        let errors = core::mem::replace(&mut self.bus_errors, crate::BusErrors::empty());
        let (handshake, count) = self.bdt.descriptor(pid).result();
        let result = match (errors.transfer_error(), handshake) {
            (Some(error), _) => TransactionResult::Error(error),
            (None, Ok(handshake)) => TransactionResult::Handshake(handshake, count),
            (None, Err(_pid)) => {
                warn!("Unexpected PID {=u8:#X}", _pid);
                TransactionResult::Error(TransferError::IllegalPid)
            }
        };

        let address = self.device.as_ref().map_or(0, |device| device.address);
        let now = self.ticks;
        let Some(ep) = self.endpoints.get_mut(slot) else {
            return;
        };
        // Terminated while the token was on the bus
        if !ep.is_busy() {
            return;
        }
        let progress = ep.on_transaction(result, &self.config, now);
        if ep.is_periodic() {
            // One transaction per interval
            ep.restart_interval();
            self.frame.serviced |= 1 << slot;
        } else if progress != Progress::Continue {
            self.frame.serviced |= 1 << slot;
        }

        match progress {
            Progress::Done => post_completion(&mut self.events, address, ep),
            Progress::Interval {
                byte_count,
                error,
                buffer,
            } if ep.client != Client::Host => {
                let mut transfer = TransferEvent::new(ep.address, byte_count, error);
                transfer.buffer = Some(buffer);
                let _ = self.events.push(Event {
                    address,
                    client: ep.client,
                    transfer,
                });
            }
            _ => {}
        }
    }

    /// Reset the frame budget, and advance the periodic schedule
    fn start_frame(&mut self) {
        self.frame = Frame::default();
        let address = self.device.as_ref().map_or(0, |device| device.address);
        let now = self.ticks;
        for (_, ep) in self.endpoints.iter_mut() {
            if ep.is_periodic() {
                ep.tick();
            }
            if ep.check_status_timeout(now) {
                warn!("Status stage timeout on endpoint {=u8:#X}", u8::from(ep.address));
                post_completion(&mut self.events, address, ep);
            }
        }
    }

    /// Put the next token on the bus, if there's one to send
    fn schedule(&mut self) {
        if self.in_flight.is_some()
            || self.flags.contains(HostFlags::DETACH)
            || !self.state.allows_traffic()
        {
            return;
        }
        let enumerating = self.state.is_enumerating();
        while self.frame.transactions < self.config.transactions_per_frame {
            if self.peripheral.is_token_busy() {
                return;
            }
            let Some(slot) = self.next_endpoint(enumerating) else {
                return;
            };
            let Some(ep) = self.endpoints.get_mut(slot) else {
                return;
            };
            match ep.next_transaction() {
                Some(transaction) => {
                    let endpoint = ep.address.index() as u8;
                    self.issue(slot, endpoint, transaction);
                    return;
                }
                None => {
                    // An isochronous interval without a buffer
                    if ep.is_periodic() {
                        ep.restart_interval();
                    }
                    self.frame.serviced |= 1 << slot;
                }
            }
        }
    }

    /// The endpoint that gets the next token
    fn next_endpoint(&mut self, enumerating: bool) -> Option<usize> {
        let serviced = self.frame.serviced;
        let ready = move |slot: usize, ep: &Endpoint| {
            ep.is_busy() && ep.is_due() && serviced & (1 << slot) == 0
        };
        if enumerating {
            return self.endpoints.get(0).filter(|ep0| ready(0, *ep0)).map(|_| 0);
        }

        let endpoints = &self.endpoints;
        let first = |wanted: fn(&Endpoint) -> bool| {
            endpoints
                .iter()
                .find(|&(slot, ep)| wanted(ep) && ready(slot, ep))
                .map(|(slot, _)| slot)
        };
        let prioritized = first(Endpoint::is_control)
            .or_else(|| first(Endpoint::is_isochronous))
            .or_else(|| first(|ep| ep.kind == EndpointType::Interrupt));
        if prioritized.is_some() {
            return prioritized;
        }

        let start = self.bulk_cursor;
        let slot = (0..MAX_ENDPOINTS)
            .map(|offset| (start + offset) % MAX_ENDPOINTS)
            .find(|&slot| {
                self.endpoints
                    .get(slot)
                    .is_some_and(|ep| ep.kind == EndpointType::Bulk && ready(slot, ep))
            })?;
        self.bulk_cursor = (slot + 1) % MAX_ENDPOINTS;
        Some(slot)
    }

    /// Arm the descriptor, and hand the token to the peripheral
    fn issue(&mut self, slot: usize, endpoint: u8, transaction: Transaction) {
        let descriptor = self.bdt.descriptor(transaction.pid);
        let (buffer, len) = match transaction.packet {
            Packet::Setup(setup) => (self.bdt.setup_packet(&setup), setup.len()),
            Packet::Data { ptr, len } => (ptr, len),
        };
        descriptor.arm(buffer, len, transaction.toggle, transaction.check_toggle);
        self.in_flight = Some(InFlight {
            slot,
            pid: transaction.pid,
        });
        self.frame.transactions = self.frame.transactions.saturating_add(1);
        trace!(
            "TOKEN {=u8:#X} EP{=u8} LEN {=usize}",
            transaction.pid as u8,
            endpoint,
            len
        );
        self.peripheral.issue_token(
            Token {
                pid: transaction.pid,
                endpoint,
                handshake: transaction.handshake,
            },
            descriptor,
        );
    }
}

/// Queue the completion of an endpoint's transfer for its client
///
/// The host's own transfers aren't queued.
fn post_completion<const N: usize>(events: &mut EventQueue<N>, address: u8, ep: &Endpoint) {
    if ep.client == Client::Host {
        return;
    }
    let (byte_count, error) = match ep.completion() {
        TransferStatus::Complete { byte_count } => (byte_count, None),
        TransferStatus::Failed { error, byte_count } => (byte_count, Some(error)),
        TransferStatus::Pending => return,
    };
    let _ = events.push(Event {
        address,
        client: ep.client,
        transfer: TransferEvent::new(ep.address, byte_count, error),
    });
}
