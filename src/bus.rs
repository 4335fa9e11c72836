//! Sharing a host between the USB interrupt and thread mode

use crate::{event::EVENT_QUEUE_DEPTH, Host, Peripheral};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};

/// A [`Host`] behind a critical section
///
/// Put a `SharedHost` in a `static`, call [`on_interrupt`](SharedHost::on_interrupt)
/// from the USB interrupt handler, and [`poll`](SharedHost::poll) from your
/// main loop. Everything else goes through [`with_host_mut`](SharedHost::with_host_mut).
///
/// Client drivers and the application handler run inside the critical
/// section, so keep their event handling short.
pub struct SharedHost<'a, P: Peripheral, const EVENTS: usize = EVENT_QUEUE_DEPTH> {
    host: Mutex<RefCell<Host<'a, P, EVENTS>>>,
}

impl<'a, P: Peripheral, const EVENTS: usize> SharedHost<'a, P, EVENTS> {
    /// Share a host
    ///
    /// Register drivers and the application handler before sharing the host.
    pub fn new(host: Host<'a, P, EVENTS>) -> Self {
        SharedHost {
            host: Mutex::new(RefCell::new(host)),
        }
    }

    /// Interrupt-safe, immutable access to the host
    pub fn with_host<R>(&self, func: impl FnOnce(&Host<'a, P, EVENTS>) -> R) -> R {
        interrupt::free(|cs| {
            let host = self.host.borrow(cs);
            let host = host.borrow();
            func(&*host)
        })
    }

    /// Interrupt-safe, mutable access to the host
    pub fn with_host_mut<R>(&self, func: impl FnOnce(&mut Host<'a, P, EVENTS>) -> R) -> R {
        interrupt::free(|cs| {
            let host = self.host.borrow(cs);
            let mut host = host.borrow_mut();
            func(&mut *host)
        })
    }

    /// Service the USB interrupt
    pub fn on_interrupt(&self) {
        self.with_host_mut(|host| host.interrupt());
    }

    /// Run the host's task loop once
    pub fn poll(&self) {
        self.with_host_mut(|host| host.tasks());
    }
}
