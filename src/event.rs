//! Transfer events, and the queue that carries them out of the interrupt handler
//!
//! The interrupt handler is the only producer, and the task loop is the
//! only consumer. The producer never blocks: if the queue is full, the
//! event is refused and the queue remembers that it overflowed.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use usb_device::endpoint::EndpointAddress;

use crate::{endpoint::Client, error::TransferError};

/// Default event queue depth
pub const EVENT_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A transfer finished, or an isochronous interval passed
    Transfer,
    /// A transfer failed on a bus error
    BusError,
    /// A transfer was stalled
    Stall,
}

/// What happened on an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub kind: EventKind,
    pub endpoint: EndpointAddress,
    pub byte_count: usize,
    pub error: Option<TransferError>,
    /// For isochronous streams, the buffer that changed hands
    pub buffer: Option<u8>,
}

impl TransferEvent {
    pub(crate) fn new(
        endpoint: EndpointAddress,
        byte_count: usize,
        error: Option<TransferError>,
    ) -> Self {
        let kind = match error {
            None => EventKind::Transfer,
            Some(TransferError::Stall) => EventKind::Stall,
            Some(_) => EventKind::BusError,
        };
        TransferEvent {
            kind,
            endpoint,
            byte_count,
            error,
            buffer: None,
        }
    }
}

/// A queued event, and where it's going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub address: u8,
    pub client: Client,
    pub transfer: TransferEvent,
}

/// A bounded single-producer, single-consumer event queue
pub struct EventQueue<const N: usize = EVENT_QUEUE_DEPTH> {
    slots: [UnsafeCell<Option<Event>>; N],
    /// Total events taken
    head: AtomicUsize,
    /// Total events written
    tail: AtomicUsize,
    overflow: AtomicBool,
}

// Safety: a slot is only written by the producer while it's free, and only
// read by the consumer while it's full. The indices publish the hand-off.
unsafe impl<const N: usize> Sync for EventQueue<N> {}

impl<const N: usize> EventQueue<N> {
    pub fn new() -> Self {
        EventQueue {
            slots: core::array::from_fn(|_| UnsafeCell::new(None)),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if an event was refused since the last call
    pub fn take_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::AcqRel)
    }

    /// Split into producer and consumer handles
    pub fn split(&mut self) -> (Producer<'_, N>, Consumer<'_, N>) {
        (Producer { queue: self }, Consumer { queue: self })
    }

    pub(crate) fn push(&mut self, event: Event) -> Result<(), Event> {
        // Safety: exclusive access, so we're the only producer.
        unsafe { self.enqueue(event) }
    }

    pub(crate) fn pop(&mut self) -> Option<Event> {
        // Safety: exclusive access, so we're the only consumer.
        unsafe { self.dequeue() }
    }

    /// Drop every queued event
    pub(crate) fn clear(&mut self) {
        while self.pop().is_some() {}
    }

    /// # Safety
    ///
    /// Only one context may produce at a time.
    unsafe fn enqueue(&self, event: Event) -> Result<(), Event> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= N {
            self.overflow.store(true, Ordering::Release);
            warn!("Event queue overflow");
            return Err(event);
        }
        *self.slots[tail % N].get() = Some(event);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// # Safety
    ///
    /// Only one context may consume at a time.
    unsafe fn dequeue(&self) -> Option<Event> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let event = (*self.slots[head % N].get()).take();
        self.head.store(head.wrapping_add(1), Ordering::Release);
        event
    }
}

impl<const N: usize> Default for EventQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The writing half of an [`EventQueue`]
pub struct Producer<'a, const N: usize> {
    queue: &'a EventQueue<N>,
}

impl<const N: usize> Producer<'_, N> {
    /// Queue an event, or hand it back if the queue is full
    pub fn push(&mut self, event: Event) -> Result<(), Event> {
        // Safety: there's only one producer per split.
        unsafe { self.queue.enqueue(event) }
    }
}

/// The reading half of an [`EventQueue`]
pub struct Consumer<'a, const N: usize> {
    queue: &'a EventQueue<N>,
}

impl<const N: usize> Consumer<'_, N> {
    pub fn pop(&mut self) -> Option<Event> {
        // Safety: there's only one consumer per split.
        unsafe { self.queue.dequeue() }
    }

    pub fn take_overflow(&self) -> bool {
        self.queue.take_overflow()
    }
}
