//! Controller events.
//!
//! All deferred work is funneled through one bounded multi-producer channel
//! consumed by the worker loop. Interrupt context and synchronous callers
//! post with `try_send`; losing an event to a full queue is acceptable for
//! both producers because each event kind is re-generated (the next tick,
//! the next timer interrupt) or coalesced (notification flags stay set).

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

/// Depth of the controller event queue.
pub const EVENT_QUEUE_DEPTH: usize = 10;

/// Bounded multi-producer, single-consumer event channel.
pub type EventChannel = Channel<CriticalSectionRawMutex, Event, EVENT_QUEUE_DEPTH>;

/// Events consumed by the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Heartbeat: run one periodic presence/safety check.
    PeriodicTick,
    /// The charger chip signalled that a current sample is ready.
    CurrentReady,
    /// Notification flags were posted and want draining.
    Notify,
    /// Drain the queue and exit the worker loop.
    Shutdown,
}
