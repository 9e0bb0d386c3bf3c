//! Change-notification coalescing.
//!
//! State-affecting code posts a [`NotifyKind`] flag and wakes the worker;
//! the worker drains the whole flag set atomically (exchange with zero) and
//! emits at most one wake-up per kind per batch. Observers await the
//! per-kind signals. Flags are atomics rather than mutex state so posting
//! works from any context without taking the controller lock.

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

/// The observable attribute changes that support async notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NotifyKind {
    ChargerPresent,
    ChargerState,
    ChargerPwm,
}

impl NotifyKind {
    const fn bit(self) -> u32 {
        match self {
            NotifyKind::ChargerPresent => 1 << 0,
            NotifyKind::ChargerState => 1 << 1,
            NotifyKind::ChargerPwm => 1 << 2,
        }
    }
}

/// Pending-notification flag set.
pub struct NotifyFlags(AtomicU32);

impl NotifyFlags {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Marks `kind` as pending.
    pub fn set(&self, kind: NotifyKind) {
        self.0.fetch_or(kind.bit(), Ordering::AcqRel);
    }

    /// Takes the whole pending set, leaving it empty.
    pub fn drain(&self) -> DrainedFlags {
        DrainedFlags(self.0.swap(0, Ordering::AcqRel))
    }
}

/// Snapshot returned by [`NotifyFlags::drain`].
#[derive(Debug, Clone, Copy)]
pub struct DrainedFlags(u32);

impl DrainedFlags {
    pub fn contains(self, kind: NotifyKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// One wake-up signal per notification kind.
pub struct NotifySignals {
    pub charger_present: Signal<CriticalSectionRawMutex, ()>,
    pub charger_state: Signal<CriticalSectionRawMutex, ()>,
    pub charger_pwm: Signal<CriticalSectionRawMutex, ()>,
}

impl NotifySignals {
    pub const fn new() -> Self {
        Self {
            charger_present: Signal::new(),
            charger_state: Signal::new(),
            charger_pwm: Signal::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_takes_everything_once() {
        let flags = NotifyFlags::new();
        flags.set(NotifyKind::ChargerState);
        flags.set(NotifyKind::ChargerPwm);
        flags.set(NotifyKind::ChargerPwm);

        let drained = flags.drain();
        assert!(drained.contains(NotifyKind::ChargerState));
        assert!(drained.contains(NotifyKind::ChargerPwm));
        assert!(!drained.contains(NotifyKind::ChargerPresent));

        assert!(flags.drain().is_empty());
    }
}
