//! Interface to the charge-algorithm collaborator.
//!
//! The algorithm owns the charging policy: given periodic voltage, current
//! and temperature samples it decides what PWM duty cycle to request and
//! when the battery counts as full or faulted. The controller owns the
//! hardware; the algorithm reaches it only through the [`PwmSink`] capability
//! handed to each update call, never through a structural back-reference.

/// Verdict of one algorithm update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargeStep {
    /// Keep charging.
    Continue,
    /// The battery is fully charged; charging stops.
    Full,
    /// The algorithm detected a fault; charging stops.
    Fault,
}

/// Capability to request a charge-current duty cycle.
///
/// Implemented by the controller; calls re-enter its PWM-write path under
/// the lock already held for the update, so the write and the bookkeeping
/// stay atomic. May only be invoked while charging is active.
pub trait PwmSink {
    fn set_current_pwm(&mut self, duty_cycle: u8);
}

/// A LiPo charge algorithm.
///
/// Exactly one of these is attached to the controller at construction time.
/// `is_charging` is the single source of truth for whether a charge is in
/// progress; the controller queries it and never tracks charging itself.
pub trait ChargeAlgorithm {
    /// Begins a charge cycle for a battery of the given capacity.
    fn start(&mut self, capacity_mah: u16);

    /// Ends the charge cycle. Must be idempotent.
    fn stop(&mut self);

    /// Whether a charge cycle is currently active.
    fn is_charging(&self) -> bool;

    /// Opaque numeric state for the external attribute surface.
    fn state(&self) -> u8;

    /// Feeds one (voltage, current, temperature) sample to the policy.
    /// Current is signed: negative values mean the cell is discharging.
    fn update_state(&mut self, mv: u16, ma: i16, temp: u16, pwm: &mut dyn PwmSink)
        -> ChargeStep;
}
