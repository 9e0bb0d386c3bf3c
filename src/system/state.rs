//! Controller state aggregate.
//!
//! One instance of [`ControllerState`] lives inside the controller's mutex
//! together with the chip backends; every field is only ever read or written
//! with the lock held. Whether a charge is actually running is not stored
//! here; that is owned by the charge-algorithm collaborator and queried.

/// Capacity class of the inserted battery, resolved from the BSI resistor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Capacity {
    /// A battery is inserted but its BSI reading matched no known class.
    Unknown,
    /// No battery inserted.
    None,
    /// Known capacity in mAh.
    Known(u16),
}

impl Capacity {
    /// Capacity in mAh, 0 unless known.
    pub fn milliamp_hours(self) -> u16 {
        match self {
            Capacity::Known(mah) => mah,
            _ => 0,
        }
    }
}

/// The single mutable state aggregate.
#[derive(Debug)]
pub struct ControllerState {
    /// A battery is inserted, as last sampled from the status register.
    pub battery_present: bool,
    /// The charger is connected, as last sampled from the status register.
    pub charger_present: bool,
    /// Capacity class of the inserted battery. Only changes on a
    /// battery-presence edge.
    pub capacity: Capacity,
    /// User/policy intent: do we want to charge when possible?
    pub charger_enabled: bool,
    /// Last PWM duty cycle written to the charge-current register.
    /// 0 whenever no charge is active.
    pub active_current_pwm: u8,
    /// Current-measurement circuitry enable refcount; the hardware is
    /// powered iff this is positive.
    pub current_measure_refcount: i32,
    /// Log every charge-state sample at info level.
    pub verbose_charge_log: bool,
    /// Hardware setup completed; gates the run loops and teardown.
    pub initialized: bool,
}

impl ControllerState {
    pub const fn new() -> Self {
        Self {
            battery_present: false,
            charger_present: false,
            capacity: Capacity::None,
            charger_enabled: false,
            active_current_pwm: 0,
            current_measure_refcount: 0,
            verbose_charge_log: false,
            initialized: false,
        }
    }

    /// A battery of known, non-zero capacity is inserted.
    pub fn known_battery_present(&self) -> bool {
        self.battery_present && matches!(self.capacity, Capacity::Known(mah) if mah > 0)
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}
