//! Register addresses and bit masks for the two power-management chips.
//!
//! Only the registers the battery controller actually touches are listed.
//! All registers are 16 bit wide on both chips.

/// Monitor chip: status bits and the ADC frontend.
pub mod monitor {
    /// Presence status register.
    pub const REG_STATUS: u8 = 0x16;
    /// A battery is inserted.
    pub const STATUS_BATTERY_PRESENT: u16 = 1 << 0;
    /// The charger plug is connected.
    pub const STATUS_CHARGER_PLUGGED: u16 = 1 << 1;

    /// ADC scan control register. Writing 0 resets the scanner and discards
    /// the conversion in flight.
    pub const REG_ADC_SCAN_CTRL: u8 = 0x1A;
}

/// Charger chip: charge-current PWM driver and current measurement.
pub mod charger {
    /// Charge control register.
    pub const REG_CHG_CTL: u8 = 0x08;
    /// Charger global enable.
    pub const CTL_ENABLE: u16 = 1 << 0;
    /// Override the PWM duty cycle set via [`REG_CHG_PWM`].
    pub const CTL_PWM_OVERRIDE: u16 = 1 << 1;
    /// With [`CTL_PWM_OVERRIDE`] set, force the override duty cycle to zero
    /// instead of full-on.
    pub const CTL_PWM_OVERRIDE_ZERO: u16 = 1 << 2;
    /// Power the current-measurement circuitry.
    pub const CTL_CURRENT_MEASURE: u16 = 1 << 3;
    /// Reset the current-measurement timer. Pulsed, not held.
    pub const CTL_CURRENT_TIMER_RESET: u16 = 1 << 4;

    /// Charge-current PWM duty cycle, 0-255 in the low byte.
    pub const REG_CHG_PWM: u8 = 0x09;

    /// Measured battery current, signed 16 bit raw units. Only valid while
    /// the current-measurement circuitry is powered.
    pub const REG_BAT_CURR: u8 = 0x0A;

    /// Current-measurement timer reload value. The current-ready interrupt
    /// fires each time the timer expires.
    pub const REG_CURR_TIMER: u8 = 0x0B;
}
