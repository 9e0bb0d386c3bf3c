//! Backend traits for the two power-management chips.
//!
//! The chips sit behind a platform bus the controller knows nothing about;
//! the firmware binary implements these traits on top of its bus driver and
//! hands the implementations to [`Controller::new`](crate::Controller::new).
//! Register accesses cannot fail on this bus, so only the ADC conversion,
//! which involves an analog settling sequence, returns a `Result`.

/// Physical ADC channel ids of the monitor chip, plus the chip-internal
/// reference id `0xFE` used by the calibration block.
///
/// The discriminants are wire values: they index the calibration table and
/// select the ADC input multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ChannelId {
    /// Battery voltage.
    BatVolt = 0x01,
    /// Charger voltage.
    ChgVolt = 0x02,
    /// Ground reference, reads 0 V on healthy hardware.
    Gnd2 = 0x03,
    /// Battery size indicator resistor.
    Bsi = 0x04,
    /// Battery temperature.
    BatTemp = 0x05,
    /// Headset detection.
    Headset = 0x06,
    /// Hook detection.
    HookDet = 0x07,
    /// Ambient light sensor.
    LightSens = 0x08,
    /// Battery current.
    BatCurr = 0x0E,
    /// Backup battery voltage.
    BkupVolt = 0x13,
    /// Light sensor temperature.
    LightTemp = 0x14,
    /// RF general purpose input.
    RfGp = 0x15,
    /// Wideband TX detection.
    WbTx = 0x16,
    /// Monitor chip die temperature.
    ChipTemp = 0x17,
    /// Chip-internal reference, only ever seen in the calibration block.
    Internal = 0xFE,
}

impl ChannelId {
    /// Maps a raw id byte from the calibration block back to a channel.
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => Self::BatVolt,
            0x02 => Self::ChgVolt,
            0x03 => Self::Gnd2,
            0x04 => Self::Bsi,
            0x05 => Self::BatTemp,
            0x06 => Self::Headset,
            0x07 => Self::HookDet,
            0x08 => Self::LightSens,
            0x0E => Self::BatCurr,
            0x13 => Self::BkupVolt,
            0x14 => Self::LightTemp,
            0x15 => Self::RfGp,
            0x16 => Self::WbTx,
            0x17 => Self::ChipTemp,
            0xFE => Self::Internal,
            _ => return None,
        })
    }

    /// The raw wire value.
    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// A single ADC conversion failed. Transient: callers report the failure and
/// skip the current cycle's action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AdcError;

/// Register access to the monitor chip (status register, ADC frontend).
pub trait MonitorChip {
    fn read(&mut self, reg: u8) -> u16;
    fn write(&mut self, reg: u8, value: u16);

    /// Clears `mask`, then sets `set` (which must be a subset of `mask`), as
    /// one atomic register update.
    fn maskset(&mut self, reg: u8, mask: u16, set: u16);

    fn set_bits(&mut self, reg: u8, mask: u16) {
        self.maskset(reg, mask, mask);
    }

    fn clear_bits(&mut self, reg: u8, mask: u16) {
        self.maskset(reg, mask, 0);
    }

    /// Runs one ADC conversion on `channel`. May block for the conversion
    /// time; the only fallible chip primitive.
    async fn read_adc(&mut self, channel: ChannelId) -> Result<u16, AdcError>;
}

/// Register access to the charger chip, plus control over its current-ready
/// interrupt line.
pub trait ChargerChip {
    fn read(&mut self, reg: u8) -> u16;
    fn write(&mut self, reg: u8, value: u16);

    /// Clears `mask`, then sets `set` (which must be a subset of `mask`), as
    /// one atomic register update.
    fn maskset(&mut self, reg: u8, mask: u16, set: u16);

    fn set_bits(&mut self, reg: u8, mask: u16) {
        self.maskset(reg, mask, mask);
    }

    fn clear_bits(&mut self, reg: u8, mask: u16) {
        self.maskset(reg, mask, 0);
    }

    /// Acknowledges the current-ready interrupt so the line can fire again.
    fn ack_current_irq(&mut self);
    fn enable_current_irq(&mut self);
    fn disable_current_irq(&mut self);
}

/// Device-level services the controller cannot provide itself.
pub trait Platform {
    /// Unrecoverable halt of the whole device. Invoked when continuing to
    /// run would risk over-discharging or otherwise damaging the battery.
    /// Must not return.
    fn emergency(&mut self, reason: &str) -> !;
}
