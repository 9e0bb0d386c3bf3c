//! Measurement layer: raw ADC sampling and conversion.
//!
//! Every measurement averages a handful of raw conversions; the counts are
//! protocol, not tuning knobs. Conversion to physical units is only
//! implemented for the battery voltage channel; the other channels pass the
//! raw value through until their scale factors are understood.

use crate::charge::ChargeAlgorithm;
use crate::hw::{AdcError, ChannelId, ChargerChip, MonitorChip, Platform};
use crate::regs::charger::{
    CTL_ENABLE, CTL_CURRENT_MEASURE, CTL_PWM_OVERRIDE, CTL_PWM_OVERRIDE_ZERO, REG_BAT_CURR,
    REG_CHG_CTL,
};
use crate::regs::monitor::REG_ADC_SCAN_CTRL;
use crate::system::state::Capacity;

use super::Inner;

/// Raw battery-voltage reading at 2.80 V.
const BATT_ADC_LOW: u16 = 0x37;
/// Raw battery-voltage reading at 4.20 V.
const BATT_ADC_HIGH: u16 = 0x236;

/// BSI reading identifying the 1500 mAh battery class.
const BSI_1500MAH: u16 = 0x3B5;
/// Acceptance window around [`BSI_1500MAH`], in raw units.
const BSI_HYSTERESIS: u16 = 20;

/// Maps an averaged raw battery-voltage reading onto millivolts.
///
/// Linear fit between the two measured calibration points; readings at or
/// below the low anchor clamp to 2800 mV exactly.
fn batt_adc_to_mv(adc: u16) -> u16 {
    const SCALE: u32 = 1000;
    if adc <= BATT_ADC_LOW {
        return 2800;
    }
    let slope = ((4200 - 2800) * SCALE) / (BATT_ADC_HIGH - BATT_ADC_LOW) as u32;
    (2800 + ((adc - BATT_ADC_LOW) as u32 * slope) / SCALE) as u16
}

/// Converts a battery voltage to a charge percentage over the usable
/// discharge range, clamping outside [3700, 4150] mV.
pub fn millivolt_to_percent(mv: u16) -> u8 {
    const MIN_MV: u32 = 3700;
    const MAX_MV: u32 = 4150;

    let mv = (mv as u32).clamp(MIN_MV, MAX_MV);
    ((mv - MIN_MV) * 100 / (MAX_MV - MIN_MV)) as u8
}

impl<M, C, A, P> Inner<M, C, A, P>
where
    M: MonitorChip,
    C: ChargerChip,
    A: ChargeAlgorithm,
    P: Platform,
{
    /// Averages `passes` raw conversions of `channel`.
    async fn adc_average(&mut self, channel: ChannelId, passes: u32) -> Result<u16, AdcError> {
        debug_assert!(passes > 0);
        let mut acc: u32 = 0;
        for _ in 0..passes {
            acc += u32::from(self.monitor.read_adc(channel).await?);
        }
        Ok((acc / passes) as u16)
    }

    /// Battery voltage in mV.
    pub(super) async fn measure_batt_voltage(&mut self) -> Result<u16, AdcError> {
        let adc = self.adc_average(ChannelId::BatVolt, 5).await?;
        // TODO: compensate for current draw and apply the calibration table
        // once the field semantics of the voltage slots are worked out.
        Ok(batt_adc_to_mv(adc))
    }

    /// Charger voltage, raw ADC units (unit conversion not implemented).
    pub(super) async fn measure_charger_voltage(&mut self) -> Result<u16, AdcError> {
        self.adc_average(ChannelId::ChgVolt, 5).await
    }

    /// Backup battery voltage, raw ADC units (unit conversion not
    /// implemented).
    pub(super) async fn measure_backup_batt_voltage(&mut self) -> Result<u16, AdcError> {
        self.adc_average(ChannelId::BkupVolt, 3).await
    }

    /// Battery temperature, raw ADC units (unit conversion not implemented).
    pub(super) async fn measure_batt_temp(&mut self) -> Result<u16, AdcError> {
        self.adc_average(ChannelId::BatTemp, 3).await
    }

    /// Resolves the capacity class of the inserted battery from its BSI
    /// resistor.
    pub(super) async fn read_batt_capacity(&mut self) -> Capacity {
        let adc = match self.adc_average(ChannelId::Bsi, 5).await {
            Ok(adc) => adc,
            Err(_) => {
                error!("failed to read the BSI ADC");
                return Capacity::Unknown;
            }
        };

        if (BSI_1500MAH - BSI_HYSTERESIS..=BSI_1500MAH + BSI_HYSTERESIS).contains(&adc) {
            return Capacity::Known(1500);
        }

        error!("capacity indicator {} unknown", adc);
        Capacity::Unknown
    }

    /// Powers the current-measurement circuitry on the first enable.
    pub(super) fn enable_current_measure(&mut self) {
        assert!(self.state.current_measure_refcount >= 0);
        if self.state.current_measure_refcount == 0 {
            self.charger.set_bits(REG_CHG_CTL, CTL_CURRENT_MEASURE);
            debug!("current measurement circuitry enabled");
        }
        self.state.current_measure_refcount += 1;
    }

    /// Powers the circuitry down on the last disable. An unbalanced disable
    /// is a logic defect, not an environment condition.
    pub(super) fn disable_current_measure(&mut self) {
        self.state.current_measure_refcount -= 1;
        assert!(
            self.state.current_measure_refcount >= 0,
            "current-measure refcount went negative"
        );
        if self.state.current_measure_refcount == 0 {
            self.charger.clear_bits(REG_CHG_CTL, CTL_CURRENT_MEASURE);
            debug!("current measurement circuitry disabled");
        }
    }

    /// Averaged battery current in mA, sign preserved (negative while
    /// discharging). Only meaningful while the circuitry is powered.
    pub(super) fn measure_batt_current(&mut self) -> i16 {
        if self.state.current_measure_refcount <= 0 {
            debug_assert!(false, "battery current read while measurement is disabled");
            return 0;
        }
        let mut acc: i32 = 0;
        for _ in 0..3 {
            acc += i32::from(self.charger.read(REG_BAT_CURR) as i16);
        }
        // TODO: scale to mA with the battery-current calibration slope.
        (acc / 3) as i16
    }

    /// One-shot battery current measurement, outside a charge cycle.
    ///
    /// While charging, the PWM output is forced to zero for the sample so
    /// the ADC sees the true cell current; the prior override mode is
    /// restored afterwards. Runs under the controller lock by construction.
    pub(super) fn measure_batt_current_oneshot(&mut self) -> i16 {
        let charging = self.algo.is_charging();

        self.enable_current_measure();
        if !charging {
            debug_assert_eq!(self.state.active_current_pwm, 0);
        }
        self.charger.maskset(
            REG_CHG_CTL,
            CTL_ENABLE | CTL_PWM_OVERRIDE | CTL_PWM_OVERRIDE_ZERO,
            CTL_ENABLE
                | CTL_PWM_OVERRIDE
                | if charging { 0 } else { CTL_PWM_OVERRIDE_ZERO },
        );
        let ma = self.measure_batt_current();
        self.charger.maskset(
            REG_CHG_CTL,
            CTL_ENABLE | CTL_PWM_OVERRIDE | CTL_PWM_OVERRIDE_ZERO,
            if charging { CTL_ENABLE } else { 0 },
        );
        self.disable_current_measure();

        ma
    }

    /// Ground-reference sanity check of the ADC frontend.
    ///
    /// A ground channel reading above a few counts means the measurement
    /// path cannot be trusted, and with it none of the voltage decisions
    /// protecting the battery: that is an emergency, not an error.
    pub(super) async fn check_adc_sanity(&mut self) -> Result<(), AdcError> {
        // Reset the scanner and discard one conversion.
        self.monitor.write(REG_ADC_SCAN_CTRL, 0);
        let _ = self.monitor.read_adc(ChannelId::Gnd2).await;

        let value = match self.monitor.read_adc(ChannelId::Gnd2).await {
            Ok(value) => value,
            Err(err) => {
                error!("failed to read the ground ADC channel");
                return Err(err);
            }
        };
        debug!("ground ADC sanity check read {}", value);
        if value > 5 {
            self.emergency("ground ADC sanity check failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_endpoints() {
        assert_eq!(millivolt_to_percent(3700), 0);
        assert_eq!(millivolt_to_percent(4150), 100);
    }

    #[test]
    fn percent_clamps_out_of_range() {
        assert_eq!(millivolt_to_percent(0), 0);
        assert_eq!(millivolt_to_percent(3699), 0);
        assert_eq!(millivolt_to_percent(4151), 100);
        assert_eq!(millivolt_to_percent(u16::MAX), 100);
    }

    #[test]
    fn percent_is_monotonic() {
        let mut last = 0;
        for mv in 3600..=4200 {
            let pct = millivolt_to_percent(mv);
            assert!(pct >= last);
            last = pct;
        }
    }

    #[test]
    fn batt_voltage_low_clamp() {
        assert_eq!(batt_adc_to_mv(0), 2800);
        assert_eq!(batt_adc_to_mv(BATT_ADC_LOW), 2800);
    }

    #[test]
    fn batt_voltage_linear_fit() {
        // Integer slope truncation puts the high anchor at 4199 mV.
        assert_eq!(batt_adc_to_mv(BATT_ADC_HIGH), 4199);
        assert!(batt_adc_to_mv(0x136) > 3400 && batt_adc_to_mv(0x136) < 3600);
    }
}
