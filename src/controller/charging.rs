//! Charge state machine: start/stop, the periodic presence/safety check and
//! the current-measurement pipeline driven by the charger chip's timer
//! interrupt.

use embassy_time::Timer;

use crate::charge::{ChargeAlgorithm, ChargeStep, PwmSink};
use crate::hw::{ChargerChip, MonitorChip, Platform};
use crate::regs::charger::{
    CTL_CURRENT_TIMER_RESET, CTL_ENABLE, CTL_PWM_OVERRIDE, CTL_PWM_OVERRIDE_ZERO, REG_CHG_CTL,
    REG_CHG_PWM, REG_CURR_TIMER,
};
use crate::regs::monitor::{REG_STATUS, STATUS_BATTERY_PRESENT, STATUS_CHARGER_PLUGGED};
use crate::system::notify::NotifyKind;
use crate::system::state::{Capacity, ControllerState};

use super::{Controller, Inner, Shared};

/// Absolute minimum battery voltage. Observing a discharging battery below
/// this floor triggers the emergency halt.
const MIN_VOLTAGE_THRESHOLD_MV: u16 = 3200;

/// Interval of the hardware current-measurement timer while charging.
const CURRENT_MEASURE_INTERVAL_MS: u16 = 250;

/// Converts a millisecond interval to the timer's reload register value.
fn curr_timer_reload(millisec_interval: u16) -> u16 {
    if millisec_interval <= 0xF905 {
        let value = ((0x1062_4DD3u64 * (u64::from(millisec_interval) + 0xF9)) >> 32) as u16;
        value / 16
    } else {
        0xFF
    }
}

/// The controller's PWM-write path, handed to the charge algorithm as its
/// only way to request a duty cycle. Lives for one `update_state` call.
struct PwmWriter<'a, C> {
    charger: &'a mut C,
    state: &'a mut ControllerState,
    shared: &'a Shared,
}

impl<C: ChargerChip> PwmSink for PwmWriter<'_, C> {
    fn set_current_pwm(&mut self, duty_cycle: u8) {
        assert!(
            self.state.charger_enabled,
            "PWM requested while charging is disabled"
        );
        assert!(
            self.state.battery_present && self.state.charger_present,
            "PWM requested without battery and charger"
        );

        if duty_cycle != self.state.active_current_pwm {
            self.state.active_current_pwm = duty_cycle;
            self.charger.write(REG_CHG_PWM, u16::from(duty_cycle));
            self.shared.post(NotifyKind::ChargerPwm);
        }
    }
}

impl<M, C, A, P> Inner<M, C, A, P>
where
    M: MonitorChip,
    C: ChargerChip,
    A: ChargeAlgorithm,
    P: Platform,
{
    /// Arms the hardware current-measurement timer; 0 disarms it. The
    /// current-ready interrupt is enabled iff the timer runs.
    fn set_current_measure_timer(&mut self, millisec_interval: u16) {
        let reload = curr_timer_reload(millisec_interval);
        self.charger.write(REG_CURR_TIMER, reload & 0xFF);

        self.charger.set_bits(REG_CHG_CTL, CTL_CURRENT_TIMER_RESET);
        self.charger.clear_bits(REG_CHG_CTL, CTL_CURRENT_TIMER_RESET);

        if millisec_interval != 0 {
            self.charger.enable_current_irq();
        } else {
            self.charger.disable_current_irq();
        }
        // TODO: back this with a software timer in case the timer interrupt
        // is lost.
    }

    /// Begins a charge cycle. Preconditions are asserted, not checked: the
    /// periodic monitor is the only caller and establishes all of them.
    pub(super) fn start_charge(&mut self, shared: &Shared) {
        assert!(self.state.battery_present, "charge start without a battery");
        assert!(self.state.charger_present, "charge start without a charger");

        // PWM to zero before enabling; the algorithm ramps it up.
        self.state.active_current_pwm = 0;
        self.charger
            .write(REG_CHG_PWM, u16::from(self.state.active_current_pwm));

        // Charger global enable, overrides off.
        self.charger.maskset(
            REG_CHG_CTL,
            CTL_ENABLE | CTL_PWM_OVERRIDE | CTL_PWM_OVERRIDE_ZERO,
            CTL_ENABLE,
        );

        let capacity_mah = self.state.capacity.milliamp_hours();
        assert!(capacity_mah > 0, "charge start without a known capacity");
        self.algo.start(capacity_mah);

        self.enable_current_measure();
        self.set_current_measure_timer(CURRENT_MEASURE_INTERVAL_MS);

        info!("charging battery");
        shared.post(NotifyKind::ChargerState);
        shared.post(NotifyKind::ChargerPwm);
    }

    /// Ends the charge cycle. Idempotent; safe to call while idle.
    pub(super) fn stop_charge(&mut self, shared: &Shared) {
        if self.algo.is_charging() {
            self.set_current_measure_timer(0);
            self.disable_current_measure();
        }
        self.algo.stop();

        self.state.active_current_pwm = 0;
        self.charger
            .write(REG_CHG_PWM, u16::from(self.state.active_current_pwm));

        // Charger global disable, overrides off.
        self.charger.maskset(
            REG_CHG_CTL,
            CTL_ENABLE | CTL_PWM_OVERRIDE | CTL_PWM_OVERRIDE_ZERO,
            0,
        );

        info!("not charging battery");
        shared.post(NotifyKind::ChargerState);
        shared.post(NotifyKind::ChargerPwm);
    }
}

impl<M, C, A, P> Controller<M, C, A, P>
where
    M: MonitorChip,
    C: ChargerChip,
    A: ChargeAlgorithm,
    P: Platform,
{
    /// One periodic pass: sample presence, track capacity across presence
    /// edges, enforce the discharge floor, start or stop charging.
    pub(super) async fn periodic_check(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if !inner.state.initialized {
            return;
        }

        let status = inner.monitor.read(REG_STATUS);
        let battery_was_present = inner.state.battery_present;
        let charger_was_present = inner.state.charger_present;
        inner.state.battery_present = status & STATUS_BATTERY_PRESENT != 0;
        inner.state.charger_present = status & STATUS_CHARGER_PLUGGED != 0;

        if inner.state.battery_present != battery_was_present {
            if inner.state.battery_present {
                inner.state.capacity = inner.read_batt_capacity().await;
                match inner.state.capacity {
                    Capacity::Known(mah) => info!("detected {} mAh battery", mah),
                    _ => error!("unknown battery detected"),
                }
            } else {
                inner.state.capacity = Capacity::None;
                info!("the main battery was removed");
            }
        }

        if inner.state.charger_present != charger_was_present {
            if inner.state.charger_present {
                info!("the charger was plugged in");
            } else {
                info!("the charger was removed");
            }
            self.shared.post(NotifyKind::ChargerPresent);
        }

        if (inner.state.battery_present && !inner.state.charger_present)
            || !inner.state.known_battery_present()
        {
            // We are draining the battery; below the floor the only safe
            // move left is halting the whole device.
            match inner.measure_batt_voltage().await {
                Err(_) => inner.emergency("periodic check: failed to measure voltage"),
                Ok(mv) if mv < MIN_VOLTAGE_THRESHOLD_MV => {
                    inner.emergency("periodic check: minimum voltage threshold reached")
                }
                Ok(_) => {}
            }
        }

        if inner.state.charger_present
            && inner.state.known_battery_present()
            && inner.state.charger_enabled
            && !inner.algo.is_charging()
        {
            // TODO: only start once the battery drops below a restart
            // threshold instead of topping up immediately.
            inner.start_charge(&self.shared);
        }

        if inner.algo.is_charging() && !inner.state.charger_present {
            inner.stop_charge(&self.shared);
        }
    }

    /// Deferred half of the current-ready interrupt: sample current with the
    /// true PWM output, voltage with the output suppressed, then temperature,
    /// and feed the triple to the charge algorithm.
    pub(super) async fn current_measure_work(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        inner.charger.ack_current_irq();
        if !inner.algo.is_charging() {
            return;
        }

        // Let the ADC see the real charge current.
        inner.charger.maskset(
            REG_CHG_CTL,
            CTL_PWM_OVERRIDE | CTL_PWM_OVERRIDE_ZERO,
            CTL_PWM_OVERRIDE,
        );
        let ma = inner.measure_batt_current();

        // Suppress the output and let the line settle before reading the
        // open-circuit voltage.
        inner.charger.maskset(
            REG_CHG_CTL,
            CTL_PWM_OVERRIDE | CTL_PWM_OVERRIDE_ZERO,
            CTL_PWM_OVERRIDE | CTL_PWM_OVERRIDE_ZERO,
        );
        Timer::after_millis(10).await;
        let mv = inner.measure_batt_voltage().await;

        inner
            .charger
            .maskset(REG_CHG_CTL, CTL_PWM_OVERRIDE | CTL_PWM_OVERRIDE_ZERO, 0);
        let temp = inner.measure_batt_temp().await;

        let Ok(mv) = mv else {
            warn!("charge sample: voltage read failed");
            return;
        };
        let Ok(temp) = temp else {
            warn!("charge sample: temperature read failed");
            return;
        };

        if inner.state.verbose_charge_log {
            info!(
                "battery charge state: {} mV, {} mA ({})",
                mv,
                ma,
                if ma <= 0 { "discharging" } else { "charging" }
            );
        }

        let step = {
            let Inner {
                charger,
                state,
                algo,
                ..
            } = &mut *inner;
            let mut pwm = PwmWriter {
                charger,
                state,
                shared: &self.shared,
            };
            algo.update_state(mv, ma, temp, &mut pwm)
        };

        if step != ChargeStep::Continue {
            if step == ChargeStep::Full {
                info!("battery fully charged");
            }
            inner.stop_charge(&self.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_reload_values() {
        // 0 disarms: reload collapses to 0.
        assert_eq!(curr_timer_reload(0), 0);
        // The 250 ms charge-sampling interval.
        assert_eq!(curr_timer_reload(250), 1);
        // Above the representable range the reload saturates.
        assert_eq!(curr_timer_reload(0xF906), 0xFF);
        // Monotonic over the representable range.
        assert!(curr_timer_reload(10_000) > curr_timer_reload(250));
    }
}
