//! The battery/charger controller.
//!
//! One [`Controller`] exists per device. It owns both chip backends, the
//! calibration table and the state aggregate behind a single mutex, plus the
//! event channel and notification plumbing that everything else talks to.
//! No ambient globals: a firmware binary constructs the controller once,
//! parks it in a static cell and passes the reference to its tasks.
//!
//! Blocking work (multi-sample ADC averaging, the 10 ms settle delay in the
//! measurement pipeline) deliberately happens while the lock is held;
//! overlapping those register sequences with concurrent writes would corrupt
//! the charger's PWM-override sequencing.

mod charging;
mod measure;


use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};

use crate::calib::{self, CalibrationTable, ParseError};
use crate::charge::ChargeAlgorithm;
use crate::hw::{AdcError, ChargerChip, MonitorChip, Platform};
use crate::regs;
use crate::system::event::{Event, EventChannel};
use crate::system::notify::{NotifyFlags, NotifyKind, NotifySignals};
use crate::system::state::ControllerState;

pub use measure::millivolt_to_percent;

/// Cadence of the periodic presence/safety check.
const CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Why initialization failed. The controller stays unusable afterwards: no
/// charging, but also no discharge protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError {
    /// The calibration image was rejected.
    Calibration(ParseError),
    /// The ADC ground-reference sanity read failed.
    Adc(AdcError),
}

/// Everything behind the one lock: chips, algorithm, calibration, state.
struct Inner<M, C, A, P> {
    monitor: M,
    charger: C,
    algo: A,
    platform: P,
    calib: CalibrationTable,
    state: ControllerState,
}

impl<M, C, A, P> Inner<M, C, A, P>
where
    M: MonitorChip,
    C: ChargerChip,
    A: ChargeAlgorithm,
    P: Platform,
{
    /// Unrecoverable halt. Callers must not touch state after this; the
    /// signature makes that impossible.
    fn emergency(&mut self, reason: &str) -> ! {
        error!("battery management fatal fault: {}", reason);
        self.platform.emergency(reason)
    }
}

/// Lock-free side of the controller: the event queue and notification
/// plumbing, postable from any context.
struct Shared {
    events: EventChannel,
    flags: NotifyFlags,
    signals: NotifySignals,
}

impl Shared {
    /// Marks `kind` pending and wakes the worker. If the queue is full a
    /// `Notify` event is already in flight and the flag will be picked up
    /// with it.
    fn post(&self, kind: NotifyKind) {
        self.flags.set(kind);
        let _ = self.events.try_send(Event::Notify);
    }
}

/// The battery/charger controller. See the module docs.
pub struct Controller<M, C, A, P> {
    inner: Mutex<CriticalSectionRawMutex, Inner<M, C, A, P>>,
    shared: Shared,
    stop_request: Signal<CriticalSectionRawMutex, ()>,
    heartbeat_stopped: Signal<CriticalSectionRawMutex, ()>,
    worker_stopped: Signal<CriticalSectionRawMutex, ()>,
}

impl<M, C, A, P> Controller<M, C, A, P>
where
    M: MonitorChip,
    C: ChargerChip,
    A: ChargeAlgorithm,
    P: Platform,
{
    /// Builds an uninitialized controller around the chip backends, the
    /// charge algorithm and the platform services.
    pub fn new(monitor: M, charger: C, algo: A, platform: P) -> Self {
        Self {
            inner: Mutex::new(Inner {
                monitor,
                charger,
                algo,
                platform,
                calib: CalibrationTable::with_defaults(),
                state: ControllerState::new(),
            }),
            shared: Shared {
                events: EventChannel::new(),
                flags: NotifyFlags::new(),
                signals: NotifySignals::new(),
            },
            stop_request: Signal::new(),
            heartbeat_stopped: Signal::new(),
            worker_stopped: Signal::new(),
        }
    }

    /// Brings the hardware up from a calibration image.
    ///
    /// The image acquisition is the caller's business (it is an external,
    /// possibly slow fetch); until this succeeds the controller idles and
    /// every run loop is a no-op. A rejected image or a failed ADC sanity
    /// read leaves the controller uninitialized for good.
    pub async fn initialize(&self, pmm_image: &[u8]) -> Result<(), InitError> {
        let table = match calib::parse(pmm_image) {
            Ok(table) => table,
            Err(err) => {
                error!("calibration image rejected: {:?}", err);
                return Err(InitError::Calibration(err));
            }
        };

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.calib = table;

        inner.check_adc_sanity().await.map_err(InitError::Adc)?;
        inner.stop_charge(&self.shared);
        inner.charger.disable_current_irq();

        inner.state.initialized = true;
        info!("battery management initialized");
        Ok(())
    }

    /// Stops the deferred activities in order (heartbeat, then the worker
    /// with its queued notify/measure events) and releases the hardware.
    pub async fn shutdown(&self) {
        if !self.inner.lock().await.state.initialized {
            return;
        }

        self.stop_request.signal(());
        self.heartbeat_stopped.wait().await;

        self.shared.events.send(Event::Shutdown).await;
        self.worker_stopped.wait().await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.stop_charge(&self.shared);
        inner.monitor.write(regs::monitor::REG_ADC_SCAN_CTRL, 0);
        inner.state.initialized = false;
        info!("battery management stopped");
    }

    /// Worker loop: drains the event channel until shutdown. Spawn exactly
    /// one instance.
    pub async fn run_worker(&self) {
        info!("battery management worker started");
        loop {
            match self.shared.events.receive().await {
                Event::PeriodicTick => self.periodic_check().await,
                Event::CurrentReady => self.current_measure_work().await,
                Event::Notify => self.notify_work(),
                Event::Shutdown => break,
            }
        }
        self.worker_stopped.signal(());
    }

    /// Heartbeat loop: posts a periodic tick every 2 seconds until shutdown.
    /// The tick is posted after the interval, never before, so two checks
    /// are always at least one interval apart.
    pub async fn run_heartbeat(&self) {
        loop {
            match select(Timer::after(CHECK_INTERVAL), self.stop_request.wait()).await {
                Either::First(()) => self.shared.events.send(Event::PeriodicTick).await,
                Either::Second(()) => break,
            }
        }
        self.heartbeat_stopped.signal(());
    }

    /// Current-ready interrupt hook. Safe to call from interrupt context:
    /// only posts an event, the worker acknowledges the line. A full queue
    /// is fine, the pending event already covers this sample.
    pub fn on_current_ready_irq(&self) {
        let _ = self.shared.events.try_send(Event::CurrentReady);
    }

    /// Emits one wake-up per pending notification kind.
    fn notify_work(&self) {
        let drained = self.shared.flags.drain();
        if drained.contains(NotifyKind::ChargerPresent) {
            self.shared.signals.charger_present.signal(());
        }
        if drained.contains(NotifyKind::ChargerState) {
            self.shared.signals.charger_state.signal(());
        }
        if drained.contains(NotifyKind::ChargerPwm) {
            self.shared.signals.charger_pwm.signal(());
        }
    }

    // --- attribute surface -------------------------------------------------

    pub async fn battery_present(&self) -> bool {
        self.inner.lock().await.state.battery_present
    }

    pub async fn charger_present(&self) -> bool {
        self.inner.lock().await.state.charger_present
    }

    /// Battery charge level in percent. Not available while charging (the
    /// PWM output skews the voltage reading) or without a battery.
    pub async fn battery_level(&self) -> Option<u8> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if !inner.state.battery_present || inner.algo.is_charging() {
            return None;
        }
        let mv = inner.measure_batt_voltage().await.ok()?;
        Some(millivolt_to_percent(mv))
    }

    /// Signed battery current estimate in mA; runs an active measurement.
    /// Reads 0 without a battery.
    pub async fn battery_current(&self) -> i16 {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if !inner.state.battery_present {
            return 0;
        }
        inner.measure_batt_current_oneshot()
    }

    /// Capacity of the inserted battery in mAh, 0 if absent or unknown.
    pub async fn battery_capacity(&self) -> u16 {
        let guard = self.inner.lock().await;
        if guard.state.known_battery_present() {
            guard.state.capacity.milliamp_hours()
        } else {
            0
        }
    }

    /// Battery temperature in raw ADC units.
    pub async fn battery_temp(&self) -> Option<u16> {
        self.inner.lock().await.measure_batt_temp().await.ok()
    }

    /// Backup battery voltage in raw ADC units.
    pub async fn backup_battery_voltage(&self) -> Option<u16> {
        self.inner
            .lock()
            .await
            .measure_backup_batt_voltage()
            .await
            .ok()
    }

    /// Charger voltage in raw ADC units; 0 while no charger is plugged.
    pub async fn charger_voltage(&self) -> Option<u16> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if !inner.state.charger_present {
            return Some(0);
        }
        inner.measure_charger_voltage().await.ok()
    }

    /// Opaque state of the charge algorithm.
    pub async fn charger_state(&self) -> u8 {
        self.inner.lock().await.algo.state()
    }

    pub async fn charger_pwm(&self) -> u8 {
        self.inner.lock().await.state.active_current_pwm
    }

    pub async fn charger_enable(&self) -> bool {
        self.inner.lock().await.state.charger_enabled
    }

    /// Sets the charge intent. Takes effect on the next periodic check.
    pub async fn set_charger_enable(&self, enabled: bool) {
        self.inner.lock().await.state.charger_enabled = enabled;
    }

    pub async fn charger_verbose(&self) -> bool {
        self.inner.lock().await.state.verbose_charge_log
    }

    pub async fn set_charger_verbose(&self, verbose: bool) {
        self.inner.lock().await.state.verbose_charge_log = verbose;
    }

    // --- change notification ----------------------------------------------

    /// Completes on the next `charger_present` change after the call.
    pub async fn wait_charger_present_changed(&self) {
        self.shared.signals.charger_present.wait().await
    }

    /// Completes on the next charge-state change after the call.
    pub async fn wait_charger_state_changed(&self) {
        self.shared.signals.charger_state.wait().await
    }

    /// Completes on the next PWM duty-cycle change after the call.
    pub async fn wait_charger_pwm_changed(&self) {
        self.shared.signals.charger_pwm.wait().await
    }
}
