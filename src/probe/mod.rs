// probe_host_rust/src/probe/mod.rs
// Probe cycle orchestration: deploy, approach, multi-sample acquisition,
// filtering, stow. Owns the subsystem's mutable state (deployed flag,
// sensorless adjustments, sensitivity mask).

mod driver;
mod guard;
pub mod params;
mod trigger;

pub use self::params::{
    Clearances, PersistedProbe, ProbeKind, ProbeMove, ProbeParams, ProbeSettings,
};

use std::collections::HashMap;
use std::fmt;

use serde_json::json;

use crate::bltouch::BlTouch;
use crate::configfile::{ConfigError, Configfile};
use crate::core_traits::{
    CompensationAdapter, DriverAdapter, EndstopsAdapter, Handle, MachineAdapter, MotionAdapter,
    PlannerAdapter, ProbeHardware, StepperAdapter, ThermalAdapter, UiAdapter,
};
use crate::endstops::EndstopState;
use crate::mathutil::{Axis, SenseBool, TowerValues, XyPos, XyzPos};
use self::params::UNTRUSTED_LOW_POINT;

/// Stabilization windows: a preheat wait is skipped when the current
/// temperature is already within this many degrees of the request.
pub const TEMP_WINDOW: f64 = 1.0;
pub const TEMP_BED_WINDOW: f64 = 1.0;

/// Reference away from any real probe height, used to seed the
/// largest-sensorless-adjustment scan.
const SENSORLESS_ADJ_REFERENCE: f64 = -3.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeError {
    Config(String),
    /// Requested XY (after offset application) is outside the reachable
    /// envelope.
    Unreachable,
    /// Deploy/stow needs homed axes that are not trusted.
    NotHomed,
    /// Deploy or stow verification failed; the machine has been stopped.
    DeployFailed(String),
    /// No trigger within the descent envelope, or a trigger at an
    /// implausibly high Z.
    ProbingFailed,
    TareFailed(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Config(msg) => write!(f, "{}", msg),
            ProbeError::Unreachable => write!(f, "Position Not Reachable"),
            ProbeError::NotHomed => write!(f, "Axes must be homed before deploying this probe"),
            ProbeError::DeployFailed(msg) => write!(f, "{}", msg),
            ProbeError::ProbingFailed => write!(f, "Probing failed"),
            ProbeError::TareFailed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<ConfigError> for ProbeError {
    fn from(e: ConfigError) -> Self {
        ProbeError::Config(e.to_string())
    }
}

/// What to do with Z (and the probe) after a successful measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseAfter {
    None,
    Raise,
    BigRaise,
    Stow,
    LastStow,
}

/// The firmware surfaces the probe talks to.
#[derive(Clone)]
pub struct ProbeAdapters {
    pub motion: Handle<dyn MotionAdapter>,
    pub planner: Handle<dyn PlannerAdapter>,
    pub endstops: Handle<dyn EndstopsAdapter>,
    pub thermal: Handle<dyn ThermalAdapter>,
    pub steppers: Handle<dyn StepperAdapter>,
    pub drivers: Handle<dyn DriverAdapter>,
    pub ui: Handle<dyn UiAdapter>,
    pub machine: Handle<dyn MachineAdapter>,
    pub hardware: Handle<dyn ProbeHardware>,
    pub compensation: Option<Handle<dyn CompensationAdapter>>,
}

pub struct Probe {
    pub(crate) params: ProbeParams,
    pub settings: ProbeSettings,
    pub(crate) bltouch: Option<BlTouch>,
    pub(crate) deployed: bool,
    pub test_sensitivity: SenseBool,
    pub offset_sensorless_adj: TowerValues,
    pub(crate) largest_sensorless_adj: f64,
    last_z_result: f64,

    pub(crate) motion: Handle<dyn MotionAdapter>,
    pub(crate) planner: Handle<dyn PlannerAdapter>,
    pub(crate) endstops: Handle<dyn EndstopsAdapter>,
    pub(crate) thermal: Handle<dyn ThermalAdapter>,
    pub(crate) steppers: Handle<dyn StepperAdapter>,
    pub(crate) drivers: Handle<dyn DriverAdapter>,
    pub(crate) ui: Handle<dyn UiAdapter>,
    pub(crate) machine: Handle<dyn MachineAdapter>,
    pub(crate) hardware: Handle<dyn ProbeHardware>,
    pub(crate) compensation: Option<Handle<dyn CompensationAdapter>>,
}

impl Probe {
    pub fn new(params: ProbeParams, settings: ProbeSettings, adapters: ProbeAdapters) -> Self {
        let bltouch = if params.kind == ProbeKind::BlTouch {
            Some(BlTouch::new(params.servo_nr, params.high_speed_bltouch))
        } else {
            None
        };
        let probe = Probe {
            settings,
            bltouch,
            deployed: false,
            test_sensitivity: SenseBool::default(),
            offset_sensorless_adj: TowerValues::default(),
            largest_sensorless_adj: 0.0,
            last_z_result: 0.0,
            motion: adapters.motion,
            planner: adapters.planner,
            endstops: adapters.endstops,
            thermal: adapters.thermal,
            steppers: adapters.steppers,
            drivers: adapters.drivers,
            ui: adapters.ui,
            machine: adapters.machine,
            hardware: adapters.hardware,
            compensation: adapters.compensation,
            params,
        };
        probe.tare_init();
        probe
    }

    pub fn from_config(config: &Configfile, adapters: ProbeAdapters) -> Result<Self, ProbeError> {
        let params = ProbeParams::new(config)?;
        let settings = ProbeSettings::new(config)?;
        Ok(Probe::new(params, settings, adapters))
    }

    pub fn params(&self) -> &ProbeParams {
        &self.params
    }

    pub fn offset(&self) -> XyzPos {
        self.params.offset
    }

    pub fn set_offset(&mut self, offset: XyzPos) {
        self.params.offset = offset;
    }

    pub fn is_deployed(&self) -> bool {
        self.deployed
    }

    pub fn last_z_result(&self) -> f64 {
        self.last_z_result
    }

    pub fn deploy(&mut self) -> Result<(), ProbeError> {
        self.set_deployed(true)
    }

    pub fn stow(&mut self) -> Result<(), ProbeError> {
        self.set_deployed(false)
    }

    /// Record contributed to the firmware's persisted-settings image.
    pub fn persisted_record(&self) -> PersistedProbe {
        PersistedProbe {
            offset_x: self.params.offset.x,
            offset_y: self.params.offset.y,
            offset_z: self.params.offset.z,
            preheat_hotend_temp: self.settings.preheat_hotend_temp,
            preheat_bed_temp: self.settings.preheat_bed_temp,
            turn_heaters_off: self.settings.turn_heaters_off,
            stabilize_temperatures_after_probing: self.settings.stabilize_temperatures_after_probing,
        }
    }

    pub fn apply_persisted(&mut self, rec: PersistedProbe) {
        self.params.offset = XyzPos::new(rec.offset_x, rec.offset_y, rec.offset_z);
        self.settings.preheat_hotend_temp = rec.preheat_hotend_temp;
        self.settings.preheat_bed_temp = rec.preheat_bed_temp;
        self.settings.turn_heaters_off = rec.turn_heaters_off;
        self.settings.stabilize_temperatures_after_probing = rec.stabilize_temperatures_after_probing;
    }

    /// A servo probe may come up deployed and too low to stow after a
    /// reboot; force the stowed position before homing.
    pub fn servo_probe_init(&mut self) {
        match self.params.kind {
            ProbeKind::ZServo => {
                let (nr, angle) = (self.params.servo_nr, self.params.servo_stow_angle);
                self.hardware.lock().servo_move(nr, angle);
            }
            ProbeKind::BlTouch => {
                if let Some(bl) = self.bltouch.clone() {
                    let mut hw = self.hardware.lock();
                    let _ = bl.stow(&mut *hw);
                }
            }
            _ => {}
        }
        self.deployed = false;
    }

    /// Raise Z to make room for the probe to move.
    pub(crate) fn do_z_raise(&mut self, z_raise: f64) {
        log::debug!("do_z_raise({})", z_raise);
        let mut z_dest = z_raise;
        if self.params.offset.z < 0.0 {
            z_dest -= self.params.offset.z;
        }
        self.motion.lock().do_z_clearance(z_dest);
    }

    fn tare_init(&self) {
        if let Some(pin) = self.params.tare_pin {
            self.hardware.lock().write_pin(pin, !self.params.tare_active_high);
        }
    }

    /// Zero a strain-gauge probe before a measurement.
    pub(crate) fn tare(&mut self) -> Result<(), ProbeError> {
        let Some(pin) = self.params.tare_pin else {
            return Ok(());
        };
        if self.params.tare_only_while_inactive && self.endstops.lock().probe_switch_activated() {
            log::error!("Cannot tare an active probe");
            return Err(ProbeError::TareFailed("Cannot tare an active probe".to_string()));
        }
        log::debug!("Taring probe");
        let active = self.params.tare_active_high;
        {
            let mut hw = self.hardware.lock();
            hw.write_pin(pin, active);
            hw.delay_ms(self.params.tare_time_ms);
            hw.write_pin(pin, !active);
            hw.delay_ms(self.params.tare_delay_ms);
        }
        self.endstops.lock().hit_on_purpose();
        Ok(())
    }

    /// Raise heater targets that are below the request, and (unless
    /// `early`) wait for stabilization.
    pub fn preheat_for_probing(&mut self, hotend_temp: f64, bed_temp: f64, early: bool) {
        if !early {
            self.ui.lock().set_status("Preheating");
        }
        log::debug!("Preheating hotend {:.0} bed {:.0}", hotend_temp, bed_temp);
        let mut thermal = self.thermal.lock();
        if hotend_temp > thermal.deg_target_hotend(0) {
            thermal.set_target_hotend(hotend_temp, 0);
        }
        if bed_temp > thermal.deg_target_bed() {
            thermal.set_target_bed(bed_temp);
        }
        if !early {
            if hotend_temp > thermal.whole_deg_hotend(0) + TEMP_WINDOW {
                thermal.wait_for_hotend(0);
            }
            if bed_temp > thermal.whole_deg_bed() + TEMP_BED_WINDOW {
                thermal.wait_for_bed_heating();
            }
        }
    }

    pub(crate) fn has_delta_sensorless(&self) -> bool {
        self.params.kind == ProbeKind::Sensorless && self.motion.lock().is_delta()
    }

    /// Set the sensorless Z adjustment for every tower participating in
    /// stall detection.
    pub fn set_offset_sensorless_adj(&mut self, sz: f64) {
        if self.test_sensitivity.x {
            self.offset_sensorless_adj.a = sz;
        }
        if self.test_sensitivity.y {
            self.offset_sensorless_adj.b = sz;
        }
        if self.test_sensitivity.z {
            self.offset_sensorless_adj.c = sz;
        }
    }

    /// Scan latched tower bits for the largest per-tower adjustment.
    pub(crate) fn refresh_largest_sensorless_adj(&mut self) {
        self.largest_sensorless_adj = SENSORLESS_ADJ_REFERENCE;
        let state = self.endstops.lock().state();
        if state.contains(EndstopState::X_MAX) {
            self.largest_sensorless_adj =
                self.largest_sensorless_adj.max(self.offset_sensorless_adj.a);
            log::debug!("tower A stall, adj {:.3}", self.offset_sensorless_adj.a);
        }
        if state.contains(EndstopState::Y_MAX) {
            self.largest_sensorless_adj =
                self.largest_sensorless_adj.max(self.offset_sensorless_adj.b);
            log::debug!("tower B stall, adj {:.3}", self.offset_sensorless_adj.b);
        }
        if state.contains(EndstopState::Z_MAX) {
            self.largest_sensorless_adj =
                self.largest_sensorless_adj.max(self.offset_sensorless_adj.c);
            log::debug!("tower C stall, adj {:.3}", self.offset_sensorless_adj.c);
        }
    }

    pub fn largest_sensorless_adj(&self) -> f64 {
        self.largest_sensorless_adj
    }

    /// Current Z with the delta-sensorless stall offset folded out.
    fn sample_z(&self) -> f64 {
        let z = self.motion.lock().current_position().z;
        if self.has_delta_sensorless() {
            z - self.largest_sensorless_adj
        } else {
            z
        }
    }

    /// One descent plus the spurious-trigger check: a trigger above normal
    /// operating clearance is physically implausible.
    fn try_to_probe(
        &mut self,
        label: &str,
        z_probe_low_point: f64,
        feedrate: f64,
        sanity_check: bool,
        clearance: f64,
    ) -> Result<(), ProbeError> {
        let probe_triggered = self.probe_down_to_z(z_probe_low_point, feedrate)?;
        let current_z = self.motion.lock().current_position().z;
        let early = sanity_check && current_z > -self.params.offset.z + clearance;
        if !probe_triggered || early {
            log::debug!(
                "{} probe fail:{}{}",
                label,
                if !probe_triggered { " no trigger" } else { "" },
                if early { " triggered early" } else { "" }
            );
            return Err(ProbeError::ProbingFailed);
        }
        Ok(())
    }

    /// Probe at the current XY (possibly more than once) to find the bed
    /// Z. Leaves Z at the height where the probe last triggered.
    pub(crate) fn run_z_probe(&mut self, sanity_check: bool) -> Result<f64, ProbeError> {
        // Stop the probe before it goes too low to prevent damage. If Z
        // isn't trusted, probe down to -10mm.
        let z_probe_low_point = if self.motion.lock().axis_is_trusted(Axis::Z) {
            -self.params.offset.z + self.params.z_probe_low_point
        } else {
            UNTRUSTED_LOW_POINT
        };
        let total = self.params.total_samples;
        let extra = self.params.extra_samples;
        let clearances = self.params.clearances;
        let fast = self.params.fast_feedrate;
        let slow = self.params.slow_feedrate;

        let mut first_probe_z = f64::NAN;
        if total == 2 {
            // Double-probing does a fast probe followed by a slow probe.
            self.tare()?;
            self.try_to_probe("fast", z_probe_low_point, fast, sanity_check, clearances.between_probes)?;
            first_probe_z = self.sample_z();
            log::debug!("1st probe z: {:.3}", first_probe_z);
            let cur = self.motion.lock().current_position().z;
            self.motion.lock().do_blocking_move_to_z(cur + clearances.multi_probe, fast);
        } else if (fast - slow).abs() > f64::EPSILON {
            // If the nozzle is well over the travel height then move down
            // quickly before doing the slow probe.
            let z = clearances.deploy
                + 5.0
                + if self.params.offset.z < 0.0 { -self.params.offset.z } else { 0.0 };
            if self.motion.lock().current_position().z > z {
                if !self.probe_down_to_z(z, fast)? {
                    let cur = self.motion.lock().current_position().z;
                    self.motion.lock().do_blocking_move_to_z(cur + clearances.between_probes, fast);
                }
            }
        }

        let iterations = if total > 2 { total } else { 1 };
        let mut probes: Vec<f64> = Vec::with_capacity(if extra > 0 { total } else { 0 });
        let mut probes_z_sum = 0.0;
        for p in 0..iterations {
            self.tare()?;
            self.try_to_probe("slow", z_probe_low_point, slow, sanity_check, clearances.multi_probe)?;

            if self.params.measure_backlash {
                if let Some(comp) = &self.compensation {
                    comp.lock().measure_backlash_with_probe();
                }
            }

            let z = self.sample_z();
            if extra > 0 {
                // Keep the sample list sorted ascending.
                let idx = probes.partition_point(|&v| v <= z);
                probes.insert(idx, z);
            } else if total > 2 {
                probes_z_sum += z;
            }

            // Small Z raise between (not after) samples.
            if total > 2 && p + 1 < iterations {
                self.motion.lock().do_blocking_move_to_z(z + clearances.multi_probe, fast);
            }
        }

        let measured_z = if total > 2 {
            if extra > 0 {
                trimmed_mean(&probes, extra)
            } else {
                probes_z_sum / total as f64
            }
        } else if total == 2 {
            let second_probe_z = self.sample_z();
            log::debug!(
                "2nd probe z: {:.3} discrepancy: {:.3}",
                second_probe_z,
                first_probe_z - second_probe_z
            );
            weighted_double(second_probe_z, first_probe_z)
        } else {
            self.sample_z()
        };
        Ok(measured_z)
    }

    /// Move to the given XY, deploy if needed, measure the bed Z, then
    /// raise or stow per `raise_after`.
    pub fn probe_at_point(
        &mut self,
        rx: f64,
        ry: f64,
        raise_after: RaiseAfter,
        probe_relative: bool,
        sanity_check: bool,
    ) -> Result<f64, ProbeError> {
        log::debug!(
            "probe_at_point({:.3}, {:.3}, {:?}, {}_relative)",
            rx,
            ry,
            raise_after,
            if probe_relative { "probe" } else { "nozzle" }
        );

        if let Some(bl) = self.bltouch.clone() {
            if bl.high_speed_mode {
                let mut hw = self.hardware.lock();
                if bl.triggered(&*hw) {
                    bl.reset(&mut *hw);
                }
            }
        }

        // On delta keep Z below the clip height or the planner rejects
        // the planar move.
        let clipped_z = {
            let motion = self.motion.lock();
            let z = motion.current_position().z;
            if motion.is_delta() {
                z.min(motion.delta_clip_start_height())
            } else {
                z
            }
        };
        let mut npos = XyzPos::new(rx, ry, clipped_z);
        if !self.motion.lock().can_reach(npos, probe_relative) {
            log::debug!("Position Not Reachable");
            return Err(ProbeError::Unreachable);
        }
        if probe_relative {
            // Land the probe tip, not the nozzle, on the requested point.
            npos.x -= self.params.offset.x;
            npos.y -= self.params.offset.y;
        }

        let xy_feedrate = self.params.xy_feedrate;
        self.motion.lock().do_blocking_move_to(npos, xy_feedrate);

        if self.params.kind == ProbeKind::BdSensor {
            let z = self.motion.lock().current_position().z;
            return Ok(z - self.hardware.lock().bd_sensor_read());
        }

        let mut result = self
            .deploy()
            .and_then(|()| self.run_z_probe(sanity_check))
            .map(|z| {
                let mut measured_z = z + self.params.offset.z;
                if let Some(comp) = &self.compensation {
                    if self.params.temperature_compensation {
                        comp.lock().apply_ptc(&mut measured_z);
                    }
                    if self.params.x_twist_compensation {
                        measured_z += comp.lock().x_twist(XyPos {
                            x: npos.x + self.params.offset.x,
                            y: npos.y + self.params.offset.y,
                        });
                    }
                }
                measured_z
            });

        if result.is_ok() {
            match raise_after {
                RaiseAfter::Raise | RaiseAfter::BigRaise => {
                    let dist = if raise_after == RaiseAfter::BigRaise {
                        self.params.clearances.big_raise
                    } else {
                        self.params.clearances.between_probes
                    };
                    let cur = self.motion.lock().current_position().z;
                    let fast = self.params.fast_feedrate;
                    self.motion.lock().do_blocking_move_to_z(cur + dist, fast);
                }
                RaiseAfter::Stow | RaiseAfter::LastStow => {
                    if self.stow().is_err() {
                        result = Err(ProbeError::ProbingFailed);
                    }
                }
                RaiseAfter::None => {}
            }
        }

        match &result {
            Ok(measured_z) => {
                self.last_z_result = *measured_z;
                log::debug!("bed x: {:.3} y: {:.3} z: {:.6}", rx, ry, measured_z);
            }
            Err(_) => {
                let _ = self.stow();
                self.ui.lock().set_status("Probing failed");
                if !self.params.retry_and_recover {
                    log::error!("Probing failed");
                }
            }
        }
        result
    }

    /// Print an error and halt the machine.
    pub(crate) fn probe_error_stop(&mut self, reason: &str) {
        log::error!("Printer halted: {}", reason);
        self.machine.lock().stop();
    }

    pub fn get_status(&self) -> HashMap<String, serde_json::Value> {
        let mut status = HashMap::new();
        status.insert("kind".to_string(), json!(kind_name(self.params.kind)));
        status.insert("deployed".to_string(), json!(self.deployed));
        status.insert("last_z_result".to_string(), json!(self.last_z_result));
        status.insert(
            "offset".to_string(),
            json!([self.params.offset.x, self.params.offset.y, self.params.offset.z]),
        );
        status
    }
}

fn kind_name(kind: ProbeKind) -> &'static str {
    match kind {
        ProbeKind::FixedMount => "fixed_mount",
        ProbeKind::NozzleAsProbe => "nozzle",
        ProbeKind::BlTouch => "bltouch",
        ProbeKind::ZServo => "z_servo",
        ProbeKind::Solenoid => "solenoid",
        ProbeKind::MagLev => "maglev",
        ProbeKind::Sled => "sled",
        ProbeKind::TouchMi => "touch_mi",
        ProbeKind::AllenKey => "allen_key",
        ProbeKind::MagMounted => "mag_mounted",
        ProbeKind::RackAndPinion => "rack_and_pinion",
        ProbeKind::Sensorless => "sensorless",
        ProbeKind::BdSensor => "bd_sensor",
    }
}

/// Weighted average of the slow and fast probes of a double-probe cycle,
/// weighted toward the slow sample.
pub(crate) fn weighted_double(slow_z: f64, fast_z: f64) -> f64 {
    (slow_z * 3.0 + fast_z * 2.0) / 5.0
}

/// Median-anchored outlier trim over an ascending sample list: drop the
/// endpoint farther from the median of the original set, `extra` times
/// (ties drop the upper end), then average what remains.
pub(crate) fn trimmed_mean(sorted: &[f64], extra: usize) -> f64 {
    let n = sorted.len();
    let half = (n - 1) / 2;
    let middle = sorted[half];
    let median = if n % 2 == 1 { middle } else { (middle + sorted[half + 1]) * 0.5 };

    let mut lo = 0usize;
    let mut hi = n - 1;
    for _ in 0..extra {
        if (sorted[hi] - median).abs() >= (sorted[lo] - median).abs() {
            hi -= 1;
        } else {
            lo += 1;
        }
    }
    let kept = &sorted[lo..=hi];
    kept.iter().sum::<f64>() / kept.len() as f64
}
