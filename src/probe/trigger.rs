// probe_host_rust/src/probe/trigger.rs
// Single downward trigger move: descend toward the Z floor, decode the
// latched trigger snapshot, and reconcile the planner with the
// stepper-counted position.

use crate::core_traits::{EndstopsAdapter, MotionAdapter, PlannerAdapter, ThermalAdapter, UiAdapter};
use crate::endstops::EndstopState;
use crate::mathutil::Axis;
use crate::probe::guard::ProbingGuard;
use crate::probe::{Probe, ProbeError};

impl Probe {
    /// Move down until the probe triggers or the low limit is reached.
    /// Returns whether the probe triggered; Z is left at the
    /// stepper-counted trigger height and the planner is synchronized.
    pub(crate) fn probe_down_to_z(&mut self, z: f64, feedrate: f64) -> Result<bool, ProbeError> {
        log::debug!("probe_down_to_z({:.3}, {:.2})", z, feedrate);

        // Deploy in low-speed mode on every probe action.
        if let Some(bl) = self.bltouch.clone() {
            if !bl.high_speed_mode {
                let mut hw = self.hardware.lock();
                bl.deploy(&mut *hw)?;
            }
        }

        if self.params.wait_for_bed_heater {
            self.thermal.lock().wait_for_bed_heating();
        }
        if self.params.wait_for_hotend {
            self.thermal.lock().wait_for_hotend(0);
        }
        if self.params.heaters_off_during_probe
            && self.settings.turn_heaters_off
            && self.settings.stabilize_temperatures_after_probing
            && self.planner.lock().has_blocks_queued()
        {
            // Printing resumes right behind this probe; get back on
            // temperature before continuing.
            log::info!("Waiting for heat-up before probing");
            self.ui.lock().set_status("Waiting for heat-up...");
            self.thermal.lock().wait_for_hotend(0);
            self.thermal.lock().wait_for_bed_heating();
        }

        let guard = ProbingGuard::acquire(self);

        // Move down until the probe is triggered.
        self.motion.lock().do_blocking_move_to_z(z, feedrate);

        let trigger_state = self.endstops.lock().trigger_state();
        let probe_triggered = if self.has_delta_sensorless() {
            trigger_state.intersects(EndstopState::delta_towers())
        } else {
            trigger_state.contains(EndstopState::Z_MIN_PROBE)
        };

        if probe_triggered && self.has_delta_sensorless() {
            self.refresh_largest_sensorless_adj();
        }

        drop(guard);

        // Stow in low-speed mode on every trigger.
        if probe_triggered {
            if let Some(bl) = self.bltouch.clone() {
                if !bl.high_speed_mode {
                    let mut hw = self.hardware.lock();
                    bl.stow(&mut *hw)?;
                }
            }
        }

        // Clear latch flags, adopt the Z where the steppers were
        // interrupted, and tell the planner where we actually are.
        self.endstops.lock().hit_on_purpose();
        self.motion.lock().set_current_from_steppers_for_axis(Axis::Z);
        self.motion.lock().sync_plan_position();

        Ok(probe_triggered)
    }
}
