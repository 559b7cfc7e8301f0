// probe_host_rust/src/core_traits.rs
// Trait seams toward the rest of the firmware. The probe subsystem never
// touches the planner, heaters or drivers directly; everything crosses one
// of these adapters, shared as Arc<Mutex<dyn ...>> handles.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::endstops::EndstopState;
use crate::mathutil::{Axis, XyPos, XyzPos};

pub type Handle<T> = Arc<Mutex<T>>;

/// Validated pin identifier. Construction is the only checkpoint; every
/// later `write_pin`/`read_pin` call can assume the id is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinId(u8);

impl PinId {
    pub fn new(id: i64) -> Option<PinId> {
        u8::try_from(id).ok().map(PinId)
    }

    pub fn id(self) -> u8 {
        self.0
    }
}

/// Synchronous blocking-move surface of the motion planner. "Blocking"
/// means a cooperative spin on the planner drain; the step generator keeps
/// running underneath.
pub trait MotionAdapter: Send {
    fn do_blocking_move_to(&mut self, pos: XyzPos, feedrate: f64);
    fn do_blocking_move_to_xy(&mut self, xy: XyPos, feedrate: f64);
    fn do_blocking_move_to_x(&mut self, x: f64, feedrate: f64);
    fn do_blocking_move_to_y(&mut self, y: f64, feedrate: f64);
    fn do_blocking_move_to_z(&mut self, z: f64, feedrate: f64);
    /// Raise Z so it is at least `z_dest`; never descends.
    fn do_z_clearance(&mut self, z_dest: f64);
    fn sync_plan_position(&mut self);
    fn set_current_from_steppers_for_axis(&mut self, axis: Axis);
    fn current_position(&self) -> XyzPos;
    fn set_current_position(&mut self, pos: XyzPos);
    fn axis_is_trusted(&self, axis: Axis) -> bool;
    fn axes_trusted(&self) -> u8;
    fn set_axes_trusted(&mut self, mask: u8);
    fn can_reach(&self, pos: XyzPos, probe_relative: bool) -> bool;
    fn is_delta(&self) -> bool;
    fn delta_clip_start_height(&self) -> f64;
    fn homing_feedrate(&self, axis: Axis) -> f64;
}

pub trait PlannerAdapter: Send {
    fn has_blocks_queued(&self) -> bool;
}

pub trait EndstopsAdapter: Send {
    fn enable(&mut self, on: bool);
    fn not_homing(&mut self);
    /// Clear latch flags after an intentional trigger.
    fn hit_on_purpose(&mut self);
    fn enable_z_probe(&mut self, on: bool);
    fn z_probe_enabled(&self) -> bool;
    fn trigger_state(&self) -> EndstopState;
    fn state(&self) -> EndstopState;
    fn set_homing_current(&mut self, on: bool);
    fn probe_switch_activated(&self) -> bool;
}

pub trait ThermalAdapter: Send {
    fn pause_heaters(&mut self, pause: bool);
    fn set_fans_paused(&mut self, pause: bool);
    fn wait_for_hotend(&mut self, idx: usize);
    fn wait_for_bed_heating(&mut self);
    fn deg_target_hotend(&self, idx: usize) -> f64;
    fn deg_target_bed(&self) -> f64;
    fn set_target_hotend(&mut self, temp: f64, idx: usize);
    fn set_target_bed(&mut self, temp: f64);
    fn whole_deg_hotend(&self, idx: usize) -> f64;
    fn whole_deg_bed(&self) -> f64;
}

pub trait StepperAdapter: Send {
    fn enable_axis(&mut self, axis: Axis);
    fn disable_axis(&mut self, axis: Axis);
    fn disable_e_steppers(&mut self);
}

/// TMC stallGuard switching for sensorless probing. `tmc_enable_stallguard`
/// returns the prior stealthChop state so it can be handed back on restore.
pub trait DriverAdapter: Send {
    fn tmc_enable_stallguard(&mut self, axis: Axis) -> bool;
    fn tmc_disable_stallguard(&mut self, axis: Axis, prior_stealth: bool);
}

pub trait UiAdapter: Send {
    fn set_status(&mut self, msg: &str);
    fn reset_status(&mut self);
    fn return_to_status(&mut self);
    fn alert(&mut self, msg: &str);
    fn buzz(&mut self);
    fn continue_prompt(&mut self, msg: &str);
    fn user_confirm_required(&mut self, msg: &str);
    fn wait_for_user_response(&mut self);
    fn set_wait_for_user(&mut self, wait: bool);
    fn waiting_for_user(&self) -> bool;
    /// Cooperative yield while spinning on operator input.
    fn idle(&mut self);
}

/// Fatal-stop surface. `stop()` is a one-way transition; only operator
/// reset resumes motion.
pub trait MachineAdapter: Send {
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// Thin capability surface over pins, servos and delays (the probe's own
/// hardware, as opposed to the shared machine surfaces above).
pub trait ProbeHardware: Send {
    fn write_pin(&mut self, pin: PinId, level: bool);
    fn read_pin(&self, pin: PinId) -> bool;
    fn delay_ms(&mut self, ms: u32);
    /// Delay that yields to background tasks while waiting.
    fn safe_delay(&mut self, ms: u32);
    fn servo_move(&mut self, servo: usize, angle: u16);
    /// Live digital state of whichever input is configured as probe.
    fn is_probe_triggered(&self) -> bool;
    fn endstop_trigger_state(&self) -> EndstopState;
    /// Distance reading from a bed-distance sensor, in mm.
    fn bd_sensor_read(&self) -> f64;
}

/// Optional measurement-correction hooks: backlash capture after a trigger,
/// probe temperature compensation and X-twist correction.
pub trait CompensationAdapter: Send {
    fn measure_backlash_with_probe(&mut self);
    fn apply_ptc(&self, measured_z: &mut f64);
    fn x_twist(&self, probe_pos: XyPos) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_id_validates_range() {
        assert!(PinId::new(0).is_some());
        assert_eq!(PinId::new(42).unwrap().id(), 42);
        assert!(PinId::new(-1).is_none());
        assert!(PinId::new(256).is_none());
    }
}
