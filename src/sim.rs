// probe_host_rust/src/sim.rs
// Simulation backend: one shared machine state behind every adapter
// trait, with a flat bed plane, scriptable trigger heights and an event
// trace. Drives the unit tests and the end-to-end scenario tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core_traits::{
    CompensationAdapter, DriverAdapter, EndstopsAdapter, Handle, MachineAdapter, MotionAdapter,
    PinId, PlannerAdapter, ProbeHardware, StepperAdapter, ThermalAdapter, UiAdapter,
};
use crate::endstops::EndstopState;
use crate::mathutil::{Axis, XyPos, XyzPos};
use crate::probe::ProbeAdapters;

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    MoveTo { pos: XyzPos, feedrate: f64 },
    MoveZ { target: f64, feedrate: f64, triggered: bool },
    MoveX { x: f64 },
    MoveY { y: f64 },
    ZClearance { z: f64 },
    SetFromSteppers(Axis),
    SyncPlan,
    PinWrite { pin: u8, level: bool },
    ServoMove { servo: usize, angle: u16 },
    Delay(u32),
    SafeDelay(u32),
    HeatersPaused(bool),
    FansPaused(bool),
    WaitHotend,
    WaitBed,
    AxisEnabled(Axis),
    AxisDisabled(Axis),
    ESteppersOff,
    StallguardOn(Axis),
    StallguardOff(Axis),
    HomingCurrent(bool),
    EndstopsEnabled(bool),
    ZProbeEnabled(bool),
    HitOnPurpose,
    Status(String),
    Alert(String),
    Buzz,
    ContinuePrompt(String),
    ConfirmRequired(String),
    UserResponse,
    BacklashMeasured,
    Stop,
}

pub struct SimState {
    /// Logical (planner) position; goes stale on an aborted descent until
    /// the reconciliation step adopts the stepper count.
    pub pos: XyzPos,
    /// Physical, stepper-counted Z.
    pub stepper_z: f64,
    /// Flat bed plane height, or None for a missing bed.
    pub bed_z: Option<f64>,
    /// Tip-below-nozzle offset used for the mechanical trigger height.
    pub probe_offset_z: f64,
    /// Scripted per-descent trigger heights (nozzle Z); consumed
    /// front-to-back, overriding the bed plane.
    pub trigger_heights: VecDeque<f64>,
    /// Tower bits to latch when a stallguard descent triggers.
    pub sensorless_towers: EndstopState,
    pub latched: EndstopState,
    pub min_z_seen: f64,
    /// Physical Z after every Z move, in order.
    pub z_history: Vec<f64>,

    pub endstops_enabled: bool,
    pub z_probe_enabled: bool,
    pub homing_current: bool,
    pub probe_switch_active: bool,

    /// Physical deploy state of the probe mechanism.
    pub probe_deployed: bool,
    pub probe_alarm: bool,
    /// When set, actuation events do not change the physical state.
    pub actuation_broken: bool,
    /// Probe reads triggered while stowed (detached-style probes).
    pub triggered_when_stowed: bool,
    /// Pin whose level tracks the deploy state (solenoid, sled).
    pub deploy_pin: Option<u8>,
    /// Servo angles that map to deploy/stow for servo-driven probes.
    pub servo_deploy_angle: Option<u16>,
    pub servo_stow_angle: Option<u16>,
    /// Servo angle that clears a latched probe alarm.
    pub servo_reset_angle: Option<u16>,

    pub heaters_paused: bool,
    pub fans_paused: bool,
    pub hotend_target: f64,
    pub bed_target: f64,
    pub hotend_temp: f64,
    pub bed_temp: f64,

    pub axes_trusted: u8,
    pub enabled_axes: u8,
    pub e_steppers_enabled: bool,
    pub stealthchop: [bool; 3],
    pub stallguard: [bool; 3],

    pub pins: HashMap<u8, bool>,
    pub servos: HashMap<usize, u16>,
    pub bd_reading: f64,

    pub wait_for_user: bool,
    /// Idle calls before the sim operator releases a wait loop.
    pub idle_ticks_until_release: u32,
    pub running: bool,

    pub delta: bool,
    pub delta_clip_start_height: f64,
    pub reach_min: XyPos,
    pub reach_max: XyPos,
    pub homing_feedrates: [f64; 3],
    pub has_blocks_queued: bool,
    pub planner_synced: bool,

    pub ptc_shift: f64,
    pub twist_comp: f64,
    pub backlash_measurements: u32,

    pub events: Vec<SimEvent>,
}

impl SimState {
    fn new(bed_z: Option<f64>) -> Self {
        SimState {
            pos: XyzPos::new(0.0, 0.0, 10.0),
            stepper_z: 10.0,
            bed_z,
            probe_offset_z: 0.0,
            trigger_heights: VecDeque::new(),
            sensorless_towers: EndstopState::empty(),
            latched: EndstopState::empty(),
            min_z_seen: 10.0,
            z_history: Vec::new(),
            endstops_enabled: false,
            z_probe_enabled: false,
            homing_current: false,
            probe_switch_active: false,
            probe_deployed: true,
            probe_alarm: false,
            actuation_broken: false,
            triggered_when_stowed: false,
            deploy_pin: None,
            servo_deploy_angle: None,
            servo_stow_angle: None,
            servo_reset_angle: None,
            heaters_paused: false,
            fans_paused: false,
            hotend_target: 0.0,
            bed_target: 0.0,
            hotend_temp: 25.0,
            bed_temp: 25.0,
            axes_trusted: 0b111,
            enabled_axes: 0b111,
            e_steppers_enabled: true,
            stealthchop: [true; 3],
            stallguard: [false; 3],
            pins: HashMap::new(),
            servos: HashMap::new(),
            bd_reading: 0.0,
            wait_for_user: false,
            idle_ticks_until_release: 2,
            running: true,
            delta: false,
            delta_clip_start_height: 100.0,
            reach_min: XyPos { x: 0.0, y: 0.0 },
            reach_max: XyPos { x: 220.0, y: 220.0 },
            homing_feedrates: [50.0, 50.0, 4.0],
            has_blocks_queued: false,
            planner_synced: false,
            ptc_shift: 0.0,
            twist_comp: 0.0,
            backlash_measurements: 0,
            events: Vec::new(),
        }
    }

    fn live_triggered(&self) -> bool {
        if self.probe_alarm {
            return true;
        }
        if self.triggered_when_stowed {
            return !self.probe_deployed;
        }
        match self.bed_z {
            Some(bed) => {
                self.probe_deployed && self.stepper_z + self.probe_offset_z <= bed + 1e-9
            }
            None => false,
        }
    }

    fn probing_active(&self) -> bool {
        self.z_probe_enabled || (self.endstops_enabled && self.stallguard.iter().any(|&s| s))
    }

    fn mechanical_trigger_height(&self) -> Option<f64> {
        let bed = self.bed_z?;
        if !self.probe_deployed {
            return None;
        }
        Some(bed - self.probe_offset_z)
    }

    fn move_z(&mut self, target: f64, feedrate: f64) {
        let descending = target < self.stepper_z;
        let mut triggered = false;
        if descending && self.probing_active() {
            let trigger_z = match self.trigger_heights.pop_front() {
                Some(h) => Some(h),
                None => self.mechanical_trigger_height(),
            };
            if let Some(h) = trigger_z {
                if h >= target {
                    // Motion aborts at the trigger; the planner's logical
                    // Z stays at the commanded target until reconciled.
                    self.stepper_z = h;
                    self.pos.z = target;
                    let stall_mode =
                        self.stallguard.iter().any(|&s| s) && !self.sensorless_towers.is_empty();
                    let bits = if stall_mode {
                        self.sensorless_towers
                    } else {
                        EndstopState::Z_MIN_PROBE
                    };
                    self.latched |= bits;
                    triggered = true;
                }
            }
        }
        if !triggered {
            self.stepper_z = target;
            self.pos.z = target;
        }
        self.min_z_seen = self.min_z_seen.min(self.stepper_z);
        self.z_history.push(self.stepper_z);
        self.events.push(SimEvent::MoveZ { target, feedrate, triggered });
    }

    fn apply_pin_actuation(&mut self, pin: u8, level: bool) {
        if self.deploy_pin == Some(pin) && !self.actuation_broken {
            self.probe_deployed = level;
        }
    }

    fn apply_servo_actuation(&mut self, angle: u16) {
        if self.servo_reset_angle == Some(angle) {
            self.probe_alarm = false;
        }
        if self.actuation_broken {
            return;
        }
        if self.servo_deploy_angle == Some(angle) {
            self.probe_deployed = true;
        } else if self.servo_stow_angle == Some(angle) {
            self.probe_deployed = false;
        }
    }
}

type Shared = Arc<Mutex<SimState>>;

pub struct SimMotion(Shared);

impl MotionAdapter for SimMotion {
    fn do_blocking_move_to(&mut self, pos: XyzPos, feedrate: f64) {
        let mut st = self.0.lock();
        st.pos.x = pos.x;
        st.pos.y = pos.y;
        st.events.push(SimEvent::MoveTo { pos, feedrate });
        if (pos.z - st.stepper_z).abs() > 1e-12 {
            st.move_z(pos.z, feedrate);
        } else {
            st.pos.z = pos.z;
        }
    }

    fn do_blocking_move_to_xy(&mut self, xy: XyPos, feedrate: f64) {
        let mut st = self.0.lock();
        st.pos.x = xy.x;
        st.pos.y = xy.y;
        let z = st.pos.z;
        st.events.push(SimEvent::MoveTo { pos: XyzPos::new(xy.x, xy.y, z), feedrate });
    }

    fn do_blocking_move_to_x(&mut self, x: f64, _feedrate: f64) {
        let mut st = self.0.lock();
        st.pos.x = x;
        st.events.push(SimEvent::MoveX { x });
    }

    fn do_blocking_move_to_y(&mut self, y: f64, _feedrate: f64) {
        let mut st = self.0.lock();
        st.pos.y = y;
        st.events.push(SimEvent::MoveY { y });
    }

    fn do_blocking_move_to_z(&mut self, z: f64, feedrate: f64) {
        self.0.lock().move_z(z, feedrate);
    }

    fn do_z_clearance(&mut self, z_dest: f64) {
        let mut st = self.0.lock();
        st.events.push(SimEvent::ZClearance { z: z_dest });
        if st.stepper_z < z_dest {
            let fr = st.homing_feedrates[Axis::Z.index()];
            st.move_z(z_dest, fr);
        }
    }

    fn sync_plan_position(&mut self) {
        let mut st = self.0.lock();
        st.planner_synced = true;
        st.events.push(SimEvent::SyncPlan);
    }

    fn set_current_from_steppers_for_axis(&mut self, axis: Axis) {
        let mut st = self.0.lock();
        if axis == Axis::Z {
            st.pos.z = st.stepper_z;
        }
        st.events.push(SimEvent::SetFromSteppers(axis));
    }

    fn current_position(&self) -> XyzPos {
        self.0.lock().pos
    }

    fn set_current_position(&mut self, pos: XyzPos) {
        let mut st = self.0.lock();
        st.pos = pos;
        st.stepper_z = pos.z;
    }

    fn axis_is_trusted(&self, axis: Axis) -> bool {
        self.0.lock().axes_trusted & axis.bit() != 0
    }

    fn axes_trusted(&self) -> u8 {
        self.0.lock().axes_trusted
    }

    fn set_axes_trusted(&mut self, mask: u8) {
        self.0.lock().axes_trusted = mask;
    }

    fn can_reach(&self, pos: XyzPos, _probe_relative: bool) -> bool {
        let st = self.0.lock();
        pos.x >= st.reach_min.x
            && pos.x <= st.reach_max.x
            && pos.y >= st.reach_min.y
            && pos.y <= st.reach_max.y
    }

    fn is_delta(&self) -> bool {
        self.0.lock().delta
    }

    fn delta_clip_start_height(&self) -> f64 {
        self.0.lock().delta_clip_start_height
    }

    fn homing_feedrate(&self, axis: Axis) -> f64 {
        self.0.lock().homing_feedrates[axis.index()]
    }
}

pub struct SimPlanner(Shared);

impl PlannerAdapter for SimPlanner {
    fn has_blocks_queued(&self) -> bool {
        self.0.lock().has_blocks_queued
    }
}

pub struct SimEndstops(Shared);

impl EndstopsAdapter for SimEndstops {
    fn enable(&mut self, on: bool) {
        let mut st = self.0.lock();
        st.endstops_enabled = on;
        st.events.push(SimEvent::EndstopsEnabled(on));
    }

    fn not_homing(&mut self) {
        let mut st = self.0.lock();
        st.endstops_enabled = false;
        st.events.push(SimEvent::EndstopsEnabled(false));
    }

    fn hit_on_purpose(&mut self) {
        let mut st = self.0.lock();
        st.latched = EndstopState::empty();
        st.events.push(SimEvent::HitOnPurpose);
    }

    fn enable_z_probe(&mut self, on: bool) {
        let mut st = self.0.lock();
        st.z_probe_enabled = on;
        st.events.push(SimEvent::ZProbeEnabled(on));
    }

    fn z_probe_enabled(&self) -> bool {
        self.0.lock().z_probe_enabled
    }

    fn trigger_state(&self) -> EndstopState {
        self.0.lock().latched
    }

    fn state(&self) -> EndstopState {
        self.0.lock().latched
    }

    fn set_homing_current(&mut self, on: bool) {
        let mut st = self.0.lock();
        st.homing_current = on;
        st.events.push(SimEvent::HomingCurrent(on));
    }

    fn probe_switch_activated(&self) -> bool {
        self.0.lock().probe_switch_active
    }
}

pub struct SimThermal(Shared);

impl ThermalAdapter for SimThermal {
    fn pause_heaters(&mut self, pause: bool) {
        let mut st = self.0.lock();
        st.heaters_paused = pause;
        st.events.push(SimEvent::HeatersPaused(pause));
    }

    fn set_fans_paused(&mut self, pause: bool) {
        let mut st = self.0.lock();
        st.fans_paused = pause;
        st.events.push(SimEvent::FansPaused(pause));
    }

    fn wait_for_hotend(&mut self, _idx: usize) {
        let mut st = self.0.lock();
        st.hotend_temp = st.hotend_target;
        st.events.push(SimEvent::WaitHotend);
    }

    fn wait_for_bed_heating(&mut self) {
        let mut st = self.0.lock();
        st.bed_temp = st.bed_target;
        st.events.push(SimEvent::WaitBed);
    }

    fn deg_target_hotend(&self, _idx: usize) -> f64 {
        self.0.lock().hotend_target
    }

    fn deg_target_bed(&self) -> f64 {
        self.0.lock().bed_target
    }

    fn set_target_hotend(&mut self, temp: f64, _idx: usize) {
        self.0.lock().hotend_target = temp;
    }

    fn set_target_bed(&mut self, temp: f64) {
        self.0.lock().bed_target = temp;
    }

    fn whole_deg_hotend(&self, _idx: usize) -> f64 {
        self.0.lock().hotend_temp
    }

    fn whole_deg_bed(&self) -> f64 {
        self.0.lock().bed_temp
    }
}

pub struct SimSteppers(Shared);

impl StepperAdapter for SimSteppers {
    fn enable_axis(&mut self, axis: Axis) {
        let mut st = self.0.lock();
        st.enabled_axes |= axis.bit();
        st.events.push(SimEvent::AxisEnabled(axis));
    }

    fn disable_axis(&mut self, axis: Axis) {
        let mut st = self.0.lock();
        st.enabled_axes &= !axis.bit();
        st.axes_trusted &= !axis.bit();
        st.events.push(SimEvent::AxisDisabled(axis));
    }

    fn disable_e_steppers(&mut self) {
        let mut st = self.0.lock();
        st.e_steppers_enabled = false;
        st.events.push(SimEvent::ESteppersOff);
    }
}

pub struct SimDrivers(Shared);

impl DriverAdapter for SimDrivers {
    fn tmc_enable_stallguard(&mut self, axis: Axis) -> bool {
        let mut st = self.0.lock();
        let prior = st.stealthchop[axis.index()];
        st.stallguard[axis.index()] = true;
        st.stealthchop[axis.index()] = false;
        st.events.push(SimEvent::StallguardOn(axis));
        prior
    }

    fn tmc_disable_stallguard(&mut self, axis: Axis, prior_stealth: bool) {
        let mut st = self.0.lock();
        st.stallguard[axis.index()] = false;
        st.stealthchop[axis.index()] = prior_stealth;
        st.events.push(SimEvent::StallguardOff(axis));
    }
}

pub struct SimUi(Shared);

impl UiAdapter for SimUi {
    fn set_status(&mut self, msg: &str) {
        self.0.lock().events.push(SimEvent::Status(msg.to_string()));
    }

    fn reset_status(&mut self) {
        self.0.lock().events.push(SimEvent::Status(String::new()));
    }

    fn return_to_status(&mut self) {}

    fn alert(&mut self, msg: &str) {
        self.0.lock().events.push(SimEvent::Alert(msg.to_string()));
    }

    fn buzz(&mut self) {
        self.0.lock().events.push(SimEvent::Buzz);
    }

    fn continue_prompt(&mut self, msg: &str) {
        self.0.lock().events.push(SimEvent::ContinuePrompt(msg.to_string()));
    }

    fn user_confirm_required(&mut self, msg: &str) {
        self.0.lock().events.push(SimEvent::ConfirmRequired(msg.to_string()));
    }

    fn wait_for_user_response(&mut self) {
        self.0.lock().events.push(SimEvent::UserResponse);
    }

    fn set_wait_for_user(&mut self, wait: bool) {
        self.0.lock().wait_for_user = wait;
    }

    fn waiting_for_user(&self) -> bool {
        self.0.lock().wait_for_user
    }

    fn idle(&mut self) {
        let mut st = self.0.lock();
        if st.idle_ticks_until_release > 0 {
            st.idle_ticks_until_release -= 1;
        }
        if st.idle_ticks_until_release == 0 {
            st.wait_for_user = false;
        }
    }
}

pub struct SimMachine(Shared);

impl MachineAdapter for SimMachine {
    fn stop(&mut self) {
        let mut st = self.0.lock();
        st.running = false;
        st.events.push(SimEvent::Stop);
    }

    fn is_running(&self) -> bool {
        self.0.lock().running
    }
}

pub struct SimHardware(Shared);

impl ProbeHardware for SimHardware {
    fn write_pin(&mut self, pin: PinId, level: bool) {
        let mut st = self.0.lock();
        st.pins.insert(pin.id(), level);
        st.apply_pin_actuation(pin.id(), level);
        st.events.push(SimEvent::PinWrite { pin: pin.id(), level });
    }

    fn read_pin(&self, pin: PinId) -> bool {
        *self.0.lock().pins.get(&pin.id()).unwrap_or(&false)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.0.lock().events.push(SimEvent::Delay(ms));
    }

    fn safe_delay(&mut self, ms: u32) {
        self.0.lock().events.push(SimEvent::SafeDelay(ms));
    }

    fn servo_move(&mut self, servo: usize, angle: u16) {
        let mut st = self.0.lock();
        st.servos.insert(servo, angle);
        st.apply_servo_actuation(angle);
        st.events.push(SimEvent::ServoMove { servo, angle });
    }

    fn is_probe_triggered(&self) -> bool {
        self.0.lock().live_triggered()
    }

    fn endstop_trigger_state(&self) -> EndstopState {
        self.0.lock().latched
    }

    fn bd_sensor_read(&self) -> f64 {
        self.0.lock().bd_reading
    }
}

pub struct SimCompensation(Shared);

impl CompensationAdapter for SimCompensation {
    fn measure_backlash_with_probe(&mut self) {
        let mut st = self.0.lock();
        st.backlash_measurements += 1;
        st.events.push(SimEvent::BacklashMeasured);
    }

    fn apply_ptc(&self, measured_z: &mut f64) {
        *measured_z += self.0.lock().ptc_shift;
    }

    fn x_twist(&self, _probe_pos: XyPos) -> f64 {
        self.0.lock().twist_comp
    }
}

/// A complete simulated machine. Tests poke `state` directly and read the
/// event trace back out.
pub struct SimRig {
    pub state: Shared,
}

impl SimRig {
    pub fn new() -> SimRig {
        SimRig::with_bed(Some(0.0))
    }

    pub fn with_bed(bed_z: Option<f64>) -> SimRig {
        SimRig { state: Arc::new(Mutex::new(SimState::new(bed_z))) }
    }

    pub fn adapters(&self) -> ProbeAdapters {
        ProbeAdapters {
            motion: Arc::new(Mutex::new(SimMotion(self.state.clone()))) as Handle<dyn MotionAdapter>,
            planner: Arc::new(Mutex::new(SimPlanner(self.state.clone()))) as Handle<dyn PlannerAdapter>,
            endstops: Arc::new(Mutex::new(SimEndstops(self.state.clone()))) as Handle<dyn EndstopsAdapter>,
            thermal: Arc::new(Mutex::new(SimThermal(self.state.clone()))) as Handle<dyn ThermalAdapter>,
            steppers: Arc::new(Mutex::new(SimSteppers(self.state.clone()))) as Handle<dyn StepperAdapter>,
            drivers: Arc::new(Mutex::new(SimDrivers(self.state.clone()))) as Handle<dyn DriverAdapter>,
            ui: Arc::new(Mutex::new(SimUi(self.state.clone()))) as Handle<dyn UiAdapter>,
            machine: Arc::new(Mutex::new(SimMachine(self.state.clone()))) as Handle<dyn MachineAdapter>,
            hardware: Arc::new(Mutex::new(SimHardware(self.state.clone()))) as Handle<dyn ProbeHardware>,
            compensation: Some(
                Arc::new(Mutex::new(SimCompensation(self.state.clone()))) as Handle<dyn CompensationAdapter>
            ),
        }
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.clone()
    }
}

impl Default for SimRig {
    fn default() -> Self {
        SimRig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descent_triggers_at_the_bed_plane() {
        let rig = SimRig::new();
        {
            let mut st = rig.state.lock();
            st.probe_offset_z = -2.0;
            st.z_probe_enabled = true;
        }
        let adapters = rig.adapters();
        adapters.motion.lock().do_blocking_move_to_z(-10.0, 4.0);
        let st = rig.state.lock();
        assert!((st.stepper_z - 2.0).abs() < 1e-9);
        assert!(st.latched.contains(EndstopState::Z_MIN_PROBE));
        assert_eq!(st.pos.z, -10.0);
    }

    #[test]
    fn descent_without_probing_reaches_target() {
        let rig = SimRig::new();
        let adapters = rig.adapters();
        adapters.motion.lock().do_blocking_move_to_z(-5.0, 4.0);
        let st = rig.state.lock();
        assert_eq!(st.stepper_z, -5.0);
        assert!(st.latched.is_empty());
    }

    #[test]
    fn scripted_heights_override_the_bed() {
        let rig = SimRig::new();
        {
            let mut st = rig.state.lock();
            st.z_probe_enabled = true;
            st.trigger_heights.push_back(3.25);
        }
        let adapters = rig.adapters();
        adapters.motion.lock().do_blocking_move_to_z(-10.0, 4.0);
        assert!((rig.state.lock().stepper_z - 3.25).abs() < 1e-9);
    }

    #[test]
    fn z_clearance_only_raises() {
        let rig = SimRig::new();
        let adapters = rig.adapters();
        adapters.motion.lock().do_z_clearance(5.0);
        assert_eq!(rig.state.lock().stepper_z, 10.0);
        adapters.motion.lock().do_z_clearance(15.0);
        assert_eq!(rig.state.lock().stepper_z, 15.0);
    }

    #[test]
    fn stallguard_swaps_stealthchop_and_back() {
        let rig = SimRig::new();
        let adapters = rig.adapters();
        let prior = adapters.drivers.lock().tmc_enable_stallguard(Axis::Z);
        assert!(prior);
        assert!(!rig.state.lock().stealthchop[2]);
        adapters.drivers.lock().tmc_disable_stallguard(Axis::Z, prior);
        assert!(rig.state.lock().stealthchop[2]);
    }
}
