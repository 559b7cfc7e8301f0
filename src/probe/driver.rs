// probe_host_rust/src/probe/driver.rs
// Per-variant deploy/stow actuation and the set_deployed state machine.
// Waypoint sequences (Allen-key, mag-mounted) are data, not code.

use crate::core_traits::{EndstopsAdapter, MachineAdapter, MotionAdapter, ProbeHardware, UiAdapter};
use crate::mathutil::{Axis, XyPos};
use crate::probe::params::{ProbeKind, ProbeMove};
use crate::probe::{Probe, ProbeError};

impl Probe {
    /// Deploy or stow the probe, verifying the transition where the
    /// hardware allows it. Idempotent: a request matching the current
    /// state returns without touching the hardware.
    pub(crate) fn set_deployed(&mut self, deploy: bool) -> Result<(), ProbeError> {
        log::debug!(
            "set_deployed({}) at {}",
            deploy,
            self.motion.lock().current_position()
        );
        if self.deployed == deploy {
            return Ok(());
        }

        // Make room for the probe to deploy (or stow). A fix-mounted
        // probe only raises for deploy, unless an operator pause needs
        // working room either way.
        let z_raise_wanted = if self.params.kind.needs_z_clearance_on_stow(self.params.pause_before_deploy_stow) {
            true
        } else {
            deploy
        };
        if z_raise_wanted {
            let clearances = self.params.clearances;
            self.do_z_raise(clearances.between_probes.max(clearances.deploy));
        }

        if self.params.kind.requires_homed_xy() {
            let homed = {
                let motion = self.motion.lock();
                motion.axis_is_trusted(Axis::X) && motion.axis_is_trusted(Axis::Y)
            };
            if !homed {
                self.probe_error_stop("Home XY before deploying the probe");
                return Err(ProbeError::NotHomed);
            }
        }

        let old_xy = self.motion.lock().current_position().xy();

        if self.params.triggered_when_stowed_test {
            // Only actuate if the trigger state says it is needed.
            if self.hardware.lock().is_probe_triggered() == deploy {
                // Switch off a triggered-when-stowed probe early,
                // otherwise an Allen-key probe can't be stowed.
                if !deploy {
                    self.endstops.lock().enable_z_probe(false);
                }
                self.probe_specific_action(deploy)?;
            }
            // Unchanged after the deploy/stow action?
            if self.hardware.lock().is_probe_triggered() == deploy {
                if self.machine.lock().is_running() {
                    log::error!("Z-Probe failed");
                    self.ui.lock().alert("Err: ZPROBE");
                }
                self.machine.lock().stop();
                return Err(ProbeError::DeployFailed("Z-Probe failed".to_string()));
            }
        } else {
            self.probe_specific_action(deploy)?;
        }

        if deploy && self.params.preheat_before_probing {
            let (hotend, bed) = (self.settings.preheat_hotend_temp, self.settings.preheat_bed_temp);
            self.preheat_for_probing(hotend, bed, false);
        }

        let xy_feedrate = self.params.xy_feedrate;
        self.motion.lock().do_blocking_move_to_xy(old_xy, xy_feedrate);
        self.endstops.lock().enable_z_probe(deploy);
        self.deployed = deploy;
        Ok(())
    }

    fn probe_specific_action(&mut self, deploy: bool) -> Result<(), ProbeError> {
        if self.params.pause_before_deploy_stow {
            self.operator_deploy_pause(deploy);
        }
        match self.params.kind {
            ProbeKind::FixedMount
            | ProbeKind::NozzleAsProbe
            | ProbeKind::Sensorless
            | ProbeKind::BdSensor => {}
            ProbeKind::Solenoid => {
                if let Some(pin) = self.params.sol1_pin {
                    self.hardware.lock().write_pin(pin, deploy);
                }
            }
            ProbeKind::MagLev => {
                if deploy {
                    self.maglev_release();
                } else {
                    self.maglev_idle();
                }
            }
            ProbeKind::Sled => self.dock_sled(deploy),
            ProbeKind::BlTouch => {
                let bl = self
                    .bltouch
                    .clone()
                    .ok_or_else(|| ProbeError::Config("BLTouch kind without command layer".to_string()))?;
                let mut hw = self.hardware.lock();
                if deploy {
                    bl.deploy(&mut *hw)?;
                } else {
                    bl.stow(&mut *hw)?;
                }
            }
            ProbeKind::ZServo => {
                let angle = if deploy {
                    self.params.servo_deploy_angle
                } else {
                    self.params.servo_stow_angle
                };
                self.hardware.lock().servo_move(self.params.servo_nr, angle);
            }
            ProbeKind::TouchMi => {
                if deploy {
                    self.touch_mi_deploy();
                } else {
                    self.touch_mi_stow();
                }
            }
            ProbeKind::AllenKey | ProbeKind::MagMounted => {
                let moves = if deploy {
                    self.params.deploy_moves.clone()
                } else {
                    self.params.stow_moves.clone()
                };
                self.run_waypoints(&moves);
            }
            ProbeKind::RackAndPinion => {
                let x = if deploy { self.params.rack_deploy_x } else { self.params.rack_retract_x };
                let feedrate = self.params.xy_feedrate;
                self.motion.lock().do_blocking_move_to_x(x, feedrate);
            }
        }
        Ok(())
    }

    /// Operator-assisted deploy/stow: announce, optionally wait for the
    /// probe to be attached or detached, then await confirmation.
    fn operator_deploy_pause(&mut self, deploy: bool) {
        // Start preheating before waiting for the operator so the wait
        // overlaps the heat-up.
        if deploy && self.params.preheat_before_probing {
            let bed = self.settings.preheat_bed_temp;
            self.preheat_for_probing(0.0, bed, true);
        }

        let msg = if deploy { "Deploy Z-probe" } else { "Stow Z-probe" };
        {
            let mut ui = self.ui.lock();
            ui.return_to_status();
            ui.set_status(msg);
            ui.buzz();
        }
        log::info!("{}", msg);

        if self.params.pause_when_triggered {
            // Wait for the trigger state to flip before asking for
            // explicit confirmation. The operator can interrupt.
            self.ui.lock().set_wait_for_user(true);
            loop {
                let triggered = self.hardware.lock().is_probe_triggered();
                if triggered != deploy || !self.ui.lock().waiting_for_user() {
                    break;
                }
                self.ui.lock().idle();
            }
            let mut ui = self.ui.lock();
            ui.set_wait_for_user(false);
            ui.buzz();
        }

        let mut ui = self.ui.lock();
        ui.continue_prompt(msg);
        ui.user_confirm_required(msg);
        ui.wait_for_user_response();
        ui.reset_status();
    }

    /// Pulse the trigger pin to release a magnetically levitated probe.
    fn maglev_release(&mut self) {
        if let Some(pin) = self.params.maglev_trigger_pin {
            let delay = self.params.maglev_trigger_delay_ms;
            let mut hw = self.hardware.lock();
            hw.write_pin(pin, true);
            hw.delay_ms(delay);
            hw.write_pin(pin, false);
        }
    }

    fn maglev_idle(&mut self) {
        let z = self.params.maglev_idle_z;
        let feedrate = self.motion.lock().homing_feedrate(Axis::Z);
        self.motion.lock().do_blocking_move_to_z(z, feedrate);
    }

    /// Move the carriage to the dock. Deploy docks a little short so the
    /// sled is captured cleanly.
    fn dock_sled(&mut self, deploy: bool) {
        log::debug!("dock_sled(deploy: {})", deploy);
        let x = self.params.sled_dock_x + self.params.sled_docking_offset
            - if deploy { 1.0 } else { 0.0 };
        let feedrate = self.params.xy_feedrate;
        self.motion.lock().do_blocking_move_to_x(x, feedrate);
        if let Some(pin) = self.params.sol1_pin {
            self.hardware.lock().write_pin(pin, !deploy);
        }
    }

    /// Move to the magnet (or prompt the operator) to unlock the probe.
    fn touch_mi_deploy(&mut self) {
        if self.params.touch_mi_manual_deploy {
            let mut ui = self.ui.lock();
            ui.set_status("Deploy TouchMI");
            ui.return_to_status();
            ui.continue_prompt("Deploy TouchMI");
            ui.wait_for_user_response();
            ui.reset_status();
            return;
        }
        let feedrate = self.params.xy_feedrate;
        match (self.params.touch_mi_deploy_x, self.params.touch_mi_deploy_y) {
            (Some(x), Some(y)) => self.motion.lock().do_blocking_move_to_xy(XyPos { x, y }, feedrate),
            (Some(x), None) => self.motion.lock().do_blocking_move_to_x(x, feedrate),
            (None, Some(y)) => self.motion.lock().do_blocking_move_to_y(y, feedrate),
            (None, None) => {}
        }
    }

    /// Descend to the retract height so the magnet re-captures the pin,
    /// then return to the previous Z.
    fn touch_mi_stow(&mut self) {
        let old_z = self.motion.lock().current_position().z;
        self.endstops.lock().enable_z_probe(false);
        let feedrate = self.motion.lock().homing_feedrate(Axis::Z);
        let retract_z = self.params.touch_mi_retract_z;
        self.motion.lock().do_blocking_move_to_z(retract_z, feedrate);
        self.motion.lock().do_blocking_move_to_z(old_z, feedrate);
    }

    fn run_waypoints(&mut self, moves: &[ProbeMove]) {
        for mv in moves {
            self.motion.lock().do_blocking_move_to(mv.pos, mv.feedrate);
        }
    }
}
