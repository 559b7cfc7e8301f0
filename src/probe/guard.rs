// probe_host_rust/src/probe/guard.rs
// Quiet-probing context: pause heaters/fans, idle steppers, switch the
// drivers to stall detection. Restoration runs in Drop so every exit
// path, including failures, unwinds the machine state.

use crate::core_traits::{
    DriverAdapter, EndstopsAdapter, Handle, MotionAdapter, ProbeHardware, StepperAdapter,
    ThermalAdapter,
};
use crate::mathutil::Axis;
use crate::probe::params::{ProbeKind, MIN_DELAY_BEFORE_PROBING_MS};
use crate::probe::Probe;

pub(crate) struct ProbingGuard {
    thermal: Handle<dyn ThermalAdapter>,
    endstops: Handle<dyn EndstopsAdapter>,
    drivers: Handle<dyn DriverAdapter>,
    steppers: Handle<dyn StepperAdapter>,
    motion: Handle<dyn MotionAdapter>,
    heaters_paused: bool,
    fans_paused: bool,
    /// `axes_trusted` snapshot taken before the XY steppers were idled.
    prior_trusted: Option<u8>,
    /// Per-axis prior stealthChop state, in enable order.
    stealth_states: Vec<(Axis, bool)>,
    sensorless: bool,
}

impl ProbingGuard {
    /// Enter the quiet context. Returns None when no quiet-probing
    /// feature is configured.
    pub(crate) fn acquire(probe: &Probe) -> Option<ProbingGuard> {
        if !probe.params.has_quiet_probing() {
            return None;
        }

        let heaters_paused = probe.params.heaters_off_during_probe && probe.settings.turn_heaters_off;
        if heaters_paused {
            probe.thermal.lock().pause_heaters(true);
        }
        let fans_paused = probe.params.fans_off_during_probe;
        if fans_paused {
            probe.thermal.lock().set_fans_paused(true);
        }
        if probe.params.e_steppers_off {
            probe.steppers.lock().disable_e_steppers();
        }

        let mut prior_trusted = None;
        if probe.params.xy_steppers_off && !probe.motion.lock().is_delta() {
            prior_trusted = Some(probe.motion.lock().axes_trusted());
            probe.steppers.lock().disable_axis(Axis::X);
            probe.steppers.lock().disable_axis(Axis::Y);
        }

        let mut stealth_states = Vec::new();
        let sensorless = probe.params.kind == ProbeKind::Sensorless;
        if sensorless {
            // Delta machines watch every tower DIAG pin for a stall; all
            // machines check Z.
            if probe.motion.lock().is_delta() {
                if probe.test_sensitivity.x {
                    stealth_states.push((Axis::X, probe.drivers.lock().tmc_enable_stallguard(Axis::X)));
                }
                if probe.test_sensitivity.y {
                    stealth_states.push((Axis::Y, probe.drivers.lock().tmc_enable_stallguard(Axis::Y)));
                }
            }
            if probe.test_sensitivity.z {
                stealth_states.push((Axis::Z, probe.drivers.lock().tmc_enable_stallguard(Axis::Z)));
            }
            // The homing current also applies to probing.
            probe.endstops.lock().set_homing_current(true);
            probe.endstops.lock().enable(true);
        }

        // Let mechanical and electrical transients settle.
        let settle = probe.params.delay_before_probing_ms.max(MIN_DELAY_BEFORE_PROBING_MS);
        probe.hardware.lock().safe_delay(settle);

        Some(ProbingGuard {
            thermal: probe.thermal.clone(),
            endstops: probe.endstops.clone(),
            drivers: probe.drivers.clone(),
            steppers: probe.steppers.clone(),
            motion: probe.motion.clone(),
            heaters_paused,
            fans_paused,
            prior_trusted,
            stealth_states,
            sensorless,
        })
    }
}

impl Drop for ProbingGuard {
    fn drop(&mut self) {
        if self.sensorless {
            self.endstops.lock().not_homing();
            for (axis, prior) in self.stealth_states.drain(..) {
                self.drivers.lock().tmc_disable_stallguard(axis, prior);
            }
            self.endstops.lock().set_homing_current(false);
        }
        if let Some(old_trusted) = self.prior_trusted {
            if old_trusted & Axis::X.bit() != 0 {
                self.steppers.lock().enable_axis(Axis::X);
            }
            if old_trusted & Axis::Y.bit() != 0 {
                self.steppers.lock().enable_axis(Axis::Y);
            }
            self.motion.lock().set_axes_trusted(old_trusted);
        }
        if self.fans_paused {
            self.thermal.lock().set_fans_paused(false);
        }
        if self.heaters_paused {
            self.thermal.lock().pause_heaters(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configfile::Configfile;
    use crate::probe::params::SECTION;
    use crate::probe::Probe;
    use crate::sim::{SimEvent, SimRig};

    fn quiet_config() -> Configfile {
        let mut cf = Configfile::new();
        cf.add_section(SECTION);
        cf.set(SECTION, "z_offset", "-1.5");
        cf.set(SECTION, "heaters_off_during_probe", "true");
        cf.set(SECTION, "fans_off_during_probe", "true");
        cf.set(SECTION, "e_steppers_off", "true");
        cf.set(SECTION, "xy_steppers_off", "true");
        cf
    }

    #[test]
    fn no_features_means_no_guard() {
        let mut cf = Configfile::new();
        cf.add_section(SECTION);
        cf.set(SECTION, "z_offset", "-1.5");
        let rig = SimRig::new();
        let probe = Probe::from_config(&cf, rig.adapters()).unwrap();
        assert!(ProbingGuard::acquire(&probe).is_none());
        assert!(rig.events().is_empty());
    }

    #[test]
    fn pause_and_restore_round_trip() {
        let rig = SimRig::new();
        let probe = Probe::from_config(&quiet_config(), rig.adapters()).unwrap();

        let guard = ProbingGuard::acquire(&probe).unwrap();
        {
            let st = rig.state.lock();
            assert!(st.heaters_paused);
            assert!(st.fans_paused);
            assert!(!st.e_steppers_enabled);
            assert_eq!(st.enabled_axes & 0b011, 0);
            assert_eq!(st.axes_trusted & 0b011, 0);
        }
        drop(guard);
        let st = rig.state.lock();
        assert!(!st.heaters_paused);
        assert!(!st.fans_paused);
        assert_eq!(st.enabled_axes & 0b011, 0b011);
        assert_eq!(st.axes_trusted, 0b111);
    }

    #[test]
    fn heaters_stay_on_when_settings_say_so() {
        let rig = SimRig::new();
        let mut probe = Probe::from_config(&quiet_config(), rig.adapters()).unwrap();
        probe.settings.turn_heaters_off = false;

        let guard = ProbingGuard::acquire(&probe).unwrap();
        assert!(!rig.state.lock().heaters_paused);
        drop(guard);
        assert!(!rig.state.lock().heaters_paused);
    }

    #[test]
    fn untrusted_axes_are_not_reenabled() {
        let rig = SimRig::new();
        rig.state.lock().axes_trusted = 0b100; // only Z trusted
        let probe = Probe::from_config(&quiet_config(), rig.adapters()).unwrap();

        let guard = ProbingGuard::acquire(&probe).unwrap();
        drop(guard);
        let st = rig.state.lock();
        assert_eq!(st.axes_trusted, 0b100);
        assert_eq!(st.enabled_axes & 0b011, 0);
    }

    #[test]
    fn sensorless_restores_stealthchop_and_current() {
        let mut cf = Configfile::new();
        cf.add_section(SECTION);
        cf.set(SECTION, "z_offset", "0");
        cf.set(SECTION, "kind", "sensorless");
        let rig = SimRig::new();
        let probe = Probe::from_config(&cf, rig.adapters()).unwrap();

        let guard = ProbingGuard::acquire(&probe).unwrap();
        {
            let st = rig.state.lock();
            assert!(st.stallguard[2]);
            assert!(!st.stealthchop[2]);
            assert!(st.homing_current);
            assert!(st.endstops_enabled);
        }
        drop(guard);
        let st = rig.state.lock();
        assert!(!st.stallguard[2]);
        assert!(st.stealthchop[2]);
        assert!(!st.homing_current);
        assert!(!st.endstops_enabled);
    }

    #[test]
    fn delta_sensorless_covers_participating_towers() {
        let mut cf = Configfile::new();
        cf.add_section(SECTION);
        cf.set(SECTION, "z_offset", "0");
        cf.set(SECTION, "kind", "sensorless");
        let rig = SimRig::new();
        rig.state.lock().delta = true;
        let mut probe = Probe::from_config(&cf, rig.adapters()).unwrap();
        probe.test_sensitivity.y = false;

        let guard = ProbingGuard::acquire(&probe).unwrap();
        {
            let st = rig.state.lock();
            assert!(st.stallguard[0]);
            assert!(!st.stallguard[1]);
            assert!(st.stallguard[2]);
        }
        drop(guard);
        let st = rig.state.lock();
        assert!(!st.stallguard[0]);
        assert!(st.stealthchop[0]);
    }

    #[test]
    fn settle_delay_runs_on_entry() {
        let rig = SimRig::new();
        let probe = Probe::from_config(&quiet_config(), rig.adapters()).unwrap();
        let _guard = ProbingGuard::acquire(&probe).unwrap();
        assert!(rig
            .events()
            .iter()
            .any(|e| matches!(e, SimEvent::SafeDelay(ms) if *ms >= 25)));
    }
}
