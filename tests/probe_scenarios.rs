// End-to-end probe cycles on the simulated machine: one probe per
// scenario, asserting the measured height, the post-cycle machine state
// and the restoration guarantees.

use probe_host_rust::configfile::Configfile;
use probe_host_rust::endstops::EndstopState;
use probe_host_rust::mathutil::TowerValues;
use probe_host_rust::probe::params::SECTION;
use probe_host_rust::probe::{Probe, ProbeError, RaiseAfter};
use probe_host_rust::sim::{SimEvent, SimRig};

fn config(kind: &str, z_offset: &str) -> Configfile {
    let mut cf = Configfile::new();
    cf.add_section(SECTION);
    cf.set(SECTION, "kind", kind);
    cf.set(SECTION, "z_offset", z_offset);
    cf
}

fn build(rig: &SimRig, cf: &Configfile) -> Probe {
    let _ = env_logger::builder().is_test(true).try_init();
    Probe::from_config(cf, rig.adapters()).unwrap()
}

#[test]
fn single_mechanical_probe_measures_a_flat_bed() {
    let rig = SimRig::new();
    rig.state.lock().probe_offset_z = -1.5;
    let cf = config("fixed_mount", "-1.5");
    let mut probe = build(&rig, &cf);

    let z = probe
        .probe_at_point(100.0, 100.0, RaiseAfter::Raise, true, true)
        .unwrap();
    assert!((-0.02..=0.02).contains(&z), "measured {}", z);

    let st = rig.state.lock();
    assert!(st.pos.x == 100.0 && st.pos.y == 100.0);
    // Raised clear of the bed after the cycle.
    assert!(st.pos.z >= 5.0);
    // Planner and stepper agree.
    assert!((st.pos.z - st.stepper_z).abs() < 1e-9);
}

#[test]
fn double_probe_weights_slow_sample_three_to_two() {
    let rig = SimRig::new();
    {
        let mut st = rig.state.lock();
        st.trigger_heights.push_back(0.30); // fast
        st.trigger_heights.push_back(0.10); // slow
    }
    let mut cf = config("fixed_mount", "0");
    cf.set(SECTION, "samples", "2");
    let mut probe = build(&rig, &cf);

    let z = probe
        .probe_at_point(50.0, 50.0, RaiseAfter::None, true, true)
        .unwrap();
    assert!((z - 0.18).abs() < 1e-9, "measured {}", z);
}

#[test]
fn five_samples_trim_one_outlier_from_the_median() {
    let rig = SimRig::new();
    {
        let mut st = rig.state.lock();
        for h in [0.10, 0.05, 0.40, 0.09, 0.11] {
            st.trigger_heights.push_back(h);
        }
    }
    let mut cf = config("fixed_mount", "0");
    cf.set(SECTION, "samples", "5");
    cf.set(SECTION, "extra_samples", "1");
    let mut probe = build(&rig, &cf);

    let z = probe
        .probe_at_point(50.0, 50.0, RaiseAfter::None, true, true)
        .unwrap();
    assert!((z - 0.0875).abs() < 1e-9, "measured {}", z);
}

#[test]
fn clearance_raises_between_consecutive_samples() {
    let rig = SimRig::new();
    let mut cf = config("fixed_mount", "0");
    cf.set(SECTION, "samples", "3");
    cf.set(SECTION, "multi_probe_clearance", "5");
    let mut probe = build(&rig, &cf);

    probe
        .probe_at_point(50.0, 50.0, RaiseAfter::None, true, true)
        .unwrap();

    // Walk the physical Z trace: after each triggered descent (bed at 0)
    // the trajectory must reach the sample height plus the clearance
    // before descending again.
    let history = rig.state.lock().z_history.clone();
    let triggers: Vec<usize> = history
        .iter()
        .enumerate()
        .filter(|(_, &z)| z.abs() < 1e-9)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(triggers.len(), 3);
    for pair in triggers.windows(2) {
        let between = &history[pair[0] + 1..pair[1]];
        let peak = between.iter().cloned().fold(f64::MIN, f64::max);
        assert!(peak >= 5.0 - 1e-9, "peak between samples was {}", peak);
    }
}

#[test]
fn missing_bed_fails_and_restores_driver_state() {
    let rig = SimRig::with_bed(None);
    {
        let mut st = rig.state.lock();
        st.axes_trusted = 0b011; // Z not trusted: floor is -10
    }
    let cf = config("sensorless", "0");
    let mut probe = build(&rig, &cf);

    let err = probe
        .probe_at_point(50.0, 50.0, RaiseAfter::Stow, true, true)
        .unwrap_err();
    assert_eq!(err, ProbeError::ProbingFailed);
    assert!(!probe.is_deployed());

    let st = rig.state.lock();
    // Descended exactly to the untrusted floor, never past it.
    assert!(st.min_z_seen >= -10.0 - 1e-9);
    assert!((st.min_z_seen - -10.0).abs() < 1e-9);
    // stallGuard off, stealthChop back, homing current dropped.
    assert!(!st.stallguard[2]);
    assert!(st.stealthchop[2]);
    assert!(!st.homing_current);
    assert!(st
        .events
        .iter()
        .any(|e| matches!(e, SimEvent::Status(s) if s == "Probing failed")));
}

#[test]
fn implausibly_high_trigger_is_rejected() {
    let rig = SimRig::new();
    {
        let mut st = rig.state.lock();
        st.probe_offset_z = -1.5;
        st.probe_deployed = false;
        st.deploy_pin = Some(7);
        // Trigger half a millimeter above the plausible ceiling.
        st.trigger_heights.push_back(1.5 + 5.0 + 0.5);
    }
    let mut cf = config("solenoid", "-1.5");
    cf.set(SECTION, "sol1_pin", "7");
    cf.set(SECTION, "multi_probe_clearance", "5");
    let mut probe = build(&rig, &cf);

    let err = probe
        .probe_at_point(50.0, 50.0, RaiseAfter::Stow, true, true)
        .unwrap_err();
    assert_eq!(err, ProbeError::ProbingFailed);
    assert!(!probe.is_deployed());
    // The stow was actually driven out to the solenoid.
    assert!(rig
        .events()
        .contains(&SimEvent::PinWrite { pin: 7, level: false }));
}

#[test]
fn delta_sensorless_applies_largest_tower_adjustment() {
    let rig = SimRig::new();
    {
        let mut st = rig.state.lock();
        st.delta = true;
        st.sensorless_towers = EndstopState::Y_MAX;
        st.trigger_heights.push_back(1.0);
    }
    let cf = config("sensorless", "0");
    let mut probe = build(&rig, &cf);
    probe.offset_sensorless_adj = TowerValues { a: 0.1, b: 0.2, c: -0.05 };

    let z = probe
        .probe_at_point(50.0, 50.0, RaiseAfter::None, false, true)
        .unwrap();
    assert!((probe.largest_sensorless_adj() - 0.2).abs() < 1e-12);
    assert!((z - 0.8).abs() < 1e-9, "measured {}", z);
}

#[test]
fn unreachable_point_reports_without_side_effects() {
    let rig = SimRig::new();
    let cf = config("fixed_mount", "-1.5");
    let mut probe = build(&rig, &cf);

    let err = probe
        .probe_at_point(1000.0, 1000.0, RaiseAfter::Raise, true, true)
        .unwrap_err();
    assert_eq!(err, ProbeError::Unreachable);
    // No move, no deploy, no status chatter.
    assert!(rig.events().is_empty());
}

#[test]
fn bd_sensor_short_circuits_without_deploying() {
    let rig = SimRig::new();
    rig.state.lock().bd_reading = 1.2;
    let cf = config("bd_sensor", "0");
    let mut probe = build(&rig, &cf);

    let z = probe
        .probe_at_point(50.0, 50.0, RaiseAfter::None, true, true)
        .unwrap();
    assert!((z - 8.8).abs() < 1e-9);
    assert!(!rig
        .events()
        .iter()
        .any(|e| matches!(e, SimEvent::ZProbeEnabled(true))));
}

#[test]
fn bltouch_low_speed_deploys_and_stows_around_each_sample() {
    let rig = SimRig::new();
    {
        let mut st = rig.state.lock();
        st.probe_deployed = false;
        st.servo_deploy_angle = Some(10);
        st.servo_stow_angle = Some(90);
        st.servo_reset_angle = Some(160);
    }
    let cf = config("bltouch", "0");
    let mut probe = build(&rig, &cf);

    let z = probe
        .probe_at_point(50.0, 50.0, RaiseAfter::Stow, true, true)
        .unwrap();
    assert!(z.abs() < 1e-9);

    let events = rig.events();
    let deploys = events
        .iter()
        .filter(|e| matches!(e, SimEvent::ServoMove { angle: 10, .. }))
        .count();
    let stows = events
        .iter()
        .filter(|e| matches!(e, SimEvent::ServoMove { angle: 90, .. }))
        .count();
    // Cycle deploy, per-sample deploy, per-trigger stow, final stow.
    assert!(deploys >= 2, "deploys {}", deploys);
    assert!(stows >= 2, "stows {}", stows);
    assert!(!probe.is_deployed());
}

#[test]
fn bltouch_high_speed_resets_a_stuck_trigger_on_entry() {
    let rig = SimRig::new();
    {
        let mut st = rig.state.lock();
        st.probe_deployed = false;
        st.probe_alarm = true;
        st.servo_deploy_angle = Some(10);
        st.servo_stow_angle = Some(90);
        st.servo_reset_angle = Some(160);
    }
    let mut cf = config("bltouch", "0");
    cf.set(SECTION, "high_speed_bltouch", "true");
    let mut probe = build(&rig, &cf);

    probe
        .probe_at_point(50.0, 50.0, RaiseAfter::Stow, true, true)
        .unwrap();
    assert!(rig
        .events()
        .iter()
        .any(|e| matches!(e, SimEvent::ServoMove { angle: 160, .. })));
    assert!(!rig.state.lock().probe_alarm);
}

#[test]
fn preheat_raises_targets_and_waits_for_stabilization() {
    let rig = SimRig::new();
    {
        let mut st = rig.state.lock();
        st.probe_deployed = false;
        st.deploy_pin = Some(7);
    }
    let mut cf = config("solenoid", "-1.0");
    cf.set(SECTION, "sol1_pin", "7");
    cf.set(SECTION, "preheat_before_probing", "true");
    cf.set(SECTION, "preheat_hotend_temp", "120");
    cf.set(SECTION, "preheat_bed_temp", "90");
    let mut probe = build(&rig, &cf);

    probe.deploy().unwrap();
    let st = rig.state.lock();
    assert_eq!(st.hotend_target, 120.0);
    assert_eq!(st.bed_target, 90.0);
    assert_eq!(st.hotend_temp, 120.0);
    assert_eq!(st.bed_temp, 90.0);
    assert!(st.events.contains(&SimEvent::WaitHotend));
    assert!(st.events.contains(&SimEvent::WaitBed));
}

#[test]
fn stabilize_after_probing_waits_when_work_is_queued() {
    let rig = SimRig::new();
    {
        let mut st = rig.state.lock();
        st.probe_offset_z = -1.0;
        st.has_blocks_queued = true;
    }
    let mut cf = config("fixed_mount", "-1.0");
    cf.set(SECTION, "heaters_off_during_probe", "true");
    let mut probe = build(&rig, &cf);

    probe
        .probe_at_point(50.0, 50.0, RaiseAfter::Raise, true, true)
        .unwrap();
    let events = rig.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SimEvent::Status(s) if s.contains("heat-up"))));
    // Heaters were paused for the descent and resumed afterwards.
    assert!(events.contains(&SimEvent::HeatersPaused(true)));
    assert!(events.contains(&SimEvent::HeatersPaused(false)));
    assert!(!rig.state.lock().heaters_paused);
}

#[test]
fn tare_pulses_the_pin_and_refuses_when_active() {
    let rig = SimRig::new();
    rig.state.lock().probe_offset_z = -1.0;
    let mut cf = config("fixed_mount", "-1.0");
    cf.set(SECTION, "tare_pin", "9");
    cf.set(SECTION, "tare_time_ms", "200");
    cf.set(SECTION, "tare_only_while_inactive", "true");
    let mut probe = build(&rig, &cf);

    probe
        .probe_at_point(50.0, 50.0, RaiseAfter::Raise, true, true)
        .unwrap();
    let events = rig.events();
    assert!(events.contains(&SimEvent::PinWrite { pin: 9, level: true }));
    assert!(events.contains(&SimEvent::Delay(200)));

    // An active probe cannot be tared; the cycle fails cleanly.
    rig.state.lock().probe_switch_active = true;
    let err = probe
        .probe_at_point(50.0, 50.0, RaiseAfter::Raise, true, true)
        .unwrap_err();
    assert!(matches!(err, ProbeError::TareFailed(_)));
}

#[test]
fn backlash_is_measured_once_per_sample_when_enabled() {
    let rig = SimRig::new();
    let mut cf = config("fixed_mount", "0");
    cf.set(SECTION, "samples", "3");
    cf.set(SECTION, "measure_backlash", "true");
    let mut probe = build(&rig, &cf);

    probe
        .probe_at_point(50.0, 50.0, RaiseAfter::None, true, true)
        .unwrap();
    assert_eq!(rig.state.lock().backlash_measurements, 3);
}

#[test]
fn compensation_hooks_shift_the_result() {
    let rig = SimRig::new();
    {
        let mut st = rig.state.lock();
        st.probe_offset_z = -1.0;
        st.ptc_shift = 0.05;
        st.twist_comp = -0.02;
    }
    let mut cf = config("fixed_mount", "-1.0");
    cf.set(SECTION, "temperature_compensation", "true");
    cf.set(SECTION, "x_twist_compensation", "true");
    let mut probe = build(&rig, &cf);

    let z = probe
        .probe_at_point(50.0, 50.0, RaiseAfter::Raise, true, true)
        .unwrap();
    assert!((z - 0.03).abs() < 1e-9, "measured {}", z);
}

#[test]
fn big_raise_ascends_by_the_big_clearance() {
    let rig = SimRig::new();
    rig.state.lock().probe_offset_z = -1.0;
    let cf = config("fixed_mount", "-1.0");
    let mut probe = build(&rig, &cf);

    probe
        .probe_at_point(50.0, 50.0, RaiseAfter::BigRaise, true, true)
        .unwrap();
    // Trigger at 1.0, then a 25mm raise.
    let st = rig.state.lock();
    assert!((st.pos.z - 26.0).abs() < 1e-9);
}

#[test]
fn probe_status_reflects_the_last_result() {
    let rig = SimRig::new();
    rig.state.lock().probe_offset_z = -1.0;
    let cf = config("fixed_mount", "-1.0");
    let mut probe = build(&rig, &cf);

    probe
        .probe_at_point(10.0, 20.0, RaiseAfter::Raise, true, true)
        .unwrap();
    let status = probe.get_status();
    assert_eq!(status["kind"], "fixed_mount");
    let z = status["last_z_result"].as_f64().unwrap();
    assert!(z.abs() < 1e-9);
}
