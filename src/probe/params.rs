// probe_host_rust/src/probe/params.rs
// Probe configuration: immutable per-cycle parameters parsed from the
// [probe] config section, plus the mutable user-facing settings.

use crate::configfile::{ConfigError, Configfile};
use crate::core_traits::PinId;
use crate::mathutil::XyzPos;
use crate::probe::ProbeError;

pub const SECTION: &str = "probe";

/// Deepest Z allowed when the Z axis is not trusted.
pub const UNTRUSTED_LOW_POINT: f64 = -10.0;

/// Minimum settle delay before a quiet-probing descent, in ms.
pub const MIN_DELAY_BEFORE_PROBING_MS: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    FixedMount,
    NozzleAsProbe,
    BlTouch,
    ZServo,
    Solenoid,
    MagLev,
    Sled,
    TouchMi,
    AllenKey,
    MagMounted,
    RackAndPinion,
    Sensorless,
    BdSensor,
}

impl ProbeKind {
    pub const CHOICES: [&'static str; 13] = [
        "fixed_mount",
        "nozzle",
        "bltouch",
        "z_servo",
        "solenoid",
        "maglev",
        "sled",
        "touch_mi",
        "allen_key",
        "mag_mounted",
        "rack_and_pinion",
        "sensorless",
        "bd_sensor",
    ];

    fn from_choice(s: &str) -> ProbeKind {
        match s {
            "nozzle" => ProbeKind::NozzleAsProbe,
            "bltouch" => ProbeKind::BlTouch,
            "z_servo" => ProbeKind::ZServo,
            "solenoid" => ProbeKind::Solenoid,
            "maglev" => ProbeKind::MagLev,
            "sled" => ProbeKind::Sled,
            "touch_mi" => ProbeKind::TouchMi,
            "allen_key" => ProbeKind::AllenKey,
            "mag_mounted" => ProbeKind::MagMounted,
            "rack_and_pinion" => ProbeKind::RackAndPinion,
            "sensorless" => ProbeKind::Sensorless,
            "bd_sensor" => ProbeKind::BdSensor,
            _ => ProbeKind::FixedMount,
        }
    }

    /// Probes with no moving carriage hardware of their own.
    pub fn is_fixed(self) -> bool {
        matches!(self, ProbeKind::FixedMount | ProbeKind::NozzleAsProbe)
    }

    /// Sled docking and Allen-key waypoint replay move the carriage, so
    /// XY must be homed before deploy/stow.
    pub fn requires_homed_xy(self) -> bool {
        matches!(self, ProbeKind::Sled | ProbeKind::AllenKey)
    }

    /// Whether stow needs Z clearance first. Fixed probes only raise for
    /// deploy, unless an operator pause needs working room either way.
    pub fn needs_z_clearance_on_stow(self, pause_before_deploy_stow: bool) -> bool {
        !self.is_fixed() || pause_before_deploy_stow
    }
}

/// One waypoint of an Allen-key or mag-mounted deploy/stow sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeMove {
    pub pos: XyzPos,
    pub feedrate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clearances {
    pub deploy: f64,
    pub between_probes: f64,
    pub multi_probe: f64,
    pub big_raise: f64,
}

#[derive(Debug, Clone)]
pub struct ProbeParams {
    pub kind: ProbeKind,
    pub offset: XyzPos,
    pub fast_feedrate: f64,
    pub slow_feedrate: f64,
    pub xy_feedrate: f64,
    pub total_samples: usize,
    pub extra_samples: usize,
    pub z_probe_low_point: f64,
    pub clearances: Clearances,
    pub delay_before_probing_ms: u32,

    pub servo_nr: usize,
    pub servo_deploy_angle: u16,
    pub servo_stow_angle: u16,

    pub sol1_pin: Option<PinId>,
    pub maglev_trigger_pin: Option<PinId>,
    pub maglev_trigger_delay_ms: u32,
    pub maglev_idle_z: f64,

    pub sled_dock_x: f64,
    pub sled_docking_offset: f64,

    pub touch_mi_deploy_x: Option<f64>,
    pub touch_mi_deploy_y: Option<f64>,
    pub touch_mi_retract_z: f64,
    pub touch_mi_manual_deploy: bool,

    pub deploy_moves: Vec<ProbeMove>,
    pub stow_moves: Vec<ProbeMove>,

    pub rack_deploy_x: f64,
    pub rack_retract_x: f64,

    pub tare_pin: Option<PinId>,
    pub tare_active_high: bool,
    pub tare_time_ms: u32,
    pub tare_delay_ms: u32,
    pub tare_only_while_inactive: bool,

    pub pause_before_deploy_stow: bool,
    pub pause_when_triggered: bool,
    pub preheat_before_probing: bool,
    pub heaters_off_during_probe: bool,
    pub fans_off_during_probe: bool,
    pub e_steppers_off: bool,
    pub xy_steppers_off: bool,
    pub measure_backlash: bool,
    pub x_twist_compensation: bool,
    pub temperature_compensation: bool,
    pub triggered_when_stowed_test: bool,
    pub high_speed_bltouch: bool,
    pub wait_for_bed_heater: bool,
    pub wait_for_hotend: bool,
    pub retry_and_recover: bool,
}

impl ProbeParams {
    pub fn new(config: &Configfile) -> Result<Self, ProbeError> {
        if !config.has_section(SECTION) {
            return Err(ConfigError::MissingSection(SECTION.to_string()).into());
        }

        let kind = ProbeKind::from_choice(&config.getchoice(
            SECTION,
            "kind",
            &ProbeKind::CHOICES,
            Some("fixed_mount"),
        )?);

        let offset = XyzPos::new(
            config.getfloat(SECTION, "x_offset", Some(0.0), None, None)?,
            config.getfloat(SECTION, "y_offset", Some(0.0), None, None)?,
            config.getfloat(SECTION, "z_offset", None, None, None)?,
        );

        let fast_feedrate = config.getfloat(SECTION, "fast_feedrate", Some(4.0), None, None)?;
        if fast_feedrate <= 0.0 {
            return Err(positive_err("fast_feedrate"));
        }
        let slow_feedrate =
            config.getfloat(SECTION, "slow_feedrate", Some(fast_feedrate / 2.0), None, None)?;
        if slow_feedrate <= 0.0 {
            return Err(positive_err("slow_feedrate"));
        }
        let xy_feedrate = config.getfloat(SECTION, "xy_feedrate", Some(133.0), None, None)?;
        if xy_feedrate <= 0.0 {
            return Err(positive_err("xy_feedrate"));
        }

        let total_samples = config.getint(SECTION, "samples", Some(1), Some(1), Some(64))? as usize;
        let extra_samples = config.getint(SECTION, "extra_samples", Some(0), Some(0), Some(62))? as usize;
        if extra_samples > 0 && total_samples < extra_samples + 2 {
            return Err(ProbeError::Config(format!(
                "'extra_samples' in section [{}] must leave at least two kept samples",
                SECTION
            )));
        }

        let z_probe_low_point =
            config.getfloat(SECTION, "low_point", Some(-2.0), None, Some(0.0))?;

        let clearances = Clearances {
            deploy: config.getfloat(SECTION, "deploy_clearance", Some(10.0), Some(0.0), None)?,
            between_probes: config.getfloat(SECTION, "between_probes_clearance", Some(5.0), Some(0.0), None)?,
            multi_probe: config.getfloat(SECTION, "multi_probe_clearance", Some(5.0), Some(0.0), None)?,
            big_raise: config.getfloat(SECTION, "big_raise_clearance", Some(25.0), Some(0.0), None)?,
        };

        let delay_before_probing_ms =
            config.getint(SECTION, "delay_before_probing_ms", Some(25), Some(0), Some(10_000))? as u32;

        let sol1_pin = optional_pin(config, "sol1_pin")?;
        let maglev_trigger_pin = optional_pin(config, "maglev_trigger_pin")?;
        let tare_pin = optional_pin(config, "tare_pin")?;

        let deploy_moves = parse_moves(config, "deploy_move")?;
        let stow_moves = parse_moves(config, "stow_move")?;
        if matches!(kind, ProbeKind::AllenKey | ProbeKind::MagMounted)
            && (deploy_moves.is_empty() || stow_moves.is_empty())
        {
            return Err(ProbeError::Config(format!(
                "probe kind '{:?}' needs deploy_move_1/stow_move_1 waypoints",
                kind
            )));
        }

        let params = ProbeParams {
            kind,
            offset,
            fast_feedrate,
            slow_feedrate,
            xy_feedrate,
            total_samples,
            extra_samples,
            z_probe_low_point,
            clearances,
            delay_before_probing_ms,
            servo_nr: config.getint(SECTION, "servo_nr", Some(0), Some(0), Some(7))? as usize,
            servo_deploy_angle: config.getint(SECTION, "servo_deploy_angle", Some(10), Some(0), Some(180))? as u16,
            servo_stow_angle: config.getint(SECTION, "servo_stow_angle", Some(90), Some(0), Some(180))? as u16,
            sol1_pin,
            maglev_trigger_pin,
            maglev_trigger_delay_ms: config
                .getint(SECTION, "maglev_trigger_delay_ms", Some(500), Some(0), Some(10_000))?
                as u32,
            maglev_idle_z: config.getfloat(SECTION, "maglev_idle_z", Some(10.0), Some(0.0), None)?,
            sled_dock_x: config.getfloat(SECTION, "sled_dock_x", Some(0.0), None, None)?,
            sled_docking_offset: config.getfloat(SECTION, "sled_docking_offset", Some(0.0), None, None)?,
            touch_mi_deploy_x: optional_float(config, "touch_mi_deploy_x")?,
            touch_mi_deploy_y: optional_float(config, "touch_mi_deploy_y")?,
            touch_mi_retract_z: config.getfloat(SECTION, "touch_mi_retract_z", Some(0.5), None, None)?,
            touch_mi_manual_deploy: config.getboolean(SECTION, "touch_mi_manual_deploy", Some(false))?,
            rack_deploy_x: config.getfloat(SECTION, "rack_deploy_x", Some(0.0), None, None)?,
            rack_retract_x: config.getfloat(SECTION, "rack_retract_x", Some(0.0), None, None)?,
            tare_pin,
            tare_active_high: config.getboolean(SECTION, "tare_active_high", Some(true))?,
            tare_time_ms: config.getint(SECTION, "tare_time_ms", Some(200), Some(0), Some(10_000))? as u32,
            tare_delay_ms: config.getint(SECTION, "tare_delay_ms", Some(200), Some(0), Some(10_000))? as u32,
            tare_only_while_inactive: config.getboolean(SECTION, "tare_only_while_inactive", Some(false))?,
            deploy_moves,
            stow_moves,
            pause_before_deploy_stow: config.getboolean(SECTION, "pause_before_deploy_stow", Some(false))?,
            pause_when_triggered: config.getboolean(SECTION, "pause_when_triggered", Some(false))?,
            preheat_before_probing: config.getboolean(SECTION, "preheat_before_probing", Some(false))?,
            heaters_off_during_probe: config.getboolean(SECTION, "heaters_off_during_probe", Some(false))?,
            fans_off_during_probe: config.getboolean(SECTION, "fans_off_during_probe", Some(false))?,
            e_steppers_off: config.getboolean(SECTION, "e_steppers_off", Some(false))?,
            xy_steppers_off: config.getboolean(SECTION, "xy_steppers_off", Some(false))?,
            measure_backlash: config.getboolean(SECTION, "measure_backlash", Some(false))?,
            x_twist_compensation: config.getboolean(SECTION, "x_twist_compensation", Some(false))?,
            temperature_compensation: config.getboolean(SECTION, "temperature_compensation", Some(false))?,
            triggered_when_stowed_test: config.getboolean(SECTION, "triggered_when_stowed_test", Some(false))?,
            high_speed_bltouch: config.getboolean(SECTION, "high_speed_bltouch", Some(false))?,
            wait_for_bed_heater: config.getboolean(SECTION, "wait_for_bed_heater", Some(false))?,
            wait_for_hotend: config.getboolean(SECTION, "wait_for_hotend", Some(false))?,
            retry_and_recover: config.getboolean(SECTION, "retry_and_recover", Some(false))?,
        };
        Ok(params)
    }

    pub fn probe_tare(&self) -> bool {
        self.tare_pin.is_some()
    }

    /// Any quiet-probing feature that needs the environment guard.
    pub fn has_quiet_probing(&self) -> bool {
        self.heaters_off_during_probe
            || self.fans_off_during_probe
            || self.e_steppers_off
            || self.xy_steppers_off
            || self.kind == ProbeKind::Sensorless
    }
}

fn positive_err(option: &str) -> ProbeError {
    ProbeError::Config(format!("'{}' in section [{}] must be positive", option, SECTION))
}

fn optional_pin(config: &Configfile, option: &str) -> Result<Option<PinId>, ProbeError> {
    match config.getint(SECTION, option, Some(-1), Some(-1), Some(255))? {
        -1 => Ok(None),
        id => PinId::new(id)
            .map(Some)
            .ok_or_else(|| ProbeError::Config(format!("invalid pin id for '{}'", option))),
    }
}

fn optional_float(config: &Configfile, option: &str) -> Result<Option<f64>, ProbeError> {
    match config.get(SECTION, option, Some("")) {
        Ok(s) if s.is_empty() => Ok(None),
        Ok(_) => Ok(Some(config.getfloat(SECTION, option, None, None, None)?)),
        Err(e) => Err(e.into()),
    }
}

/// Parse `<prefix>_1` .. `<prefix>_5` waypoints of the form
/// "x,y,z,feedrate_mm_min". Missing entries end the sequence.
fn parse_moves(config: &Configfile, prefix: &str) -> Result<Vec<ProbeMove>, ProbeError> {
    let mut moves = Vec::new();
    for i in 1..=5 {
        let option = format!("{}_{}", prefix, i);
        let raw = config.get(SECTION, &option, Some(""))?;
        if raw.is_empty() {
            break;
        }
        let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(ProbeError::Config(format!(
                "'{}' must be 'x,y,z,feedrate' (got '{}')",
                option, raw
            )));
        }
        let mut vals = [0.0f64; 4];
        for (slot, field) in vals.iter_mut().zip(&fields) {
            *slot = field.parse::<f64>().map_err(|_| {
                ProbeError::Config(format!("'{}' has non-numeric field '{}'", option, field))
            })?;
        }
        moves.push(ProbeMove {
            pos: XyzPos::new(vals[0], vals[1], vals[2]),
            feedrate: vals[3] / 60.0,
        });
    }
    Ok(moves)
}

/// Mutable, user-configurable probe settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSettings {
    pub preheat_hotend_temp: f64,
    pub preheat_bed_temp: f64,
    pub turn_heaters_off: bool,
    pub stabilize_temperatures_after_probing: bool,
}

impl ProbeSettings {
    pub fn new(config: &Configfile) -> Result<Self, ProbeError> {
        Ok(ProbeSettings {
            preheat_hotend_temp: config.getfloat(SECTION, "preheat_hotend_temp", Some(0.0), Some(0.0), None)?,
            preheat_bed_temp: config.getfloat(SECTION, "preheat_bed_temp", Some(0.0), Some(0.0), None)?,
            turn_heaters_off: config.getboolean(SECTION, "turn_heaters_off", Some(true))?,
            stabilize_temperatures_after_probing: config
                .getboolean(SECTION, "stabilize_temperatures_after_probing", Some(true))?,
        })
    }
}

/// Fixed record contributed to the firmware's persisted-settings image.
/// Byte layout is the settings component's business.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersistedProbe {
    pub offset_x: f64,
    pub offset_y: f64,
    pub offset_z: f64,
    pub preheat_hotend_temp: f64,
    pub preheat_bed_temp: f64,
    pub turn_heaters_off: bool,
    pub stabilize_temperatures_after_probing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Configfile {
        let mut cf = Configfile::new();
        cf.add_section(SECTION);
        cf.set(SECTION, "z_offset", "-1.5");
        cf
    }

    #[test]
    fn defaults_are_sane() {
        let cf = base_config();
        let p = ProbeParams::new(&cf).unwrap();
        assert_eq!(p.kind, ProbeKind::FixedMount);
        assert_eq!(p.offset.z, -1.5);
        assert_eq!(p.fast_feedrate, 4.0);
        assert_eq!(p.slow_feedrate, 2.0);
        assert_eq!(p.total_samples, 1);
        assert_eq!(p.extra_samples, 0);
        assert_eq!(p.clearances.deploy, 10.0);
        assert_eq!(p.clearances.big_raise, 25.0);
        assert!(!p.probe_tare());
        assert!(!p.has_quiet_probing());
    }

    #[test]
    fn z_offset_is_mandatory() {
        let mut cf = Configfile::new();
        cf.add_section(SECTION);
        let err = ProbeParams::new(&cf).unwrap_err();
        assert!(err.to_string().contains("z_offset"));
    }

    #[test]
    fn extra_samples_must_leave_two_kept() {
        let mut cf = base_config();
        cf.set(SECTION, "samples", "3");
        cf.set(SECTION, "extra_samples", "2");
        assert!(ProbeParams::new(&cf).is_err());
        cf.set(SECTION, "samples", "5");
        let p = ProbeParams::new(&cf).unwrap();
        assert_eq!(p.extra_samples, 2);
    }

    #[test]
    fn waypoints_parse_and_convert_feedrate() {
        let mut cf = base_config();
        cf.set(SECTION, "kind", "allen_key");
        cf.set(SECTION, "deploy_move_1", "30, 0, 5, 1200");
        cf.set(SECTION, "deploy_move_2", "0, 0, 5, 600");
        cf.set(SECTION, "stow_move_1", "30, 0, 5, 1200");
        let p = ProbeParams::new(&cf).unwrap();
        assert_eq!(p.deploy_moves.len(), 2);
        assert_eq!(p.deploy_moves[0].pos, XyzPos::new(30.0, 0.0, 5.0));
        assert_eq!(p.deploy_moves[0].feedrate, 20.0);
        assert_eq!(p.stow_moves.len(), 1);
    }

    #[test]
    fn allen_key_requires_waypoints() {
        let mut cf = base_config();
        cf.set(SECTION, "kind", "allen_key");
        assert!(ProbeParams::new(&cf).is_err());
    }

    #[test]
    fn sensorless_counts_as_quiet_probing() {
        let mut cf = base_config();
        cf.set(SECTION, "kind", "sensorless");
        let p = ProbeParams::new(&cf).unwrap();
        assert!(p.has_quiet_probing());
    }

    #[test]
    fn settings_defaults() {
        let cf = base_config();
        let s = ProbeSettings::new(&cf).unwrap();
        assert_eq!(s.preheat_hotend_temp, 0.0);
        assert!(s.turn_heaters_off);
        assert!(s.stabilize_temperatures_after_probing);
    }

    #[test]
    fn pins_validate_range() {
        let mut cf = base_config();
        cf.set(SECTION, "tare_pin", "42");
        let p = ProbeParams::new(&cf).unwrap();
        assert_eq!(p.tare_pin.unwrap().id(), 42);
        assert!(p.probe_tare());

        cf.set(SECTION, "tare_pin", "300");
        assert!(ProbeParams::new(&cf).is_err());
    }
}
