// probe_host_rust/src/configfile.rs
// Section/option configuration store and typed accessors.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    MissingSection(String),
    MissingOption { section: String, option: String },
    Parse { section: String, option: String, value: String, expected: &'static str },
    OutOfRange { section: String, option: String, value: String, min: Option<f64>, max: Option<f64> },
    BadChoice { section: String, option: String, value: String, choices: Vec<String> },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingSection(s) => write!(f, "Config section '[{}]' not found", s),
            ConfigError::MissingOption { section, option } => {
                write!(f, "Option '{}' in section [{}] is not specified", option, section)
            }
            ConfigError::Parse { section, option, value, expected } => write!(
                f,
                "Unable to parse '{}' in section [{}]: '{}' is not a valid {}",
                option, section, value, expected
            ),
            ConfigError::OutOfRange { section, option, value, min, max } => {
                write!(f, "Option '{}' in section [{}] is out of range ({}", option, section, value)?;
                if let Some(lo) = min {
                    write!(f, ", min {}", lo)?;
                }
                if let Some(hi) = max {
                    write!(f, ", max {}", hi)?;
                }
                write!(f, ")")
            }
            ConfigError::BadChoice { section, option, value, choices } => write!(
                f,
                "Choice '{}' for option '{}' in section [{}] is not valid (must be one of {:?})",
                value, option, section, choices
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// In-memory configuration: named sections of string options. Parsing of
/// the on-disk format happens upstream; the probe subsystem only consumes
/// sections handed to it.
#[derive(Debug, Clone, Default)]
pub struct Configfile {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Configfile {
    pub fn new() -> Self {
        Configfile { sections: HashMap::new() }
    }

    pub fn add_section(&mut self, name: &str) {
        self.sections.entry(name.to_string()).or_default();
    }

    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(option.to_string(), value.to_string());
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    fn raw(&self, section: &str, option: &str) -> Result<Option<&str>, ConfigError> {
        let sec = self
            .sections
            .get(section)
            .ok_or_else(|| ConfigError::MissingSection(section.to_string()))?;
        Ok(sec.get(option).map(|s| s.as_str()))
    }

    pub fn get(&self, section: &str, option: &str, default: Option<&str>) -> Result<String, ConfigError> {
        match self.raw(section, option)? {
            Some(v) => Ok(v.to_string()),
            None => default.map(|d| d.to_string()).ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            }),
        }
    }

    pub fn getfloat(
        &self,
        section: &str,
        option: &str,
        default: Option<f64>,
        minval: Option<f64>,
        maxval: Option<f64>,
    ) -> Result<f64, ConfigError> {
        let value = match self.raw(section, option)? {
            Some(v) => v.trim().parse::<f64>().map_err(|_| ConfigError::Parse {
                section: section.to_string(),
                option: option.to_string(),
                value: v.to_string(),
                expected: "number",
            })?,
            None => default.ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            })?,
        };
        if minval.is_some_and(|lo| value < lo) || maxval.is_some_and(|hi| value > hi) {
            return Err(ConfigError::OutOfRange {
                section: section.to_string(),
                option: option.to_string(),
                value: value.to_string(),
                min: minval,
                max: maxval,
            });
        }
        Ok(value)
    }

    pub fn getint(
        &self,
        section: &str,
        option: &str,
        default: Option<i64>,
        minval: Option<i64>,
        maxval: Option<i64>,
    ) -> Result<i64, ConfigError> {
        let value = match self.raw(section, option)? {
            Some(v) => v.trim().parse::<i64>().map_err(|_| ConfigError::Parse {
                section: section.to_string(),
                option: option.to_string(),
                value: v.to_string(),
                expected: "integer",
            })?,
            None => default.ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            })?,
        };
        if minval.is_some_and(|lo| value < lo) || maxval.is_some_and(|hi| value > hi) {
            return Err(ConfigError::OutOfRange {
                section: section.to_string(),
                option: option.to_string(),
                value: value.to_string(),
                min: minval.map(|v| v as f64),
                max: maxval.map(|v| v as f64),
            });
        }
        Ok(value)
    }

    pub fn getboolean(&self, section: &str, option: &str, default: Option<bool>) -> Result<bool, ConfigError> {
        match self.raw(section, option)? {
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                other => Err(ConfigError::Parse {
                    section: section.to_string(),
                    option: option.to_string(),
                    value: other.to_string(),
                    expected: "boolean",
                }),
            },
            None => default.ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            }),
        }
    }

    pub fn getchoice(
        &self,
        section: &str,
        option: &str,
        choices: &[&str],
        default: Option<&str>,
    ) -> Result<String, ConfigError> {
        let value = self.get(section, option, default)?;
        if choices.contains(&value.as_str()) {
            Ok(value)
        } else {
            Err(ConfigError::BadChoice {
                section: section.to_string(),
                option: option.to_string(),
                value,
                choices: choices.iter().map(|s| s.to_string()).collect(),
            })
        }
    }
}
