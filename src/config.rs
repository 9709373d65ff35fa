//! Configuration file handling.
//!
//! The configuration is a TOML document. `[core]`, `[logging]` and `[ccsds]` hold framework
//! settings; `[cfs]` is the base target section and every `[cfs_<name>]` section describes an
//! additional target whose missing fields fall back to `[cfs]`.

use std::net::{SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ccsds::CcsdsVersion;
use crate::error::ConfigError;
use crate::types::Endianness;

/// Section name of the base target, also the name of the fallback local target.
pub const BASE_TARGET: &str = "cfs";

const TARGET_PREFIX: &str = "cfs_";

const REQUIRED_TARGET_FIELDS: &[&str] = &["ccsds_data_dir", "cfs_run_dir", "cfs_exe"];

/// Expand a leading `~` and `$VAR`/`${VAR}` references. Unknown variables are left as-is.
pub fn expand_path(path: &str) -> PathBuf {
    static VAR: OnceLock<Regex> = OnceLock::new();
    let re = VAR.get_or_init(|| {
        Regex::new(r"\$(?:\{(\w+)\}|(\w+))").expect("environment variable regex is valid")
    });

    let expanded = re.replace_all(path, |caps: &regex::Captures<'_>| {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    });

    match expanded.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(format!("{}{}", home.to_string_lossy(), rest)),
            None => PathBuf::from(expanded.as_ref()),
        },
        _ => PathBuf::from(expanded.as_ref()),
    }
}

fn default_timeout() -> f64 {
    4.0
}

fn default_poll_period() -> f64 {
    0.1
}

fn default_delay_between_scripts() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_timeout")]
    pub ctf_verification_timeout: f64,
    #[serde(default = "default_poll_period")]
    pub ctf_verification_poll_period: f64,
    #[serde(default)]
    pub end_test_on_fail: bool,
    #[serde(default = "default_delay_between_scripts")]
    pub delay_between_scripts: f64,
    #[serde(default)]
    pub ignored_instructions: Vec<String>,
    #[serde(default = "default_true")]
    pub reset_plugins_between_scripts: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ctf_verification_timeout: default_timeout(),
            ctf_verification_poll_period: default_poll_period(),
            end_test_on_fail: false,
            delay_between_scripts: default_delay_between_scripts(),
            ignored_instructions: Vec::new(),
            reset_plugins_between_scripts: true,
        }
    }
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("./results")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_results_dir")]
    pub results_output_dir: PathBuf,
    #[serde(default)]
    pub temp_script_output_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_results: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            results_output_dir: default_results_dir(),
            temp_script_output_dir: None,
            log_level: default_log_level(),
            json_results: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CcsdsConfig {
    /// Payload definitions include the CCSDS header, so telemetry decoding starts at byte 0.
    #[serde(default)]
    pub ccsds_header_info_included: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Local,
    Ssh,
}

fn default_build_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_build_cmd() -> String {
    "make".to_string()
}

fn default_output_file() -> String {
    "cfs_stdout.txt".to_string()
}

fn default_target_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_cmd_port() -> u16 {
    1234
}

fn default_tlm_port() -> u16 {
    1235
}

fn default_evs_log() -> String {
    "evs_msgs.log".to_string()
}

fn default_tlm_log() -> String {
    "tlm_msgs.log".to_string()
}

fn default_ccsds_ver() -> u8 {
    1
}

fn default_long_event_mid() -> String {
    "CFE_EVS_LONG_EVENT_MSG_MID".to_string()
}

fn default_short_event_mid() -> String {
    "CFE_EVS_SHORT_EVENT_MSG_MID".to_string()
}

fn default_evs_clear_after() -> f64 {
    5.0
}

/// Settings for one flight-software target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub cfs_protocol: Protocol,
    /// `user@host` for SSH targets.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub build_cfs: bool,
    pub ccsds_data_dir: PathBuf,
    #[serde(default)]
    pub ccsds_target: String,
    #[serde(default)]
    pub log_ccsds_imports: bool,
    #[serde(default = "default_build_dir")]
    pub cfs_build_dir: PathBuf,
    #[serde(default = "default_build_cmd")]
    pub cfs_build_cmd: String,
    pub cfs_run_dir: PathBuf,
    pub cfs_exe: String,
    #[serde(default)]
    pub cfs_run_args: String,
    #[serde(default)]
    pub cfs_port_arg: bool,
    #[serde(default = "default_output_file")]
    pub cfs_output_file: String,
    #[serde(default = "default_true")]
    pub remove_continuous_on_fail: bool,
    #[serde(default = "default_target_ip")]
    pub cfs_target_ip: String,
    #[serde(default)]
    pub ctf_ip: Option<String>,
    #[serde(default = "default_cmd_port")]
    pub cmd_udp_port: u16,
    #[serde(default = "default_tlm_port")]
    pub tlm_udp_port: u16,
    #[serde(default = "default_evs_log")]
    pub evs_log_file: String,
    #[serde(default = "default_tlm_log")]
    pub tlm_log_file: String,
    #[serde(default = "default_ccsds_ver")]
    pub ccsds_ver: u8,
    #[serde(default = "default_long_event_mid")]
    pub evs_long_event_mid_name: String,
    #[serde(default = "default_short_event_mid")]
    pub evs_short_event_mid_name: String,
    #[serde(default = "default_evs_clear_after")]
    pub evs_messages_clear_after_time: f64,
    #[serde(default)]
    pub endianess_of_target: Endianness,
    #[serde(default)]
    pub command_crc: bool,
    #[serde(default)]
    pub telemetry_debug: bool,
    /// Copied from `[ccsds]` at resolution time.
    #[serde(skip)]
    pub ccsds_header_info_included: bool,
}

impl TargetConfig {
    pub fn version(&self) -> Result<CcsdsVersion, ConfigError> {
        match self.ccsds_ver {
            1 => Ok(CcsdsVersion::V1),
            2 => Ok(CcsdsVersion::V2),
            other => Err(ConfigError::Invalid {
                section: self.name.clone(),
                field: "ccsds_ver".to_string(),
                reason: format!("{} is not a CCSDS version (1 or 2)", other),
            }),
        }
    }

    pub fn command_address(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.cfs_target_ip, self.cmd_udp_port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                section: self.name.clone(),
                field: "cfs_target_ip".to_string(),
                reason: e.to_string(),
            })
    }

    /// Address telemetry is received on. Without `ctf_ip`, the local address facing the
    /// target is probed with a connected UDP socket.
    pub fn telemetry_address(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self.local_ip();
        format!("{}:{}", ip, self.tlm_udp_port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                section: self.name.clone(),
                field: "ctf_ip".to_string(),
                reason: e.to_string(),
            })
    }

    pub fn local_ip(&self) -> String {
        if let Some(ip) = &self.ctf_ip {
            return ip.clone();
        }
        let probe = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
            socket.connect((self.cfs_target_ip.as_str(), 80))?;
            socket.local_addr()
        });
        match probe {
            Ok(addr) => addr.ip().to_string(),
            Err(e) => {
                warn!(
                    "Unable to determine local address facing {}: {}. Using 127.0.0.1",
                    self.cfs_target_ip, e
                );
                "127.0.0.1".to_string()
            }
        }
    }

    /// Command line used to launch the executable, relative to `cfs_run_dir`.
    pub fn run_command(&self, extra_args: &str) -> String {
        let args = if extra_args.is_empty() {
            self.cfs_run_args.as_str()
        } else {
            extra_args
        };
        let mut cmd = format!("./{} {}", self.cfs_exe, args).trim().to_string();
        if self.cfs_port_arg {
            cmd.push_str(&format!(" -p {}", self.cmd_udp_port));
        }
        cmd
    }

    fn expand_paths(&mut self) {
        self.ccsds_data_dir = expand_path(&self.ccsds_data_dir.to_string_lossy());
        self.cfs_build_dir = expand_path(&self.cfs_build_dir.to_string_lossy());
        self.cfs_run_dir = expand_path(&self.cfs_run_dir.to_string_lossy());
    }
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub core: CoreConfig,
    pub logging: LoggingConfig,
    pub ccsds: CcsdsConfig,
    sections: toml::Table,
}

fn section<T: Default + serde::de::DeserializeOwned>(
    table: &toml::Table,
    name: &str,
) -> Result<T, ConfigError> {
    match table.get(name) {
        Some(value) => Ok(value.clone().try_into()?),
        None => Ok(T::default()),
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        info!("Loaded configuration {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let sections: toml::Table = content.parse()?;
        let mut config = Self {
            core: section(&sections, "core")?,
            logging: section(&sections, "logging")?,
            ccsds: section(&sections, "ccsds")?,
            sections,
        };
        config.logging.results_output_dir =
            expand_path(&config.logging.results_output_dir.to_string_lossy());
        if let Some(dir) = &config.logging.temp_script_output_dir {
            config.logging.temp_script_output_dir = Some(expand_path(&dir.to_string_lossy()));
        }
        Ok(config)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.get(name).is_some_and(toml::Value::is_table)
    }

    /// Names of the `[cfs_*]` target sections, sorted.
    pub fn target_sections(&self) -> Vec<String> {
        self.sections
            .iter()
            .filter(|(name, value)| name.starts_with(TARGET_PREFIX) && value.is_table())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Raw string value of a target field, with `[cfs]` fallback.
    pub fn target_field(&self, name: &str, field: &str) -> Option<toml::Value> {
        let lookup = |section: &str| {
            self.sections
                .get(section)
                .and_then(toml::Value::as_table)
                .and_then(|table| table.get(field))
                .cloned()
        };
        lookup(name).or_else(|| {
            if name == BASE_TARGET {
                None
            } else {
                lookup(BASE_TARGET)
            }
        })
    }

    /// Resolve the settings of target `name`. Fields absent from `[name]` come from `[cfs]`.
    pub fn target(&self, name: &str) -> Result<TargetConfig, ConfigError> {
        if name != BASE_TARGET && !self.has_section(name) {
            return Err(ConfigError::MissingSection(name.to_string()));
        }

        let mut merged = self
            .sections
            .get(BASE_TARGET)
            .and_then(toml::Value::as_table)
            .cloned()
            .unwrap_or_default();
        if name != BASE_TARGET {
            if let Some(overlay) = self.sections.get(name).and_then(toml::Value::as_table) {
                for (key, value) in overlay {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }

        for field in REQUIRED_TARGET_FIELDS {
            if !merged.contains_key(*field) {
                return Err(ConfigError::MissingField {
                    section: name.to_string(),
                    field: (*field).to_string(),
                });
            }
        }
        for field in ["cfs_protocol", "endianess_of_target"] {
            if let Some(toml::Value::String(text)) = merged.get_mut(field) {
                *text = text.to_ascii_lowercase();
            }
        }

        let mut target: TargetConfig = toml::Value::Table(merged).try_into()?;
        target.name = name.to_string();
        target.ccsds_header_info_included = self.ccsds.ccsds_header_info_included;
        target.expand_paths();
        target.version()?;
        if target.cfs_protocol == Protocol::Ssh && target.destination.is_none() {
            return Err(ConfigError::MissingField {
                section: name.to_string(),
                field: "destination".to_string(),
            });
        }
        debug!("Target {} resolved to {:?}", name, target);
        Ok(target)
    }
}
