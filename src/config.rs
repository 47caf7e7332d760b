//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SIM800L_SERIAL_PATH`, `SIM800L_PIN`
//! 2. **Config file** — path passed to [`Config::load`], or `sim800l.toml` in
//!    the current directory
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [serial]
//! path = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [modem]
//! pin = "1234"
//! custom_cnmi = "2,1,2,1,0"
//! delivery_report = true
//! auto_delete_from_sim = true
//! smsc = "+12065550000"
//!
//! [supervisor]
//! brownout_interval_secs = 20
//! brownout_threshold = 3
//! network_interval_secs = 60
//! network_retry_threshold = 3
//! max_resets = 5
//! ```

use std::path::Path;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Serial port settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Device path (default `/dev/ttyUSB0`).
    #[serde(default = "default_path")]
    pub path: String,
    /// Baud rate, 8-N-1 (default 115200).
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Modem behavior settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModemConfig {
    /// SIM PIN, used only when `AT+CPIN?` reports `SIM PIN`.
    pub pin: Option<String>,
    /// `AT+CNMI` configuration string (default `"2,1,2,1,0"`).
    #[serde(default = "default_cnmi")]
    pub custom_cnmi: String,
    /// Request delivery (status) reports on send (default true).
    #[serde(default = "default_true")]
    pub delivery_report: bool,
    /// Policy flag for downstream SIM auto-deletion (default true). The
    /// actual `AT+CMGD` call is not issued by this crate — see DESIGN.md.
    #[serde(default = "default_true")]
    pub auto_delete_from_sim: bool,
    /// SMSC override passed to the PDU codec.
    pub smsc: Option<String>,
}

/// Supervisor timing and thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Brownout probe period in seconds (default 20).
    #[serde(default = "default_brownout_interval")]
    pub brownout_interval_secs: u64,
    /// Consecutive brownout failures before a reset is triggered (default 3).
    #[serde(default = "default_brownout_threshold")]
    pub brownout_threshold: u32,
    /// Network registration poll period in seconds (default 60).
    #[serde(default = "default_network_interval")]
    pub network_interval_secs: u64,
    /// Consecutive non-registered readings before a reset is triggered (default 3).
    #[serde(default = "default_network_retry_threshold")]
    pub network_retry_threshold: u32,
    /// Resets beyond this count are fatal (default 5).
    #[serde(default = "default_max_resets")]
    pub max_resets: u32,
}

fn default_path() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud() -> u32 {
    115_200
}
fn default_cnmi() -> String {
    "2,1,2,1,0".to_string()
}
fn default_true() -> bool {
    true
}
fn default_brownout_interval() -> u64 {
    20
}
fn default_brownout_threshold() -> u32 {
    3
}
fn default_network_interval() -> u64 {
    60
}
fn default_network_retry_threshold() -> u32 {
    3
}
fn default_max_resets() -> u32 {
    5
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            baud: default_baud(),
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            pin: None,
            custom_cnmi: default_cnmi(),
            delivery_report: default_true(),
            auto_delete_from_sim: default_true(),
            smsc: None,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            brownout_interval_secs: default_brownout_interval(),
            brownout_threshold: default_brownout_threshold(),
            network_interval_secs: default_network_interval(),
            network_retry_threshold: default_network_retry_threshold(),
            max_resets: default_max_resets(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            modem: ModemConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `sim800l.toml` in the current directory, falling back to
    /// compiled defaults.
    #[must_use]
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("sim800l.toml").exists() {
            let content =
                std::fs::read_to_string("sim800l.toml").expect("Failed to read sim800l.toml");
            toml::from_str(&content).expect("Failed to parse sim800l.toml")
        } else {
            Config::default()
        };

        if let Ok(path) = std::env::var("SIM800L_SERIAL_PATH") {
            config.serial.path = path;
        }
        if let Ok(pin) = std::env::var("SIM800L_PIN") {
            config.modem.pin = Some(pin);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.serial.path, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud, 115_200);
        assert_eq!(config.modem.custom_cnmi, "2,1,2,1,0");
        assert!(config.modem.delivery_report);
        assert!(config.modem.auto_delete_from_sim);
        assert_eq!(config.supervisor.max_resets, 5);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            [modem]
            pin = "1234"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.modem.pin.as_deref(), Some("1234"));
        assert_eq!(config.serial.path, "/dev/ttyUSB0");
    }
}
