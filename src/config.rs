//! Emulator configuration
//!
//! Loaded from TOML. Every field has a default, so a file only needs the
//! capture path and its `[[sockets]]` entries:
//!
//! ```toml
//! dump_file = "captures/plant.pcapng"
//! one_shot = false
//! simultaneous = true
//! finish_delay = "3s"
//!
//! [[sockets]]
//! emulate = "127.0.0.1:1502"
//! dump = "192.168.1.10:502"
//! protocol = "tcp"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::WireMode;
use crate::DEFAULT_FINISH_DELAY;

/// Top-level emulator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Capture file replayed by every socket.
    pub dump_file: PathBuf,

    /// Stop each server after one pass through its history.
    pub one_shot: bool,

    /// Start every server together once any of them gets a client.
    pub simultaneous: bool,

    /// Pause after the last event before stopping or looping.
    #[serde(with = "humantime_serde")]
    pub finish_delay: Duration,

    /// Default log level, overridden by `RUST_LOG`.
    pub log_level: String,

    /// One emulated server per entry.
    pub sockets: Vec<SocketConfig>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            dump_file: PathBuf::from("dump.pcapng"),
            one_shot: false,
            simultaneous: false,
            finish_delay: DEFAULT_FINISH_DELAY,
            log_level: "info".to_string(),
            sockets: Vec::new(),
        }
    }
}

/// One emulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Address the emulator listens on.
    pub emulate: SocketAddr,

    /// Device address as recorded in the capture.
    pub dump: SocketAddr,

    /// Wire variant spoken on both sockets.
    #[serde(default = "default_protocol")]
    pub protocol: WireMode,
}

fn default_protocol() -> WireMode {
    WireMode::Tcp
}

impl EmulatorConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> ModbusResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    pub fn to_toml_string(&self) -> ModbusResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ModbusError::configuration(format!("TOML serialize error: {}", e)))
    }

    /// Starting point written by `gen-config`.
    pub fn template() -> Self {
        Self {
            sockets: vec![
                SocketConfig {
                    emulate: SocketAddr::from(([127, 0, 0, 1], 1502)),
                    dump: SocketAddr::from(([127, 0, 0, 1], 502)),
                    protocol: WireMode::Tcp,
                },
                SocketConfig {
                    emulate: SocketAddr::from(([127, 0, 0, 1], 1503)),
                    dump: SocketAddr::from(([127, 0, 0, 1], 503)),
                    protocol: WireMode::RtuOverTcp,
                },
            ],
            ..Self::default()
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.sockets.is_empty() {
            return Err(ModbusError::configuration("at least one [[sockets]] entry is required"));
        }

        let mut seen = HashSet::new();
        for socket in &self.sockets {
            if !seen.insert(socket.emulate) {
                return Err(ModbusError::configuration(format!(
                    "emulate socket {} is used more than once", socket.emulate
                )));
            }
        }

        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(ModbusError::configuration(format!(
                "unknown log level '{}'", self.log_level
            )));
        }
        Ok(())
    }
}
