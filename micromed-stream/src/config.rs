//! Settings file and command line merging.
//!
//! Settings live in `config.json` in the user's config directory
//! (`~/.config/micromed-stream/` on Linux) unless `--config` names another
//! file. Every key is optional; command line flags win over the file.
//!
//! ```json
//! {
//!   "address": "127.0.0.1",
//!   "port": 5123,
//!   "packetMs": 256,
//!   "speed": 1.0,
//!   "channelCapacity": 64,
//!   "epoch": { "epochDuration": 5.0, "overlap": 2.5, "units": "physical" }
//! }
//! ```

use directories::ProjectDirs;
use log::debug;
use micromed_core::EpochConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::emulator::EmulatorConfig;
use crate::error::StreamError;
use crate::{EpochArgs, NetArgs};

pub const DEFAULT_PORT: u16 = 5123;
const CONFIG_FILE: &str = "config.json";

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "micromed", "micromed-stream")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub address: IpAddr,
    pub port: u16,
    /// Samples per data frame, as a duration
    pub packet_ms: u64,
    pub speed: f64,
    /// Frames queued between the receiver and the epoch pipeline
    pub channel_capacity: usize,
    pub epoch: EpochConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            packet_ms: 256,
            speed: 1.0,
            channel_capacity: 64,
            epoch: EpochConfig::default(),
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        get_project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load `path`, or the default file when it exists, or the defaults.
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Config, StreamError> {
        let path = match path {
            Some(path) => path.to_owned(),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => path,
                None => {
                    debug!("No configuration file, using defaults");
                    return Ok(Config::default());
                }
            },
        };
        let text = std::fs::read_to_string(&path).map_err(|e| StreamError::ConfigFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_json(&text).map_err(|e| StreamError::ConfigFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Config, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn apply_net(&mut self, args: &NetArgs) {
        if let Some(address) = args.address {
            self.address = address;
        }
        if let Some(port) = args.port {
            self.port = port;
        }
    }

    pub fn apply_epoch(&mut self, args: &EpochArgs) {
        if let Some(duration) = args.epoch_duration {
            self.epoch.epoch_duration = duration;
        }
        if let Some(overlap) = args.overlap {
            self.epoch.overlap = overlap;
        }
        if !args.picks.is_empty() {
            self.epoch.picks = Some(args.picks.clone());
        }
        if let Some(units) = args.units {
            self.epoch.units = units.into();
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn emulator(&self, throttle: bool) -> EmulatorConfig {
        EmulatorConfig {
            packet: Duration::from_millis(self.packet_ms),
            speed: self.speed,
            throttle,
        }
    }
}
