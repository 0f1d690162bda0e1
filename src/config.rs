// Client and dispatcher settings. Every field has a default, so a config file
// only needs the values it changes.
use crate::error::ConfigError;
use crate::grid::{CellId, GridConfig};
use crate::link::LinkOptions;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5050";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VehicleConfig {
    pub name: String,
    pub start_cell: CellId,
    /// Overrides the fleet-wide server address for this vehicle.
    #[serde(default)]
    pub server: Option<String>,
}

impl VehicleConfig {
    pub fn new(name: impl Into<String>, start_cell: CellId) -> Self {
        Self {
            name: name.into(),
            start_cell,
            server: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub server: String,
    pub vehicles: Vec<VehicleConfig>,
    pub grid: GridConfig,
    /// Fixed simulation step, in simulated seconds.
    pub tick_interval: f32,
    /// Wait before re-polling an empty command queue.
    pub idle_interval: f32,
    /// Simulated seconds per wall-clock second.
    pub time_scale: f32,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER_ADDR.to_string(),
            vehicles: vec![
                VehicleConfig::new("agv_1", 2),
                VehicleConfig::new("agv_2", 42),
                VehicleConfig::new("agv_3", 82),
            ],
            grid: GridConfig::default(),
            tick_interval: 0.02,
            idle_interval: 0.1,
            time_scale: 1.0,
            connect_timeout_ms: 3000,
            write_timeout_ms: 5000,
        }
    }
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !positive(self.tick_interval) {
            return Err(ConfigError::Invalid(format!(
                "tick_interval must be positive, got {}",
                self.tick_interval
            )));
        }
        if !positive(self.time_scale) {
            return Err(ConfigError::Invalid("time_scale must be positive".into()));
        }
        if self.idle_interval < 0.0 {
            return Err(ConfigError::Invalid("idle_interval cannot be negative".into()));
        }
        validate_grid(&self.grid)?;

        let mut seen = HashSet::new();
        for v in &self.vehicles {
            // the name travels inside the space separated login line
            if v.name.is_empty() || v.name.chars().any(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!("bad vehicle name {:?}", v.name)));
            }
            if !seen.insert(v.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate vehicle {}", v.name)));
            }
        }
        Ok(())
    }

    pub fn server_for<'a>(&'a self, vehicle: &'a VehicleConfig) -> &'a str {
        vehicle.server.as_deref().unwrap_or(&self.server)
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            connect_timeout: millis(self.connect_timeout_ms),
            write_timeout: millis(self.write_timeout_ms),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub grid: GridConfig,
    /// Speed used for assignments composed in the dispatcher window.
    pub default_speed: f32,
    /// Where each vehicle is parked when it logs in. Vehicles not listed stay at
    /// an unknown cell until their first completion report.
    pub start_cells: BTreeMap<String, CellId>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_SERVER_ADDR.to_string(),
            grid: GridConfig::default(),
            default_speed: 12.0,
            start_cells: ClientConfig::default()
                .vehicles
                .into_iter()
                .map(|v| (v.name, v.start_cell))
                .collect(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        validate_grid(&config.grid)?;
        if !positive(config.default_speed) {
            return Err(ConfigError::Invalid("default_speed must be positive".into()));
        }
        Ok(config)
    }
}

fn validate_grid(grid: &GridConfig) -> Result<(), ConfigError> {
    if grid.lane_count <= 0 {
        return Err(ConfigError::Invalid("grid.lane_count must be positive".into()));
    }
    if grid.buffer_row < 0 || grid.holder_row <= grid.buffer_row {
        return Err(ConfigError::Invalid(
            "grid rows must satisfy 0 <= buffer_row < holder_row".into(),
        ));
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn positive(x: f32) -> bool {
    x.is_finite() && x > 0.0
}

// zero disables the timeout
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = write_config(
            r#"{ "server": "10.0.0.5:9000",
                 "vehicles": [{ "name": "agv_7", "start_cell": 12 },
                              { "name": "agv_8", "start_cell": 13, "server": "10.0.0.6:9000" }],
                 "grid": { "lane_count": 20 } }"#,
        );
        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.vehicles.len(), 2);
        assert_eq!(config.grid.lane_count, 20);
        assert_eq!(config.grid.holder_row, 12);
        assert_eq!(config.idle_interval, 0.1);
        assert_eq!(config.server_for(&config.vehicles[0]), "10.0.0.5:9000");
        assert_eq!(config.server_for(&config.vehicles[1]), "10.0.0.6:9000");
    }

    #[test]
    fn rejects_duplicate_and_spaced_names() {
        let dup = write_config(
            r#"{ "vehicles": [{ "name": "a", "start_cell": 1 }, { "name": "a", "start_cell": 2 }] }"#,
        );
        assert!(matches!(ClientConfig::load(dup.path()), Err(ConfigError::Invalid(_))));

        let spaced = write_config(r#"{ "vehicles": [{ "name": "agv 1", "start_cell": 1 }] }"#);
        assert!(matches!(ClientConfig::load(spaced.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn reports_unreadable_and_malformed_files() {
        assert!(matches!(
            ClientConfig::load("/definitely/not/here.json"),
            Err(ConfigError::Read { .. })
        ));
        let broken = write_config("{ \"server\": ");
        assert!(matches!(ServerConfig::load(broken.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn shipped_examples_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
        let client = ClientConfig::load(dir.join("client.example.json")).unwrap();
        assert_eq!(client.vehicles[0], VehicleConfig::new("agv_1", 2));
        let server = ServerConfig::load(dir.join("server.example.json")).unwrap();
        assert_eq!(server.bind, "0.0.0.0:5050");
        for v in &client.vehicles {
            assert_eq!(server.start_cells.get(&v.name), Some(&v.start_cell));
        }
    }

    #[test]
    fn server_start_cells_default_to_client_fleet() {
        let server = ServerConfig::default();
        assert_eq!(server.start_cells.get("agv_2"), Some(&42));

        let file = write_config(r#"{ "start_cells": { "agv_9": 7 } }"#);
        let server = ServerConfig::load(file.path()).unwrap();
        assert_eq!(server.start_cells.len(), 1);
        assert_eq!(server.start_cells.get("agv_9"), Some(&7));
    }

    #[test]
    fn zero_timeouts_disable() {
        let config = ClientConfig {
            connect_timeout_ms: 0,
            ..ClientConfig::default()
        };
        assert!(config.link_options().connect_timeout.is_none());
        assert_eq!(config.link_options().write_timeout, Some(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }
}
