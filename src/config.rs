use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configured durations are capped at a century
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 3600;

fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub positioning: PositioningConfig,
    #[serde(default)]
    pub trail: TrailConfig,
    #[serde(default)]
    pub heatmap: HeatmapConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Seconds without an observation before an open interval is closed
    pub absence_timeout_secs: u64,
    /// Close the asset's interval in other rooms when it shows up in a new one
    pub exclusive_rooms: bool,
    /// Closed intervals kept in memory for presence queries
    pub history_limit: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        PresenceConfig {
            absence_timeout_secs: 60,
            exclusive_rooms: false,
            history_limit: 1000,
        }
    }
}

impl PresenceConfig {
    pub fn absence_timeout(&self) -> Duration {
        seconds(self.absence_timeout_secs)
    }
}

/// RSSI to weight conversion used by the weighted centroid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum WeightingModel {
    /// weight = 1 / max(d, min_distance_m), d from the log-distance path loss model
    PathLoss {
        /// Reference signal strength at 1 meter (dBm)
        measured_power_dbm: f64,
        /// 2.0 = free space, 2.5-4.0 = indoors with obstacles
        path_loss_exponent: f64,
        min_distance_m: f64,
    },
    /// weight = 10 ^ ((rssi + offset_dbm) / divisor_db)
    Exponential { offset_dbm: f64, divisor_db: f64 },
}

impl Default for WeightingModel {
    fn default() -> Self {
        WeightingModel::PathLoss {
            measured_power_dbm: -55.0,
            path_loss_exponent: 2.5,
            min_distance_m: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositioningConfig {
    /// Trailing window of observations feeding one estimate
    pub window_secs: u64,
    /// Low-pass factor in (0, 1]; 1.0 disables smoothing
    pub smoothing_factor: f64,
    pub weighting: WeightingModel,
}

impl Default for PositioningConfig {
    fn default() -> Self {
        PositioningConfig {
            window_secs: 15,
            smoothing_factor: 0.25,
            weighting: WeightingModel::default(),
        }
    }
}

impl PositioningConfig {
    pub fn window(&self) -> Duration {
        seconds(self.window_secs)
    }

    /// Smoothing factor forced into (0, 1]
    pub fn alpha(&self) -> f64 {
        if self.smoothing_factor.is_finite() && self.smoothing_factor > 0.0 {
            self.smoothing_factor.min(1.0)
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    pub capacity: usize,
    /// Per-axis movement required before a new breadcrumb is recorded
    pub min_displacement_m: f64,
}

impl Default for TrailConfig {
    fn default() -> Self {
        TrailConfig {
            capacity: 10,
            min_displacement_m: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    pub cell_size_m: f64,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        HeatmapConfig { cell_size_m: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_ms: u64,
    /// Anchors silent for longer than this are reported offline
    pub anchor_offline_after_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            interval_ms: 5000,
            anchor_offline_after_secs: 120,
        }
    }
}

impl ReaperConfig {
    pub fn anchor_offline_after(&self) -> Duration {
        seconds(self.anchor_offline_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: String,
    pub site: String,
    /// Capacity of the event channel between the pipeline and the log writer
    pub event_buffer: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database: "./roomscan.db".to_string(),
            site: "site.json".to_string(),
            event_buffer: 1024,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config = serde_json::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
