//! Position estimation from multi-anchor RSSI.
//!
//! Implements:
//! - **Weighted Centroid**: anchors weighted by a monotone function of signal strength
//! - **Position Smoothing**: first-order low-pass filter against the previous estimate
//!
//! Smoothing state is owned per device and evicted explicitly once the
//! device has been silent for the absence timeout.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::config::{PositioningConfig, WeightingModel};
use crate::distance::{proximity_category, signal_weight};
use crate::registry::{Anchor, Asset, RoomId};
use crate::validation::Observation;

/// A 2D position in room coordinates (meters)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    /// Linear interpolation towards `other`
    pub fn lerp(&self, other: &Point, t: f64) -> Point {
        Point {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
        }
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorWeight {
    pub anchor_id: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEstimate {
    pub device_address: String,
    pub room_id: RoomId,
    pub x: f64,
    pub y: f64,
    /// Unsmoothed weighted centroid for this cycle
    pub raw: Point,
    pub anchors: Vec<AnchorWeight>,
    /// Strongest contributing reading; display only
    pub max_signal_strength: i32,
    pub proximity: String,
    pub timestamp: DateTime<Utc>,
    pub is_asset: bool,
    pub asset_name: Option<String>,
    pub asset_type: Option<String>,
}

impl PositionEstimate {
    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// Weighted centroid of `(anchor position, rssi)` readings.
///
/// Returns `None` when the total weight is zero.
pub fn weighted_centroid<I>(readings: I, model: &WeightingModel) -> Option<Point>
where
    I: IntoIterator<Item = (Point, i32)>,
{
    let mut total = 0.0;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;

    for (position, rssi) in readings {
        let weight = signal_weight(rssi, model);
        sum_x += position.x * weight;
        sum_y += position.y * weight;
        total += weight;
    }

    if total > 0.0 && total.is_finite() {
        Some(Point::new(sum_x / total, sum_y / total))
    } else {
        None
    }
}

#[derive(Debug, Clone)]
struct Reading {
    anchor_id: String,
    room_id: RoomId,
    position: Point,
    rssi: i32,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct DeviceState {
    readings: VecDeque<Reading>,
    /// Room, smoothed point and the reading time it was computed at
    smoothed: Option<(RoomId, Point, DateTime<Utc>)>,
    latest: Option<PositionEstimate>,
    last_seen: Option<DateTime<Utc>>,
    asset: Option<Asset>,
}

pub struct PositionEstimator {
    window: Duration,
    absence_timeout: Duration,
    alpha: f64,
    weighting: WeightingModel,
    devices: HashMap<String, DeviceState>,
}

impl PositionEstimator {
    /// Smoothing state older than `absence_timeout` is discarded on the next
    /// estimate, even if `evict_stale` has not run yet.
    pub fn new(config: &PositioningConfig, absence_timeout: Duration) -> Self {
        PositionEstimator {
            window: config.window(),
            absence_timeout,
            alpha: config.alpha(),
            weighting: config.weighting,
            devices: HashMap::new(),
        }
    }

    /// Add a validated reading to the device's trailing window.
    pub fn record(&mut self, observation: &Observation, anchor: &Anchor, asset: Option<&Asset>) {
        let state = self
            .devices
            .entry(observation.device_address.clone())
            .or_default();

        state.readings.push_back(Reading {
            anchor_id: anchor.id.clone(),
            room_id: anchor.room_id,
            position: Point::new(anchor.x, anchor.y),
            rssi: observation.signal_strength,
            timestamp: observation.timestamp,
        });
        state.last_seen = Some(match state.last_seen {
            Some(seen) => seen.max(observation.timestamp),
            None => observation.timestamp,
        });
        if asset.is_some() {
            state.asset = asset.cloned();
        }
    }

    /// Recompute the smoothed position of one device from its window.
    ///
    /// Only readings from the room of the strongest reading contribute, since
    /// anchor coordinates are room-relative.
    pub fn estimate(&mut self, device_address: &str) -> Option<PositionEstimate> {
        let window = self.window;
        let absence_timeout = self.absence_timeout;
        let alpha = self.alpha;
        let weighting = self.weighting;
        let state = self.devices.get_mut(device_address)?;

        let newest = state.readings.iter().map(|r| r.timestamp).max()?;
        if let Some(cutoff) = newest.checked_sub_signed(window) {
            state.readings.retain(|r| r.timestamp >= cutoff);
        }

        let strongest = state.readings.iter().max_by_key(|r| r.rssi)?;
        let room_id = strongest.room_id;

        let in_room: Vec<&Reading> = state
            .readings
            .iter()
            .filter(|r| r.room_id == room_id)
            .collect();

        let raw = match weighted_centroid(in_room.iter().map(|r| (r.position, r.rssi)), &weighting) {
            Some(point) => point,
            None => {
                debug!("NoContributingAnchor for {}", device_address);
                return None;
            }
        };

        let smoothed = match state.smoothed {
            Some((prev_room, prev, at)) if prev_room == room_id && newest - at <= absence_timeout => {
                prev.lerp(&raw, alpha)
            }
            Some(_) | None => raw,
        };
        state.smoothed = Some((room_id, smoothed, newest));

        let mut weights: BTreeMap<&str, f64> = BTreeMap::new();
        for reading in &in_room {
            *weights.entry(reading.anchor_id.as_str()).or_insert(0.0) += signal_weight(reading.rssi, &weighting);
        }
        let max_signal_strength = in_room.iter().map(|r| r.rssi).max().unwrap_or(i32::MIN);
        let timestamp = in_room.iter().map(|r| r.timestamp).max().unwrap_or(newest);

        let (measured_power, exponent) = match weighting {
            WeightingModel::PathLoss {
                measured_power_dbm,
                path_loss_exponent,
                ..
            } => (measured_power_dbm, path_loss_exponent),
            WeightingModel::Exponential { .. } => (-55.0, 2.5),
        };

        let estimate = PositionEstimate {
            device_address: device_address.to_string(),
            room_id,
            x: smoothed.x,
            y: smoothed.y,
            raw,
            anchors: weights
                .into_iter()
                .map(|(anchor_id, weight)| AnchorWeight {
                    anchor_id: anchor_id.to_string(),
                    weight,
                })
                .collect(),
            max_signal_strength,
            proximity: proximity_category(max_signal_strength, measured_power, exponent).to_string(),
            timestamp,
            is_asset: state.asset.is_some(),
            asset_name: state.asset.as_ref().map(|a| a.name.clone()),
            asset_type: state.asset.as_ref().and_then(|a| a.kind.clone()),
        };

        debug!(
            "Position {}: room {} ({:.2}, {:.2}) from {} anchors",
            device_address,
            room_id,
            estimate.x,
            estimate.y,
            estimate.anchors.len()
        );
        state.latest = Some(estimate.clone());
        Some(estimate)
    }

    /// Drop all state of devices not seen for longer than `timeout`.
    /// Returns the evicted device addresses.
    pub fn evict_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let mut evicted: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, state)| match state.last_seen {
                Some(seen) => now - seen > timeout,
                None => true,
            })
            .map(|(address, _)| address.clone())
            .collect();
        evicted.sort();

        for address in &evicted {
            self.devices.remove(address);
            debug!("Evicted position state for {}", address);
        }
        evicted
    }

    pub fn latest(&self, device_address: &str) -> Option<&PositionEstimate> {
        self.devices.get(device_address)?.latest.as_ref()
    }

    /// Latest estimates of every tracked device located in `room_id`
    pub fn current_positions(&self, room_id: RoomId) -> Vec<PositionEstimate> {
        let mut positions: Vec<PositionEstimate> = self
            .devices
            .values()
            .filter_map(|state| state.latest.as_ref())
            .filter(|estimate| estimate.room_id == room_id)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.device_address.cmp(&b.device_address));
        positions
    }
}
