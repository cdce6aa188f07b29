//! Breadcrumb trails and occupancy heatmaps.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::config::TrailConfig;
use crate::position::Point;
use crate::registry::{Room, RoomId};

/// Bounded per-device history of smoothed positions, oldest first
pub struct TrailAggregator {
    capacity: usize,
    min_displacement: f64,
    trails: HashMap<String, VecDeque<Point>>,
}

impl TrailAggregator {
    pub fn new(config: &TrailConfig) -> Self {
        TrailAggregator {
            capacity: config.capacity.max(1),
            min_displacement: config.min_displacement_m.max(0.0),
            trails: HashMap::new(),
        }
    }

    /// Append `point` unless it is within the displacement threshold of the
    /// last breadcrumb on both axes. Returns whether a point was added.
    pub fn record(&mut self, device_address: &str, point: Point) -> bool {
        let trail = self.trails.entry(device_address.to_string()).or_default();

        if let Some(last) = trail.back() {
            let moved = (last.x - point.x).abs() > self.min_displacement
                || (last.y - point.y).abs() > self.min_displacement;
            if !moved {
                return false;
            }
        }

        trail.push_back(point);
        while trail.len() > self.capacity {
            trail.pop_front();
        }
        true
    }

    pub fn trail(&self, device_address: &str) -> Vec<Point> {
        self.trails
            .get(device_address)
            .map(|trail| trail.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn evict(&mut self, device_address: &str) {
        if self.trails.remove(device_address).is_some() {
            debug!("Dropped trail for {}", device_address);
        }
    }
}

/// Instantaneous device density over a room grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heatmap {
    pub room_id: RoomId,
    pub cell_size: f64,
    pub cols: usize,
    pub rows: usize,
    /// Visit counts, indexed `[row][col]`
    pub counts: Vec<Vec<u32>>,
    /// Counts divided by the maximum count, in [0, 1]
    pub intensity: Vec<Vec<f64>>,
}

impl Heatmap {
    /// Bin `points` into a grid covering `room`.
    ///
    /// Points outside the room are clamped to the border cells so every
    /// positioned device is counted exactly once.
    pub fn build(room: &Room, cell_size: f64, points: &[Point]) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            1.0
        };
        let cols = grid_len(room.width, cell_size);
        let rows = grid_len(room.height, cell_size);

        let mut counts = vec![vec![0u32; cols]; rows];
        for point in points {
            let col = cell_index(point.x, cell_size, cols);
            let row = cell_index(point.y, cell_size, rows);
            counts[row][col] += 1;
        }

        let max = counts.iter().flatten().copied().max().unwrap_or(0);
        let intensity = counts
            .iter()
            .map(|row| {
                row.iter()
                    .map(|&count| if max > 0 { count as f64 / max as f64 } else { 0.0 })
                    .collect()
            })
            .collect();

        Heatmap {
            room_id: room.id,
            cell_size,
            cols,
            rows,
            counts,
            intensity,
        }
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().flatten().sum()
    }

    /// Text rendering, one character per cell
    pub fn render_ascii(&self) -> String {
        const SHADES: [char; 5] = ['.', ':', '+', '#', '@'];
        let mut out = String::with_capacity((self.cols + 1) * self.rows);

        for row in &self.intensity {
            for &value in row {
                let shade = if value <= 0.0 {
                    SHADES[0]
                } else {
                    let idx = (value * (SHADES.len() - 1) as f64).ceil() as usize;
                    SHADES[idx.clamp(1, SHADES.len() - 1)]
                };
                out.push(shade);
            }
            out.push('\n');
        }
        out
    }
}

fn grid_len(extent: f64, cell_size: f64) -> usize {
    if extent.is_finite() && extent > 0.0 {
        ((extent / cell_size).ceil() as usize).max(1)
    } else {
        1
    }
}

fn cell_index(coordinate: f64, cell_size: f64, len: usize) -> usize {
    let idx = (coordinate / cell_size).floor();
    if idx.is_nan() || idx < 0.0 {
        0
    } else {
        (idx as usize).min(len - 1)
    }
}
