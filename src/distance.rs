/// Signal strength to distance and weight conversion
///
/// Uses the Log-Distance Path Loss Model:
/// distance = 10 ^ ((measured_power - rssi) / (10 * n))
///
/// Where:
/// - measured_power: Reference signal strength at 1 meter (dBm)
/// - rssi: Measured signal strength (dBm)
/// - n: Path loss exponent (environment dependent)
use crate::config::WeightingModel;

/// Exponents beyond this are clamped so weights stay finite when summed.
const MAX_WEIGHT_EXPONENT: f64 = 100.0;

/// Path loss exponent used when the configured one is not positive
const TYPICAL_INDOOR_EXPONENT: f64 = 3.0;

/// Estimate distance in meters from RSSI
///
/// No range check is done on `rssi_dbm`: implausibly strong readings give a
/// tiny distance and are floored by the caller.
pub fn estimate_distance(rssi_dbm: i32, measured_power_dbm: f64, path_loss_exponent: f64) -> f64 {
    let n = if path_loss_exponent > 0.0 {
        path_loss_exponent
    } else {
        TYPICAL_INDOOR_EXPONENT
    };
    let exponent = (measured_power_dbm - rssi_dbm as f64) / (10.0 * n);
    10.0_f64.powf(exponent.clamp(-MAX_WEIGHT_EXPONENT, MAX_WEIGHT_EXPONENT))
}

/// Convert one reading into a non-negative centroid weight.
///
/// Monotone in `rssi_dbm`: a stronger signal never yields a smaller weight.
pub fn signal_weight(rssi_dbm: i32, model: &WeightingModel) -> f64 {
    let weight = match *model {
        WeightingModel::PathLoss {
            measured_power_dbm,
            path_loss_exponent,
            min_distance_m,
        } => {
            let floor = if min_distance_m > 0.0 { min_distance_m } else { 0.1 };
            let d = estimate_distance(rssi_dbm, measured_power_dbm, path_loss_exponent);
            1.0 / d.max(floor)
        }
        WeightingModel::Exponential {
            offset_dbm,
            divisor_db,
        } => {
            let divisor = if divisor_db > 0.0 { divisor_db } else { 20.0 };
            let exponent = (rssi_dbm as f64 + offset_dbm) / divisor;
            10.0_f64.powf(exponent.clamp(-MAX_WEIGHT_EXPONENT, MAX_WEIGHT_EXPONENT))
        }
    };

    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

/// Get a human-readable proximity category for the strongest reading
pub fn proximity_category(rssi_dbm: i32, measured_power_dbm: f64, path_loss_exponent: f64) -> &'static str {
    match estimate_distance(rssi_dbm, measured_power_dbm, path_loss_exponent) {
        d if d < 1.0 => "immediate",
        d if d < 3.0 => "near",
        d if d < 10.0 => "room",
        _ => "far",
    }
}

/// Format distance for display
pub fn format_distance(distance_m: f64) -> String {
    if distance_m < 10.0 {
        format!("{:.1}m", distance_m)
    } else {
        format!("{:.0}m", distance_m)
    }
}
