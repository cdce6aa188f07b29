use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{PayloadError, RejectReason};
use crate::registry::{normalize_address, Anchor, AnchorRegistry};

/// One observation as it arrives on the wire, before validation.
///
/// Field aliases cover the scanner firmware (`scannerMac`, `mac`, `rssi`) and
/// the shared API types (`nodeId`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawObservation {
    #[serde(default, alias = "scannerMac", alias = "nodeId")]
    pub anchor_id: Option<String>,
    #[serde(default, alias = "mac", alias = "macAddress")]
    pub device_address: Option<String>,
    #[serde(default, alias = "rssi")]
    pub signal_strength: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

/// Epoch milliseconds or an RFC 3339 string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

/// Accepted timestamps run from the Unix epoch to the end of year 9999
const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

impl WireTimestamp {
    fn resolve(&self) -> Result<DateTime<Utc>, RejectReason> {
        let invalid = |reason: String| RejectReason::InvalidField {
            field: "timestamp",
            reason,
        };
        let from_millis = |ms: i64| {
            if !(0..=MAX_TIMESTAMP_MS).contains(&ms) {
                return Err(invalid(format!("{} is out of range", ms)));
            }
            Utc.timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| invalid(format!("{} is out of range", ms)))
        };

        let resolved = match self {
            WireTimestamp::Millis(ms) => from_millis(*ms)?,
            WireTimestamp::Fractional(ms) => {
                let rounded = ms.round();
                if !rounded.is_finite() || rounded.abs() > i64::MAX as f64 {
                    return Err(invalid(format!("{} is out of range", ms)));
                }
                from_millis(rounded as i64)?
            }
            WireTimestamp::Text(text) => DateTime::parse_from_rfc3339(text.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| invalid(format!("{:?}: {}", text, e)))?,
        };

        if resolved.timestamp_millis() < 0 {
            return Err(invalid(format!("{} is before the Unix epoch", resolved)));
        }
        Ok(resolved)
    }
}

/// A validated, normalized observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub anchor_id: String,
    pub device_address: String,
    pub signal_strength: i32,
    pub timestamp: DateTime<Utc>,
}

/// Decode an ingestion payload: a single observation object or an array.
///
/// Each element is decoded on its own, so a malformed element becomes a
/// per-record rejection instead of failing the batch.
pub fn parse_payload(json: &str) -> Result<Vec<Result<RawObservation, RejectReason>>, PayloadError> {
    let value: serde_json::Value = serde_json::from_str(json)?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        object @ serde_json::Value::Object(_) => vec![object],
        serde_json::Value::Null => return Err(PayloadError::UnexpectedType("null")),
        serde_json::Value::Bool(_) => return Err(PayloadError::UnexpectedType("boolean")),
        serde_json::Value::Number(_) => return Err(PayloadError::UnexpectedType("number")),
        serde_json::Value::String(_) => return Err(PayloadError::UnexpectedType("string")),
    };

    if items.is_empty() {
        return Err(PayloadError::Empty);
    }

    Ok(items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<RawObservation>(item)
                .map_err(|e| RejectReason::Malformed(e.to_string()))
        })
        .collect())
}

/// Result of a successful validation: the observation and its resolved anchor
#[derive(Debug, Clone)]
pub struct ValidatedObservation {
    pub observation: Observation,
    pub anchor: Anchor,
}

pub struct ScanValidator {
    registry: Arc<dyn AnchorRegistry>,
}

impl ScanValidator {
    pub fn new(registry: Arc<dyn AnchorRegistry>) -> Self {
        ScanValidator { registry }
    }

    /// Validate one raw observation.
    ///
    /// `received_at` is used when the observation carries no timestamp and
    /// as the anchor's last-seen time on success.
    pub fn validate(
        &self,
        raw: &RawObservation,
        received_at: DateTime<Utc>,
    ) -> Result<ValidatedObservation, RejectReason> {
        let anchor_id = present(raw.anchor_id.as_deref()).ok_or(RejectReason::MissingField("anchorId"))?;
        let device_address =
            present(raw.device_address.as_deref()).ok_or(RejectReason::MissingField("deviceAddress"))?;
        let signal = raw
            .signal_strength
            .ok_or(RejectReason::MissingField("signalStrength"))?;
        if !signal.is_finite() {
            return Err(RejectReason::InvalidField {
                field: "signalStrength",
                reason: "not a finite number".to_string(),
            });
        }

        let timestamp = match &raw.timestamp {
            Some(ts) => ts.resolve()?,
            None => received_at,
        };

        let anchor = self
            .registry
            .resolve_anchor(anchor_id)
            .ok_or_else(|| RejectReason::UnknownAnchor(normalize_address(anchor_id)))?;

        self.registry.mark_anchor_seen(&anchor.id, received_at);

        let observation = Observation {
            anchor_id: anchor.id.clone(),
            device_address: normalize_address(device_address),
            // No range check; out-of-range strengths saturate
            signal_strength: signal.round() as i32,
            timestamp,
        };
        debug!(
            "Validated observation: anchor={} device={} rssi={}",
            observation.anchor_id, observation.device_address, observation.signal_strength
        );

        Ok(ValidatedObservation { observation, anchor })
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
