//! Pipeline orchestration
//!
//! Runs each ingestion batch through validation, presence tracking,
//! position estimation and trail aggregation, and forwards the resulting
//! updates to an optional event channel.
//!
//! All mutable engine state sits behind one mutex, so concurrent batches and
//! the reaper are serialized and never interleave partial updates.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::Config;
use crate::error::{PayloadError, RejectReason};
use crate::position::{Point, PositionEstimate, PositionEstimator};
use crate::presence::{PresenceInterval, PresenceTracker, PresenceTransition};
use crate::registry::{AnchorRegistry, AssetDirectory, AssetId, RoomId};
use crate::trail::{Heatmap, TrailAggregator};
use crate::validation::{parse_payload, Observation, RawObservation, ScanValidator};

/// Outcome for one observation of a batch, in input order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerObservationResult {
    pub device_address: Option<String>,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PerObservationResult {
    fn accepted(device_address: String) -> Self {
        PerObservationResult {
            device_address: Some(device_address),
            accepted: true,
            reason: None,
        }
    }

    fn rejected(device_address: Option<String>, reason: &RejectReason) -> Self {
        PerObservationResult {
            device_address,
            accepted: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Updates emitted to external sinks
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Observed { observation: Observation, is_asset: bool },
    PresenceOpened(PresenceInterval),
    PresenceUpdated(PresenceInterval),
    PresenceClosed(PresenceInterval),
    PresenceConflict { asset_id: AssetId, rooms: Vec<RoomId> },
    PositionUpdated(PositionEstimate),
}

impl From<PresenceTransition> for EngineEvent {
    fn from(transition: PresenceTransition) -> Self {
        match transition {
            PresenceTransition::Opened(interval) => EngineEvent::PresenceOpened(interval),
            PresenceTransition::Updated(interval) => EngineEvent::PresenceUpdated(interval),
            PresenceTransition::Closed(interval) => EngineEvent::PresenceClosed(interval),
            PresenceTransition::Conflict { asset_id, rooms } => {
                EngineEvent::PresenceConflict { asset_id, rooms }
            }
        }
    }
}

/// What one reaper sweep changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReapSummary {
    pub closed_presences: Vec<PresenceInterval>,
    pub evicted_devices: Vec<String>,
    pub offline_anchors: Vec<String>,
}

impl ReapSummary {
    pub fn is_empty(&self) -> bool {
        self.closed_presences.is_empty() && self.evicted_devices.is_empty() && self.offline_anchors.is_empty()
    }
}

struct EngineState {
    presence: PresenceTracker,
    positions: PositionEstimator,
    trails: TrailAggregator,
}

pub struct IngestionPipeline {
    config: Config,
    registry: Arc<dyn AnchorRegistry>,
    assets: Arc<dyn AssetDirectory>,
    validator: ScanValidator,
    state: Mutex<EngineState>,
    events: Option<mpsc::Sender<EngineEvent>>,
}

impl IngestionPipeline {
    pub fn new(config: Config, registry: Arc<dyn AnchorRegistry>, assets: Arc<dyn AssetDirectory>) -> Self {
        let state = EngineState {
            presence: PresenceTracker::new(&config.presence),
            positions: PositionEstimator::new(&config.positioning, config.presence.absence_timeout()),
            trails: TrailAggregator::new(&config.trail),
        };

        IngestionPipeline {
            validator: ScanValidator::new(registry.clone()),
            config,
            registry,
            assets,
            state: Mutex::new(state),
            events: None,
        }
    }

    /// Forward engine events to `sender`. Delivery is best effort: a full
    /// channel drops the event rather than blocking ingestion.
    pub fn with_events(mut self, sender: mpsc::Sender<EngineEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ingest a JSON payload (single observation or array) received now.
    pub fn ingest_payload(&self, json: &str) -> Result<Vec<PerObservationResult>, PayloadError> {
        self.ingest_payload_at(json, Utc::now())
    }

    pub fn ingest_payload_at(
        &self,
        json: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Vec<PerObservationResult>, PayloadError> {
        let items = parse_payload(json)?;
        Ok(self.process(items, received_at))
    }

    pub fn ingest_batch(&self, observations: &[RawObservation]) -> Vec<PerObservationResult> {
        self.ingest_batch_at(observations, Utc::now())
    }

    pub fn ingest_batch_at(
        &self,
        observations: &[RawObservation],
        received_at: DateTime<Utc>,
    ) -> Vec<PerObservationResult> {
        self.process(observations.iter().cloned().map(Ok).collect(), received_at)
    }

    fn process(
        &self,
        items: Vec<Result<RawObservation, RejectReason>>,
        received_at: DateTime<Utc>,
    ) -> Vec<PerObservationResult> {
        let mut results = Vec::with_capacity(items.len());
        let mut events = Vec::new();
        let mut touched = BTreeSet::new();

        {
            let mut state = self.lock();

            for item in items {
                let raw = match item {
                    Ok(raw) => raw,
                    Err(reason) => {
                        debug!("Rejected observation: {}", reason);
                        results.push(PerObservationResult::rejected(None, &reason));
                        continue;
                    }
                };

                let validated = match self.validator.validate(&raw, received_at) {
                    Ok(validated) => validated,
                    Err(reason) => {
                        debug!("Rejected observation {:?}: {}", raw.device_address, reason);
                        results.push(PerObservationResult::rejected(raw.device_address.clone(), &reason));
                        continue;
                    }
                };

                let observation = &validated.observation;
                let asset = self.assets.registered_asset(&observation.device_address);

                if let Some(asset) = &asset {
                    debug!("Registered asset {} ({}) seen", asset.name, observation.device_address);
                    let transitions =
                        state
                            .presence
                            .observe(asset.id, validated.anchor.room_id, observation.timestamp);
                    events.extend(transitions.into_iter().map(EngineEvent::from));
                }

                state
                    .positions
                    .record(observation, &validated.anchor, asset.as_ref());
                touched.insert(observation.device_address.clone());

                events.push(EngineEvent::Observed {
                    observation: observation.clone(),
                    is_asset: asset.is_some(),
                });
                results.push(PerObservationResult::accepted(observation.device_address.clone()));
            }

            for device in &touched {
                let Some(estimate) = state.positions.estimate(device) else {
                    continue;
                };
                if estimate.is_asset {
                    state.trails.record(device, estimate.point());
                }
                events.push(EngineEvent::PositionUpdated(estimate));
            }
        }

        let accepted = results.iter().filter(|r| r.accepted).count();
        info!(
            "Processed batch: {} observations, {} accepted, {} rejected, {} devices positioned",
            results.len(),
            accepted,
            results.len() - accepted,
            touched.len()
        );

        self.emit(events);
        results
    }

    /// Close stale presences, evict silent devices and flag silent anchors.
    /// Idempotent; safe to run concurrently with ingestion.
    pub fn reap(&self, now: DateTime<Utc>) -> ReapSummary {
        let timeout = self.config.presence.absence_timeout();

        let (closed_presences, evicted_devices) = {
            let mut state = self.lock();
            let closed = state.presence.close_stale(now);
            let evicted = state.positions.evict_stale(now, timeout);
            for device in &evicted {
                state.trails.evict(device);
            }
            (closed, evicted)
        };

        let offline_anchors = self
            .registry
            .mark_silent_anchors_offline(now, self.config.reaper.anchor_offline_after());

        let summary = ReapSummary {
            closed_presences,
            evicted_devices,
            offline_anchors,
        };
        if !summary.is_empty() {
            info!(
                "Reaper: closed {} presences, evicted {} devices, {} anchors offline",
                summary.closed_presences.len(),
                summary.evicted_devices.len(),
                summary.offline_anchors.len()
            );
        }

        self.emit(
            summary
                .closed_presences
                .iter()
                .cloned()
                .map(EngineEvent::PresenceClosed)
                .collect(),
        );
        summary
    }

    /// Latest position estimates of devices located in a room
    pub fn current_positions(&self, room_id: RoomId) -> Vec<PositionEstimate> {
        self.lock().positions.current_positions(room_id)
    }

    pub fn position(&self, device_address: &str) -> Option<PositionEstimate> {
        let key = crate::registry::normalize_address(device_address);
        self.lock().positions.latest(&key).cloned()
    }

    pub fn trail(&self, device_address: &str) -> Vec<Point> {
        let key = crate::registry::normalize_address(device_address);
        self.lock().trails.trail(&key)
    }

    /// Density grid of the devices currently positioned in a room, or
    /// `None` for an unknown room
    pub fn heatmap(&self, room_id: RoomId) -> Option<Heatmap> {
        let room = self.registry.room(room_id)?;
        let points: Vec<Point> = self
            .current_positions(room_id)
            .iter()
            .map(PositionEstimate::point)
            .collect();
        Some(Heatmap::build(&room, self.config.heatmap.cell_size_m, &points))
    }

    pub fn open_presences(&self) -> Vec<PresenceInterval> {
        self.lock().presence.open_intervals()
    }

    pub fn room_occupants(&self, room_id: RoomId) -> Vec<PresenceInterval> {
        self.lock().presence.room_occupants(room_id)
    }

    pub fn presence_history(&self, asset_id: AssetId) -> Vec<PresenceInterval> {
        self.lock().presence.intervals_for_asset(asset_id)
    }

    fn emit(&self, events: Vec<EngineEvent>) {
        let Some(sender) = &self.events else {
            return;
        };

        for event in events {
            match sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    warn!("Event buffer full, dropping {:?}", event);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Event receiver closed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AnchorStatus, SiteRegistry};
    use chrono::{Duration, TimeZone};

    const ASSET: &str = "AA:BB:CC:00:00:01";
    const WEST: &str = "B8:27:EB:00:00:01";
    const EAST: &str = "B8:27:EB:00:00:02";
    const OFFICE: &str = "B8:27:EB:00:00:04";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap() + Duration::seconds(secs)
    }

    fn pipeline() -> (Arc<SiteRegistry>, IngestionPipeline) {
        let registry = Arc::new(SiteRegistry::sample());
        let pipeline = IngestionPipeline::new(Config::default(), registry.clone(), registry.clone());
        (registry, pipeline)
    }

    fn raw(anchor: &str, device: &str, rssi: f64, at: DateTime<Utc>) -> RawObservation {
        RawObservation {
            anchor_id: Some(anchor.to_string()),
            device_address: Some(device.to_string()),
            signal_strength: Some(rssi),
            timestamp: Some(crate::validation::WireTimestamp::Millis(at.timestamp_millis())),
        }
    }

    #[test]
    fn test_first_sighting_opens_presence() {
        let (_, pipeline) = pipeline();
        let results = pipeline.ingest_batch_at(&[raw(WEST, ASSET, -60.0, t(0))], t(0));

        assert_eq!(results, vec![PerObservationResult::accepted(ASSET.to_string())]);
        let open = pipeline.open_presences();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].room_id, 1);
        assert_eq!(open[0].entered_at, t(0));
        assert_eq!(open[0].last_seen_at, t(0));
    }

    #[test]
    fn test_repeat_sighting_keeps_single_interval() {
        let (_, pipeline) = pipeline();
        pipeline.ingest_batch_at(&[raw(WEST, ASSET, -60.0, t(0))], t(0));
        pipeline.ingest_batch_at(&[raw(EAST, ASSET, -62.0, t(5))], t(5));

        let open = pipeline.open_presences();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entered_at, t(0));
        assert_eq!(open[0].last_seen_at, t(5));
    }

    #[test]
    fn test_reaper_closes_absent_asset() {
        let (_, pipeline) = pipeline();
        pipeline.ingest_batch_at(&[raw(WEST, ASSET, -60.0, t(0))], t(0));

        assert!(pipeline.reap(t(30)).closed_presences.is_empty());
        let summary = pipeline.reap(t(61));
        assert_eq!(summary.closed_presences.len(), 1);
        assert!(summary.closed_presences[0].exited_at.unwrap() >= t(0));
        assert_eq!(summary.evicted_devices, vec![ASSET.to_string()]);
        assert!(pipeline.open_presences().is_empty());
        assert!(pipeline.trail(ASSET).is_empty());

        assert!(pipeline.reap(t(62)).closed_presences.is_empty());
    }

    #[test]
    fn test_partial_batch_rejection() {
        let (_, pipeline) = pipeline();
        let payload = format!(
            r#"[{{"anchorId":"bad"}},
                {{"scannerMac":"00:00:00:00:00:09","mac":"11:11:11:11:11:11","rssi":-70}},
                {{"scannerMac":"{}","mac":"11:11:11:11:11:11","rssi":-70}}]"#,
            WEST
        );
        let results = pipeline.ingest_payload_at(&payload, t(0)).unwrap();

        assert_eq!(results.len(), 3);
        assert!(!results[0].accepted);
        assert_eq!(
            results[0].reason.as_deref(),
            Some("Missing required field: deviceAddress")
        );
        assert!(!results[1].accepted);
        assert_eq!(
            results[1].reason.as_deref(),
            Some("Unknown anchor: 00:00:00:00:00:09")
        );
        assert!(results[2].accepted);
        assert!(pipeline.position("11:11:11:11:11:11").is_some());
    }

    #[test]
    fn test_single_missing_field_payload() {
        let (_, pipeline) = pipeline();
        let results = pipeline.ingest_payload_at(r#"[{"anchorId": "bad"}]"#, t(0)).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].accepted);
        assert!(results[0].reason.as_deref().unwrap().starts_with("Missing required field"));
    }

    #[test]
    fn test_symmetric_position_and_trail() {
        let (registry, pipeline) = pipeline();
        pipeline.ingest_batch_at(
            &[raw(WEST, ASSET, -65.0, t(0)), raw(EAST, ASSET, -65.0, t(0))],
            t(0),
        );

        let positions = pipeline.current_positions(1);
        assert_eq!(positions.len(), 1);
        assert!((positions[0].x - 5.0).abs() < 1e-9);
        assert!((positions[0].y - 4.0).abs() < 1e-9);
        assert!(positions[0].is_asset);
        assert_eq!(pipeline.trail(ASSET).len(), 1);

        assert_eq!(
            registry.resolve_anchor(WEST).unwrap().status,
            AnchorStatus::Online
        );
    }

    #[test]
    fn test_non_assets_have_position_but_no_trail_or_presence() {
        let (_, pipeline) = pipeline();
        pipeline.ingest_batch_at(&[raw(WEST, "22:22:22:22:22:22", -60.0, t(0))], t(0));

        assert!(pipeline.position("22:22:22:22:22:22").is_some());
        assert!(pipeline.trail("22:22:22:22:22:22").is_empty());
        assert!(pipeline.open_presences().is_empty());
    }

    #[test]
    fn test_heatmap_counts_positioned_devices() {
        let (_, pipeline) = pipeline();
        pipeline.ingest_batch_at(
            &[
                raw(WEST, "22:22:22:22:22:01", -50.0, t(0)),
                raw(EAST, "22:22:22:22:22:02", -50.0, t(0)),
                raw(WEST, ASSET, -60.0, t(0)),
                raw(OFFICE, "22:22:22:22:22:03", -50.0, t(0)),
            ],
            t(0),
        );

        let heatmap = pipeline.heatmap(1).unwrap();
        assert_eq!(heatmap.total(), 3);
        assert_eq!(pipeline.heatmap(2).unwrap().total(), 1);
        assert!(pipeline.heatmap(99).is_none());

        // Not cumulative: another cycle with the same devices keeps the sum
        pipeline.ingest_batch_at(&[raw(WEST, "22:22:22:22:22:01", -50.0, t(1))], t(1));
        assert_eq!(pipeline.heatmap(1).unwrap().total(), 3);
    }

    #[test]
    fn test_extreme_timestamp_is_rejected_not_fatal() {
        let (_, pipeline) = pipeline();
        let mut extreme = raw(WEST, ASSET, -60.0, t(0));
        extreme.timestamp = Some(crate::validation::WireTimestamp::Millis(
            DateTime::<Utc>::MIN_UTC.timestamp_millis(),
        ));

        let results = pipeline.ingest_batch_at(&[extreme, raw(EAST, ASSET, -60.0, t(0))], t(0));
        assert!(!results[0].accepted);
        assert!(results[0].reason.as_deref().unwrap().starts_with("Invalid timestamp"));
        assert!(results[1].accepted);
        assert_eq!(pipeline.open_presences().len(), 1);
    }

    #[test]
    fn test_returning_device_starts_from_raw_position() {
        let (_, pipeline) = pipeline();
        pipeline.ingest_batch_at(&[raw(WEST, ASSET, -60.0, t(0))], t(0));
        pipeline.ingest_batch_at(&[raw(EAST, ASSET, -60.0, t(300))], t(300));

        let position = pipeline.position(ASSET).unwrap();
        assert!((position.x - 10.0).abs() < 1e-9);
        assert!((position.raw.x - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_rooms_in_one_batch_conflict() {
        let (_, pipeline) = pipeline();
        let (tx, mut rx) = mpsc::channel(64);
        let pipeline = pipeline.with_events(tx);

        pipeline.ingest_batch_at(
            &[raw(WEST, ASSET, -60.0, t(0)), raw(OFFICE, ASSET, -55.0, t(0))],
            t(0),
        );
        assert_eq!(pipeline.open_presences().len(), 2);

        let mut saw_conflict = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::PresenceConflict { asset_id, rooms } = event {
                assert_eq!(asset_id, 1);
                assert_eq!(rooms, vec![1, 2]);
                saw_conflict = true;
            }
        }
        assert!(saw_conflict);
    }

    #[test]
    fn test_full_event_buffer_does_not_block() {
        let (_, pipeline) = pipeline();
        let (tx, _rx) = mpsc::channel(1);
        let pipeline = pipeline.with_events(tx);

        let results = pipeline.ingest_batch_at(
            &[raw(WEST, ASSET, -60.0, t(0)), raw(EAST, ASSET, -60.0, t(0))],
            t(0),
        );
        assert!(results.iter().all(|r| r.accepted));
    }
}
