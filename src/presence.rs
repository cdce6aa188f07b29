//! Room-level presence tracking.
//!
//! Each (asset, room) pair is either absent or has exactly one open
//! interval. Observations open or extend intervals; exits are detected
//! lazily once `last_seen_at` falls behind the absence timeout.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::config::PresenceConfig;
use crate::registry::{AssetId, RoomId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInterval {
    pub id: u64,
    pub asset_id: AssetId,
    pub room_id: RoomId,
    pub entered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
}

impl PresenceInterval {
    pub fn is_open(&self) -> bool {
        self.exited_at.is_none()
    }
}

/// State change produced by the tracker
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceTransition {
    Opened(PresenceInterval),
    Updated(PresenceInterval),
    Closed(PresenceInterval),
    /// The asset now has open intervals in more than one room
    Conflict { asset_id: AssetId, rooms: Vec<RoomId> },
}

pub struct PresenceTracker {
    timeout: Duration,
    exclusive_rooms: bool,
    history_limit: usize,
    open: HashMap<(AssetId, RoomId), PresenceInterval>,
    closed: VecDeque<PresenceInterval>,
    /// Exit time of the most recently closed interval per pair
    last_exit: HashMap<(AssetId, RoomId), DateTime<Utc>>,
    next_id: u64,
}

impl PresenceTracker {
    pub fn new(config: &PresenceConfig) -> Self {
        PresenceTracker {
            timeout: config.absence_timeout(),
            exclusive_rooms: config.exclusive_rooms,
            history_limit: config.history_limit,
            open: HashMap::new(),
            closed: VecDeque::new(),
            last_exit: HashMap::new(),
            next_id: 1,
        }
    }

    /// Apply one observation of `asset_id` in `room_id` at `at`.
    pub fn observe(&mut self, asset_id: AssetId, room_id: RoomId, at: DateTime<Utc>) -> Vec<PresenceTransition> {
        let mut transitions = Vec::new();

        // Late sightings that belong to an already closed interval
        if let Some(exited_at) = self.last_exit.get(&(asset_id, room_id)) {
            if at <= *exited_at {
                debug!(
                    "Ignoring late sighting of asset {} in room {} at {} (left at {})",
                    asset_id, room_id, at, exited_at
                );
                return transitions;
            }
        }

        if self.exclusive_rooms {
            let others: Vec<RoomId> = self
                .open
                .keys()
                .filter(|(asset, room)| *asset == asset_id && *room != room_id)
                .map(|(_, room)| *room)
                .collect();
            for other in others {
                let last_seen = self.open[&(asset_id, other)].last_seen_at;
                if let Some(closed) = self.close((asset_id, other), at.max(last_seen)) {
                    info!(
                        "Asset {} moved from room {} to room {}",
                        asset_id, other, room_id
                    );
                    transitions.push(PresenceTransition::Closed(closed));
                }
            }
        }

        let key = (asset_id, room_id);
        let stale_exit = self
            .open
            .get(&key)
            .filter(|interval| at - interval.last_seen_at > self.timeout)
            .map(|interval| exit_time(interval.last_seen_at, self.timeout));
        if let Some(exited_at) = stale_exit {
            if let Some(closed) = self.close(key, exited_at) {
                transitions.push(PresenceTransition::Closed(closed));
            }
        }

        if let Some(interval) = self.open.get_mut(&key) {
            // Order independent: earliest entry, latest sighting
            interval.entered_at = interval.entered_at.min(at);
            interval.last_seen_at = interval.last_seen_at.max(at);
            debug!(
                "Presence updated: asset {} room {} last seen {}",
                asset_id, room_id, interval.last_seen_at
            );
            transitions.push(PresenceTransition::Updated(interval.clone()));
            return transitions;
        }

        let interval = PresenceInterval {
            id: self.next_id,
            asset_id,
            room_id,
            entered_at: at,
            last_seen_at: at,
            exited_at: None,
        };
        self.next_id += 1;
        info!("Asset {} entered room {} at {}", asset_id, room_id, at);
        self.open.insert(key, interval.clone());
        transitions.push(PresenceTransition::Opened(interval));

        let rooms = self.open_rooms(asset_id);
        if rooms.len() > 1 {
            warn!(
                "StaleIntervalConflict: asset {} has open presence in rooms {:?}",
                asset_id, rooms
            );
            transitions.push(PresenceTransition::Conflict { asset_id, rooms });
        }

        transitions
    }

    /// Close every open interval whose last sighting is older than the
    /// timeout at `now`. Exit time is `last_seen_at + timeout`.
    pub fn close_stale(&mut self, now: DateTime<Utc>) -> Vec<PresenceInterval> {
        let stale: Vec<((AssetId, RoomId), DateTime<Utc>)> = self
            .open
            .iter()
            .filter(|(_, interval)| now - interval.last_seen_at > self.timeout)
            .map(|(key, interval)| (*key, exit_time(interval.last_seen_at, self.timeout)))
            .collect();

        let mut closed: Vec<PresenceInterval> = stale
            .into_iter()
            .filter_map(|(key, exited_at)| self.close(key, exited_at))
            .collect();
        closed.sort_by_key(|interval| interval.id);
        closed
    }

    fn close(&mut self, key: (AssetId, RoomId), exited_at: DateTime<Utc>) -> Option<PresenceInterval> {
        let mut interval = self.open.remove(&key)?;
        interval.exited_at = Some(exited_at.max(interval.last_seen_at));
        info!(
            "Asset {} left room {} at {}",
            interval.asset_id, interval.room_id, exited_at
        );

        if let Some(exited_at) = interval.exited_at {
            self.last_exit.insert(key, exited_at);
        }
        self.closed.push_back(interval.clone());
        while self.closed.len() > self.history_limit {
            self.closed.pop_front();
        }
        Some(interval)
    }

    fn open_rooms(&self, asset_id: AssetId) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .open
            .keys()
            .filter(|(asset, _)| *asset == asset_id)
            .map(|(_, room)| *room)
            .collect();
        rooms.sort_unstable();
        rooms
    }

    pub fn open_interval(&self, asset_id: AssetId, room_id: RoomId) -> Option<&PresenceInterval> {
        self.open.get(&(asset_id, room_id))
    }

    pub fn open_intervals(&self) -> Vec<PresenceInterval> {
        let mut intervals: Vec<PresenceInterval> = self.open.values().cloned().collect();
        intervals.sort_by_key(|i| (i.asset_id, i.room_id));
        intervals
    }

    /// Assets currently present in a room
    pub fn room_occupants(&self, room_id: RoomId) -> Vec<PresenceInterval> {
        let mut intervals: Vec<PresenceInterval> = self
            .open
            .values()
            .filter(|i| i.room_id == room_id)
            .cloned()
            .collect();
        intervals.sort_by_key(|i| i.asset_id);
        intervals
    }

    /// Open and retained closed intervals of one asset, oldest entry first
    pub fn intervals_for_asset(&self, asset_id: AssetId) -> Vec<PresenceInterval> {
        let mut intervals: Vec<PresenceInterval> = self
            .closed
            .iter()
            .chain(self.open.values())
            .filter(|i| i.asset_id == asset_id)
            .cloned()
            .collect();
        intervals.sort_by_key(|i| (i.entered_at, i.id));
        intervals
    }

    /// False when the asset has no open interval anywhere
    pub fn is_detected(&self, asset_id: AssetId) -> bool {
        self.open.keys().any(|(asset, _)| *asset == asset_id)
    }
}

fn exit_time(last_seen_at: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    last_seen_at
        .checked_add_signed(timeout)
        .unwrap_or(last_seen_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap() + Duration::seconds(secs)
    }

    fn tracker(exclusive_rooms: bool) -> PresenceTracker {
        PresenceTracker::new(&PresenceConfig {
            absence_timeout_secs: 60,
            exclusive_rooms,
            history_limit: 100,
        })
    }

    #[test]
    fn test_first_sighting_opens_interval() {
        let mut tracker = tracker(false);
        let transitions = tracker.observe(1, 10, t(0));

        assert_eq!(transitions.len(), 1);
        let interval = tracker.open_interval(1, 10).unwrap();
        assert_eq!(interval.entered_at, t(0));
        assert_eq!(interval.last_seen_at, t(0));
        assert!(interval.is_open());
        assert!(tracker.is_detected(1));
    }

    #[test]
    fn test_repeat_sighting_bumps_last_seen() {
        let mut tracker = tracker(false);
        tracker.observe(1, 10, t(0));
        let transitions = tracker.observe(1, 10, t(5));

        assert!(matches!(transitions.as_slice(), [PresenceTransition::Updated(_)]));
        assert_eq!(tracker.open_intervals().len(), 1);
        let interval = tracker.open_interval(1, 10).unwrap();
        assert_eq!(interval.entered_at, t(0));
        assert_eq!(interval.last_seen_at, t(5));
    }

    #[test]
    fn test_order_independent_within_batch() {
        let mut forward = tracker(false);
        forward.observe(1, 10, t(0));
        forward.observe(1, 10, t(3));

        let mut backward = tracker(false);
        backward.observe(1, 10, t(3));
        backward.observe(1, 10, t(0));

        let a = forward.open_interval(1, 10).unwrap();
        let b = backward.open_interval(1, 10).unwrap();
        assert_eq!((a.entered_at, a.last_seen_at), (b.entered_at, b.last_seen_at));
    }

    #[test]
    fn test_close_stale_is_idempotent() {
        let mut tracker = tracker(false);
        tracker.observe(1, 10, t(0));
        tracker.observe(1, 10, t(10));

        assert!(tracker.close_stale(t(60)).is_empty());

        let closed = tracker.close_stale(t(71));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exited_at, Some(t(70)));
        assert!(closed[0].exited_at.unwrap() >= closed[0].last_seen_at);
        assert!(!tracker.is_detected(1));

        assert!(tracker.close_stale(t(500)).is_empty());
        assert_eq!(tracker.intervals_for_asset(1).len(), 1);
    }

    #[test]
    fn test_stale_interval_closed_inline_on_return() {
        let mut tracker = tracker(false);
        tracker.observe(1, 10, t(0));
        let transitions = tracker.observe(1, 10, t(200));

        assert!(matches!(
            transitions.as_slice(),
            [PresenceTransition::Closed(_), PresenceTransition::Opened(_)]
        ));
        let history = tracker.intervals_for_asset(1);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].exited_at, Some(t(60)));
        assert_eq!(history[1].entered_at, t(200));
        assert!(history[1].is_open());
    }

    #[test]
    fn test_late_sighting_does_not_overlap_previous_interval() {
        let mut tracker = tracker(false);
        tracker.observe(1, 10, t(0));
        tracker.close_stale(t(100));
        tracker.observe(1, 10, t(200));

        // Arrives after the first interval was closed at t(60)
        assert!(tracker.observe(1, 10, t(50)).is_empty());
        assert!(tracker.observe(1, 10, t(60)).is_empty());
        tracker.observe(1, 10, t(65));

        let history = tracker.intervals_for_asset(1);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].exited_at, Some(t(60)));
        assert_eq!(history[1].entered_at, t(65));
        assert_eq!(history[1].last_seen_at, t(200));
        assert!(history[1].entered_at > history[0].exited_at.unwrap());
    }

    #[test]
    fn test_late_sighting_after_close_stays_absent() {
        let mut tracker = tracker(false);
        tracker.observe(1, 10, t(0));
        tracker.close_stale(t(100));

        assert!(tracker.observe(1, 10, t(30)).is_empty());
        assert!(!tracker.is_detected(1));
    }

    #[test]
    fn test_exit_time_saturates() {
        let max = DateTime::<Utc>::MAX_UTC;
        assert_eq!(exit_time(max, Duration::seconds(60)), max);
        assert_eq!(exit_time(t(0), Duration::seconds(60)), t(60));
    }

    #[test]
    fn test_two_rooms_conflict_is_flagged() {
        let mut tracker = tracker(false);
        tracker.observe(1, 10, t(0));
        let transitions = tracker.observe(1, 20, t(1));

        assert!(transitions.contains(&PresenceTransition::Conflict {
            asset_id: 1,
            rooms: vec![10, 20]
        }));
        assert_eq!(tracker.open_intervals().len(), 2);
    }

    #[test]
    fn test_exclusive_rooms_close_then_open() {
        let mut tracker = tracker(true);
        tracker.observe(1, 10, t(0));
        let transitions = tracker.observe(1, 20, t(4));

        match transitions.as_slice() {
            [PresenceTransition::Closed(old), PresenceTransition::Opened(new)] => {
                assert_eq!(old.room_id, 10);
                assert_eq!(old.exited_at, Some(t(4)));
                assert_eq!(new.room_id, 20);
            }
            other => panic!("unexpected transitions: {:?}", other),
        }
        assert_eq!(tracker.open_intervals().len(), 1);
        assert_eq!(tracker.room_occupants(20).len(), 1);
        assert!(tracker.room_occupants(10).is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut tracker = PresenceTracker::new(&PresenceConfig {
            absence_timeout_secs: 1,
            exclusive_rooms: false,
            history_limit: 3,
        });
        for i in 0..10 {
            tracker.observe(1, 10, t(i * 10));
        }
        tracker.close_stale(t(1000));
        assert_eq!(tracker.intervals_for_asset(1).len(), 3);
    }
}
