//! Anchor, room and asset lookup.
//!
//! Entity lifecycle is owned elsewhere; the engine only resolves anchors and
//! assets and reports anchor contact. `SiteRegistry` is the in-process
//! implementation, loaded from a JSON site file.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

pub type RoomId = i64;
pub type AssetId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorStatus {
    Online,
    #[default]
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    /// Physical identity (hardware address), not a storage key
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub room_id: RoomId,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub status: AnchorStatus,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    #[serde(default)]
    pub name: String,
    /// Meters
    pub width: f64,
    /// Meters
    pub height: f64,
}

/// A device registered as a tracked asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: AssetId,
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

pub trait AnchorRegistry: Send + Sync {
    fn resolve_anchor(&self, anchor_id: &str) -> Option<Anchor>;

    /// Record contact with an anchor: last-seen = `at`, status online.
    fn mark_anchor_seen(&self, anchor_id: &str, at: DateTime<Utc>);

    fn room(&self, room_id: RoomId) -> Option<Room>;

    /// Flag online anchors silent for longer than `after` as offline.
    /// Returns the identities that changed state.
    fn mark_silent_anchors_offline(&self, _now: DateTime<Utc>, _after: Duration) -> Vec<String> {
        Vec::new()
    }
}

pub trait AssetDirectory: Send + Sync {
    fn registered_asset(&self, device_address: &str) -> Option<Asset>;
}

/// Normalize a hardware address to upper-case, colon separated form.
///
/// Identifiers that are not MAC-48 addresses are trimmed and upper-cased.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    match trimmed.parse::<MacAddr6>() {
        Ok(mac) => {
            let b = mac.as_bytes();
            format!(
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            )
        }
        Err(_) => trimmed.to_uppercase(),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SiteFile {
    #[serde(default)]
    rooms: Vec<Room>,
    #[serde(default)]
    anchors: Vec<Anchor>,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Default)]
pub struct SiteRegistry {
    rooms: HashMap<RoomId, Room>,
    anchors: RwLock<HashMap<String, Anchor>>,
    assets: HashMap<String, Asset>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        SiteRegistry::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read site file: {:?}", path.as_ref()))?;

        let site: SiteFile = serde_json::from_str(&content)
            .with_context(|| "Failed to parse site file JSON")?;

        let mut registry = SiteRegistry::new();
        for room in site.rooms {
            registry.add_room(room);
        }
        for anchor in site.anchors {
            if !registry.rooms.contains_key(&anchor.room_id) {
                warn!("Anchor {} references unknown room {}", anchor.id, anchor.room_id);
            }
            registry.add_anchor(anchor);
        }
        for asset in site.assets {
            registry.add_asset(asset);
        }

        info!(
            "Loaded site: {} rooms, {} anchors, {} assets",
            registry.rooms.len(),
            registry.anchor_count(),
            registry.assets.len()
        );
        Ok(registry)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut site = SiteFile {
            rooms: self.rooms.values().cloned().collect(),
            anchors: self.anchors(),
            assets: self.assets.values().cloned().collect(),
        };
        site.rooms.sort_by_key(|r| r.id);
        site.assets.sort_by_key(|a| a.id);

        let content = serde_json::to_string_pretty(&site)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn add_room(&mut self, room: Room) {
        self.rooms.insert(room.id, room);
    }

    pub fn add_anchor(&mut self, mut anchor: Anchor) {
        anchor.id = normalize_address(&anchor.id);
        self.anchors
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(anchor.id.clone(), anchor);
    }

    pub fn add_asset(&mut self, mut asset: Asset) {
        asset.address = normalize_address(&asset.address);
        self.assets.insert(asset.address.clone(), asset);
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of all anchors, sorted by identity
    pub fn anchors(&self) -> Vec<Anchor> {
        let mut anchors: Vec<Anchor> = self
            .anchors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        anchors.sort_by(|a, b| a.id.cmp(&b.id));
        anchors
    }

    pub fn rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.values().cloned().collect();
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    /// A small two-room site used by `init`
    pub fn sample() -> Self {
        let mut registry = SiteRegistry::new();
        registry.add_room(Room {
            id: 1,
            name: "Lab".to_string(),
            width: 10.0,
            height: 8.0,
        });
        registry.add_room(Room {
            id: 2,
            name: "Office".to_string(),
            width: 6.0,
            height: 6.0,
        });
        for (id, name, room_id, x, y) in [
            ("B8:27:EB:00:00:01", "lab-west", 1, 0.0, 4.0),
            ("B8:27:EB:00:00:02", "lab-east", 1, 10.0, 4.0),
            ("B8:27:EB:00:00:03", "lab-north", 1, 5.0, 0.0),
            ("B8:27:EB:00:00:04", "office", 2, 3.0, 3.0),
        ] {
            registry.add_anchor(Anchor {
                id: id.to_string(),
                name: name.to_string(),
                room_id,
                x,
                y,
                status: AnchorStatus::Offline,
                last_seen: None,
            });
        }
        registry.add_asset(Asset {
            id: 1,
            address: "AA:BB:CC:00:00:01".to_string(),
            name: "Infusion pump".to_string(),
            kind: Some("equipment".to_string()),
        });
        registry
    }
}

impl AnchorRegistry for SiteRegistry {
    fn resolve_anchor(&self, anchor_id: &str) -> Option<Anchor> {
        let key = normalize_address(anchor_id);
        self.anchors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    fn mark_anchor_seen(&self, anchor_id: &str, at: DateTime<Utc>) {
        let key = normalize_address(anchor_id);
        let mut anchors = self.anchors.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(anchor) = anchors.get_mut(&key) {
            if anchor.status != AnchorStatus::Online {
                info!("Anchor {} is online", anchor.id);
            }
            anchor.status = AnchorStatus::Online;
            anchor.last_seen = Some(at);
        } else {
            debug!("mark_anchor_seen for unknown anchor {}", key);
        }
    }

    fn room(&self, room_id: RoomId) -> Option<Room> {
        self.rooms.get(&room_id).cloned()
    }

    fn mark_silent_anchors_offline(&self, now: DateTime<Utc>, after: Duration) -> Vec<String> {
        let mut anchors = self.anchors.write().unwrap_or_else(PoisonError::into_inner);
        let mut changed = Vec::new();

        for anchor in anchors.values_mut() {
            if anchor.status != AnchorStatus::Online {
                continue;
            }
            let silent = match anchor.last_seen {
                Some(seen) => now - seen > after,
                None => true,
            };
            if silent {
                anchor.status = AnchorStatus::Offline;
                changed.push(anchor.id.clone());
            }
        }

        changed.sort();
        for id in &changed {
            info!("Anchor {} went offline", id);
        }
        changed
    }
}

impl AssetDirectory for SiteRegistry {
    fn registered_asset(&self, device_address: &str) -> Option<Asset> {
        self.assets.get(&normalize_address(device_address)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_address_normalization() {
        assert_eq!(normalize_address("aa:bb:cc:dd:ee:ff"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_address("AA-BB-CC-DD-EE-FF"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_address("  node-7 "), "NODE-7");
    }

    #[test]
    fn test_resolve_by_physical_identity() {
        let registry = SiteRegistry::sample();

        let anchor = registry.resolve_anchor("b8-27-eb-00-00-02").unwrap();
        assert_eq!(anchor.name, "lab-east");
        assert_eq!(anchor.room_id, 1);
        assert!(registry.resolve_anchor("00:00:00:00:00:00").is_none());

        let asset = registry.registered_asset("aa:bb:cc:00:00:01").unwrap();
        assert_eq!(asset.id, 1);
        assert!(registry.registered_asset("AA:BB:CC:00:00:99").is_none());
    }

    #[test]
    fn test_mark_seen_and_offline() {
        let registry = SiteRegistry::sample();
        let t0 = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();

        registry.mark_anchor_seen("B8:27:EB:00:00:01", t0);
        registry.mark_anchor_seen("B8:27:EB:00:00:01", t0);
        let anchor = registry.resolve_anchor("B8:27:EB:00:00:01").unwrap();
        assert_eq!(anchor.status, AnchorStatus::Online);
        assert_eq!(anchor.last_seen, Some(t0));

        let changed = registry.mark_silent_anchors_offline(t0 + Duration::seconds(30), Duration::seconds(60));
        assert!(changed.is_empty());

        let changed = registry.mark_silent_anchors_offline(t0 + Duration::seconds(61), Duration::seconds(60));
        assert_eq!(changed, vec!["B8:27:EB:00:00:01".to_string()]);
        assert_eq!(
            registry.resolve_anchor("B8:27:EB:00:00:01").unwrap().status,
            AnchorStatus::Offline
        );
    }

    #[test]
    fn test_site_file_round_trip() {
        let path = std::env::temp_dir().join(format!("roomscan-site-{}.json", std::process::id()));
        SiteRegistry::sample().save(&path).unwrap();

        let loaded = SiteRegistry::load(&path).unwrap();
        assert_eq!(loaded.rooms().len(), 2);
        assert_eq!(loaded.anchor_count(), 4);
        assert_eq!(
            loaded.registered_asset("AA:BB:CC:00:00:01").unwrap().kind.as_deref(),
            Some("equipment")
        );

        let _ = fs::remove_file(&path);
    }
}
