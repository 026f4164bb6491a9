//! The published SA database: a flat mapping keyed by ephemeral SPI plus a
//! per-route back-index, so a route teardown never needs a linear scan, and
//! an atomic, throttled publish to disk for the ESP/DSP worker processes to
//! pick up.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::DerivedKeyMaterial;
use crate::route::RouteId;

/// AEAD identifier is fixed, never negotiated.
pub const AEAD_ID: &str = "aes-gcm-16-icv";

const PUBLISH_THROTTLE: Duration = Duration::from_secs(1);

/// One directional SA record, as held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaRecord {
    pub route: RouteId,
    pub spi: u32,
    pub key: [u8; 16],
    pub salt: [u8; 4],
}

impl SaRecord {
    pub fn new(route: RouteId, spi: u32, material: DerivedKeyMaterial) -> Self {
        Self {
            route,
            spi,
            key: material.key,
            salt: material.salt,
        }
    }

    fn to_entry(&self) -> SaEntry {
        SaEntry {
            route: self.route.0.clone(),
            spi: self.spi,
            aead: AEAD_ID.to_string(),
            key: hex::encode(self.key),
            salt: hex::encode(self.salt),
        }
    }
}

/// Wire shape of one entry in the published database: `{route, spi, aead,
/// key: hex-32-chars, salt: hex-8-chars}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaEntry {
    pub route: String,
    pub spi: u32,
    pub aead: String,
    pub key: String,
    pub salt: String,
}

/// The serializable shape of the published SA database document, plus an
/// ambient `version` counter watchers can use to detect staleness without
/// re-hashing the file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaDbDocument {
    pub version: u64,
    pub outbound_sa: HashMap<u32, SaEntry>,
    pub inbound_sa: HashMap<u32, SaEntry>,
}

/// Which SPIs, in which map, belong to one route. Lets route teardown and
/// reconfiguration remove exactly their own entries without scanning every
/// SPI in the database.
#[derive(Debug, Default, Clone)]
struct RouteSaIndex {
    inbound: Vec<u32>,
    outbound: Vec<u32>,
}

/// In-memory SA database plus the bookkeeping needed to publish it
/// atomically, throttled to at most once per second.
#[derive(Debug, Default)]
pub struct SaDatabase {
    inbound: HashMap<u32, SaRecord>,
    outbound: HashMap<u32, SaRecord>,
    by_route: HashMap<RouteId, RouteSaIndex>,
    dirty: bool,
    version: u64,
    last_flush: Option<Instant>,
}

impl SaDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fatal condition if true: `spi` already names an inbound SA
    /// belonging to a *different* route.
    /// The caller (the manager) is the one that turns this into a process
    /// abort; the database itself only reports the collision.
    pub fn inbound_collides(&self, spi: u32, route: &RouteId) -> bool {
        self.inbound.get(&spi).is_some_and(|existing| &existing.route != route)
    }

    pub fn insert_inbound(&mut self, sa: SaRecord) {
        self.by_route.entry(sa.route.clone()).or_default().inbound.push(sa.spi);
        self.inbound.insert(sa.spi, sa);
        self.dirty = true;
    }

    pub fn insert_outbound(&mut self, sa: SaRecord) {
        self.by_route.entry(sa.route.clone()).or_default().outbound.push(sa.spi);
        self.outbound.insert(sa.spi, sa);
        self.dirty = true;
    }

    pub fn remove_inbound(&mut self, spi: u32) {
        if let Some(sa) = self.inbound.remove(&spi) {
            if let Some(idx) = self.by_route.get_mut(&sa.route) {
                idx.inbound.retain(|s| *s != spi);
            }
            self.dirty = true;
        }
    }

    pub fn remove_outbound(&mut self, spi: u32) {
        if let Some(sa) = self.outbound.remove(&spi) {
            if let Some(idx) = self.by_route.get_mut(&sa.route) {
                idx.outbound.retain(|s| *s != spi);
            }
            self.dirty = true;
        }
    }

    /// Remove every SA belonging to `route`, in both maps, without scanning
    /// SPIs that aren't its own.
    pub fn teardown_route(&mut self, route: &RouteId) {
        if let Some(idx) = self.by_route.remove(route) {
            for spi in idx.inbound {
                self.inbound.remove(&spi);
            }
            for spi in idx.outbound {
                self.outbound.remove(&spi);
            }
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn to_document(&self) -> SaDbDocument {
        SaDbDocument {
            version: self.version + 1,
            outbound_sa: self.outbound.iter().map(|(spi, sa)| (*spi, sa.to_entry())).collect(),
            inbound_sa: self.inbound.iter().map(|(spi, sa)| (*spi, sa.to_entry())).collect(),
        }
    }

    /// Publish the database if dirty and the throttle allows it. Writes to
    /// a sibling temp file and renames into place so a watcher never
    /// observes a half-written file. Returns whether a write actually
    /// happened.
    pub fn publish(&mut self, path: &Path, now: Instant) -> io::Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        if let Some(last) = self.last_flush {
            if now.duration_since(last) < PUBLISH_THROTTLE {
                return Ok(false);
            }
        }
        let doc = self.to_document();
        let body = serde_json::to_vec_pretty(&doc).map_err(io::Error::other)?;
        let tmp_path: PathBuf = {
            let mut p = path.as_os_str().to_owned();
            p.push(format!(".tmp-{}", std::process::id()));
            PathBuf::from(p)
        };
        std::fs::write(&tmp_path, &body)?;
        std::fs::rename(&tmp_path, path)?;

        self.version = doc.version;
        self.dirty = false;
        self.last_flush = Some(now);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(route: &str, spi: u32) -> SaRecord {
        SaRecord::new(route.into(), spi, DerivedKeyMaterial { key: [1u8; 16], salt: [2u8; 4] })
    }

    #[test]
    fn inbound_collision_is_detected_across_routes_only() {
        let mut db = SaDatabase::new();
        db.insert_inbound(sa("a", 300));
        assert!(!db.inbound_collides(300, &"a".into()));
        assert!(db.inbound_collides(300, &"b".into()));
        assert!(!db.inbound_collides(301, &"b".into()));
    }

    #[test]
    fn teardown_route_only_removes_its_own_spis() {
        let mut db = SaDatabase::new();
        db.insert_inbound(sa("a", 300));
        db.insert_outbound(sa("a", 301));
        db.insert_inbound(sa("b", 400));
        db.teardown_route(&"a".into());
        assert!(db.inbound.is_empty() || !db.inbound.contains_key(&300));
        assert!(db.inbound.contains_key(&400));
        assert!(!db.outbound.contains_key(&301));
    }

    #[test]
    fn publish_is_throttled_to_once_per_second() {
        let dir = std::env::temp_dir().join(format!("vita-ske-sadb-test-{}", std::process::id()));
        let path = dir.with_extension("json");
        let mut db = SaDatabase::new();
        db.insert_inbound(sa("a", 300));
        let t0 = Instant::now();
        assert!(db.publish(&path, t0).unwrap());
        db.insert_inbound(sa("a", 301));
        assert!(!db.publish(&path, t0 + Duration::from_millis(100)).unwrap());
        assert!(db.publish(&path, t0 + Duration::from_secs(2)).unwrap());
        std::fs::remove_file(&path).ok();
    }
}
