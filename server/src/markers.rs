use std::sync::Arc;

use bytes::Bytes;
use fairmap_shared::{Club, Coordinates, Marker, MarkerChange, category_color};
use tracing::warn;

/// Synchronization phase of the marker set against the directory:
/// `Stale` from any coordinate-mutating action elsewhere until the next
/// rebuild from a placed-club fetch completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Stale,
    Consistent,
}

/// The live marker set, one marker per placed club. Each marker carries
/// its club's stable id, so a clicked marker resolves to its club without
/// a spatial round trip through the directory.
#[derive(Debug)]
pub struct MarkerSet {
    markers: Vec<Marker>,
    phase: SyncPhase,
}

impl Default for MarkerSet {
    fn default() -> Self {
        Self {
            markers: Vec::new(),
            phase: SyncPhase::Stale,
        }
    }
}

impl MarkerSet {
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn get(&self, club_id: &str) -> Option<&Marker> {
        self.markers.iter().find(|m| m.club_id == club_id)
    }

    /// Markers in stable (club id) order, for deterministic payloads.
    pub fn markers(&self) -> Vec<Marker> {
        let mut markers = self.markers.clone();
        markers.sort_by(|a, b| a.club_id.cmp(&b.club_id));
        markers
    }

    /// Exact-position lookup used to resolve a clicked marker back to its
    /// club. Positions come back verbatim from the marker layer, so bitwise
    /// equality is the correct join here.
    pub fn find_at(&self, position: Coordinates) -> Option<&Marker> {
        self.markers
            .iter()
            .find(|m| m.position.x == position.x && m.position.y == position.y)
    }

    /// Ad-hoc marker for an optimistic placement. Replaces any marker the
    /// club already had. The phase is unchanged: the marker mirrors the
    /// placement that was just requested, not a drifted snapshot.
    pub fn add(&mut self, club: &Club, position: Coordinates) -> Marker {
        let marker = Marker {
            club_id: club.id.clone(),
            name: club.name.clone(),
            color: category_color(&club.category),
            category: club.category.clone(),
            position,
        };
        self.markers.retain(|m| m.club_id != club.id);
        self.markers.push(marker.clone());
        marker
    }

    pub fn remove(&mut self, club_id: &str) -> Option<Marker> {
        let index = self.markers.iter().position(|m| m.club_id == club_id)?;
        Some(self.markers.remove(index))
    }

    pub fn mark_stale(&mut self) {
        self.phase = SyncPhase::Stale;
    }

    /// Full teardown and rebuild from a placed-club fetch. Entries without
    /// coordinates should not occur in the directory's placed response but
    /// are skipped rather than trusted; the skip count is returned so the
    /// caller can log it. Idempotent for an unchanged fetch result.
    pub fn rebuild(&mut self, placed: &[Club]) -> usize {
        self.markers.clear();
        let mut skipped = 0;
        for club in placed {
            match club.coordinates {
                Some(position) => {
                    self.add(club, position);
                }
                None => skipped += 1,
            }
        }
        self.phase = SyncPhase::Consistent;
        skipped
    }
}

#[derive(serde::Serialize)]
#[serde(tag = "type")]
enum SerializedMarkerEvent<'a> {
    Update {
        seq: u64,
        changes: &'a [MarkerChange],
        timestamp: &'a str,
    },
}

/// Serialize the SSE snapshot payload and the bare marker-list payload in
/// one pass. Serialized once per mutation, shared by all clients via `Arc`.
pub fn serialize_layer(
    seq: u64,
    timestamp: &str,
    markers: &[Marker],
) -> Option<(Arc<Bytes>, Arc<Bytes>)> {
    let markers_vec = match serde_json::to_vec(markers) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to serialize marker list: {e}");
            return None;
        }
    };
    let timestamp_json = match serde_json::to_string(timestamp) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to serialize marker timestamp: {e}");
            return None;
        }
    };
    let seq_json = seq.to_string();

    let mut snapshot_buf = Vec::with_capacity(markers_vec.len() + 96);
    snapshot_buf.extend_from_slice(b"{\"type\":\"Snapshot\",\"seq\":");
    snapshot_buf.extend_from_slice(seq_json.as_bytes());
    snapshot_buf.extend_from_slice(b",\"markers\":");
    snapshot_buf.extend_from_slice(&markers_vec);
    snapshot_buf.extend_from_slice(b",\"timestamp\":");
    snapshot_buf.extend_from_slice(timestamp_json.as_bytes());
    snapshot_buf.push(b'}');

    Some((
        Arc::new(Bytes::from(snapshot_buf)),
        Arc::new(Bytes::from(markers_vec)),
    ))
}

pub fn update_payload(seq: u64, timestamp: &str, changes: &[MarkerChange]) -> Option<Arc<Bytes>> {
    match serde_json::to_vec(&SerializedMarkerEvent::Update {
        seq,
        changes,
        timestamp,
    }) {
        Ok(json) => Some(Arc::new(Bytes::from(json))),
        Err(e) => {
            warn!("failed to serialize marker update event: {e}");
            None
        }
    }
}
