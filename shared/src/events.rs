use serde::{Deserialize, Serialize};

use crate::club::Coordinates;

/// One visual marker on the event map, mirroring a placed club. The color
/// is derived from the category tag so every client tints it identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub club_id: String,
    pub name: String,
    pub category: String,
    pub color: (u8, u8, u8),
    pub position: Coordinates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MarkerEvent {
    Snapshot {
        #[serde(default)]
        seq: u64,
        markers: Vec<Marker>,
        timestamp: String,
    },
    Update {
        #[serde(default)]
        seq: u64,
        changes: Vec<MarkerChange>,
        timestamp: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum MarkerChange {
    Added { marker: Marker },
    Removed { club_id: String },
}
