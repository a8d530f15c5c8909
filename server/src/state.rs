use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fairmap_shared::{Club, MarkerChange};
use tokio::sync::{RwLock, broadcast};
use tracing::warn;

use crate::config::{sse_broadcast_buffer, upstream_connect_timeout, upstream_http_timeout};
use crate::markers::{self, MarkerSet};
use crate::placement::PlacementState;
use crate::viewport::Viewport;

/// Pre-serialized SSE event, serialized once by the mutating handler and
/// shared by all clients via Arc.
#[derive(Debug, Clone)]
pub enum PreSerializedEvent {
    Snapshot { seq: u64, json: Arc<Bytes> },
    Update { seq: u64, json: Arc<Bytes> },
}

/// The marker set plus its pre-serialized payloads, versioned by `seq`.
#[derive(Debug)]
pub struct MarkerLayer {
    pub seq: u64,
    pub timestamp: String,
    pub set: MarkerSet,
    pub snapshot_json: Arc<Bytes>,
    pub markers_json: Arc<Bytes>,
}

impl Default for MarkerLayer {
    fn default() -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now().to_rfc3339(),
            set: MarkerSet::default(),
            snapshot_json: Arc::new(Bytes::new()),
            markers_json: Arc::new(Bytes::from_static(b"[]")),
        }
    }
}

/// Club display fields cached after a resolve, to spare the directory a
/// lookup per marker click.
#[derive(Debug, Clone)]
pub struct CachedClubDetail {
    pub club: Club,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AppState {
    pub placement: Arc<RwLock<PlacementState>>,
    pub marker_layer: Arc<RwLock<MarkerLayer>>,
    pub viewport: Arc<RwLock<Viewport>>,
    pub next_seq: Arc<AtomicU64>,
    pub event_tx: broadcast::Sender<PreSerializedEvent>,
    pub club_details: Arc<DashMap<String, CachedClubDetail>>,
    pub http_client: reqwest::Client,
    /// Base URL of the club directory / event location service.
    pub directory_url: String,
    pub event_id: String,
    pub observability: Arc<ObservabilityCounters>,
}

#[derive(Debug, Default)]
pub struct ObservabilityCounters {
    placement_clicks_total: AtomicU64,
    assignment_failures_total: AtomicU64,
    moves_total: AtomicU64,
    move_failures_total: AtomicU64,
    marker_refreshes_total: AtomicU64,
    resolve_requests_total: AtomicU64,
    resolve_misses_total: AtomicU64,
    detail_cache_hits_total: AtomicU64,
    detail_cache_misses_total: AtomicU64,
    invitation_requests_total: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ObservabilitySnapshot {
    pub placement_clicks_total: u64,
    pub assignment_failures_total: u64,
    pub moves_total: u64,
    pub move_failures_total: u64,
    pub marker_refreshes_total: u64,
    pub resolve_requests_total: u64,
    pub resolve_misses_total: u64,
    pub detail_cache_hits_total: u64,
    pub detail_cache_misses_total: u64,
    pub invitation_requests_total: u64,
}

impl ObservabilityCounters {
    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            placement_clicks_total: self.placement_clicks_total.load(Ordering::Relaxed),
            assignment_failures_total: self.assignment_failures_total.load(Ordering::Relaxed),
            moves_total: self.moves_total.load(Ordering::Relaxed),
            move_failures_total: self.move_failures_total.load(Ordering::Relaxed),
            marker_refreshes_total: self.marker_refreshes_total.load(Ordering::Relaxed),
            resolve_requests_total: self.resolve_requests_total.load(Ordering::Relaxed),
            resolve_misses_total: self.resolve_misses_total.load(Ordering::Relaxed),
            detail_cache_hits_total: self.detail_cache_hits_total.load(Ordering::Relaxed),
            detail_cache_misses_total: self.detail_cache_misses_total.load(Ordering::Relaxed),
            invitation_requests_total: self.invitation_requests_total.load(Ordering::Relaxed),
        }
    }

    pub fn record_placement_click(&self) {
        self.placement_clicks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_assignment_failure(&self) {
        self.assignment_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_move(&self) {
        self.moves_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_move_failure(&self) {
        self.move_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_marker_refresh(&self) {
        self.marker_refreshes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolve_request(&self) {
        self.resolve_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolve_miss(&self) {
        self.resolve_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detail_cache_hit(&self) {
        self.detail_cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detail_cache_miss(&self) {
        self.detail_cache_misses_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invitation_request(&self) {
        self.invitation_requests_total
            .fetch_add(1, Ordering::Relaxed);
    }
}

impl AppState {
    pub fn new(directory_url: String, event_id: String) -> Self {
        let (event_tx, _) = broadcast::channel(sse_broadcast_buffer());
        let request_timeout = upstream_http_timeout();
        let connect_timeout = upstream_connect_timeout();
        let http_client = reqwest::Client::builder()
            .user_agent("fairmap-server/0.1")
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .or_else(|e| {
                warn!(
                    error = %e,
                    "failed to build configured HTTP client, retrying without custom user-agent"
                );
                reqwest::Client::builder()
                    .timeout(request_timeout)
                    .connect_timeout(connect_timeout)
                    .build()
            })
            .unwrap_or_else(|e| {
                panic!("failed to build timeout-configured HTTP client: {e}");
            });
        Self {
            placement: Arc::new(RwLock::new(PlacementState::default())),
            marker_layer: Arc::new(RwLock::new(MarkerLayer::default())),
            viewport: Arc::new(RwLock::new(Viewport::default())),
            next_seq: Arc::new(AtomicU64::new(0)),
            event_tx,
            club_details: Arc::new(DashMap::new()),
            http_client,
            directory_url,
            event_id,
            observability: Arc::new(ObservabilityCounters::default()),
        }
    }

    /// Apply a mutation to the marker set, re-serialize the layer payloads,
    /// and broadcast an `Update` carrying the returned changes. No changes
    /// (or a serialization failure) leaves the layer as it was.
    pub async fn publish_marker_update<F>(&self, mutate: F) -> bool
    where
        F: FnOnce(&mut MarkerSet) -> Vec<MarkerChange>,
    {
        let mut layer = self.marker_layer.write().await;
        let changes = mutate(&mut layer.set);
        if changes.is_empty() {
            return false;
        }
        let Some(seq) = self.next_seq.load(Ordering::Relaxed).checked_add(1) else {
            warn!("marker stream sequence counter overflow");
            return false;
        };
        let timestamp = Utc::now().to_rfc3339();
        let markers = layer.set.markers();
        let Some((snapshot_json, markers_json)) = markers::serialize_layer(seq, &timestamp, &markers)
        else {
            return false;
        };
        let Some(update_json) = markers::update_payload(seq, &timestamp, &changes) else {
            return false;
        };

        layer.seq = seq;
        layer.timestamp = timestamp;
        layer.snapshot_json = snapshot_json;
        layer.markers_json = markers_json;
        self.next_seq.store(seq, Ordering::Relaxed);
        drop(layer);

        let _ = self.event_tx.send(PreSerializedEvent::Update {
            seq,
            json: update_json,
        });
        true
    }

    /// Rebuild the marker set from a placed-club fetch, re-serialize, and
    /// broadcast a full `Snapshot`. Returns `(marker count, skipped)` or
    /// None when the payloads could not be serialized.
    pub async fn publish_marker_snapshot(&self, placed: &[Club]) -> Option<(usize, usize)> {
        let mut layer = self.marker_layer.write().await;
        let skipped = layer.set.rebuild(placed);
        let count = layer.set.len();
        let Some(seq) = self.next_seq.load(Ordering::Relaxed).checked_add(1) else {
            warn!("marker stream sequence counter overflow");
            return None;
        };
        let timestamp = Utc::now().to_rfc3339();
        let markers = layer.set.markers();
        let (snapshot_json, markers_json) = markers::serialize_layer(seq, &timestamp, &markers)?;

        layer.seq = seq;
        layer.timestamp = timestamp;
        layer.snapshot_json = Arc::clone(&snapshot_json);
        layer.markers_json = markers_json;
        self.next_seq.store(seq, Ordering::Relaxed);
        drop(layer);

        let _ = self.event_tx.send(PreSerializedEvent::Snapshot {
            seq,
            json: snapshot_json,
        });
        Some((count, skipped))
    }
}
