use std::fmt::Write as _;

use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use fairmap_shared::{Club, Coordinates, InvitationReport, MarkerChange};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{MAX_CLUB_DETAIL_ENTRIES, club_detail_cache_ttl_secs};
use crate::directory;
use crate::markers::SyncPhase;
use crate::placement::PlacementState;
use crate::state::{AppState, CachedClubDetail, ObservabilitySnapshot};
use crate::viewport::Viewport;

/// Coordinator state as the UI sees it: the category queue, the current
/// selection, and the knobs around them.
#[derive(Debug, Serialize)]
pub struct PlacementSnapshot {
    pub category: Option<String>,
    pub placement_mode: bool,
    pub categories: Vec<String>,
    pub queue: Vec<Club>,
    pub selection: Option<String>,
    pub moving: Option<String>,
    pub pending: Vec<String>,
}

fn placement_snapshot(placement: &PlacementState) -> PlacementSnapshot {
    PlacementSnapshot {
        category: placement.category().map(str::to_owned),
        placement_mode: placement.placement_mode(),
        categories: placement.categories(),
        queue: placement.queue().to_vec(),
        selection: placement.selection().map(str::to_owned),
        moving: placement.moving().map(|c| c.id.clone()),
        pending: placement.pending().iter().map(|p| p.club.id.clone()).collect(),
    }
}

pub async fn get_placement_state(State(state): State<AppState>) -> Json<PlacementSnapshot> {
    let placement = state.placement.read().await;
    Json(placement_snapshot(&placement))
}

#[derive(Debug, Deserialize)]
pub struct CategoryRequest {
    pub category: String,
}

pub async fn set_category(
    State(state): State<AppState>,
    Json(request): Json<CategoryRequest>,
) -> Result<Json<PlacementSnapshot>, StatusCode> {
    let category = request.category.trim();
    if category.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut placement = state.placement.write().await;
    placement.set_category(category);
    Ok(Json(placement_snapshot(&placement)))
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub active: bool,
}

pub async fn set_placement_mode(
    State(state): State<AppState>,
    Json(request): Json<ModeRequest>,
) -> Json<PlacementSnapshot> {
    let mut placement = state.placement.write().await;
    placement.set_placement_mode(request.active);
    Json(placement_snapshot(&placement))
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub club_id: String,
}

#[derive(Debug, Serialize)]
pub struct SelectOutcome {
    pub selected: bool,
    pub selection: Option<String>,
}

pub async fn select_club(
    State(state): State<AppState>,
    Json(request): Json<SelectRequest>,
) -> Json<SelectOutcome> {
    let mut placement = state.placement.write().await;
    let selected = placement.select_in_queue(&request.club_id);
    Json(SelectOutcome {
        selected,
        selection: placement.selection().map(str::to_owned),
    })
}

/// Re-fetch the unplaced-club snapshot from the directory. The explicit
/// retry path for a failed fetch: prior state stays live on error.
pub async fn reload_clubs(
    State(state): State<AppState>,
) -> Result<Json<PlacementSnapshot>, (StatusCode, String)> {
    let clubs =
        directory::fetch_unplaced_clubs(&state.http_client, &state.directory_url, &state.event_id)
            .await
            .map_err(|e| {
                warn!(error = %e, "unplaced-club fetch failed; keeping previous snapshot");
                (StatusCode::BAD_GATEWAY, format!("club fetch failed: {e}"))
            })?;

    let mut placement = state.placement.write().await;
    placement.set_known_clubs(clubs);
    Ok(Json(placement_snapshot(&placement)))
}

#[derive(Debug, Deserialize)]
pub struct ClickRequest {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Serialize)]
pub struct ClickOutcome {
    /// Whether the click consumed a club. False for the defined no-ops
    /// (mode off, empty queue) and for a rolled-back assignment.
    pub placed: bool,
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub club: Option<Club>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_selection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A map click in placement mode: pop the selection, drop a marker at the
/// click position, then ask the directory to persist the assignment. The
/// queue advances before the directory answers; a rejected assignment is
/// compensated by re-queuing the club at the front and tearing its marker
/// down again.
pub async fn place_club(
    State(state): State<AppState>,
    Json(request): Json<ClickRequest>,
) -> Json<ClickOutcome> {
    let position = Coordinates::new(request.x, request.y);

    let popped = {
        let mut placement = state.placement.write().await;
        placement.place_at(position)
    };
    let Some(club) = popped else {
        return Json(ClickOutcome {
            placed: false,
            confirmed: false,
            club: None,
            next_selection: None,
            error: None,
        });
    };
    state.observability.record_placement_click();

    state
        .publish_marker_update(|set| {
            let marker = set.add(&club, position);
            vec![MarkerChange::Added { marker }]
        })
        .await;

    match directory::assign_coordinates(&state.http_client, &state.directory_url, &club.id, position)
        .await
    {
        Ok(()) => {
            let mut placement = state.placement.write().await;
            if !placement.confirm_assignment(&club.id) {
                warn!(club = %club.id, "assignment ack matched no pending entry; ignoring");
            }
            let next_selection = placement.selection().map(str::to_owned);
            drop(placement);
            Json(ClickOutcome {
                placed: true,
                confirmed: true,
                club: Some(club),
                next_selection,
                error: None,
            })
        }
        Err(e) => {
            warn!(club = %club.id, error = %e, "coordinate assignment rejected; re-queuing at front");
            state.observability.record_assignment_failure();
            let restored = {
                let mut placement = state.placement.write().await;
                placement.fail_assignment(&club.id)
            };
            if restored.is_some() {
                state
                    .publish_marker_update(|set| match set.remove(&club.id) {
                        Some(_) => vec![MarkerChange::Removed {
                            club_id: club.id.clone(),
                        }],
                        None => Vec::new(),
                    })
                    .await;
            }
            let next_selection = state.placement.read().await.selection().map(str::to_owned);
            Json(ClickOutcome {
                placed: false,
                confirmed: false,
                club: Some(club),
                next_selection,
                error: Some(e),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub club_id: String,
}

/// The move workflow: un-place an already-positioned club and re-admit it
/// at the front of its category's queue. The directory clear runs first;
/// if it is rejected the move is abandoned with nothing changed.
pub async fn move_club(
    State(state): State<AppState>,
    Json(request): Json<MoveRequest>,
) -> Result<Json<PlacementSnapshot>, (StatusCode, String)> {
    let marker_club = {
        let layer = state.marker_layer.read().await;
        layer.set.get(&request.club_id).map(|m| Club {
            id: m.club_id.clone(),
            name: m.name.clone(),
            description: String::new(),
            category: m.category.clone(),
            coordinates: Some(m.position),
        })
    };
    let Some(fallback_club) = marker_club else {
        return Err((
            StatusCode::NOT_FOUND,
            format!("club {} has no marker on the map", request.club_id),
        ));
    };
    state.observability.record_move();

    if let Err(e) =
        directory::clear_coordinates(&state.http_client, &state.directory_url, &request.club_id)
            .await
    {
        state.observability.record_move_failure();
        warn!(club = %request.club_id, error = %e, "coordinate clear rejected; move abandoned");
        return Err((
            StatusCode::BAD_GATEWAY,
            format!("move of club {} abandoned: {e}", request.club_id),
        ));
    }

    // The club is un-placed server-side now: bring the marker layer back to
    // consistent and the known-club snapshot up to date before re-queuing.
    match directory::fetch_placed_clubs(&state.http_client, &state.directory_url, &state.event_id)
        .await
    {
        Ok(placed) => {
            state.publish_marker_snapshot(&placed).await;
            state.observability.record_marker_refresh();
        }
        Err(e) => {
            warn!(error = %e, "marker refresh after move failed; marker layer left stale");
            state.marker_layer.write().await.set.mark_stale();
        }
    }

    let known =
        match directory::fetch_unplaced_clubs(&state.http_client, &state.directory_url, &state.event_id)
            .await
        {
            Ok(clubs) => Some(clubs),
            Err(e) => {
                warn!(error = %e, "unplaced fetch after move failed; keeping previous snapshot");
                None
            }
        };

    let mut placement = state.placement.write().await;
    if let Some(clubs) = known {
        placement.set_known_clubs(clubs);
    }
    let moving = placement
        .find_known(&request.club_id)
        .cloned()
        .unwrap_or(fallback_club);
    let category = moving.category.clone();
    placement.set_moving(moving);
    placement.set_category(&category);
    Ok(Json(placement_snapshot(&placement)))
}

/// Serve the pre-serialized marker list without re-serializing per request.
pub async fn get_markers(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let (etag, json) = {
        let layer = state.marker_layer.read().await;
        (markers_etag(layer.seq), layer.markers_json.clone())
    };

    if if_none_match_matches(&headers, &etag) {
        return not_modified_response("public, max-age=5", Some(etag.as_str()));
    }

    json_bytes_response((*json).clone(), "public, max-age=5", Some(etag.as_str()))
}

#[derive(Debug, Serialize)]
pub struct RefreshOutcome {
    pub markers: usize,
    pub skipped: usize,
}

/// Tear down every marker and rebuild from the directory's placed-club
/// list. Safe to call redundantly.
pub async fn refresh_markers(
    State(state): State<AppState>,
) -> Result<Json<RefreshOutcome>, (StatusCode, String)> {
    let placed =
        directory::fetch_placed_clubs(&state.http_client, &state.directory_url, &state.event_id)
            .await
            .map_err(|e| {
                warn!(error = %e, "placed-club fetch failed; marker layer unchanged");
                (StatusCode::BAD_GATEWAY, format!("placed-club fetch failed: {e}"))
            })?;

    let Some((markers, skipped)) = state.publish_marker_snapshot(&placed).await else {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to serialize marker payloads".to_string(),
        ));
    };
    state.observability.record_marker_refresh();
    if skipped > 0 {
        warn!(skipped, "placed-club response carried entries without coordinates");
    }
    Ok(Json(RefreshOutcome { markers, skipped }))
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Serialize)]
pub struct ResolveOutcome {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub club: Option<Club>,
}

/// Resolve a clicked marker back to its club. The marker itself carries the
/// club id; the directory lookup only fills in display fields, cached for a
/// short TTL.
pub async fn resolve_marker(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<ResolveOutcome>, (StatusCode, String)> {
    state.observability.record_resolve_request();
    let position = Coordinates::new(query.x, query.y);

    let marker = {
        let layer = state.marker_layer.read().await;
        layer.set.find_at(position).cloned()
    };
    let Some(marker) = marker else {
        state.observability.record_resolve_miss();
        return Ok(Json(ResolveOutcome {
            found: false,
            club: None,
        }));
    };

    if let Some(cached) = state.club_details.get(&marker.club_id) {
        let age = Utc::now()
            .signed_duration_since(cached.fetched_at)
            .num_seconds();
        if age < club_detail_cache_ttl_secs() {
            state.observability.record_detail_cache_hit();
            return Ok(Json(ResolveOutcome {
                found: true,
                club: Some(cached.club.clone()),
            }));
        }
    }
    state.observability.record_detail_cache_miss();

    match directory::find_by_coordinates(&state.http_client, &state.directory_url, marker.position)
        .await
    {
        Ok(Some(club)) => {
            cache_club_detail(&state, club.clone());
            Ok(Json(ResolveOutcome {
                found: true,
                club: Some(club),
            }))
        }
        Ok(None) => {
            // The marker exists locally but the directory no longer knows a
            // club at that position: missing-detail state, not a crash.
            state.observability.record_resolve_miss();
            Ok(Json(ResolveOutcome {
                found: false,
                club: None,
            }))
        }
        Err(e) => {
            warn!(club = %marker.club_id, error = %e, "coordinate lookup failed");
            Err((StatusCode::BAD_GATEWAY, format!("marker resolution failed: {e}")))
        }
    }
}

pub async fn get_viewport(State(state): State<AppState>) -> Json<Viewport> {
    Json(*state.viewport.read().await)
}

#[derive(Debug, Deserialize)]
pub struct ViewportUpdate {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub zoom: Option<f64>,
}

/// Organic pans and zooms from the viewer. Local state only; the saved
/// event location is never written back from here.
pub async fn update_viewport(
    State(state): State<AppState>,
    Json(request): Json<ViewportUpdate>,
) -> Json<Viewport> {
    let mut viewport = state.viewport.write().await;
    viewport.update(request.x, request.y, request.zoom);
    Json(*viewport)
}

pub async fn send_invitations(
    State(state): State<AppState>,
) -> Result<Json<InvitationReport>, (StatusCode, String)> {
    state.observability.record_invitation_request();
    directory::send_invitations(&state.http_client, &state.directory_url, &state.event_id)
        .await
        .map(Json)
        .map_err(|e| {
            warn!(error = %e, "invitation send failed");
            (StatusCode::BAD_GATEWAY, format!("invitation send failed: {e}"))
        })
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (queue_len, pending, placement_mode) = {
        let placement = state.placement.read().await;
        (
            placement.queue().len(),
            placement.pending().len(),
            placement.placement_mode(),
        )
    };
    let (marker_count, marker_phase) = {
        let layer = state.marker_layer.read().await;
        (layer.set.len(), layer.set.phase())
    };
    let observability = state.observability.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "event": state.event_id,
        "queue_clubs": queue_len,
        "pending_assignments": pending,
        "placement_mode": placement_mode,
        "markers": marker_count,
        "marker_phase": match marker_phase {
            SyncPhase::Consistent => "consistent",
            SyncPhase::Stale => "stale",
        },
        "detail_cache_size": state.club_details.len(),
        "observability": {
            "placement_clicks_total": observability.placement_clicks_total,
            "assignment_failures_total": observability.assignment_failures_total,
            "moves_total": observability.moves_total,
            "move_failures_total": observability.move_failures_total,
            "marker_refreshes_total": observability.marker_refreshes_total,
            "resolve_requests_total": observability.resolve_requests_total,
            "resolve_misses_total": observability.resolve_misses_total,
            "detail_cache_hits_total": observability.detail_cache_hits_total,
            "detail_cache_misses_total": observability.detail_cache_misses_total,
            "invitation_requests_total": observability.invitation_requests_total,
        }
    }))
}

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let (queue_len, pending, placement_mode) = {
        let placement = state.placement.read().await;
        (
            placement.queue().len(),
            placement.pending().len(),
            placement.placement_mode(),
        )
    };
    let (marker_count, consistent) = {
        let layer = state.marker_layer.read().await;
        (layer.set.len(), layer.set.phase() == SyncPhase::Consistent)
    };
    let observability = state.observability.snapshot();

    let body = render_prometheus_metrics(
        queue_len,
        pending,
        marker_count,
        placement_mode,
        consistent,
        observability,
    );

    (
        [
            (header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
}

fn render_prometheus_metrics(
    queue_len: usize,
    pending: usize,
    marker_count: usize,
    placement_mode: bool,
    consistent: bool,
    observability: ObservabilitySnapshot,
) -> String {
    let mut body = String::new();
    write_metric(
        &mut body,
        "fairmap_queue_clubs",
        "gauge",
        "Clubs currently queued for placement in the selected category.",
        queue_len as u64,
    );
    write_metric(
        &mut body,
        "fairmap_pending_assignments",
        "gauge",
        "Optimistic coordinate assignments awaiting directory acknowledgement.",
        pending as u64,
    );
    write_metric(
        &mut body,
        "fairmap_markers",
        "gauge",
        "Markers currently on the event map.",
        marker_count as u64,
    );
    write_metric(
        &mut body,
        "fairmap_placement_mode",
        "gauge",
        "Whether placement mode is active (1 or 0).",
        u64::from(placement_mode),
    );
    write_metric(
        &mut body,
        "fairmap_marker_layer_consistent",
        "gauge",
        "Whether the marker layer matches the last placed-club fetch (1 or 0).",
        u64::from(consistent),
    );
    write_metric(
        &mut body,
        "fairmap_placement_clicks_total",
        "counter",
        "Total map clicks that consumed a queued club.",
        observability.placement_clicks_total,
    );
    write_metric(
        &mut body,
        "fairmap_assignment_failures_total",
        "counter",
        "Total coordinate assignments rejected after an optimistic pop.",
        observability.assignment_failures_total,
    );
    write_metric(
        &mut body,
        "fairmap_moves_total",
        "counter",
        "Total move-club workflows started.",
        observability.moves_total,
    );
    write_metric(
        &mut body,
        "fairmap_move_failures_total",
        "counter",
        "Total move-club workflows abandoned on a rejected clear.",
        observability.move_failures_total,
    );
    write_metric(
        &mut body,
        "fairmap_marker_refreshes_total",
        "counter",
        "Total full marker rebuilds from a placed-club fetch.",
        observability.marker_refreshes_total,
    );
    write_metric(
        &mut body,
        "fairmap_resolve_requests_total",
        "counter",
        "Total marker click resolutions requested.",
        observability.resolve_requests_total,
    );
    write_metric(
        &mut body,
        "fairmap_resolve_misses_total",
        "counter",
        "Total marker resolutions that matched no club.",
        observability.resolve_misses_total,
    );
    write_metric(
        &mut body,
        "fairmap_detail_cache_hits_total",
        "counter",
        "Total club detail lookups served from cache.",
        observability.detail_cache_hits_total,
    );
    write_metric(
        &mut body,
        "fairmap_detail_cache_misses_total",
        "counter",
        "Total club detail lookups sent to the directory.",
        observability.detail_cache_misses_total,
    );
    write_metric(
        &mut body,
        "fairmap_invitation_requests_total",
        "counter",
        "Total batch invitation sends requested.",
        observability.invitation_requests_total,
    );
    body
}

fn write_metric(body: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(body, "# HELP {name} {help}");
    let _ = writeln!(body, "# TYPE {name} {kind}");
    let _ = writeln!(body, "{name} {value}");
}

fn cache_club_detail(state: &AppState, club: Club) {
    if !state.club_details.contains_key(&club.id) {
        while state.club_details.len() >= MAX_CLUB_DETAIL_ENTRIES {
            if !evict_oldest_detail_entry(state) {
                break;
            }
        }
    }

    state.club_details.insert(
        club.id.clone(),
        CachedClubDetail {
            club,
            fetched_at: Utc::now(),
        },
    );
}

fn evict_oldest_detail_entry(state: &AppState) -> bool {
    let Some(oldest_id) = state
        .club_details
        .iter()
        .min_by_key(|entry| entry.value().fetched_at)
        .map(|entry| entry.key().clone())
    else {
        return false;
    };
    state.club_details.remove(&oldest_id).is_some()
}

fn markers_etag(seq: u64) -> String {
    format!("\"markers-{seq}\"")
}

fn json_bytes_response(body: Bytes, cache_control: &'static str, etag: Option<&str>) -> Response {
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache_control),
    );
    if let Some(etag) = etag
        && let Ok(etag_header) = HeaderValue::from_str(etag)
    {
        headers.insert(header::ETAG, etag_header);
    }
    response
}

fn not_modified_response(cache_control: &'static str, etag: Option<&str>) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache_control),
    );
    if let Some(etag) = etag
        && let Ok(etag_header) = HeaderValue::from_str(etag)
    {
        headers.insert(header::ETAG, etag_header);
    }
    response
}

fn normalize_etag(candidate: &str) -> &str {
    candidate.strip_prefix("W/").unwrap_or(candidate).trim()
}

fn if_none_match_matches(headers: &HeaderMap, etag: &str) -> bool {
    let Some(value) = headers.get(header::IF_NONE_MATCH) else {
        return false;
    };
    let Ok(raw) = value.to_str() else {
        return false;
    };

    raw.split(',').any(|candidate| {
        let candidate = candidate.trim();
        candidate == "*" || normalize_etag(candidate) == normalize_etag(etag)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::{get, patch, post};
    use axum::{Json, Router};
    use fairmap_shared::{Club, Coordinates, InvitationReport};
    use serde_json::json;
    use tokio::sync::Mutex;

    use crate::state::AppState;

    /// Canned stand-in for the club directory / event location service:
    /// payloads are served verbatim, club updates are recorded and can be
    /// made to fail.
    #[derive(Default)]
    struct StubDirectory {
        location: serde_json::Value,
        unplaced: serde_json::Value,
        placed: serde_json::Value,
        lookup: HashMap<String, serde_json::Value>,
        invitations: serde_json::Value,
        reject_updates: AtomicBool,
        updates: Mutex<Vec<(String, serde_json::Value)>>,
    }

    async fn stub_location(State(stub): State<Arc<StubDirectory>>) -> Json<serde_json::Value> {
        Json(stub.location.clone())
    }

    #[derive(serde::Deserialize)]
    struct StubClubsQuery {
        #[serde(default)]
        placed: Option<String>,
    }

    async fn stub_clubs(
        State(stub): State<Arc<StubDirectory>>,
        Query(query): Query<StubClubsQuery>,
    ) -> Json<serde_json::Value> {
        if query.placed.as_deref() == Some("true") {
            Json(stub.placed.clone())
        } else {
            Json(stub.unplaced.clone())
        }
    }

    async fn stub_update(
        State(stub): State<Arc<StubDirectory>>,
        axum::extract::Path(club_id): axum::extract::Path<String>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        stub.updates.lock().await.push((club_id, body));
        if stub.reject_updates.load(Ordering::Relaxed) {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }

    #[derive(serde::Deserialize)]
    struct StubLookupQuery {
        x: f64,
        y: f64,
    }

    async fn stub_lookup(
        State(stub): State<Arc<StubDirectory>>,
        Query(query): Query<StubLookupQuery>,
    ) -> Result<Json<serde_json::Value>, StatusCode> {
        let key = format!("{},{}", query.x, query.y);
        stub.lookup
            .get(&key)
            .cloned()
            .map(Json)
            .ok_or(StatusCode::NOT_FOUND)
    }

    async fn stub_invitations(State(stub): State<Arc<StubDirectory>>) -> Json<serde_json::Value> {
        Json(stub.invitations.clone())
    }

    fn stub_router(stub: Arc<StubDirectory>) -> Router {
        Router::new()
            .route("/api/events/{event}/location", get(stub_location))
            .route("/api/events/{event}/clubs", get(stub_clubs))
            .route("/api/events/{event}/invitations", post(stub_invitations))
            .route("/api/clubs/lookup", get(stub_lookup))
            .route("/api/clubs/{id}", patch(stub_update))
            .with_state(stub)
    }

    async fn spawn_stub_directory(
        stub: Arc<StubDirectory>,
    ) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub address");
        let app = stub_router(stub);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve stub directory");
        });
        (format!("http://{addr}"), handle)
    }

    async fn spawn_test_server(state: AppState) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener address");
        let app = crate::app::build_app(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve test app");
        });
        (addr, handle)
    }

    fn placed_club(id: &str, name: &str, category: &str, x: f64, y: f64) -> Club {
        Club {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            category: category.to_string(),
            coordinates: Some(Coordinates::new(x, y)),
        }
    }

    fn fair_unplaced_payload() -> serde_json::Value {
        json!([
            {"id": "a", "name": "Archery", "category": "sports"},
            {"id": "b", "name": "Board Games", "category": "games"},
            {"id": "c", "name": "Chess", "category": "games"}
        ])
    }

    #[tokio::test]
    async fn click_flow_places_the_selected_club_and_advances_the_queue() {
        let stub = Arc::new(StubDirectory {
            unplaced: fair_unplaced_payload(),
            placed: json!([]),
            ..StubDirectory::default()
        });
        let (directory_url, directory_handle) = spawn_stub_directory(Arc::clone(&stub)).await;
        let state = AppState::new(directory_url, "evt-1".to_string());
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        client
            .post(format!("{base_url}/api/placement/reload"))
            .send()
            .await
            .expect("reload request")
            .error_for_status()
            .expect("reload status");

        let snapshot = client
            .post(format!("{base_url}/api/placement/category"))
            .json(&json!({"category": "games"}))
            .send()
            .await
            .expect("category request")
            .error_for_status()
            .expect("category status")
            .json::<serde_json::Value>()
            .await
            .expect("parse category snapshot");
        assert_eq!(snapshot["queue"].as_array().map(Vec::len), Some(2));
        assert_eq!(snapshot["selection"], "b");
        assert_eq!(snapshot["categories"], json!(["sports", "games"]));

        client
            .post(format!("{base_url}/api/placement/mode"))
            .json(&json!({"active": true}))
            .send()
            .await
            .expect("mode request")
            .error_for_status()
            .expect("mode status");

        let outcome = client
            .post(format!("{base_url}/api/placement/click"))
            .json(&json!({"x": 10.0, "y": 20.0}))
            .send()
            .await
            .expect("click request")
            .error_for_status()
            .expect("click status")
            .json::<serde_json::Value>()
            .await
            .expect("parse click outcome");
        assert_eq!(outcome["placed"], true);
        assert_eq!(outcome["confirmed"], true);
        assert_eq!(outcome["club"]["id"], "b");
        assert_eq!(outcome["next_selection"], "c");

        let markers = client
            .get(format!("{base_url}/api/markers"))
            .send()
            .await
            .expect("markers request")
            .error_for_status()
            .expect("markers status")
            .json::<serde_json::Value>()
            .await
            .expect("parse markers");
        let markers = markers.as_array().expect("markers should be a list");
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0]["club_id"], "b");
        assert_eq!(markers[0]["position"], json!({"x": 10.0, "y": 20.0}));

        let updates = stub.updates.lock().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "b");
        assert_eq!(updates[0].1, json!({"action": "assign", "x": 10.0, "y": 20.0}));
        drop(updates);

        server_handle.abort();
        directory_handle.abort();
    }

    #[tokio::test]
    async fn rejected_assignment_requeues_the_club_and_removes_its_marker() {
        let stub = Arc::new(StubDirectory {
            unplaced: fair_unplaced_payload(),
            placed: json!([]),
            ..StubDirectory::default()
        });
        stub.reject_updates.store(true, Ordering::Relaxed);
        let (directory_url, directory_handle) = spawn_stub_directory(Arc::clone(&stub)).await;
        let state = AppState::new(directory_url, "evt-1".to_string());
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        client
            .post(format!("{base_url}/api/placement/reload"))
            .send()
            .await
            .expect("reload request")
            .error_for_status()
            .expect("reload status");
        client
            .post(format!("{base_url}/api/placement/category"))
            .json(&json!({"category": "games"}))
            .send()
            .await
            .expect("category request")
            .error_for_status()
            .expect("category status");
        client
            .post(format!("{base_url}/api/placement/mode"))
            .json(&json!({"active": true}))
            .send()
            .await
            .expect("mode request")
            .error_for_status()
            .expect("mode status");

        let outcome = client
            .post(format!("{base_url}/api/placement/click"))
            .json(&json!({"x": 10.0, "y": 20.0}))
            .send()
            .await
            .expect("click request")
            .json::<serde_json::Value>()
            .await
            .expect("parse click outcome");
        assert_eq!(outcome["placed"], false);
        assert_eq!(outcome["confirmed"], false);
        assert!(outcome["error"].is_string());

        let snapshot = client
            .get(format!("{base_url}/api/placement/state"))
            .send()
            .await
            .expect("state request")
            .json::<serde_json::Value>()
            .await
            .expect("parse state snapshot");
        let queue_ids: Vec<&str> = snapshot["queue"]
            .as_array()
            .expect("queue should be a list")
            .iter()
            .map(|c| c["id"].as_str().expect("club id"))
            .collect();
        assert_eq!(queue_ids, vec!["b", "c"]);
        assert_eq!(snapshot["pending"], json!([]));

        let markers = client
            .get(format!("{base_url}/api/markers"))
            .send()
            .await
            .expect("markers request")
            .json::<serde_json::Value>()
            .await
            .expect("parse markers");
        assert_eq!(markers.as_array().map(Vec::len), Some(0));

        server_handle.abort();
        directory_handle.abort();
    }

    #[tokio::test]
    async fn clicks_are_inert_while_placement_mode_is_off() {
        let stub = Arc::new(StubDirectory {
            unplaced: fair_unplaced_payload(),
            placed: json!([]),
            ..StubDirectory::default()
        });
        let (directory_url, directory_handle) = spawn_stub_directory(Arc::clone(&stub)).await;
        let state = AppState::new(directory_url, "evt-1".to_string());
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        client
            .post(format!("{base_url}/api/placement/reload"))
            .send()
            .await
            .expect("reload request")
            .error_for_status()
            .expect("reload status");
        client
            .post(format!("{base_url}/api/placement/category"))
            .json(&json!({"category": "games"}))
            .send()
            .await
            .expect("category request")
            .error_for_status()
            .expect("category status");

        let outcome = client
            .post(format!("{base_url}/api/placement/click"))
            .json(&json!({"x": 1.0, "y": 2.0}))
            .send()
            .await
            .expect("click request")
            .json::<serde_json::Value>()
            .await
            .expect("parse click outcome");
        assert_eq!(outcome["placed"], false);
        assert!(outcome.get("error").is_none() || outcome["error"].is_null());

        let snapshot = client
            .get(format!("{base_url}/api/placement/state"))
            .send()
            .await
            .expect("state request")
            .json::<serde_json::Value>()
            .await
            .expect("parse state snapshot");
        assert_eq!(snapshot["queue"].as_array().map(Vec::len), Some(2));

        assert!(stub.updates.lock().await.is_empty());

        server_handle.abort();
        directory_handle.abort();
    }

    #[tokio::test]
    async fn move_flow_requeues_the_club_at_the_front_of_its_category() {
        // The stub serves the post-clear view of the directory: "m" is no
        // longer placed and shows up in the unplaced list again.
        let stub = Arc::new(StubDirectory {
            unplaced: json!([
                {"id": "b", "name": "Board Games", "category": "games"},
                {"id": "c", "name": "Chess", "category": "games"},
                {"id": "m", "name": "Mahjong", "category": "games"}
            ]),
            placed: json!([]),
            ..StubDirectory::default()
        });
        let (directory_url, directory_handle) = spawn_stub_directory(Arc::clone(&stub)).await;
        let state = AppState::new(directory_url, "evt-1".to_string());
        state
            .publish_marker_snapshot(&[placed_club("m", "Mahjong", "games", 5.0, 5.0)])
            .await
            .expect("seed marker layer");
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        let snapshot = client
            .post(format!("{base_url}/api/placement/move"))
            .json(&json!({"club_id": "m"}))
            .send()
            .await
            .expect("move request")
            .error_for_status()
            .expect("move status")
            .json::<serde_json::Value>()
            .await
            .expect("parse move snapshot");

        assert_eq!(snapshot["category"], "games");
        let queue_ids: Vec<&str> = snapshot["queue"]
            .as_array()
            .expect("queue should be a list")
            .iter()
            .map(|c| c["id"].as_str().expect("club id"))
            .collect();
        assert_eq!(queue_ids, vec!["m", "b", "c"]);
        assert_eq!(snapshot["selection"], "m");
        assert_eq!(snapshot["moving"], serde_json::Value::Null);

        let markers = client
            .get(format!("{base_url}/api/markers"))
            .send()
            .await
            .expect("markers request")
            .json::<serde_json::Value>()
            .await
            .expect("parse markers");
        assert_eq!(markers.as_array().map(Vec::len), Some(0));

        let updates = stub.updates.lock().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "m");
        assert_eq!(updates[0].1, json!({"action": "clear"}));
        drop(updates);

        server_handle.abort();
        directory_handle.abort();
    }

    #[tokio::test]
    async fn rejected_clear_abandons_the_move_with_a_visible_error() {
        let stub = Arc::new(StubDirectory {
            unplaced: json!([]),
            placed: json!([]),
            ..StubDirectory::default()
        });
        stub.reject_updates.store(true, Ordering::Relaxed);
        let (directory_url, directory_handle) = spawn_stub_directory(Arc::clone(&stub)).await;
        let state = AppState::new(directory_url, "evt-1".to_string());
        state
            .publish_marker_snapshot(&[placed_club("m", "Mahjong", "games", 5.0, 5.0)])
            .await
            .expect("seed marker layer");
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base_url}/api/placement/move"))
            .json(&json!({"club_id": "m"}))
            .send()
            .await
            .expect("move request");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
        let body = response.text().await.expect("read error body");
        assert!(body.contains("m"));

        // Nothing moved: the marker is still on the map.
        let markers = client
            .get(format!("{base_url}/api/markers"))
            .send()
            .await
            .expect("markers request")
            .json::<serde_json::Value>()
            .await
            .expect("parse markers");
        assert_eq!(markers.as_array().map(Vec::len), Some(1));

        server_handle.abort();
        directory_handle.abort();
    }

    #[tokio::test]
    async fn resolve_returns_details_for_a_marker_and_caches_them() {
        let mut lookup = HashMap::new();
        lookup.insert(
            format!("{},{}", 5.0, 5.0),
            json!({
                "id": "m", "name": "Model UN", "description": "We travel and debate",
                "category": "academics", "coordinates": {"x": 5.0, "y": 5.0}
            }),
        );
        let stub = Arc::new(StubDirectory {
            lookup,
            ..StubDirectory::default()
        });
        let (directory_url, directory_handle) = spawn_stub_directory(Arc::clone(&stub)).await;
        let state = AppState::new(directory_url, "evt-1".to_string());
        state
            .publish_marker_snapshot(&[
                placed_club("m", "Model UN", "academics", 5.0, 5.0),
                placed_club("ghost", "Ghost", "games", 7.0, 7.0),
            ])
            .await
            .expect("seed marker layer");
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        let hit = client
            .get(format!("{base_url}/api/markers/resolve?x=5&y=5"))
            .send()
            .await
            .expect("resolve request")
            .error_for_status()
            .expect("resolve status")
            .json::<serde_json::Value>()
            .await
            .expect("parse resolve outcome");
        assert_eq!(hit["found"], true);
        assert_eq!(hit["club"]["description"], "We travel and debate");

        // Second click on the same marker is served from the detail cache.
        client
            .get(format!("{base_url}/api/markers/resolve?x=5&y=5"))
            .send()
            .await
            .expect("second resolve request")
            .error_for_status()
            .expect("second resolve status");
        let health = client
            .get(format!("{base_url}/api/health"))
            .send()
            .await
            .expect("health request")
            .json::<serde_json::Value>()
            .await
            .expect("parse health");
        assert_eq!(health["observability"]["detail_cache_hits_total"], 1);

        // No marker at the position: nothing to resolve.
        let miss = client
            .get(format!("{base_url}/api/markers/resolve?x=9&y=9"))
            .send()
            .await
            .expect("miss resolve request")
            .json::<serde_json::Value>()
            .await
            .expect("parse miss outcome");
        assert_eq!(miss["found"], false);

        // Marker exists locally but the directory knows no club there.
        let orphan = client
            .get(format!("{base_url}/api/markers/resolve?x=7&y=7"))
            .send()
            .await
            .expect("orphan resolve request")
            .json::<serde_json::Value>()
            .await
            .expect("parse orphan outcome");
        assert_eq!(orphan["found"], false);

        server_handle.abort();
        directory_handle.abort();
    }

    #[tokio::test]
    async fn markers_endpoint_returns_not_modified_when_etag_matches() {
        let state = AppState::new("http://127.0.0.1:9".to_string(), "evt-1".to_string());
        state
            .publish_marker_snapshot(&[placed_club("a", "Archery", "sports", 1.0, 2.0)])
            .await
            .expect("seed marker layer");
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        let first = client
            .get(format!("{base_url}/api/markers"))
            .send()
            .await
            .expect("markers request should succeed");
        let first_status = first.status();
        let first_etag = first
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .expect("etag header should be present");
        assert_eq!(first_status, reqwest::StatusCode::OK);

        let second = client
            .get(format!("{base_url}/api/markers"))
            .header(reqwest::header::IF_NONE_MATCH, first_etag)
            .send()
            .await
            .expect("conditional markers request should succeed");
        assert_eq!(second.status(), reqwest::StatusCode::NOT_MODIFIED);
        assert_eq!(
            second
                .headers()
                .get(reqwest::header::CACHE_CONTROL)
                .and_then(|value| value.to_str().ok()),
            Some("public, max-age=5")
        );

        server_handle.abort();
    }

    #[tokio::test]
    async fn viewport_updates_are_local_and_partial() {
        let state = AppState::new("http://127.0.0.1:9".to_string(), "evt-1".to_string());
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        let updated = client
            .post(format!("{base_url}/api/viewport"))
            .json(&json!({"x": 12.5, "zoom": 16.0}))
            .send()
            .await
            .expect("viewport update request")
            .error_for_status()
            .expect("viewport update status")
            .json::<serde_json::Value>()
            .await
            .expect("parse viewport");
        assert_eq!(updated["center"]["x"], 12.5);
        assert_eq!(updated["center"]["y"], 0.0);
        assert_eq!(updated["zoom"], 16.0);

        let fetched = client
            .get(format!("{base_url}/api/viewport"))
            .send()
            .await
            .expect("viewport get request")
            .json::<serde_json::Value>()
            .await
            .expect("parse fetched viewport");
        assert_eq!(fetched, updated);

        server_handle.abort();
    }

    #[tokio::test]
    async fn invitations_proxy_reports_the_directory_summary() {
        let stub = Arc::new(StubDirectory {
            invitations: json!({"summary": {"total": 12, "successful": 11, "failed": 1}}),
            ..StubDirectory::default()
        });
        let (directory_url, directory_handle) = spawn_stub_directory(Arc::clone(&stub)).await;
        let state = AppState::new(directory_url, "evt-1".to_string());
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");

        let report = reqwest::Client::new()
            .post(format!("{base_url}/api/invitations"))
            .send()
            .await
            .expect("invitation request")
            .error_for_status()
            .expect("invitation status")
            .json::<InvitationReport>()
            .await
            .expect("parse invitation report");
        assert_eq!(report.summary.total, 12);
        assert_eq!(report.summary.successful, 11);
        assert_eq!(report.summary.failed, 1);

        server_handle.abort();
        directory_handle.abort();
    }

    #[tokio::test]
    async fn health_and_metrics_expose_expected_contract() {
        let state = AppState::new("http://127.0.0.1:9".to_string(), "evt-1".to_string());
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        let health = client
            .get(format!("{base_url}/api/health"))
            .send()
            .await
            .expect("health request")
            .error_for_status()
            .expect("health status")
            .json::<serde_json::Value>()
            .await
            .expect("parse health");
        assert_eq!(health["status"], "ok");
        assert_eq!(health["event"], "evt-1");
        assert_eq!(health["marker_phase"], "stale");
        assert_eq!(health["placement_mode"], false);
        assert!(health["observability"]["placement_clicks_total"].is_u64());

        let metrics = client
            .get(format!("{base_url}/api/metrics"))
            .send()
            .await
            .expect("metrics request")
            .error_for_status()
            .expect("metrics status")
            .text()
            .await
            .expect("parse metrics text");
        assert!(metrics.contains("# TYPE fairmap_placement_clicks_total counter"));
        assert!(metrics.contains("# TYPE fairmap_markers gauge"));
        assert!(metrics.contains("fairmap_markers 0"));
        assert!(metrics.contains("fairmap_marker_layer_consistent 0"));

        server_handle.abort();
    }

    #[tokio::test]
    async fn selection_override_points_at_any_queue_member() {
        let stub = Arc::new(StubDirectory {
            unplaced: fair_unplaced_payload(),
            placed: json!([]),
            ..StubDirectory::default()
        });
        let (directory_url, directory_handle) = spawn_stub_directory(Arc::clone(&stub)).await;
        let state = AppState::new(directory_url, "evt-1".to_string());
        let (addr, server_handle) = spawn_test_server(state).await;
        let base_url = format!("http://{addr}");
        let client = reqwest::Client::new();

        client
            .post(format!("{base_url}/api/placement/reload"))
            .send()
            .await
            .expect("reload request")
            .error_for_status()
            .expect("reload status");
        client
            .post(format!("{base_url}/api/placement/category"))
            .json(&json!({"category": "games"}))
            .send()
            .await
            .expect("category request")
            .error_for_status()
            .expect("category status");

        let overridden = client
            .post(format!("{base_url}/api/placement/select"))
            .json(&json!({"club_id": "c"}))
            .send()
            .await
            .expect("select request")
            .json::<serde_json::Value>()
            .await
            .expect("parse select outcome");
        assert_eq!(overridden["selected"], true);
        assert_eq!(overridden["selection"], "c");

        let rejected = client
            .post(format!("{base_url}/api/placement/select"))
            .json(&json!({"club_id": "ghost"}))
            .send()
            .await
            .expect("bad select request")
            .json::<serde_json::Value>()
            .await
            .expect("parse bad select outcome");
        assert_eq!(rejected["selected"], false);
        assert_eq!(rejected["selection"], "c");

        server_handle.abort();
        directory_handle.abort();
    }
}
