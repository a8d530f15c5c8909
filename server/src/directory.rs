//! Client for the external club directory / event location service.
//!
//! The directory owns every club record; this service only reads snapshots
//! and requests coordinate mutations, so all calls here are stateless
//! request/response wrappers over the shared timeout-configured client.

use bytes::Bytes;
use fairmap_shared::{Club, Coordinates, EventLocation, InvitationReport};
use reqwest::StatusCode;
use serde::Serialize;

const UNCATEGORIZED: &str = "uncategorized";

pub async fn fetch_event_location(
    client: &reqwest::Client,
    base: &str,
    event_id: &str,
) -> Result<EventLocation, String> {
    let url = event_url(base, event_id, "location")?;
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("location request failed: {e}"))?;
    let bytes = read_success_body(resp, "event location").await?;
    serde_json::from_slice(&bytes).map_err(|e| decode_error("event location", &bytes, e))
}

pub async fn fetch_unplaced_clubs(
    client: &reqwest::Client,
    base: &str,
    event_id: &str,
) -> Result<Vec<Club>, String> {
    fetch_clubs(client, base, event_id, false).await
}

pub async fn fetch_placed_clubs(
    client: &reqwest::Client,
    base: &str,
    event_id: &str,
) -> Result<Vec<Club>, String> {
    fetch_clubs(client, base, event_id, true).await
}

async fn fetch_clubs(
    client: &reqwest::Client,
    base: &str,
    event_id: &str,
    placed: bool,
) -> Result<Vec<Club>, String> {
    let mut url = event_url(base, event_id, "clubs")?;
    url.query_pairs_mut()
        .append_pair("placed", if placed { "true" } else { "false" });
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("club list request failed: {e}"))?;
    let bytes = read_success_body(resp, "club list").await?;
    let parsed = if placed {
        parse_placed_payload(&bytes)
    } else {
        parse_unplaced_payload(&bytes)
    };
    parsed.map_err(|e| decode_error("club list", &bytes, e))
}

/// Ask the directory to bind a club to map coordinates.
pub async fn assign_coordinates(
    client: &reqwest::Client,
    base: &str,
    club_id: &str,
    position: Coordinates,
) -> Result<(), String> {
    update_club(
        client,
        base,
        club_id,
        &ClubUpdate::Assign {
            x: position.x,
            y: position.y,
        },
    )
    .await
}

/// Ask the directory to un-place a club.
pub async fn clear_coordinates(
    client: &reqwest::Client,
    base: &str,
    club_id: &str,
) -> Result<(), String> {
    update_club(client, base, club_id, &ClubUpdate::Clear).await
}

/// Exact-match coordinate lookup. `Ok(None)` when no club sits at the
/// queried position.
pub async fn find_by_coordinates(
    client: &reqwest::Client,
    base: &str,
    position: Coordinates,
) -> Result<Option<Club>, String> {
    let mut url = api_url(base, &["clubs", "lookup"])?;
    url.query_pairs_mut()
        .append_pair("x", &position.x.to_string())
        .append_pair("y", &position.y.to_string());
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("coordinate lookup request failed: {e}"))?;
    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let bytes = read_success_body(resp, "coordinate lookup").await?;
    parse_lookup_payload(&bytes)
        .map(Some)
        .map_err(|e| decode_error("coordinate lookup", &bytes, e))
}

/// Trigger the directory's batch invitation send for the event.
pub async fn send_invitations(
    client: &reqwest::Client,
    base: &str,
    event_id: &str,
) -> Result<InvitationReport, String> {
    let url = event_url(base, event_id, "invitations")?;
    let resp = client
        .post(url)
        .send()
        .await
        .map_err(|e| format!("invitation request failed: {e}"))?;
    let bytes = read_success_body(resp, "invitation send").await?;
    serde_json::from_slice(&bytes).map_err(|e| decode_error("invitation send", &bytes, e))
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClubUpdate {
    Assign { x: f64, y: f64 },
    Clear,
}

async fn update_club(
    client: &reqwest::Client,
    base: &str,
    club_id: &str,
    update: &ClubUpdate,
) -> Result<(), String> {
    let url = api_url(base, &["clubs", club_id])?;
    let resp = client
        .patch(url)
        .json(update)
        .send()
        .await
        .map_err(|e| format!("club update request failed: {e}"))?;
    read_success_body(resp, "club update").await?;
    Ok(())
}

fn event_url(base: &str, event_id: &str, leaf: &str) -> Result<reqwest::Url, String> {
    api_url(base, &["events", event_id, leaf])
}

fn api_url(base: &str, segments: &[&str]) -> Result<reqwest::Url, String> {
    let mut url =
        reqwest::Url::parse(base).map_err(|e| format!("invalid directory base URL: {e}"))?;
    {
        let Ok(mut path_segments) = url.path_segments_mut() else {
            return Err("directory base URL cannot carry path segments".to_string());
        };
        path_segments.pop_if_empty().push("api");
        for segment in segments {
            path_segments.push(segment);
        }
    }
    Ok(url)
}

async fn read_success_body(resp: reqwest::Response, context: &str) -> Result<Bytes, String> {
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| format!("failed to read {context} response body: {e}"))?;
    if !status.is_success() {
        return Err(format!(
            "upstream status {status} for {context}; body preview: {}",
            body_preview(&bytes)
        ));
    }
    Ok(bytes)
}

fn decode_error(context: &str, bytes: &Bytes, e: serde_json::Error) -> String {
    format!(
        "failed to decode {context} payload: {e}; body preview: {}",
        body_preview(bytes)
    )
}

fn body_preview(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).chars().take(200).collect()
}

/// Unplaced-club entries carry coordinates as flat optional fields.
#[derive(serde::Deserialize)]
struct RawUnplacedClub {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
}

impl From<RawUnplacedClub> for Club {
    fn from(value: RawUnplacedClub) -> Self {
        let coordinates = match (value.x, value.y) {
            (Some(x), Some(y)) => Some(Coordinates::new(x, y)),
            _ => None,
        };
        Self {
            name: normalized_or(value.name, &value.id),
            category: normalized_or(value.category, UNCATEGORIZED),
            description: String::new(),
            coordinates,
            id: value.id,
        }
    }
}

/// Placed-club entries carry a nested coordinates object and display fields.
#[derive(serde::Deserialize)]
struct RawPlacedClub {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    coordinates: Option<Coordinates>,
}

impl From<RawPlacedClub> for Club {
    fn from(value: RawPlacedClub) -> Self {
        Self {
            name: normalized_or(value.name, &value.id),
            category: normalized_or(value.category, UNCATEGORIZED),
            description: value.description.unwrap_or_default(),
            coordinates: value.coordinates,
            id: value.id,
        }
    }
}

fn normalized_or(value: Option<String>, fallback: &str) -> String {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn parse_unplaced_payload(bytes: &[u8]) -> Result<Vec<Club>, serde_json::Error> {
    let raw: Vec<RawUnplacedClub> = serde_json::from_slice(bytes)?;
    Ok(raw.into_iter().map(Club::from).collect())
}

fn parse_placed_payload(bytes: &[u8]) -> Result<Vec<Club>, serde_json::Error> {
    let raw: Vec<RawPlacedClub> = serde_json::from_slice(bytes)?;
    Ok(raw.into_iter().map(Club::from).collect())
}

fn parse_lookup_payload(bytes: &[u8]) -> Result<Club, serde_json::Error> {
    let raw: RawPlacedClub = serde_json::from_slice(bytes)?;
    Ok(Club::from(raw))
}
