use fairmap_shared::{Coordinates, EventLocation};
use serde::Serialize;

const MIN_ZOOM: f64 = 1.0;
const MAX_ZOOM: f64 = 20.0;
const DEFAULT_ZOOM: f64 = 13.0;

/// Map viewport: world-space center and zoom. Initialized from the event's
/// saved location (or caller-supplied values), then free-running: organic
/// pans and zooms update this state but are never written back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Viewport {
    pub center: Coordinates,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            center: Coordinates::new(0.0, 0.0),
            zoom: DEFAULT_ZOOM,
        }
    }
}

impl Viewport {
    /// Apply the saved event location. Absent fields leave the current
    /// values unchanged.
    pub fn apply_saved(&mut self, saved: &EventLocation) {
        if let Some(location) = saved.location {
            self.center = location;
        }
        if let Some(scale) = saved.scale {
            self.zoom = scale.clamp(MIN_ZOOM, MAX_ZOOM);
        }
    }

    /// Partial update from the viewer's pan/zoom.
    pub fn update(&mut self, x: Option<f64>, y: Option<f64>, zoom: Option<f64>) {
        if let Some(x) = x {
            self.center.x = x;
        }
        if let Some(y) = y {
            self.center.y = y;
        }
        if let Some(zoom) = zoom {
            self.zoom = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
        }
    }
}
