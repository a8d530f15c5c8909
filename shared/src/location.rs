use serde::{Deserialize, Serialize};

use crate::club::Coordinates;

/// The saved map center and zoom for an event. Fields absent from the
/// location service's response leave the viewer's current values unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLocation {
    #[serde(default)]
    pub location: Option<Coordinates>,
    #[serde(default)]
    pub scale: Option<f64>,
}
