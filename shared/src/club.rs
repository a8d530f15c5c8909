use serde::{Deserialize, Serialize};

/// A point on the event map in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
}

impl Coordinates {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A club registered for an event. Coordinates are present exactly when the
/// club has been placed on the map; the directory service owns the record,
/// this is a transient snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Club {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

impl Club {
    pub fn is_placed(&self) -> bool {
        self.coordinates.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{Club, Coordinates};

    #[test]
    fn placed_means_coordinates_present() {
        let mut club = Club {
            id: "c1".to_string(),
            name: "Chess Club".to_string(),
            description: String::new(),
            category: "games".to_string(),
            coordinates: None,
        };
        assert!(!club.is_placed());

        club.coordinates = Some(Coordinates::new(10.0, 20.0));
        assert!(club.is_placed());
    }
}
