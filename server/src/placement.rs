use fairmap_shared::{Club, Coordinates};

/// A coordinate assignment issued optimistically and awaiting the
/// directory's acknowledgement. The club is kept retrievable so a rejected
/// assignment can be re-queued instead of silently discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAssignment {
    pub club: Club,
    pub position: Coordinates,
}

/// Placement session state for one event.
///
/// Invariants, upheld by every method:
/// - every queue member is unplaced and carries the selected category;
/// - the selection is a queue member, or `None` when the queue is empty;
/// - a club never appears in the queue and the pending list at once.
///
/// All mutation goes through `AppState`'s single write lock, so methods here
/// are plain synchronous transitions with no I/O.
#[derive(Debug, Default)]
pub struct PlacementState {
    /// Latest unplaced-club snapshot from the directory, fetch order preserved.
    known: Vec<Club>,
    category: Option<String>,
    queue: Vec<Club>,
    selection: Option<String>,
    placement_mode: bool,
    /// A club un-placed by the move workflow, pending front insertion into
    /// its category's queue on the next recompute.
    moving: Option<Club>,
    pending: Vec<PendingAssignment>,
}

impl PlacementState {
    pub fn queue(&self) -> &[Club] {
        &self.queue
    }

    pub fn selection(&self) -> Option<&str> {
        self.selection.as_deref()
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn placement_mode(&self) -> bool {
        self.placement_mode
    }

    pub fn moving(&self) -> Option<&Club> {
        self.moving.as_ref()
    }

    pub fn pending(&self) -> &[PendingAssignment] {
        &self.pending
    }

    pub fn find_known(&self, club_id: &str) -> Option<&Club> {
        self.known.iter().find(|c| c.id == club_id)
    }

    /// Distinct category tags among the known clubs, first-seen order.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = Vec::new();
        for club in &self.known {
            if !categories.iter().any(|c| c == &club.category) {
                categories.push(club.category.clone());
            }
        }
        categories
    }

    /// Replace the known-club snapshot and recompute the queue against it.
    pub fn set_known_clubs(&mut self, clubs: Vec<Club>) {
        self.known = clubs;
        self.rebuild_queue();
    }

    pub fn set_category(&mut self, category: &str) {
        self.category = Some(category.to_string());
        self.rebuild_queue();
    }

    /// Toggle click consumption. Queue and selection are untouched.
    pub fn set_placement_mode(&mut self, active: bool) {
        self.placement_mode = active;
    }

    /// User override: point the selection at any queue member without
    /// consuming the head. Unknown ids are a defined no-op.
    pub fn select_in_queue(&mut self, club_id: &str) -> bool {
        if self.queue.iter().any(|c| c.id == club_id) {
            self.selection = Some(club_id.to_string());
            return true;
        }
        false
    }

    /// Record a club un-placed by the move workflow. It is consumed by the
    /// next queue recompute for its own category.
    pub fn set_moving(&mut self, mut club: Club) {
        club.coordinates = None;
        self.moving = Some(club);
    }

    /// Consume a map click: pop the selection out of the queue into the
    /// pending list and advance the selection to the new queue head.
    ///
    /// Returns the popped club (with the optimistic coordinates applied), or
    /// `None` when placement mode is off or the queue is empty; both are
    /// defined no-ops, not errors.
    pub fn place_at(&mut self, position: Coordinates) -> Option<Club> {
        if !self.placement_mode || self.queue.is_empty() {
            return None;
        }
        let selected = self.selection.clone()?;
        let index = self.queue.iter().position(|c| c.id == selected)?;
        let mut club = self.queue.remove(index);
        club.coordinates = Some(position);
        self.pending.push(PendingAssignment {
            club: club.clone(),
            position,
        });
        self.selection = self.queue.first().map(|c| c.id.clone());
        Some(club)
    }

    /// Directory acknowledged the assignment: drop the pending entry.
    /// Returns false for a late ack that matches nothing: informational
    /// only, never reapplied.
    pub fn confirm_assignment(&mut self, club_id: &str) -> bool {
        let Some(index) = self.pending.iter().position(|p| p.club.id == club_id) else {
            return false;
        };
        self.pending.remove(index);
        true
    }

    /// Directory rejected the assignment: re-insert the club at the queue
    /// front instead of discarding it. Returns the restored club so the
    /// caller can tear its optimistic marker down.
    pub fn fail_assignment(&mut self, club_id: &str) -> Option<Club> {
        let index = self.pending.iter().position(|p| p.club.id == club_id)?;
        let mut club = self.pending.remove(index).club;
        club.coordinates = None;
        self.queue.insert(0, club.clone());
        if self.selection.is_none() {
            self.selection = Some(club.id.clone());
        }
        Some(club)
    }

    /// Recompute the queue from the known-club snapshot: unplaced clubs of
    /// the selected category, fetch order preserved. A pending moving club
    /// of the same category is spliced to the front and becomes the
    /// selection; otherwise the selection resets to the queue head.
    fn rebuild_queue(&mut self) {
        let Some(category) = self.category.clone() else {
            self.queue.clear();
            self.selection = None;
            return;
        };

        self.queue = self
            .known
            .iter()
            .filter(|c| !c.is_placed() && c.category == category)
            .filter(|c| !self.pending.iter().any(|p| p.club.id == c.id))
            .cloned()
            .collect();

        let moving_matches = self
            .moving
            .as_ref()
            .is_some_and(|m| m.category == category);
        let moving_here = if moving_matches { self.moving.take() } else { None };

        if let Some(moving) = moving_here {
            self.queue.retain(|c| c.id != moving.id);
            self.queue.insert(0, moving.clone());
            self.selection = Some(moving.id);
        } else {
            self.selection = self.queue.first().map(|c| c.id.clone());
        }
    }
}
