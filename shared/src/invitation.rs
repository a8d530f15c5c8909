use serde::{Deserialize, Serialize};

/// Outcome of a batch invitation send, as reported by the directory service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationSummary {
    pub total: u32,
    pub successful: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationReport {
    pub summary: InvitationSummary,
}
