pub mod club;
pub mod colors;
pub mod events;
pub mod invitation;
pub mod location;

pub use club::*;
pub use colors::category_color;
pub use events::*;
pub use invitation::{InvitationReport, InvitationSummary};
pub use location::EventLocation;
