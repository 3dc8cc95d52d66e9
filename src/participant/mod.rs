pub mod handler;
pub mod intermediary;
pub mod reporter;
pub mod store;

pub use handler::{ElementContext, ElementHandler};
pub use intermediary::ParticipantIntermediary;
pub use reporter::StateReporter;
pub use store::{CommandDisposition, ElementStore, LocalElement};
