pub mod session;

pub use session::{normalize_agent_id, SessionPatch, SessionRecord};
