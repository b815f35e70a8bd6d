pub mod backend;
pub mod config;
pub mod error;
pub mod extract;
pub mod models;
pub mod normalize;
pub mod policy;
pub mod store;

pub use backend::{BackendError, CreateSessionRequest, HttpLinkBackend, LinkBackend, RemoteReply};
pub use config::LinkCacheConfig;
pub use error::LinkCacheError;
pub use models::{SessionPatch, SessionRecord};
pub use normalize::{normalize, not_found, NormalizeOptions};
pub use store::{SessionStore, UpsertMeta};
