mod merge;
mod registry;
mod server;
mod store;

use std::time::{SystemTime, UNIX_EPOCH};

pub use merge::{MergeError, plan_merge};
pub use registry::{ImplicitSession, RegistryError, SessionRegistry};
pub use server::{
    DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_PARTS, ServerConfig, ServerState, build_server_app,
};
pub use store::PartStore;

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
