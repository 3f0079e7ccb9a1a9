//! The relay core: session lifecycle, the per-session event journal with
//! replay-capable fan-out, sandbox orchestration, and the REST + WebSocket
//! wire surface.

pub mod api;
pub mod bridge;
pub mod broadcast;
pub mod error;
pub mod github;
pub mod session;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod ws;

pub use api::router;
pub use error::ServerError;
pub use state::{AppState, ServerConfig};
pub use store::Store;
