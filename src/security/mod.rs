//! Security interceptors: hardening headers and session attachment.

pub mod middleware;
pub mod session;

pub use middleware::SecurityHeadersMiddleware;
pub use session::{
    DisabledSessions, MemorySessionStore, SessionConfig, SessionMiddleware, SessionStore,
};
