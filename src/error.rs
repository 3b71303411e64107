//! Crate-wide error taxonomy.
//!
//! Individual components (arenas, router, middleware engine, streaming engine) define
//! small, component-local error enums and convert into [`CoreError`] at the boundary
//! where a caller needs one unified type (e.g. the connection pipeline). Components
//! whose spec-mandated failure mode is a sentinel value (`route_id | 0`, `BACKPRESSURE`)
//! keep returning that sentinel at their public API and log the underlying error instead
//! of surfacing it as a `Result`.

use thiserror::Error;

/// Unified error type for cross-component failures.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("arena error: {0}")]
    Arena(#[from] crate::arena::ArenaError),

    #[error("router error: {0}")]
    Router(#[from] crate::router::RouterError),

    #[error("middleware error: {0}")]
    Middleware(#[from] crate::middleware::MiddlewareError),

    #[error("stream error: {0}")]
    Stream(#[from] crate::stream::StreamError),

    #[error("parse error: {0}")]
    Parse(#[from] crate::server::parser::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_wraps_component_error() {
        let err: CoreError = crate::router::RouterError::CapacityExceeded.into();
        assert!(err.to_string().contains("router error"));
    }
}
