//! Native reactor, router, middleware engine, and chunked streaming core for an
//! HTTP application server.
//!
//! Routes resolve to handlers through the `handler` module's registry; a
//! scripting-bridge embedding (the `bridge` module's traits) is how a host
//! language plugs in an *additional* handler runtime alongside native ones.

pub mod arena;
pub mod bridge;
pub mod config;
pub mod error;
pub mod handler;
pub mod json;
pub mod middleware;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod stream;

pub use error::CoreError;
pub use handler::{HandlerFn, HandlerRegistry};
pub use request::Request;
pub use response::Response;
pub use router::Router;
pub use server::{Server, ServerConfig};
