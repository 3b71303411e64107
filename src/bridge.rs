//! External collaborator interfaces (§6).
//!
//! These traits are dependency-free: no concrete scripting runtime is linked here.
//! A caller (e.g. a Python embedding crate, as the teacher's `pyo3`-based handler
//! registry did) implements them and hands an `Arc<dyn ...>` to the server.

use async_trait::async_trait;

use crate::request::Request;
use crate::response::Response;

/// Opaque handle to a connection, passed to the bridge so it can later address
/// response writes back to the connection that originated the request
/// (§6 "the core passes an opaque connection handle to be returned to the core for
/// response writes").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// A single registered callback that, when present, fully preempts native
/// dispatch (§6 "Bridge callback interface").
#[async_trait]
pub trait BridgeCallback: Send + Sync {
    async fn dispatch(&self, handle: ConnectionHandle, request: &Request) -> BridgeOutcome;
}

pub enum BridgeOutcome {
    /// The bridge produced a complete response; the core writes it verbatim.
    Respond(Response),
    /// The bridge took ownership of the connection (e.g. to stream) and will
    /// drive writes itself; the core must not touch it further.
    Handled,
}

/// Dependency-injection resolution hook, used by `MiddlewareContext::resolve_dependency`
/// (§4.D "resolve_dependency(name) (delegated to DI collaborator)").
pub trait DependencyResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<ResolvedDependency>;
}

/// An opaque resolved value; the concrete type lives on the collaborator's side.
pub struct ResolvedDependency {
    pub type_name: String,
    pub ptr: usize,
}

/// A resolver with nothing registered, used where no DI collaborator is wired up.
pub struct NullResolver;

impl DependencyResolver for NullResolver {
    fn resolve(&self, _name: &str) -> Option<ResolvedDependency> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_resolver_resolves_nothing() {
        let resolver = NullResolver;
        assert!(resolver.resolve("db_pool").is_none());
    }
}
