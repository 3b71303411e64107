//! Native handler registry (§4.C dispatch step 3, "On hit, invoke
//! `handler(connection, request)`").
//!
//! The router stores only an opaque [`crate::router::HandlerId`] per route; this
//! module is where an id is actually resolved to a callable, the way
//! [`crate::middleware::MiddlewareFn`] resolves a middleware registration to a
//! callable.

use std::collections::HashMap;
use std::sync::Arc;

use crate::middleware::MiddlewareContext;
use crate::request::Request;
use crate::response::Response;
use crate::router::HandlerId;

/// A native request handler. Runs on the reactor thread, so it must not block
/// (§5 "Scheduling model").
pub type HandlerFn = Arc<dyn Fn(&Request, &mut MiddlewareContext) -> Response + Send + Sync>;

/// Maps route handler ids to callables. Built once at startup alongside the
/// router and handed to the connection pipeline.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerId, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn register(&mut self, id: HandlerId, handler: HandlerFn) {
        self.handlers.insert(id, handler);
    }

    pub fn get(&self, id: HandlerId) -> Option<HandlerFn> {
        self.handlers.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_registered_handler_by_id() {
        let mut registry = HandlerRegistry::new();
        registry.register(7, Arc::new(|_req, _ctx| Response::text(200, "hi")));
        assert!(registry.get(7).is_some());
        assert!(registry.get(8).is_none());
    }

    #[test]
    fn registered_handler_runs_and_sees_the_request() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            1,
            Arc::new(|req, _ctx| Response::text(200, req.path.clone())),
        );
        let handler = registry.get(1).unwrap();
        let req = Request::new(
            "GET".into(),
            "/ping".into(),
            String::new(),
            Vec::new(),
            None,
            crate::request::ContentType::None,
        );
        let mut ctx = MiddlewareContext::new(Vec::new());
        let resp = handler(&req, &mut ctx);
        let (status, _, body) = resp.into_parts();
        assert_eq!(status, 200);
        assert_eq!(body, b"/ping");
    }
}
