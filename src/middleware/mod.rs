//! Middleware engine (component D).
//!
//! Registration is append-only until [`Chain::compile`]. Compilation is idempotent
//! and lazy: any registration flips `compiled` back to `false`, and the next
//! dispatch recompiles the three phase-specific sequences before walking them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("middleware chain capacity exceeded (max {max})")]
    CapacityExceeded { max: usize },
    #[error("middleware name {0:?} exceeds 64 bytes")]
    NameTooLong(String),
    #[error("response header bound exceeded ({0} entries already set)")]
    TooManyHeaders(usize),
    #[error("middleware function returned an unrecognized status code {0}")]
    InvalidReturnCode(i32),
}

fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

pub const MAX_MIDDLEWARE: usize = 64;
pub const MAX_RESPONSE_HEADERS: usize = 32;
const MAX_HEADER_NAME: usize = 128;
const MAX_HEADER_VALUE: usize = 512;

/// Phase flags a registration participates in. A hand-rolled bitset rather than a
/// dependency: three bits is not worth pulling in a crate for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase(u8);

impl Phase {
    pub const PRE_ROUTE: Phase = Phase(0b001);
    pub const POST_ROUTE: Phase = Phase(0b010);
    pub const ERROR: Phase = Phase(0b100);
    pub const ALWAYS: Phase = Phase(0b111);

    pub fn contains(self, other: Phase) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Phase {
    type Output = Phase;
    fn bitor(self, rhs: Phase) -> Phase {
        Phase(self.0 | rhs.0)
    }
}

/// A middleware function: receives the per-request context and returns one of the
/// four outcomes below. Boxed rather than generic so a [`Chain`] can hold a
/// heterogeneous mix of closures and function pointers, mirroring how the handler
/// registry stores opaque callables.
pub type MiddlewareFn = Arc<dyn Fn(&mut MiddlewareContext) -> Outcome + Send + Sync>;

/// Tagged return codes, replacing the four-way integer sentinel space
/// (`CONTINUE=0, SKIP_ROUTE=1, STOP=2, ERROR=-1`) named in the interface contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    SkipRoute,
    Stop,
    Error,
}

/// A single middleware registration.
#[derive(Clone)]
pub struct Registration {
    pub id: u64,
    pub name: String,
    pub priority: u32,
    pub phases: Phase,
    pub func: MiddlewareFn,
}

/// Per-chain-walk timing, in nanoseconds, keyed by registration id.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timing {
    pub nanos: u64,
}

/// Aggregate chain statistics (§5 "updated with atomic increments and read without
/// locking").
#[derive(Debug, Default)]
pub struct ChainStats {
    total_executions: AtomicU64,
    total_wall_nanos: AtomicU64,
    fastest_nanos: AtomicU64,
    slowest_nanos: AtomicU64,
}

impl ChainStats {
    fn record(&self, elapsed_nanos: u64) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        self.total_wall_nanos.fetch_add(elapsed_nanos, Ordering::Relaxed);
        self.slowest_nanos.fetch_max(elapsed_nanos, Ordering::Relaxed);
        let mut fastest = self.fastest_nanos.load(Ordering::Relaxed);
        loop {
            if fastest != 0 && fastest <= elapsed_nanos {
                break;
            }
            match self.fastest_nanos.compare_exchange_weak(
                fastest,
                elapsed_nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => fastest = current,
            }
        }
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.total_executions.load(Ordering::Relaxed),
            self.total_wall_nanos.load(Ordering::Relaxed),
            self.fastest_nanos.load(Ordering::Relaxed),
            self.slowest_nanos.load(Ordering::Relaxed),
        )
    }
}

/// Per-request middleware context (§3 "Middleware context"), allocated from the
/// REQUEST arena for the lifetime of one dispatch.
pub struct MiddlewareContext {
    pub current_index: usize,
    pub should_continue: bool,
    pub should_skip_route: bool,
    pub response_status: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Option<Vec<u8>>,
    pub content_type_override: Option<String>,
    pub request_headers: Vec<(String, String)>,
    per_middleware_slot: [Option<usize>; MAX_MIDDLEWARE],
    pub error_code: Option<u16>,
    pub error_message: Option<String>,
    pub timing: Vec<Timing>,
    resolver: Arc<dyn crate::bridge::DependencyResolver>,
}

impl MiddlewareContext {
    pub fn new(request_headers: Vec<(String, String)>) -> Self {
        MiddlewareContext {
            current_index: 0,
            should_continue: true,
            should_skip_route: false,
            response_status: 200,
            response_headers: Vec::new(),
            response_body: None,
            content_type_override: None,
            request_headers,
            per_middleware_slot: [None; MAX_MIDDLEWARE],
            error_code: None,
            error_message: None,
            timing: Vec::new(),
            resolver: Arc::new(crate::bridge::NullResolver),
        }
    }

    /// Wire a DI collaborator in place of the default no-op resolver (§6).
    pub fn with_resolver(mut self, resolver: Arc<dyn crate::bridge::DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// `resolve_dependency(name)` (§4.D), delegated to whatever DI collaborator was
    /// wired up via [`MiddlewareContext::with_resolver`].
    pub fn resolve_dependency(&self, name: &str) -> Option<crate::bridge::ResolvedDependency> {
        self.resolver.resolve(name)
    }

    pub fn set_status(&mut self, status: u16) {
        self.response_status = status;
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), MiddlewareError> {
        if self.response_headers.len() >= MAX_RESPONSE_HEADERS {
            return Err(MiddlewareError::TooManyHeaders(self.response_headers.len()));
        }
        self.response_headers.push((
            truncate_at_char_boundary(name, MAX_HEADER_NAME),
            truncate_at_char_boundary(value, MAX_HEADER_VALUE),
        ));
        Ok(())
    }

    pub fn set_body(&mut self, bytes: Vec<u8>, content_type: &str) {
        self.response_body = Some(bytes);
        self.content_type_override = Some(content_type.to_string());
    }

    pub fn get_request_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_data(&mut self, slot: usize, value: usize) {
        if slot < MAX_MIDDLEWARE {
            self.per_middleware_slot[slot] = Some(value);
        }
    }

    pub fn get_data(&self, slot: usize) -> Option<usize> {
        self.per_middleware_slot.get(slot).copied().flatten()
    }
}

/// Three parallel ordered sequences, rebuilt from `registrations` on demand.
#[derive(Default)]
struct CompiledChain {
    pre_route: Vec<usize>,
    post_route: Vec<usize>,
    error: Vec<usize>,
}

/// The middleware engine for one route (global chain) or one per-route override.
pub struct Chain {
    registrations: Vec<Registration>,
    compiled: bool,
    compiled_chain: CompiledChain,
    next_id: u64,
    stats: ChainStats,
}

impl Chain {
    pub fn new() -> Self {
        Chain {
            registrations: Vec::new(),
            compiled: false,
            compiled_chain: CompiledChain::default(),
            next_id: 1,
            stats: ChainStats::default(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        priority: u32,
        phases: Phase,
        func: MiddlewareFn,
    ) -> Result<u64, MiddlewareError> {
        if name.len() > 64 {
            return Err(MiddlewareError::NameTooLong(name.to_string()));
        }
        if self.registrations.len() >= MAX_MIDDLEWARE {
            return Err(MiddlewareError::CapacityExceeded { max: MAX_MIDDLEWARE });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.registrations.push(Registration {
            id,
            name: name.to_string(),
            priority,
            phases,
            func,
        });
        self.compiled = false;
        Ok(id)
    }

    /// Stable sort by priority ascending, then scan three times retaining only
    /// entries whose flags include that phase (§4.D compilation algorithm).
    fn compile(&mut self) {
        if self.compiled {
            return;
        }
        let mut order: Vec<usize> = (0..self.registrations.len()).collect();
        order.sort_by_key(|&i| self.registrations[i].priority);

        let mut pre = Vec::new();
        let mut post = Vec::new();
        let mut err = Vec::new();
        for &i in &order {
            let phases = self.registrations[i].phases;
            if phases.contains(Phase::PRE_ROUTE) {
                pre.push(i);
            }
            if phases.contains(Phase::POST_ROUTE) {
                post.push(i);
            }
            if phases.contains(Phase::ERROR) {
                err.push(i);
            }
        }
        self.compiled_chain = CompiledChain {
            pre_route: pre,
            post_route: post,
            error: err,
        };
        self.compiled = true;
    }

    /// Walk the pre-route chain. Returns `true` if the route handler should run.
    fn run_pre_route(&mut self, ctx: &mut MiddlewareContext) -> bool {
        self.compile();
        let mut fatal = false;
        for &i in &self.compiled_chain.pre_route.clone() {
            let start = Instant::now();
            let outcome = (self.registrations[i].func)(ctx);
            let elapsed = start.elapsed().as_nanos() as u64;
            ctx.timing.push(Timing { nanos: elapsed });

            match outcome {
                Outcome::Continue => continue,
                Outcome::SkipRoute => {
                    ctx.should_skip_route = true;
                    break;
                }
                Outcome::Stop => {
                    ctx.should_continue = false;
                    break;
                }
                Outcome::Error => {
                    fatal = true;
                    ctx.error_code.get_or_insert(500);
                    break;
                }
            }
        }
        !fatal && !ctx.should_skip_route && ctx.should_continue
    }

    /// Walk the post-route chain unconditionally; an `Error` outcome marks the
    /// overall request result as failed but never stops the walk.
    fn run_post_route(&mut self, ctx: &mut MiddlewareContext) -> bool {
        self.compile();
        let mut failed = false;
        for &i in &self.compiled_chain.post_route.clone() {
            let start = Instant::now();
            let outcome = (self.registrations[i].func)(ctx);
            let elapsed = start.elapsed().as_nanos() as u64;
            ctx.timing.push(Timing { nanos: elapsed });
            if outcome == Outcome::Error {
                failed = true;
                ctx.error_code.get_or_insert(500);
            }
        }
        !failed
    }

    fn run_error(&mut self, ctx: &mut MiddlewareContext) {
        self.compile();
        for &i in &self.compiled_chain.error.clone() {
            let _ = (self.registrations[i].func)(ctx);
        }
    }

    pub fn stats(&self) -> &ChainStats {
        &self.stats
    }

    fn registration_by_id(&self, id: u64) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.id == id)
    }

    /// Build an ad hoc chain from a subset of this chain's own registrations,
    /// overriding each entry's priority per `(id, priority)` — how
    /// `Route::middleware_chain` turns into something `execute` can run as a
    /// per-route chain. Ids with no matching registration are skipped.
    pub fn subset(&self, ids: &[(u64, u32)]) -> Chain {
        let mut chain = Chain::new();
        for &(id, priority) in ids {
            if let Some(reg) = self.registration_by_id(id) {
                chain.registrations.push(Registration {
                    id: reg.id,
                    name: reg.name.clone(),
                    priority,
                    phases: reg.phases,
                    func: reg.func.clone(),
                });
                chain.next_id = chain.next_id.max(reg.id + 1);
            }
        }
        chain
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of executing the full pre-route → handler → post-route cycle.
pub struct ExecutionResult {
    pub should_invoke_handler: bool,
    pub failed: bool,
}

/// Run `global` then, if present, `per_route` (§4.D "per-route pre-route runs
/// after the global pre-route chain so global auth/logging always run first" —
/// decided in DESIGN.md). Returns whether the route handler should run, and the
/// instant the walk started, so a caller can invoke the handler in the gap before
/// [`execute_post_route`] and still get one wall-clock stat for the whole cycle.
pub fn execute_pre_route(
    global: &mut Chain,
    per_route: Option<&mut Chain>,
    ctx: &mut MiddlewareContext,
) -> (bool, Instant) {
    let start = Instant::now();
    let mut proceed = global.run_pre_route(ctx);
    if let Some(route_chain) = per_route {
        if proceed {
            proceed = route_chain.run_pre_route(ctx);
        }
    }
    (proceed, start)
}

/// Run the post-route chains — per-route then global — then the error chain if
/// anything failed, applying the §7 default-500 fallback (a middleware that
/// returns `Error` without calling `set_status` still yields a 500, not the
/// still-default 200) before the final `ExecutionResult` is reported.
pub fn execute_post_route(
    global: &mut Chain,
    per_route: Option<&mut Chain>,
    ctx: &mut MiddlewareContext,
    should_invoke_handler: bool,
    start: Instant,
) -> ExecutionResult {
    if let Some(route_chain) = per_route {
        route_chain.run_post_route(ctx);
    }
    global.run_post_route(ctx);
    global.stats.record(start.elapsed().as_nanos() as u64);

    let failed = ctx.error_code.is_some();
    if failed && ctx.response_status == 200 {
        ctx.response_status = ctx.error_code.unwrap_or(500);
    }
    if failed {
        global.run_error(ctx);
    }
    ExecutionResult {
        should_invoke_handler,
        failed,
    }
}

/// Thin wrapper running the full pre-route → post-route cycle with no handler
/// invocation in between, for callers with no handler to run (tests, and any
/// future non-HTTP entry point that just wants chain semantics).
pub fn execute(
    global: &mut Chain,
    mut per_route: Option<&mut Chain>,
    ctx: &mut MiddlewareContext,
) -> ExecutionResult {
    let (proceed, start) = execute_pre_route(global, per_route.as_mut().map(|r| &mut **r), ctx);
    execute_post_route(global, per_route, ctx, proceed, start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting(order: Arc<parking_lot::Mutex<Vec<&'static str>>>, tag: &'static str, outcome: Outcome) -> MiddlewareFn {
        Arc::new(move |_ctx| {
            order.lock().push(tag);
            outcome
        })
    }

    #[test]
    fn pre_route_runs_in_priority_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain
            .register("second", 20, Phase::PRE_ROUTE, counting(order.clone(), "second", Outcome::Continue))
            .unwrap();
        chain
            .register("first", 10, Phase::PRE_ROUTE, counting(order.clone(), "first", Outcome::Continue))
            .unwrap();

        let mut ctx = MiddlewareContext::new(Vec::new());
        let result = execute(&mut chain, None, &mut ctx);
        assert!(result.should_invoke_handler);
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn stop_halts_pre_route_chain() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain
            .register("blocker", 1, Phase::PRE_ROUTE, counting(order.clone(), "blocker", Outcome::Stop))
            .unwrap();
        chain
            .register("never", 2, Phase::PRE_ROUTE, counting(order.clone(), "never", Outcome::Continue))
            .unwrap();

        let mut ctx = MiddlewareContext::new(Vec::new());
        let result = execute(&mut chain, None, &mut ctx);
        assert!(!result.should_invoke_handler);
        assert_eq!(*order.lock(), vec!["blocker"]);
    }

    #[test]
    fn post_route_runs_even_after_skip_route() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain
            .register("skip", 1, Phase::PRE_ROUTE, counting(order.clone(), "skip", Outcome::SkipRoute))
            .unwrap();
        chain
            .register("cleanup", 1, Phase::POST_ROUTE, counting(order.clone(), "cleanup", Outcome::Continue))
            .unwrap();

        let mut ctx = MiddlewareContext::new(Vec::new());
        let result = execute(&mut chain, None, &mut ctx);
        assert!(!result.should_invoke_handler);
        assert!(ctx.should_skip_route);
        assert_eq!(*order.lock(), vec!["skip", "cleanup"]);
    }

    #[test]
    fn error_in_post_route_marks_result_failed() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut chain = Chain::new();
        chain
            .register("bad", 1, Phase::POST_ROUTE, counting(order.clone(), "bad", Outcome::Error))
            .unwrap();

        let mut ctx = MiddlewareContext::new(Vec::new());
        let result = execute(&mut chain, None, &mut ctx);
        assert!(result.failed);
    }

    #[test]
    fn header_mutation_is_visible_to_later_middleware() {
        let mut chain = Chain::new();
        chain
            .register(
                "tagger",
                1,
                Phase::PRE_ROUTE,
                Arc::new(|ctx: &mut MiddlewareContext| {
                    ctx.set_header("X-Tag", "a").unwrap();
                    Outcome::Continue
                }),
            )
            .unwrap();
        chain
            .register(
                "reader",
                2,
                Phase::PRE_ROUTE,
                Arc::new(|ctx: &mut MiddlewareContext| {
                    assert_eq!(ctx.response_headers[0].1, "a");
                    Outcome::Continue
                }),
            )
            .unwrap();

        let mut ctx = MiddlewareContext::new(Vec::new());
        execute(&mut chain, None, &mut ctx);
    }

    #[test]
    fn per_route_runs_after_global_pre_route() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut global = Chain::new();
        global
            .register("auth", 1, Phase::PRE_ROUTE, counting(order.clone(), "auth", Outcome::Continue))
            .unwrap();
        let mut route = Chain::new();
        route
            .register("route-specific", 1, Phase::PRE_ROUTE, counting(order.clone(), "route-specific", Outcome::Continue))
            .unwrap();

        let mut ctx = MiddlewareContext::new(Vec::new());
        execute(&mut global, Some(&mut route), &mut ctx);
        assert_eq!(*order.lock(), vec!["auth", "route-specific"]);
    }

    #[test]
    fn registering_beyond_capacity_is_rejected() {
        let mut chain = Chain::new();
        for i in 0..MAX_MIDDLEWARE {
            chain
                .register(&format!("m{i}"), i as u32, Phase::PRE_ROUTE, Arc::new(|_| Outcome::Continue))
                .unwrap();
        }
        let err = chain.register("overflow", 0, Phase::PRE_ROUTE, Arc::new(|_| Outcome::Continue));
        assert!(matches!(err, Err(MiddlewareError::CapacityExceeded { .. })));
    }

    #[test]
    fn header_bound_is_enforced() {
        let mut ctx = MiddlewareContext::new(Vec::new());
        for i in 0..MAX_RESPONSE_HEADERS {
            ctx.set_header(&format!("H{i}"), "v").unwrap();
        }
        assert!(ctx.set_header("overflow", "v").is_err());
    }

    #[test]
    fn data_slots_round_trip() {
        let mut ctx = MiddlewareContext::new(Vec::new());
        ctx.set_data(3, 42);
        assert_eq!(ctx.get_data(3), Some(42));
        assert_eq!(ctx.get_data(4), None);
    }

    #[test]
    fn resolve_dependency_defaults_to_none_without_a_resolver() {
        let ctx = MiddlewareContext::new(Vec::new());
        assert!(ctx.resolve_dependency("db_pool").is_none());
    }

    #[test]
    fn resolve_dependency_delegates_to_a_wired_resolver() {
        struct FixedResolver;
        impl crate::bridge::DependencyResolver for FixedResolver {
            fn resolve(&self, name: &str) -> Option<crate::bridge::ResolvedDependency> {
                (name == "db_pool").then(|| crate::bridge::ResolvedDependency {
                    type_name: "Pool".to_string(),
                    ptr: 0xdead_beef,
                })
            }
        }

        let ctx = MiddlewareContext::new(Vec::new()).with_resolver(Arc::new(FixedResolver));
        let resolved = ctx.resolve_dependency("db_pool").unwrap();
        assert_eq!(resolved.type_name, "Pool");
        assert!(ctx.resolve_dependency("missing").is_none());
    }

    #[test]
    fn pre_route_error_without_set_status_defaults_to_500() {
        let mut chain = Chain::new();
        chain
            .register("bad", 1, Phase::PRE_ROUTE, Arc::new(|_ctx| Outcome::Error))
            .unwrap();

        let mut ctx = MiddlewareContext::new(Vec::new());
        let result = execute(&mut chain, None, &mut ctx);
        assert!(result.failed);
        assert!(!result.should_invoke_handler);
        assert_eq!(ctx.response_status, 500);
    }

    #[test]
    fn post_route_error_respects_an_explicit_set_status() {
        let mut chain = Chain::new();
        chain
            .register(
                "bad",
                1,
                Phase::POST_ROUTE,
                Arc::new(|ctx: &mut MiddlewareContext| {
                    ctx.set_status(409);
                    Outcome::Error
                }),
            )
            .unwrap();

        let mut ctx = MiddlewareContext::new(Vec::new());
        let result = execute(&mut chain, None, &mut ctx);
        assert!(result.failed);
        assert_eq!(ctx.response_status, 409);
    }

    #[test]
    fn subset_filters_by_id_and_overrides_priority() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut global = Chain::new();
        let keep = global
            .register("keep", 50, Phase::PRE_ROUTE, counting(order.clone(), "keep", Outcome::Continue))
            .unwrap();
        global
            .register("drop", 1, Phase::PRE_ROUTE, counting(order.clone(), "drop", Outcome::Continue))
            .unwrap();

        let route_chain = global.subset(&[(keep, 1)]);
        assert_eq!(route_chain.registrations.len(), 1);
        assert_eq!(route_chain.registrations[0].priority, 1);

        let mut ctx = MiddlewareContext::new(Vec::new());
        let mut route_chain = route_chain;
        execute(&mut route_chain, None, &mut ctx);
        assert_eq!(*order.lock(), vec!["keep"]);
    }

    #[test]
    fn subset_skips_unknown_ids() {
        let global = Chain::new();
        let route_chain = global.subset(&[(999, 1)]);
        assert!(route_chain.registrations.is_empty());
    }
}
