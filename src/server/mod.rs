//! Reactor and connection-pipeline core (component C).
//!
//! A single reactor drives the accept loop and every connection's request/response
//! cycle; handlers must not block it (§5 "Scheduling model"). `ServerConfig`,
//! `ServerMetrics`, and `ShutdownCoordinator` keep the shape of the original
//! multi-protocol server config but drop TLS/HTTP2/HTTP3/cluster, which are out of
//! scope.

pub mod connection;
pub mod parser;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::bridge::BridgeCallback;
use crate::handler::HandlerRegistry;
use crate::middleware::Chain;
use crate::router::Router;

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub keep_alive: Option<Duration>,
    pub max_connections: usize,
    pub tcp_nodelay: bool,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        ServerConfig {
            host: host.to_string(),
            port,
            backlog: 1024,
            keep_alive: Some(Duration::from_secs(75)),
            max_connections: 10_000,
            tcp_nodelay: true,
            read_timeout: Some(Duration::from_secs(30)),
            write_timeout: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.keep_alive = Some(duration);
        self
    }

    pub fn no_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }

    pub fn shutdown_timeout(mut self, duration: Duration) -> Self {
        self.shutdown_timeout = duration;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 8000)
    }
}

#[derive(Clone)]
pub struct ServerMetrics {
    pub total_requests: Arc<AtomicU64>,
    pub active_connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    pub bytes_sent: Arc<AtomicU64>,
    pub total_errors: Arc<AtomicU64>,
    pub start_time: Instant,
    latencies: Arc<RwLock<VecDeque<Duration>>>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        ServerMetrics {
            total_requests: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            total_errors: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
            latencies: Arc::new(RwLock::new(VecDeque::with_capacity(1024))),
        }
    }

    #[inline]
    pub fn inc_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_errors(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Sample every 64th request to avoid write-lock contention on the latency
    /// ring buffer under load.
    #[inline]
    pub fn record_latency(&self, latency: Duration) {
        if self.total_requests.load(Ordering::Relaxed) & 63 == 0 {
            let mut latencies = self.latencies.write();
            latencies.push_back(latency);
            if latencies.len() > 1000 {
                latencies.pop_front();
            }
        }
    }

    pub fn avg_latency(&self) -> Duration {
        let latencies = self.latencies.read();
        if latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = latencies.iter().sum();
        total / latencies.len() as u32
    }

    pub fn requests_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_requests.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
            requests_per_second: self.requests_per_second(),
            avg_latency_ms: self.avg_latency().as_millis() as f64,
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub active_connections: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub total_errors: u64,
    pub uptime_secs: u64,
    pub requests_per_second: f64,
    pub avg_latency_ms: f64,
}

pub struct ShutdownCoordinator {
    notify: broadcast::Sender<()>,
    shutdown_initiated: Arc<AtomicBool>,
    active_requests: Arc<AtomicU64>,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        let (notify, _) = broadcast::channel(1);
        ShutdownCoordinator {
            notify,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            active_requests: Arc::new(AtomicU64::new(0)),
            drain_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown_initiated.store(true, Ordering::SeqCst);
        let _ = self.notify.send(());
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn request_finished(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub async fn drain(&self) {
        let start = Instant::now();
        while self.active_requests() > 0 {
            if start.elapsed() > self.drain_timeout {
                tracing::warn!(
                    active = self.active_requests(),
                    "requests still active after drain timeout"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// The reactor. Owns the router, global middleware chain, arenas, and (optionally)
/// a bridge callback that preempts native dispatch (§6 "Bridge callback
/// interface").
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
    middleware: Arc<RwLock<Chain>>,
    arenas: Arc<crate::arena::Arenas>,
    handlers: Arc<HandlerRegistry>,
    bridge: Option<Arc<dyn BridgeCallback>>,
    metrics: ServerMetrics,
    shutdown: Arc<ShutdownCoordinator>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        router: Router,
        middleware: Chain,
        arenas: crate::arena::Arenas,
        handlers: HandlerRegistry,
    ) -> Self {
        let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
        Server {
            config,
            router: Arc::new(router),
            middleware: Arc::new(RwLock::new(middleware)),
            arenas: Arc::new(arenas),
            handlers: Arc::new(handlers),
            bridge: None,
            metrics: ServerMetrics::new(),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn BridgeCallback>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn shutdown_coordinator(&self) -> Arc<ShutdownCoordinator> {
        self.shutdown.clone()
    }

    /// Bind and accept connections until shutdown is signaled. Each accepted
    /// connection is spawned onto its own task; the reactor design treats these as
    /// cooperative per-connection event loops, not a thread-per-connection model
    /// (§5 "Single reactor thread per process" describes parsing/routing/dispatch,
    /// not the tokio task scheduler itself).
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if self.config.tcp_nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    if self.metrics.active_connections.load(Ordering::Relaxed) as usize
                        >= self.config.max_connections
                    {
                        tracing::warn!(%peer, "max connections reached, dropping");
                        continue;
                    }

                    let server = self.clone();
                    tokio::spawn(async move {
                        server.metrics.inc_connections();
                        if let Err(e) = connection::handle_connection(
                            stream,
                            server.router.clone(),
                            server.middleware.clone(),
                            server.arenas.clone(),
                            server.handlers.clone(),
                            server.bridge.clone(),
                            server.metrics.clone(),
                            server.shutdown.clone(),
                            server.config.keep_alive,
                        )
                        .await
                        {
                            tracing::debug!(%peer, error = %e, "connection closed with error");
                        }
                        server.metrics.dec_connections();
                    });
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown signal received, draining connections");
                    self.shutdown.drain().await;
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.max_connections, 10_000);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn metrics_snapshot_reports_zero_before_traffic() {
        let metrics = ServerMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.active_connections, 0);
    }

    #[test]
    fn metrics_round_trip_increments() {
        let metrics = ServerMetrics::new();
        metrics.inc_requests();
        metrics.inc_connections();
        metrics.add_bytes_sent(128);
        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.bytes_sent, 128);
    }

    #[tokio::test]
    async fn shutdown_coordinator_drains_when_requests_finish() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(500));
        coordinator.request_started();
        assert_eq!(coordinator.active_requests(), 1);
        coordinator.request_finished();
        coordinator.drain().await;
        assert_eq!(coordinator.active_requests(), 0);
    }

    #[test]
    fn shutdown_flag_flips_once_signaled() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(10));
        assert!(!coordinator.is_shutting_down());
        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());
    }
}
