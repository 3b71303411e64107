//! Per-connection read/dispatch/write loop (§4.C "Connection pipeline").

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::arena::{ArenaId, Arenas};
use crate::bridge::{BridgeCallback, BridgeOutcome, ConnectionHandle};
use crate::handler::HandlerRegistry;
use crate::middleware::{self, Chain, MiddlewareContext};
use crate::request::{ContentType, Request};
use crate::response::Response;
use crate::router::Router;
use crate::server::parser::{Feed, IncrementalParser};
use crate::server::{ServerMetrics, ShutdownCoordinator};
use crate::stream::Stream;

const READ_CHUNK: usize = 8 * 1024;

pub async fn handle_connection(
    mut stream: TcpStream,
    router: Arc<Router>,
    middleware: Arc<RwLock<Chain>>,
    arenas: Arc<Arenas>,
    handlers: Arc<HandlerRegistry>,
    bridge: Option<Arc<dyn BridgeCallback>>,
    metrics: ServerMetrics,
    shutdown: Arc<ShutdownCoordinator>,
    keep_alive: Option<Duration>,
) -> std::io::Result<()> {
    let handle = ConnectionHandle(connection_id());
    let mut read_buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut parser = IncrementalParser::new();

    loop {
        let message = match read_one_message(&mut stream, &mut read_buf, &mut parser, &metrics).await? {
            Some(m) => m,
            None => return Ok(()),
        };

        shutdown.request_started();
        let start = Instant::now();
        metrics.inc_requests();

        let response = dispatch_one(
            &message,
            &router,
            &middleware,
            &arenas,
            &handlers,
            bridge.as_deref(),
            handle,
        )
        .await;

        shutdown.request_finished();
        metrics.record_latency(start.elapsed());

        let keep_this_alive = keep_alive.is_some() && !message.connection_close_requested;

        // §4.E: a handler that returned Response::streaming hands off a live Stream
        // rather than a fixed body. Drive it onto the socket directly instead of
        // going through the fixed-body write path, which would format its (unused)
        // status/body fields into garbage wire bytes.
        if let Some(live_stream) = response.as_ref().and_then(Response::stream) {
            drive_stream(&mut stream, &live_stream, &metrics).await?;
        } else {
            let bytes = response
                .unwrap_or_else(Response::internal_error)
                .keep_alive(keep_this_alive)
                .into_bytes();
            metrics.add_bytes_sent(bytes.len() as u64);
            write_response(&mut stream, &arenas, &bytes).await?;
        }

        if !keep_this_alive {
            return Ok(());
        }

        parser.reset();
    }
}

/// Drive a [`Stream`] onto the socket: header block once, then drain/write/ack
/// chunks until the stream goes inactive, then the `0\r\n\r\n` terminator (§4.E).
async fn drive_stream(stream: &mut TcpStream, live: &Arc<Stream>, metrics: &ServerMetrics) -> std::io::Result<()> {
    if let Some(headers) = live.header_block() {
        metrics.add_bytes_sent(headers.len() as u64);
        stream.write_all(&headers).await?;
    }

    loop {
        match live.drain() {
            Some(chunk) => {
                let mut framed = Vec::with_capacity(chunk.header.len() + chunk.payload.len() + chunk.trailer.len());
                framed.extend_from_slice(&chunk.header);
                framed.extend_from_slice(&chunk.payload);
                framed.extend_from_slice(chunk.trailer);
                metrics.add_bytes_sent(framed.len() as u64);
                stream.write_all(&framed).await?;
                live.on_write_complete();
            }
            None => {
                if !live.is_active() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    let terminator = live.finish();
    metrics.add_bytes_sent(terminator.len() as u64);
    stream.write_all(&terminator).await
}

/// Stage the outgoing response through the RESPONSE arena (§2 "B→D"), freeing and
/// purging it once the bytes are on the wire. Falls back to writing directly if the
/// arena is exhausted rather than dropping the response.
async fn write_response(stream: &mut TcpStream, arenas: &Arenas, bytes: &[u8]) -> std::io::Result<()> {
    match arenas.alloc(ArenaId::Response, bytes.len().max(1)) {
        Ok(mut ptr) => {
            if !bytes.is_empty() {
                unsafe { ptr.as_slice_mut()[..bytes.len()].copy_from_slice(bytes) };
            }
            let write_result = stream.write_all(unsafe { &ptr.as_slice()[..bytes.len()] }).await;
            let _ = arenas.free(ArenaId::Response, ptr);
            arenas.purge(ArenaId::Response);
            write_result
        }
        Err(e) => {
            tracing::warn!(error = %e, "RESPONSE arena exhausted, writing directly");
            stream.write_all(bytes).await
        }
    }
}

fn connection_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

struct ParsedMessage {
    method: String,
    path: String,
    query: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    content_type: ContentType,
    connection_close_requested: bool,
    parse_failed_415: bool,
}

/// Read from the socket until one full message is parsed, or the connection
/// closes. Returns `Ok(None)` on clean EOF between messages.
///
/// Every `feed()` result — `NeedMoreData` included — carries a `consumed` count
/// that is drained from `read_buf` immediately. Draining only on
/// `MessageComplete` left header bytes sitting unconsumed in `read_buf` whenever
/// the body hadn't fully arrived yet, so the next socket read re-fed those header
/// bytes straight into `feed_body`, corrupting the body (and leaking into the
/// next keep-alive request).
async fn read_one_message(
    stream: &mut TcpStream,
    read_buf: &mut Vec<u8>,
    parser: &mut IncrementalParser,
    metrics: &ServerMetrics,
) -> std::io::Result<Option<ParsedMessage>> {
    loop {
        if !read_buf.is_empty() {
            match parser.feed(read_buf) {
                Ok(Feed::MessageComplete { consumed }) => {
                    read_buf.drain(..consumed);

                    let headers = parser.headers().to_vec();
                    let content_type = parser.content_type();
                    let body = if parser.body().is_empty() {
                        None
                    } else {
                        Some(parser.body().to_vec())
                    };
                    let method = parser.method().to_string();

                    let close_requested = headers
                        .iter()
                        .any(|(n, v)| n.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close"));

                    return match parser.finish() {
                        Ok((path, query)) => Ok(Some(ParsedMessage {
                            method,
                            path,
                            query,
                            headers,
                            body,
                            content_type,
                            connection_close_requested: close_requested,
                            parse_failed_415: false,
                        })),
                        Err(()) => Ok(Some(ParsedMessage {
                            method,
                            path: String::new(),
                            query: String::new(),
                            headers,
                            body: None,
                            content_type,
                            connection_close_requested: true,
                            parse_failed_415: true,
                        })),
                    };
                }
                Ok(Feed::NeedMoreData { consumed }) => {
                    read_buf.drain(..consumed);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "parse error, closing connection");
                    return Ok(None);
                }
            }
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        metrics.add_bytes_received(n as u64);
        read_buf.extend_from_slice(&chunk[..n]);
    }
}

/// Flatten method, path, and headers into the byte blob arena-allocated as this
/// dispatch's connection state (§2 "A→C").
fn connection_state_blob(request: &Request) -> Vec<u8> {
    let mut blob = Vec::with_capacity(request.method.len() + request.path.len() + 32);
    blob.extend_from_slice(request.method.as_bytes());
    blob.push(0);
    blob.extend_from_slice(request.path.as_bytes());
    for (name, value) in &request.headers {
        blob.push(0);
        blob.extend_from_slice(name.as_bytes());
        blob.push(b':');
        blob.extend_from_slice(value.as_bytes());
    }
    blob
}

/// Fold a handler's [`Response`] into the middleware context so post-route
/// middleware sees (and can override) exactly what the handler produced.
fn apply_response_to_ctx(response: Response, ctx: &mut MiddlewareContext) {
    let (status, headers, body) = response.into_parts();
    ctx.set_status(status);
    let mut content_type = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value);
            continue;
        }
        if ctx.set_header(&name, &value).is_err() {
            tracing::warn!(name = %name, "dropping handler response header past the bound");
        }
    }
    ctx.set_body(body, content_type.as_deref().unwrap_or("application/octet-stream"));
}

fn response_from_ctx(ctx: MiddlewareContext) -> Response {
    let mut resp = Response::new(ctx.response_status);
    for (name, value) in ctx.response_headers {
        resp = resp.header(name, value);
    }
    if let Some(content_type) = ctx.content_type_override {
        resp = resp.header("Content-Type", content_type);
    }
    if let Some(body) = ctx.response_body {
        resp = resp.body(body);
    }
    resp
}

async fn dispatch_one(
    message: &ParsedMessage,
    router: &Router,
    middleware: &RwLock<Chain>,
    arenas: &Arenas,
    handlers: &HandlerRegistry,
    bridge: Option<&dyn BridgeCallback>,
    handle: ConnectionHandle,
) -> Option<Response> {
    if message.parse_failed_415 {
        return Some(Response::unsupported_media_type());
    }

    let mut request = Request::new(
        message.method.clone(),
        message.path.clone(),
        message.query.clone(),
        message.headers.clone(),
        message.body.clone(),
        message.content_type,
    );

    if let Some(bridge) = bridge {
        return match bridge.dispatch(handle, &request).await {
            BridgeOutcome::Respond(resp) => Some(resp),
            BridgeOutcome::Handled => None,
        };
    }

    let route_match = router.match_route(&request.method, &request.path);
    request.path_params = route_match.params.clone();

    match route_match.status_hint {
        404 => return Some(Response::not_found()),
        405 => {
            return Some(Response::method_not_allowed(
                route_match.allowed_methods.as_deref().unwrap_or(""),
            ))
        }
        _ => {}
    }

    let route = route_match.route?;

    // A→C: arena-allocate the connection state driving this dispatch (§2), freed
    // and purged once the post-route chain has run.
    let state_blob = connection_state_blob(&request);
    let state_ptr = match arenas.alloc(ArenaId::Request, state_blob.len().max(1)) {
        Ok(mut ptr) => {
            if !state_blob.is_empty() {
                unsafe { ptr.as_slice_mut()[..state_blob.len()].copy_from_slice(&state_blob) };
            }
            Some(ptr)
        }
        Err(e) => {
            tracing::warn!(error = %e, "REQUEST arena exhausted, dispatching without staged state");
            None
        }
    };

    let mut ctx = MiddlewareContext::new(request.headers.clone());
    let mut global = middleware.write();
    let mut per_route = (!route.middleware_chain.is_empty())
        .then(|| global.subset(&route.middleware_chain));

    let (proceed, start) = middleware::execute_pre_route(&mut global, per_route.as_mut(), &mut ctx);

    // A streaming response bypasses the post-route body fold entirely: once a
    // handler has handed off a live Stream there is no fixed body for post-route
    // middleware to rewrite, and the connection loop drives the Stream directly.
    let mut streamed: Option<Response> = None;

    if proceed {
        match handlers.get(route.handler) {
            Some(handler) => {
                let response = handler(&request, &mut ctx);
                if response.stream().is_some() {
                    streamed = Some(response);
                } else {
                    apply_response_to_ctx(response, &mut ctx);
                }
            }
            None => {
                tracing::warn!(handler_id = route.handler, "no handler registered for matched route");
                ctx.set_status(500);
            }
        }
    }

    // Post-route middleware (and its stats recording) still runs even for a
    // streamed response; its effect on ctx.response_status/body is simply unused
    // below, since the Stream itself already carries the wire status/headers.
    middleware::execute_post_route(&mut global, per_route.as_mut(), &mut ctx, proceed, start);
    drop(global);

    if let Some(ptr) = state_ptr {
        let _ = arenas.free(ArenaId::Request, ptr);
    }
    arenas.purge(ArenaId::Request);

    streamed.or_else(|| Some(response_from_ctx(ctx)))
}
