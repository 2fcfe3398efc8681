//! Proxy engine: accept loop, CONNECT dispatch, per-flow pipeline.
//!
//! One task per accepted connection. Plain connections speak
//! absolute-form HTTP/1.1; CONNECT tunnels are TLS-intercepted with a
//! minted leaf certificate, falling back to raw passthrough when the
//! client does not speak TLS (or speaks a non-HTTP protocol after the
//! handshake). WebSocket upgrades switch the connection into
//! frame-splicing mode.

use crate::ca::CertificateAuthority;
use crate::client::{headers_from_response, UpstreamClient, UpstreamOptions};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::http1::{self, PrefixedStream, RequestHead};
use crate::intercept::{InterceptCoordinator, InterceptDecision, InterceptPhase};
use crate::rules::{self, RuleEngine, RulePhase, RuleSnapshot};
use crate::websocket::{self, Frame};
use crate::Result;
use chrono::Utc;
use flow_engine::{Flow, Recorder, Scheme, WebSocketDirection, WebSocketMessage};
use futures::StreamExt;
use proxy_common::{EventBus, Headers, Topic};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Recorded WebSocket frames are capped per flow to bound memory.
const MAX_RECORDED_WS_MESSAGES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub state: ProxyState,
    pub host: String,
    pub port: u16,
    pub intercept_enabled: bool,
    pub requests_total: u64,
    pub requests_intercepted: u64,
}

#[derive(Default)]
struct Stats {
    requests_total: AtomicU64,
    requests_intercepted: AtomicU64,
}

/// Everything a connection task needs.
struct Shared {
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    rules: Arc<RuleEngine>,
    coordinator: Arc<InterceptCoordinator>,
    client: UpstreamClient,
    recorder: Arc<Recorder>,
    bus: EventBus,
    stats: Stats,
}

struct Runtime {
    state: ProxyState,
    host: String,
    port: u16,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

pub struct ProxyEngine {
    shared: Arc<Shared>,
    runtime: Mutex<Runtime>,
}

impl ProxyEngine {
    pub fn new(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        rules: Arc<RuleEngine>,
        coordinator: Arc<InterceptCoordinator>,
        recorder: Arc<Recorder>,
        bus: EventBus,
    ) -> Result<Self> {
        let client = UpstreamClient::new()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                ca,
                rules,
                coordinator,
                client,
                recorder,
                bus,
                stats: Stats::default(),
            }),
            runtime: Mutex::new(Runtime {
                state: ProxyState::Stopped,
                host: String::new(),
                port: 0,
                shutdown: None,
                accept_task: None,
            }),
        })
    }

    pub async fn start(&self, host: &str, port: u16) -> Result<()> {
        {
            let runtime = lock(&self.runtime);
            if runtime.state == ProxyState::Running {
                return Err(ProxyError::AlreadyRunning);
            }
        }

        let addr = format!("{}:{}", host, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                let mut runtime = lock(&self.runtime);
                runtime.state = ProxyState::Error;
                return Err(ProxyError::Bind { addr, source: e });
            }
        };
        // Port 0 binds an ephemeral port; report the real one.
        let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let task = tokio::spawn(accept_loop(shared, listener, shutdown_rx));

        {
            let mut runtime = lock(&self.runtime);
            runtime.state = ProxyState::Running;
            runtime.host = host.to_string();
            runtime.port = bound_port;
            runtime.shutdown = Some(shutdown_tx);
            runtime.accept_task = Some(task);
        }

        info!(host, port = bound_port, "proxy listening");
        self.publish_status();
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let (shutdown, task) = {
            let mut runtime = lock(&self.runtime);
            if runtime.state != ProxyState::Running {
                return Err(ProxyError::NotRunning);
            }
            runtime.state = ProxyState::Stopped;
            (runtime.shutdown.take(), runtime.accept_task.take())
        };

        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        // Shutdown resolves every held flow as forward.
        self.shared.coordinator.shutdown();

        info!("proxy stopped");
        self.publish_status();
        Ok(())
    }

    pub fn status(&self) -> ProxyStatus {
        let runtime = lock(&self.runtime);
        ProxyStatus {
            state: runtime.state,
            host: runtime.host.clone(),
            port: runtime.port,
            intercept_enabled: self.shared.coordinator.is_enabled(),
            requests_total: self.shared.stats.requests_total.load(Ordering::Relaxed),
            requests_intercepted: self
                .shared
                .stats
                .requests_intercepted
                .load(Ordering::Relaxed),
        }
    }

    pub fn toggle_intercept(&self) -> bool {
        let enabled = self.shared.coordinator.toggle();
        self.publish_status();
        enabled
    }

    pub fn coordinator(&self) -> Arc<InterceptCoordinator> {
        self.shared.coordinator.clone()
    }

    pub fn upstream_client(&self) -> UpstreamClient {
        self.shared.client.clone()
    }

    fn publish_status(&self) {
        let status = self.status();
        if let Ok(data) = serde_json::to_value(&status) {
            self.shared.bus.publish(Topic::ProxyStatus, data);
        }
    }
}

fn lock(runtime: &Mutex<Runtime>) -> std::sync::MutexGuard<'_, Runtime> {
    match runtime.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(shared, stream).await {
                            debug!(peer = %peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream);

    // Peek the first head without consuming the connection mode decision.
    let head = match http1::read_request_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(e @ ProxyError::ClientProtocol(_)) => {
            let _ = http1::write_simple_response(&mut reader, 400, "Bad Request", "malformed request").await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    if head.is_connect() {
        return handle_connect(shared, reader, head).await;
    }

    // Forward-proxy mode: absolute-form requests over a keep-alive loop.
    serve_requests(shared, reader, None, Some(head)).await
}

/// CONNECT tunnel: TLS MITM with passthrough fallbacks.
async fn handle_connect(
    shared: Arc<Shared>,
    reader: BufReader<TcpStream>,
    head: RequestHead,
) -> Result<()> {
    let (host, port) = parse_authority(&head.target)?;

    let leftover = reader.buffer().to_vec();
    let mut stream = PrefixedStream::new(leftover, reader.into_inner());
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;

    // First byte decides: 0x16 is a TLS handshake record, anything else is
    // a client speaking plaintext through the tunnel.
    let mut first = [0u8; 1];
    if stream.read_exact(&mut first).await.is_err() {
        return Ok(());
    }
    let stream = PrefixedStream::new(vec![first[0]], stream);
    if first[0] != 0x16 {
        return passthrough_raw(shared, stream, host, port).await;
    }

    let leaf = shared.ca.leaf_for_host(&host).await?;
    let tls_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(leaf.chain.clone(), leaf.key.clone())
        .map_err(|e| ProxyError::Tls(format!("invalid leaf certificate: {}", e)))?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| ProxyError::Tls(format!("TLS handshake with client failed: {}", e)))?;

    let mut reader = BufReader::new(tls_stream);

    // A client that upgrades to a non-HTTP protocol after TLS never sends
    // a request line; degrade to passthrough over a fresh upstream TLS leg.
    let preview = reader.fill_buf().await?;
    if !looks_like_http_request(preview) {
        let buffered = reader.buffer().to_vec();
        let raw = reader.into_inner();
        return passthrough_tls(shared, PrefixedStream::new(buffered, raw), host, port).await;
    }

    serve_requests(shared, reader, Some((host, port)), None).await
}

/// Does the buffer begin like an HTTP/1.x request line?
fn looks_like_http_request(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let token_end = buf
        .iter()
        .position(|b| *b == b' ')
        .unwrap_or_else(|| buf.len().min(10));
    if token_end == 0 || token_end > 10 {
        return false;
    }
    buf[..token_end]
        .iter()
        .all(|b| b.is_ascii_uppercase() || *b == b'-')
}

/// Keep-alive request loop shared by the plain and TLS legs. `tunnel`
/// carries the CONNECT authority for origin-form targets.
async fn serve_requests<S>(
    shared: Arc<Shared>,
    mut reader: BufReader<S>,
    tunnel: Option<(String, u16)>,
    mut first_head: Option<RequestHead>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let head = match first_head.take() {
            Some(head) => head,
            None => match http1::read_request_head(&mut reader).await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                Err(e @ ProxyError::ClientProtocol(_)) => {
                    let _ = http1::write_simple_response(
                        &mut reader,
                        400,
                        "Bad Request",
                        "malformed request",
                    )
                    .await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            },
        };

        let keep_alive = head.wants_keep_alive();
        let body = http1::read_body(&mut reader, &head.headers).await?;
        let flow = match flow_from_head(&head, tunnel.as_ref(), body) {
            Ok(flow) => flow,
            Err(e) => {
                let _ = http1::write_simple_response(&mut reader, 400, "Bad Request", "bad target")
                    .await;
                return Err(e);
            }
        };

        let keep_going = process_flow(&shared, &mut reader, flow, &head).await?;
        if !keep_going || !keep_alive {
            return Ok(());
        }
    }
}

/// Build a flow from a parsed head. Origin-form targets take host/port
/// from the tunnel authority (or the Host header); absolute-form targets
/// carry their own.
fn flow_from_head(
    head: &RequestHead,
    tunnel: Option<&(String, u16)>,
    body: Vec<u8>,
) -> Result<Flow> {
    let (scheme, host, port, path, query) = if head.target.starts_with("http://")
        || head.target.starts_with("https://")
    {
        let parsed = url::Url::parse(&head.target)
            .map_err(|e| ProxyError::ClientProtocol(format!("invalid absolute target: {}", e)))?;
        let scheme = if parsed.scheme() == "https" {
            Scheme::Https
        } else {
            Scheme::Http
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| ProxyError::ClientProtocol("absolute target without host".to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or(scheme.default_port());
        let path = if parsed.path().is_empty() {
            "/".to_string()
        } else {
            parsed.path().to_string()
        };
        let query = parsed.query().map(|q| q.to_string());
        (scheme, host, port, path, query)
    } else {
        let (scheme, host, port) = match tunnel {
            Some((host, port)) => (Scheme::Https, host.clone(), *port),
            None => {
                let authority = head.headers.get("host").ok_or_else(|| {
                    ProxyError::ClientProtocol("origin-form request without Host".to_string())
                })?;
                let (host, port) = split_host_port(authority, 80);
                (Scheme::Http, host, port)
            }
        };
        let (path, query) = match head.target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (head.target.clone(), None),
        };
        (scheme, host, port, path, query)
    };

    let mut flow = Flow::new(scheme, head.method.clone(), host, port);
    flow.path = path;
    flow.query = query;
    flow.request_headers = head.headers.clone();
    flow.request_body = body;
    Ok(flow)
}

fn parse_authority(target: &str) -> Result<(String, u16)> {
    let (host, port) = split_host_port(target, 443);
    if host.is_empty() {
        return Err(ProxyError::ClientProtocol(format!(
            "invalid CONNECT target: {:?}",
            target
        )));
    }
    Ok((host, port))
}

fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), default_port),
        },
        None => (authority.to_string(), default_port),
    }
}

/// Run one flow through the full pipeline. Returns false when the
/// connection must close (drop decision, stream error, websocket splice).
async fn process_flow<S>(
    shared: &Arc<Shared>,
    io: &mut BufReader<S>,
    mut flow: Flow,
    head: &RequestHead,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    shared.stats.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let snapshot = shared.rules.snapshot();

    // Request-phase rules.
    let eval = rules::evaluate(&flow, RulePhase::Request, &snapshot);
    log_rule_errors(&flow, &eval.rule_errors);
    rules::apply(&mut flow, RulePhase::Request, &eval);
    if eval.blocked_by.is_some() {
        synthesize_response(&mut flow, 403, "Forbidden", b"Blocked by proxy rule".to_vec());
        flow.modified = true;
        http1::write_simple_response(io, 403, "Forbidden", "Blocked by proxy rule").await?;
        finalize(shared, flow, started).await;
        return Ok(true);
    }

    // Request-phase interception.
    if shared.coordinator.is_enabled() {
        flow.intercepted = true;
        shared
            .stats
            .requests_intercepted
            .fetch_add(1, Ordering::Relaxed);
        match shared
            .coordinator
            .submit(flow.id, InterceptPhase::Request, flow.detail())
            .await
        {
            Ok(InterceptDecision::Forward) | Err(_) => {}
            Ok(InterceptDecision::Drop) => {
                flow.error = Some("dropped by operator".to_string());
                finalize(shared, flow, started).await;
                return Ok(false);
            }
            Ok(InterceptDecision::ForwardModified { headers, body, .. }) => {
                if let Some(headers) = headers {
                    flow.request_headers = headers;
                }
                if let Some(body) = body {
                    flow.request_body = body;
                }
                flow.modified = true;
            }
        }
    }

    if head.is_websocket_upgrade() {
        return handle_websocket(shared, io, flow, started).await;
    }

    // Upstream dispatch.
    let options = UpstreamOptions {
        timeout: shared.config.upstream_timeout(),
        follow_redirects: false,
    };
    let forward_headers = flow.request_headers.without_hop_by_hop();
    let response = match shared
        .client
        .send(
            &flow.method,
            &flow.url(),
            &forward_headers,
            flow.request_body.clone(),
            &options,
        )
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(flow_id = %flow.id, error = %e, "upstream dispatch failed");
            flow.error = Some(e.to_string());
            synthesize_response(&mut flow, 502, "Bad Gateway", b"upstream error".to_vec());
            http1::write_simple_response(io, 502, "Bad Gateway", "upstream error").await?;
            finalize(shared, flow, started).await;
            return Ok(true);
        }
    };

    flow.response_status = Some(response.status().as_u16());
    flow.response_reason = response
        .status()
        .canonical_reason()
        .map(|r| r.to_string())
        .or_else(|| Some(http1::reason_phrase(response.status().as_u16()).to_string()));
    flow.response_headers = headers_from_response(&response);

    let intercept_response =
        shared.coordinator.is_enabled() && shared.config.intercept_responses;
    let buffer_response = intercept_response || snapshot.has_rules_for(RulePhase::Response);

    let keep_going = if buffer_response {
        handle_buffered_response(shared, io, &mut flow, response, &snapshot, intercept_response)
            .await?
    } else {
        stream_response(io, &mut flow, response).await?
    };

    finalize(shared, flow, started).await;
    Ok(keep_going)
}

/// Buffered response path: rules run before the intercept slot so the
/// operator sees rule-modified payloads. Returns false when the
/// connection must close without a response (drop decision, dead
/// upstream body).
async fn handle_buffered_response<S>(
    shared: &Arc<Shared>,
    io: &mut BufReader<S>,
    flow: &mut Flow,
    response: reqwest::Response,
    snapshot: &RuleSnapshot,
    intercept_response: bool,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match response.bytes().await {
        Ok(bytes) => flow.response_body = bytes.to_vec(),
        Err(e) => {
            flow.error = Some(format!("upstream body read failed: {}", e));
            synthesize_response(flow, 502, "Bad Gateway", b"upstream error".to_vec());
            let _ = http1::write_simple_response(io, 502, "Bad Gateway", "upstream error").await;
            return Ok(false);
        }
    }

    let eval = rules::evaluate(flow, RulePhase::Response, snapshot);
    log_rule_errors(flow, &eval.rule_errors);
    rules::apply(flow, RulePhase::Response, &eval);
    if eval.blocked_by.is_some() {
        synthesize_response(flow, 403, "Forbidden", b"Blocked by proxy rule".to_vec());
        flow.modified = true;
    }

    if intercept_response {
        flow.intercepted = true;
        match shared
            .coordinator
            .submit(flow.id, InterceptPhase::Response, flow.detail())
            .await
        {
            Ok(InterceptDecision::Forward) | Err(_) => {}
            Ok(InterceptDecision::Drop) => {
                flow.error = Some("dropped by operator".to_string());
                return Ok(false);
            }
            Ok(InterceptDecision::ForwardModified {
                headers,
                body,
                status,
            }) => {
                if let Some(headers) = headers {
                    flow.response_headers = headers;
                }
                if let Some(body) = body {
                    flow.response_body = body;
                }
                if let Some(status) = status {
                    flow.response_status = Some(status);
                    flow.response_reason = Some(http1::reason_phrase(status).to_string());
                }
                flow.modified = true;
            }
        }
    }

    let status = flow.response_status.unwrap_or(502);
    let reason = flow
        .response_reason
        .clone()
        .unwrap_or_else(|| http1::reason_phrase(status).to_string());
    let mut out_headers = flow.response_headers.without_hop_by_hop();
    out_headers.remove_all("content-length");
    out_headers.push("Content-Length", flow.response_body.len().to_string());

    http1::write_response_head(io, status, &reason, &out_headers).await?;
    io.write_all(&flow.response_body).await?;
    io.flush().await?;
    Ok(true)
}

/// Streaming response path: headers first, then body chunks mirrored
/// into the flow as they pass. Returns false when the client went away.
async fn stream_response<S>(
    io: &mut BufReader<S>,
    flow: &mut Flow,
    response: reqwest::Response,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let status = flow.response_status.unwrap_or(502);
    let reason = flow
        .response_reason
        .clone()
        .unwrap_or_else(|| http1::reason_phrase(status).to_string());

    let mut out_headers = flow.response_headers.without_hop_by_hop();
    let content_length = out_headers.content_length();
    let rechunk = content_length.is_none();
    if rechunk {
        out_headers.remove_all("content-length");
        out_headers.push("Transfer-Encoding", "chunked");
    }
    http1::write_response_head(io, status, &reason, &out_headers).await?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // Mid-stream upstream failure: the head is already gone,
                // all we can do is cut the connection.
                flow.error = Some(format!("upstream stream failed: {}", e));
                return Ok(false);
            }
        };
        flow.response_body.extend_from_slice(&chunk);

        let write_result = if rechunk {
            http1::write_chunk(io, &chunk).await
        } else {
            io.write_all(&chunk).await.map_err(ProxyError::Io)
        };
        if write_result.is_err() {
            // Client disconnect cancels the upstream transfer; dropping
            // the stream aborts it cooperatively.
            flow.error = Some("client disconnected mid-stream".to_string());
            return Ok(false);
        }
    }
    if rechunk {
        http1::write_chunk_end(io).await?;
    } else {
        io.flush().await?;
    }
    Ok(true)
}

/// WebSocket upgrade: forward the handshake, then splice frames.
/// Always consumes the connection.
async fn handle_websocket<S>(
    shared: &Arc<Shared>,
    io: &mut BufReader<S>,
    mut flow: Flow,
    started: Instant,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let options = UpstreamOptions {
        timeout: shared.config.upstream_timeout(),
        follow_redirects: false,
    };
    let mut forward_headers = flow.request_headers.without_hop_by_hop();
    forward_headers.set("Connection", "Upgrade");
    forward_headers.set("Upgrade", "websocket");

    let response = match shared
        .client
        .send(&flow.method, &flow.url(), &forward_headers, Vec::new(), &options)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            flow.error = Some(e.to_string());
            synthesize_response(&mut flow, 502, "Bad Gateway", b"upstream error".to_vec());
            let _ = http1::write_simple_response(io, 502, "Bad Gateway", "upstream error").await;
            finalize(shared, flow, started).await;
            return Ok(false);
        }
    };

    flow.response_status = Some(response.status().as_u16());
    flow.response_reason = response.status().canonical_reason().map(|r| r.to_string());
    flow.response_headers = headers_from_response(&response);

    if response.status().as_u16() != 101 {
        // Upstream refused the upgrade; relay as a normal response.
        let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        flow.response_body = body;
        let status = flow.response_status.unwrap_or(502);
        let reason = flow
            .response_reason
            .clone()
            .unwrap_or_else(|| http1::reason_phrase(status).to_string());
        let mut out_headers = flow.response_headers.without_hop_by_hop();
        out_headers.remove_all("content-length");
        out_headers.push("Content-Length", flow.response_body.len().to_string());
        http1::write_response_head(io, status, &reason, &out_headers).await?;
        io.write_all(&flow.response_body).await?;
        io.flush().await?;
        finalize(shared, flow, started).await;
        return Ok(true);
    }

    // Answer the client handshake ourselves with the accept key derived
    // from its nonce.
    let mut handshake = Headers::new();
    handshake.push("Upgrade", "websocket");
    handshake.push("Connection", "Upgrade");
    if let Some(key) = flow.request_headers.get("sec-websocket-key") {
        handshake.push("Sec-WebSocket-Accept", websocket::accept_key(key));
    }
    if let Some(protocol) = flow.response_headers.get("sec-websocket-protocol") {
        handshake.push("Sec-WebSocket-Protocol", protocol.to_string());
    }
    http1::write_response_head(io, 101, "Switching Protocols", &handshake).await?;

    let upgraded = match response.upgrade().await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            flow.error = Some(format!("upstream upgrade failed: {}", e));
            finalize(shared, flow, started).await;
            return Ok(false);
        }
    };

    flow.is_websocket = true;
    flow.scheme = match flow.scheme {
        Scheme::Https | Scheme::Wss => Scheme::Wss,
        _ => Scheme::Ws,
    };

    splice_frames(shared, io, upgraded, &mut flow).await;
    finalize(shared, flow, started).await;
    Ok(false)
}

/// Relay frames between the legs, recording data frames on the parent
/// flow and publishing them on the bus. A close frame from either side
/// ends the splice and finalizes the flow.
async fn splice_frames<S, U>(
    shared: &Arc<Shared>,
    client: &mut BufReader<S>,
    upstream: U,
    flow: &mut Flow,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use tokio::sync::mpsc;

    let (record_tx, mut record_rx) = mpsc::unbounded_channel::<WebSocketMessage>();

    // Frames the client may have pipelined behind the handshake.
    let buffered = client.buffer().to_vec();
    let client_stream = PrefixedStream::new(buffered, client.get_mut());

    let (client_read, client_write) = tokio::io::split(client_stream);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let to_upstream = relay_direction(
        client_read,
        upstream_write,
        record_tx.clone(),
        WebSocketDirection::ClientToUpstream,
        true,
    );
    let to_client = relay_direction(
        upstream_read,
        client_write,
        record_tx,
        WebSocketDirection::UpstreamToClient,
        false,
    );

    let flow_id = flow.id;
    let messages = &mut flow.websocket_messages;
    let record_loop = async {
        while let Some(message) = record_rx.recv().await {
            let payload_b64 = BASE64.encode(&message.payload);
            shared.bus.publish(
                Topic::WebsocketMessage,
                serde_json::json!({
                    "flow_id": flow_id,
                    "direction": message.direction,
                    "opcode": message.opcode,
                    "payload_b64": payload_b64,
                }),
            );
            if messages.len() < MAX_RECORDED_WS_MESSAGES {
                messages.push(message);
            }
        }
    };

    let _ = tokio::join!(to_upstream, to_client, record_loop);
}

async fn relay_direction<R, W>(
    mut reader: R,
    mut writer: W,
    record: tokio::sync::mpsc::UnboundedSender<WebSocketMessage>,
    direction: WebSocketDirection,
    mask_outgoing: bool,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let frame: Frame = match websocket::read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(_) => break,
        };
        if frame.is_data() || frame.is_close() {
            let _ = record.send(WebSocketMessage {
                opcode: frame.opcode,
                direction,
                payload: frame.payload.clone(),
                truncated: false,
                timestamp: Utc::now(),
            });
        }
        if websocket::write_frame(&mut writer, &frame, mask_outgoing)
            .await
            .is_err()
        {
            break;
        }
        if frame.is_close() {
            break;
        }
    }
}

/// Raw byte tunnel for CONNECT clients that never start TLS. Timing and
/// host are still recorded.
async fn passthrough_raw<S>(shared: Arc<Shared>, client: S, host: String, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let started = Instant::now();
    let mut flow = Flow::new(Scheme::Https, "CONNECT", host.clone(), port);
    flow.tags.insert("passthrough".to_string());

    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(mut upstream) => {
            let mut client = client;
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        }
        Err(e) => {
            flow.error = Some(format!("passthrough connect failed: {}", e));
        }
    }

    finalize(&shared, flow, started).await;
    Ok(())
}

/// Passthrough after our TLS handshake: re-encrypt to the origin without
/// verification and splice raw bytes.
async fn passthrough_tls<S>(shared: Arc<Shared>, client: S, host: String, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let started = Instant::now();
    let mut flow = Flow::new(Scheme::Https, "CONNECT", host.clone(), port);
    flow.tags.insert("passthrough".to_string());

    match connect_tls_no_verify(&host, port).await {
        Ok(mut upstream) => {
            let mut client = client;
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        }
        Err(e) => {
            flow.error = Some(e.to_string());
        }
    }

    finalize(&shared, flow, started).await;
    Ok(())
}

struct NoVerify;

impl rustls::client::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

async fn connect_tls_no_verify(
    host: &str,
    port: u16,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| ProxyError::Upstream(format!("connect to {}:{} failed: {}", host, port, e)))?;

    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    let server_name = rustls::ServerName::try_from(host)
        .map_err(|_| ProxyError::Tls(format!("invalid SNI host: {}", host)))?;

    tokio_rustls::TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProxyError::Tls(format!("upstream TLS handshake failed: {}", e)))
}

fn synthesize_response(flow: &mut Flow, status: u16, reason: &str, body: Vec<u8>) {
    flow.response_status = Some(status);
    flow.response_reason = Some(reason.to_string());
    let mut headers = Headers::new();
    headers.push("Content-Type", "text/plain; charset=utf-8");
    headers.push("Content-Length", body.len().to_string());
    flow.response_headers = headers;
    flow.response_body = body;
}

fn log_rule_errors(flow: &Flow, errors: &[(uuid::Uuid, String)]) {
    for (rule_id, reason) in errors {
        warn!(flow_id = %flow.id, rule_id = %rule_id, reason = %reason, "rule skipped for flow");
    }
}

/// Stamp duration, apply the storage cap, persist, announce.
async fn finalize(shared: &Arc<Shared>, mut flow: Flow, started: Instant) {
    flow.duration_ms = Some(started.elapsed().as_millis() as u64);
    apply_body_cap(&mut flow, shared.config.body_cap);
    shared.recorder.record(flow).await;
}

/// Truncate stored bodies at the cap, tracking how many bytes were cut.
/// A body exactly at the cap is stored complete with no truncation flag.
fn apply_body_cap(flow: &mut Flow, cap: usize) {
    if flow.request_body.len() > cap {
        flow.truncated_bytes = (flow.request_body.len() - cap) as u64;
        flow.request_body.truncate(cap);
    }
    if flow.response_body.len() > cap {
        flow.response_truncated_bytes = (flow.response_body.len() - cap) as u64;
        flow.response_body.truncate(cap);
    }
    for message in &mut flow.websocket_messages {
        if message.payload.len() > cap {
            message.payload.truncate(cap);
            message.truncated = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_parsing() {
        assert_eq!(
            parse_authority("example.test:8443").unwrap(),
            ("example.test".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("example.test").unwrap(),
            ("example.test".to_string(), 443)
        );
    }

    #[test]
    fn http_request_sniffing() {
        assert!(looks_like_http_request(b"GET / HTTP/1.1\r\n"));
        assert!(looks_like_http_request(b"DELETE /x HTTP/1.1\r\n"));
        assert!(!looks_like_http_request(&[0x16, 0x03, 0x01]));
        assert!(!looks_like_http_request(b""));
        assert!(!looks_like_http_request(b"lowercase nonsense"));
    }

    #[test]
    fn body_cap_boundaries() {
        let mut flow = Flow::new(Scheme::Http, "POST", "h", 80);
        flow.request_body = vec![0u8; 100];
        apply_body_cap(&mut flow, 100);
        assert_eq!(flow.truncated_bytes, 0);
        assert_eq!(flow.request_body.len(), 100);
        assert!(!flow.truncated());

        let mut flow = Flow::new(Scheme::Http, "POST", "h", 80);
        flow.request_body = vec![0u8; 101];
        apply_body_cap(&mut flow, 100);
        assert_eq!(flow.truncated_bytes, 1);
        assert_eq!(flow.request_body.len(), 100);
        assert!(flow.truncated());
    }

    #[test]
    fn absolute_form_flow() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "http://site.test:8080/a/b?x=1".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
        };
        let flow = flow_from_head(&head, None, Vec::new()).unwrap();
        assert_eq!(flow.scheme, Scheme::Http);
        assert_eq!(flow.host, "site.test");
        assert_eq!(flow.port, 8080);
        assert_eq!(flow.path, "/a/b");
        assert_eq!(flow.query.as_deref(), Some("x=1"));
    }

    #[test]
    fn origin_form_flow_uses_tunnel_authority() {
        let head = RequestHead {
            method: "POST".to_string(),
            target: "/api/echo".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
        };
        let tunnel = ("secure.test".to_string(), 443u16);
        let flow = flow_from_head(&head, Some(&tunnel), b"{}".to_vec()).unwrap();
        assert_eq!(flow.scheme, Scheme::Https);
        assert_eq!(flow.host, "secure.test");
        assert_eq!(flow.port, 443);
        assert_eq!(flow.path, "/api/echo");
        assert_eq!(flow.request_body, b"{}");
    }

    #[test]
    fn origin_form_flow_requires_host_without_tunnel() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "/".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
        };
        assert!(flow_from_head(&head, None, Vec::new()).is_err());
    }
}
