//! End-to-end proxy tests against a local origin server.

use flow_engine::store::memory::MemoryFlowStore;
use flow_engine::{FlowFilter, FlowStore, Recorder, Scheme};
use proxy_common::EventBus;
use proxy_core::intercept::{InterceptDecision, InterceptPhase};
use proxy_core::rules::{ActionType, ApplyTo, MatchType, Rule};
use proxy_core::{CertificateAuthority, InterceptCoordinator, ProxyConfig, ProxyEngine, RuleEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// Minimal origin: answers every request with 200 and echoes the request
/// body after a marker so tests can observe what the upstream received.
async fn spawn_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let header_end = loop {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                while buf.len() < header_end + content_length {
                    let Ok(n) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let body = &buf[header_end..];

                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let payload = format!("path={};echo={}", path, String::from_utf8_lossy(body));
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Origin: test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    payload.len(),
                    payload
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    port
}

struct Harness {
    engine: Arc<ProxyEngine>,
    store: Arc<MemoryFlowStore>,
    rules: Arc<RuleEngine>,
    coordinator: Arc<InterceptCoordinator>,
    ca: Arc<CertificateAuthority>,
    proxy_port: u16,
}

async fn start_proxy() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::default();
    let store = Arc::new(MemoryFlowStore::new());
    let ca = Arc::new(CertificateAuthority::new(dir.path(), 825).unwrap());
    let rules = Arc::new(RuleEngine::new());
    let coordinator = Arc::new(InterceptCoordinator::new(bus.clone()));
    let recorder = Arc::new(Recorder::new(store.clone(), bus.clone()));

    let engine = Arc::new(
        ProxyEngine::new(
            ProxyConfig::default(),
            ca.clone(),
            rules.clone(),
            coordinator.clone(),
            recorder,
            bus,
        )
        .unwrap(),
    );
    engine.start("127.0.0.1", 0).await.unwrap();
    let proxy_port = engine.status().port;
    // Keep the temp CA dir alive for the whole process.
    std::mem::forget(dir);

    Harness {
        engine,
        store,
        rules,
        coordinator,
        ca,
        proxy_port,
    }
}

/// TLS origin with a self-signed certificate for `localhost`, answering
/// every request with a fixed body.
async fn spawn_tls_origin() -> u16 {
    use rcgen::generate_simple_self_signed;
    use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
    use tokio_rustls::TlsAcceptor;

    let cert = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(
            vec![Certificate(cert.serialize_der().unwrap())],
            PrivateKey(cert.serialize_private_key_der()),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                // Read up to the end of the request head.
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let Ok(n) = tls.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let body = "secret-page";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = tls.write_all(response.as_bytes()).await;
                let _ = tls.shutdown().await;
            });
        }
    });
    port
}

#[tokio::test]
async fn https_mitm_serves_trusted_leaf_and_records_flow() {
    let origin_port = spawn_tls_origin().await;
    let harness = start_proxy().await;

    // A client that trusts only our root CA: the request succeeds only
    // if the minted leaf carries SAN=localhost and chains to the root.
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://127.0.0.1:{}", harness.proxy_port)).unwrap())
        .add_root_certificate(
            reqwest::Certificate::from_pem(harness.ca.ca_cert_pem().as_bytes()).unwrap(),
        )
        .build()
        .unwrap();

    let response = client
        .get(format!("https://localhost:{}/secret", origin_port))
        .send()
        .await
        .expect("MITM leaf must validate against the installed root");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "secret-page");

    let flow = wait_for_flow(&harness.store).await;
    assert_eq!(flow.scheme, Scheme::Https);
    assert_eq!(flow.host, "localhost");
    assert_eq!(flow.path, "/secret");
    assert_eq!(flow.response_status, Some(200));
    assert_eq!(flow.response_body, b"secret-page".to_vec());

    harness.engine.stop().await.unwrap();
}

/// Send one absolute-form request through the proxy and return the raw
/// response bytes.
async fn proxy_request(proxy_port: u16, request: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

async fn wait_for_flow(store: &MemoryFlowStore) -> flow_engine::Flow {
    for _ in 0..100 {
        let flows = store.list_flows(&FlowFilter::default()).await.unwrap();
        if let Some(flow) = flows.into_iter().next() {
            return flow;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no flow recorded");
}

#[tokio::test]
async fn transparent_pass_through_records_flow() {
    let origin_port = spawn_origin().await;
    let harness = start_proxy().await;

    let request = format!(
        "GET http://127.0.0.1:{}/ip HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        origin_port, origin_port
    );
    let response = proxy_request(harness.proxy_port, &request).await;
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200"), "got: {}", text);
    assert!(text.contains("path=/ip"));
    // Origin headers pass through.
    assert!(text.to_ascii_lowercase().contains("x-origin: test"));

    let flow = wait_for_flow(&harness.store).await;
    assert_eq!(flow.method, "GET");
    assert_eq!(flow.scheme, Scheme::Http);
    assert_eq!(flow.host, "127.0.0.1");
    assert_eq!(flow.path, "/ip");
    assert_eq!(flow.response_status, Some(200));
    assert!(!flow.modified);
    assert!(!flow.intercepted);
    // The recorded body matches what the client saw.
    assert!(String::from_utf8_lossy(&flow.response_body).contains("path=/ip"));

    harness.engine.stop().await.unwrap();
}

#[tokio::test]
async fn block_rule_synthesizes_403() {
    let origin_port = spawn_origin().await;
    let harness = start_proxy().await;

    harness.rules.load(vec![Rule {
        id: Uuid::new_v4(),
        name: "no admin".to_string(),
        enabled: true,
        priority: 0,
        match_type: MatchType::Url,
        match_pattern: "/admin".to_string(),
        match_regex: false,
        action_type: ActionType::Block,
        action_target: None,
        action_value: None,
        apply_to: ApplyTo::Request,
    }]);

    let request = format!(
        "GET http://127.0.0.1:{}/admin/x HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        origin_port, origin_port
    );
    let response = proxy_request(harness.proxy_port, &request).await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 403"), "got: {}", text);

    let flow = wait_for_flow(&harness.store).await;
    assert_eq!(flow.response_status, Some(403));
    assert!(flow.modified);

    harness.engine.stop().await.unwrap();
}

#[tokio::test]
async fn intercept_forward_modified_changes_upstream_body() {
    let origin_port = spawn_origin().await;
    let harness = start_proxy().await;
    harness.coordinator.toggle();

    let original = r#"{"a":1}"#;
    let request = format!(
        "POST http://127.0.0.1:{}/api/echo HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        origin_port,
        origin_port,
        original.len(),
        original
    );

    let coordinator = harness.coordinator.clone();
    let decider = tokio::spawn(async move {
        // Wait for the request-phase slot, resolve it with a new body,
        // then forward the response-phase slot untouched.
        for _ in 0..200 {
            let pending = coordinator.list();
            if let Some(slot) = pending.first() {
                let flow_id: Uuid =
                    serde_json::from_value(slot["flow_id"].clone()).unwrap();
                let phase: InterceptPhase =
                    serde_json::from_value(slot["phase"].clone()).unwrap();
                let decision = match phase {
                    InterceptPhase::Request => InterceptDecision::ForwardModified {
                        headers: None,
                        body: Some(br#"{"a":2}"#.to_vec()),
                        status: None,
                    },
                    InterceptPhase::Response => InterceptDecision::Forward,
                };
                let _ = coordinator.decide(flow_id, phase, decision);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let response = proxy_request(harness.proxy_port, &request).await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {}", text);
    // The origin observed the operator-modified body.
    assert!(text.contains(r#"echo={"a":2}"#), "got: {}", text);

    let flow = wait_for_flow(&harness.store).await;
    assert!(flow.intercepted);
    assert!(flow.modified);
    assert_eq!(flow.request_body, br#"{"a":2}"#.to_vec());

    decider.abort();
    harness.engine.stop().await.unwrap();
}

#[tokio::test]
async fn connect_to_plaintext_origin_falls_back_to_passthrough() {
    let origin_port = spawn_origin().await;
    let harness = start_proxy().await;

    let mut stream = TcpStream::connect(("127.0.0.1", harness.proxy_port))
        .await
        .unwrap();
    stream
        .write_all(
            format!(
                "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
                origin_port, origin_port
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    // Read the 200 Connection Established reply.
    let mut established = [0u8; 39];
    stream.read_exact(&mut established).await.unwrap();
    assert!(String::from_utf8_lossy(&established).starts_with("HTTP/1.1 200"));

    // Speak plaintext through the tunnel: the proxy must degrade to raw
    // passthrough instead of a TLS handshake.
    stream
        .write_all(b"GET /tunnel HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.contains("path=/tunnel"), "got: {}", text);

    // The passthrough connection is still recorded with host and tag.
    let flow = wait_for_flow(&harness.store).await;
    assert_eq!(flow.method, "CONNECT");
    assert!(flow.tags.contains("passthrough"));

    harness.engine.stop().await.unwrap();
}

#[tokio::test]
async fn upstream_failure_returns_502_with_recorded_error() {
    let harness = start_proxy().await;

    // Unroutable origin port.
    let request =
        "GET http://127.0.0.1:1/dead HTTP/1.1\r\nHost: 127.0.0.1:1\r\nConnection: close\r\n\r\n";
    let response = proxy_request(harness.proxy_port, request).await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 502"), "got: {}", text);

    let flow = wait_for_flow(&harness.store).await;
    assert_eq!(flow.response_status, Some(502));
    assert!(flow.error.is_some());

    harness.engine.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let harness = start_proxy().await;

    let mut stream = TcpStream::connect(("127.0.0.1", harness.proxy_port))
        .await
        .unwrap();
    stream.write_all(b"COMPLETE NONSENSE\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));

    harness.engine.stop().await.unwrap();
}
