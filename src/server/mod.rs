pub mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::GatewayState;

use crate::respond::{self, BoxBody};
use anyhow::Result;
use http::StatusCode;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Bounded wait for in-flight connections at shutdown.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Run the gateway server with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to [`DRAIN_TIMEOUT`] for in-flight requests to complete.
/// Returns whether the drain finished inside the bound — a `false` turns
/// into exit code 1.
pub async fn run_server(
    listen: String,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<bool> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: listening, addr={}", addr);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("gateway_connections_total", "status" => "accepted")
                    .increment(1);
                v
            }
            Err(e) => {
                error!("server: accept failed, error={}", e);
                metrics::counter!("gateway_connections_total", "status" => "error")
                    .increment(1);
                continue;
            }
        };

        metrics::gauge!("gateway_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { handle_request(req, state, peer_addr).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            metrics::gauge!("gateway_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase.
    let active = active_conns.load(Ordering::Relaxed);
    if active == 0 {
        return Ok(true);
    }
    info!("server: waiting for {} active connections to drain", active);
    let drain = async {
        while active_conns.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(_) => {
            info!("server: all connections drained");
            Ok(true)
        }
        Err(_) => {
            let remaining = active_conns.load(Ordering::Relaxed);
            error!(
                "server: drain timeout ({}s), {} connections still active",
                DRAIN_TIMEOUT.as_secs(),
                remaining
            );
            Ok(false)
        }
    }
}

/// Top-level request dispatch: admin surface or tenant prefix.
async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let start = Instant::now();
    let path = req.uri().path().to_string();
    let method = req.method().to_string();
    let client_ip = resolve_client_ip(&state.config, req.headers(), peer_addr);

    let resp = if is_admin_path(&path) {
        admin::handle(req, &state, client_ip).await
    } else {
        dispatch_tenant(req, &state, &path, client_ip).await
    };

    let status = resp.status().as_u16();
    let mut buf = itoa::Buffer::new();
    metrics::counter!(
        "gateway_http_requests_total",
        "method" => method.clone(),
        "status_code" => buf.format(status).to_owned(),
    )
    .increment(1);
    metrics::histogram!("gateway_http_request_duration_seconds")
        .record(start.elapsed().as_secs_f64());

    tracing::info!(
        client_ip = %client_ip,
        method = %method,
        path = %path,
        status = status,
        latency_ms = %start.elapsed().as_millis(),
        "access"
    );

    Ok(resp)
}

/// Paths owned by the gateway itself rather than a tenant. These all sit in
/// the reserved-slug set, so a tenant can never shadow them.
fn is_admin_path(path: &str) -> bool {
    path == "/"
        || path == "/register"
        || path == "/metrics"
        || path == "/sites"
        || path.starts_with("/sites/")
}

/// Dispatch `/<slug>/<rest>` into the tenant's door. Exactly one prefix
/// strip, done with string operations; the door sees `<rest>` and declines
/// paths that are not its own, in which case the gateway 404s against the
/// original path.
async fn dispatch_tenant<B>(
    req: Request<B>,
    state: &GatewayState,
    path: &str,
    client_ip: IpAddr,
) -> Response<BoxBody>
where
    B: hyper::body::Body,
    B::Data: bytes::Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (slug, rest) = match trimmed.split_once('/') {
        Some((slug, rest)) => (slug, format!("/{}", rest)),
        None => (trimmed, String::new()),
    };

    if slug.is_empty() {
        return not_found();
    }
    let Some(door) = state.door(slug) else {
        return not_found();
    };

    match door.handle(req, &rest, client_ip).await {
        Some(resp) => resp,
        None => not_found(),
    }
}

fn not_found() -> Response<BoxBody> {
    respond::error_envelope(StatusCode::NOT_FOUND, "not found")
}

/// Real client IP: the left-most `X-Forwarded-For` entry when a trusted
/// proxy fronts the gateway, the TCP peer otherwise.
fn resolve_client_ip(
    config: &crate::config::GatewayConfig,
    headers: &http::HeaderMap,
    peer_addr: SocketAddr,
) -> IpAddr {
    if config.trusted_proxy {
        if let Some(ip) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
        {
            return ip;
        }
    }
    peer_addr.ip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::registry::Registry;
    use bytes::Bytes;
    use http::Method;
    use http_body_util::Full;

    #[test]
    fn admin_paths() {
        assert!(is_admin_path("/"));
        assert!(is_admin_path("/register"));
        assert!(is_admin_path("/sites"));
        assert!(is_admin_path("/sites/my-store"));
        assert!(is_admin_path("/metrics"));
        assert!(!is_admin_path("/my-store"));
        assert!(!is_admin_path("/my-store/.well-known/agents.json"));
        assert!(!is_admin_path("/registered"));
    }

    #[test]
    fn client_ip_ignores_forwarded_headers_by_default() {
        let peer: SocketAddr = "203.0.113.5:4242".parse().unwrap();
        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.1, 10.0.0.1".parse().unwrap());

        let config = GatewayConfig::default();
        assert_eq!(
            resolve_client_ip(&config, &headers, peer),
            "203.0.113.5".parse::<IpAddr>().unwrap()
        );

        let config = GatewayConfig {
            trusted_proxy: true,
            ..GatewayConfig::default()
        };
        assert_eq!(
            resolve_client_ip(&config, &headers, peer),
            "198.51.100.1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn unknown_slug_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let registry = std::sync::Arc::new(Registry::open(dir.path()).await.unwrap());
        let state = GatewayState::new(
            std::sync::Arc::new(GatewayConfig::default()),
            registry,
        )
        .unwrap();

        let req = Request::builder()
            .method(Method::GET)
            .uri("/ghost/.well-known/agents.json")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = dispatch_tenant(
            req,
            &state,
            "/ghost/.well-known/agents.json",
            "203.0.113.5".parse().unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn door_decline_falls_through_to_404() {
        let dir = tempfile::tempdir().unwrap();
        let registry = std::sync::Arc::new(Registry::open(dir.path()).await.unwrap());
        let state = GatewayState::new(
            std::sync::Arc::new(GatewayConfig::default()),
            registry,
        )
        .unwrap();

        let caps = crate::capability::compile(&serde_json::json!({
            "paths": {"/x": {"get": {"operationId": "x"}}}
        }))
        .unwrap();
        let reg = crate::registry::SiteRegistration {
            slug: "s1".to_string(),
            site_name: "S1".to_string(),
            site_url: "https://s1.example.com".to_string(),
            api_url: "http://127.0.0.1:9".to_string(),
            open_api_url: None,
            rate_limit: 60,
            created_at: chrono::Utc::now(),
            spec_json: String::new(),
        };
        let door = crate::door::Door::new(reg, caps, state.config.clone(), state.http.clone());
        state.insert_door("s1".to_string(), door);

        // A path outside the door's surface 404s...
        let req = Request::builder()
            .method(Method::GET)
            .uri("/s1/random")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp =
            dispatch_tenant(req, &state, "/s1/random", "203.0.113.5".parse().unwrap()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // ...while the discovery document resolves.
        let req = Request::builder()
            .method(Method::GET)
            .uri("/s1/.well-known/agents.json")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = dispatch_tenant(
            req,
            &state,
            "/s1/.well-known/agents.json",
            "203.0.113.5".parse().unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
