use super::GatewayState;
use crate::capability;
use crate::door::Door;
use crate::error::GatewayError;
use crate::guard;
use crate::registry::SiteRegistration;
use crate::respond::{self, BoxBody};
use chrono::Utc;
use http::{HeaderMap, Method, StatusCode};
use hyper::{Request, Response};
use serde_json::{json, Value};
use std::net::IpAddr;
use subtle::ConstantTimeEq;

/// Per-IP admin operations per minute.
const ADMIN_WINDOW_LIMIT: u32 = 20;
/// Per-IP registrations per minute.
const REGISTRATION_WINDOW_LIMIT: u32 = 10;
/// Cap on a fetched OpenAPI document.
const MAX_SPEC_BYTES: usize = 5 * 1024 * 1024;

/// Slugs that collide with the gateway's own surface.
const RESERVED_SLUGS: &[&str] = &[
    "register",
    "sites",
    "health",
    "admin",
    "api",
    "static",
    "assets",
    "favicon.ico",
    "robots.txt",
    ".well-known",
];

/// Handle a request to the admin surface (`/`, `/register`, `/sites*`,
/// `/metrics`). Liveness is open; everything else sits behind the admin
/// key and the per-IP admin window.
pub async fn handle<B>(
    req: Request<B>,
    state: &GatewayState,
    client_ip: IpAddr,
) -> Response<BoxBody>
where
    B: hyper::body::Body,
    B::Data: bytes::Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if path == "/" && method == Method::GET {
        return respond::json_response(
            StatusCode::OK,
            &json!({
                "service": "agent-door",
                "version": env!("CARGO_PKG_VERSION"),
            }),
        );
    }

    let result = dispatch(req, state, client_ip, &method, &path).await;
    match result {
        Ok(resp) => resp,
        Err(e) => {
            if matches!(e, GatewayError::Internal(_) | GatewayError::Http(_)) {
                tracing::error!("admin: request failed, path={}, error={}", path, e);
            }
            respond::from_error(&e)
        }
    }
}

async fn dispatch<B>(
    req: Request<B>,
    state: &GatewayState,
    client_ip: IpAddr,
    method: &Method,
    path: &str,
) -> Result<Response<BoxBody>, GatewayError>
where
    B: hyper::body::Body,
    B::Data: bytes::Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    authorize(&state.config, req.headers())?;

    let decision = state
        .admin_limiter
        .check(&client_ip.to_string(), ADMIN_WINDOW_LIMIT)
        .await;
    if !decision.allowed {
        metrics::counter!(
            "gateway_admin_rate_limit_rejected_total",
            "window" => "admin",
        )
        .increment(1);
        return Err(GatewayError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        });
    }

    if *method == Method::POST && path == "/register" {
        register(req, state, client_ip).await
    } else if *method == Method::GET && path == "/sites" {
        let sites = state.registry.list().await;
        let data = serde_json::to_value(sites)
            .map_err(|e| GatewayError::Internal(format!("serialize sites: {}", e)))?;
        Ok(respond::ok_envelope(data))
    } else if *method == Method::DELETE && path.starts_with("/sites/") {
        delete_site(state, &path["/sites/".len()..]).await
    } else if *method == Method::GET && path == "/metrics" {
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(respond::full_body(state.metrics.render()))
            .unwrap())
    } else {
        Ok(respond::error_envelope(StatusCode::NOT_FOUND, "not found"))
    }
}

/// `DELETE /sites/:slug` — remove the record and destroy the door before
/// answering, so a subsequent request cannot see a half-dead tenant.
async fn delete_site(
    state: &GatewayState,
    slug: &str,
) -> Result<Response<BoxBody>, GatewayError> {
    if slug.is_empty() || slug.contains('/') {
        return Ok(respond::error_envelope(StatusCode::NOT_FOUND, "not found"));
    }

    let had_door = state.remove_door(slug);
    let had_record = state.registry.delete(slug).await?;
    if !had_door && !had_record {
        return Ok(respond::error_envelope(StatusCode::NOT_FOUND, "not found"));
    }

    tracing::info!("admin: site deleted, slug={}", slug);
    Ok(respond::ok_envelope(json!({ "deleted": slug })))
}

/// The registration admission pipeline. Steps run in a fixed order and the
/// first failure terminates:
/// body cap → field shapes → slug policy → rate-limit range → quota →
/// duplicate → URL guard → spec-URL guard → registration window →
/// fetch + compile → persist + install.
async fn register<B>(
    req: Request<B>,
    state: &GatewayState,
    client_ip: IpAddr,
) -> Result<Response<BoxBody>, GatewayError>
where
    B: hyper::body::Body,
    B::Data: bytes::Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();

    let bytes = respond::read_body_capped(
        &parts.headers,
        body,
        state.config.register_body_limit_bytes,
    )
    .await?;

    let request = parse_registration(&bytes)?;

    if state.registry.len().await >= state.config.max_registrations {
        metrics::counter!("gateway_registrations_total", "result" => "quota").increment(1);
        return Err(GatewayError::Quota);
    }

    if state.registry.get(&request.slug).await.is_some() {
        return Err(GatewayError::Conflict(format!(
            "slug {:?} is already registered",
            request.slug
        )));
    }

    guard_url("siteUrl", &request.site_url).await?;
    if let Some(ref u) = request.api_url {
        guard_url("apiUrl", u).await?;
    }
    if let Some(ref u) = request.open_api_url {
        guard_url("openApiUrl", u).await?;
    }

    let resolved_api_url = request
        .api_url
        .clone()
        .unwrap_or_else(|| request.site_url.clone())
        .trim_end_matches('/')
        .to_string();
    let spec_url = request
        .open_api_url
        .clone()
        .unwrap_or_else(|| format!("{}/openapi.json", resolved_api_url));
    guard_url("openApiUrl", &spec_url).await?;

    let decision = state
        .registration_limiter
        .check(&client_ip.to_string(), REGISTRATION_WINDOW_LIMIT)
        .await;
    if !decision.allowed {
        metrics::counter!(
            "gateway_admin_rate_limit_rejected_total",
            "window" => "registration",
        )
        .increment(1);
        return Err(GatewayError::RateLimited {
            retry_after_secs: 60,
        });
    }

    let spec_text = fetch_spec(state, &spec_url).await?;
    let spec: Value = serde_json::from_str(&spec_text)
        .map_err(|_| GatewayError::Input("OpenAPI spec is not valid JSON".to_string()))?;
    let caps = capability::compile(&spec)?;

    let registration = SiteRegistration {
        slug: request.slug.clone(),
        site_name: request.site_name,
        site_url: request.site_url,
        api_url: resolved_api_url,
        open_api_url: request.open_api_url,
        rate_limit: request.rate_limit,
        created_at: Utc::now(),
        spec_json: spec_text,
    };

    state.registry.register(registration.clone()).await?;
    let capability_count = caps.len();
    let door = Door::new(registration, caps, state.config.clone(), state.http.clone());
    state.insert_door(request.slug.clone(), door);

    metrics::counter!("gateway_registrations_total", "result" => "success").increment(1);
    tracing::info!(
        "admin: site registered, slug={}, capabilities={}",
        request.slug,
        capability_count
    );

    let base = response_base_url(&state.config, &parts.headers);
    let slug = &request.slug;
    Ok(respond::ok_envelope(json!({
        "slug": slug,
        "gateway_url": format!("{}/{}", base, slug),
        "agents_txt": format!("{}/{}/.well-known/agents.txt", base, slug),
        "agents_json": format!("{}/{}/.well-known/agents.json", base, slug),
    })))
}

// ---------------------------------------------------------------------------
// Admission helpers
// ---------------------------------------------------------------------------

/// A registration request after shape validation (pipeline steps 2–6).
#[derive(Debug, PartialEq)]
struct RegistrationRequest {
    slug: String,
    site_name: String,
    site_url: String,
    api_url: Option<String>,
    open_api_url: Option<String>,
    rate_limit: u32,
}

/// Shape of one body field. Request bodies are dynamic JSON; every field is
/// classified before use instead of being trusted.
#[derive(Debug, PartialEq)]
enum Field<'a> {
    Str(&'a str),
    Num(f64),
    Bool(bool),
    Absent,
    WrongShape,
}

fn field<'a>(body: &'a serde_json::Map<String, Value>, name: &str) -> Field<'a> {
    match body.get(name) {
        None | Some(Value::Null) => Field::Absent,
        Some(Value::String(s)) => Field::Str(s),
        Some(Value::Number(n)) => n.as_f64().map(Field::Num).unwrap_or(Field::WrongShape),
        Some(Value::Bool(b)) => Field::Bool(*b),
        Some(_) => Field::WrongShape,
    }
}

fn required_string(
    body: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<String, GatewayError> {
    match field(body, name) {
        Field::Str(s) if !s.trim().is_empty() => Ok(s.to_string()),
        _ => Err(GatewayError::Input(format!(
            "{} is required and must be a non-empty string",
            name
        ))),
    }
}

fn optional_string(
    body: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<Option<String>, GatewayError> {
    match field(body, name) {
        Field::Absent => Ok(None),
        Field::Str(s) if !s.trim().is_empty() => Ok(Some(s.to_string())),
        _ => Err(GatewayError::Input(format!(
            "{} must be a non-empty string when present",
            name
        ))),
    }
}

/// Pipeline steps 2–6: field shapes, slug policy, rate-limit range.
fn parse_registration(bytes: &[u8]) -> Result<RegistrationRequest, GatewayError> {
    let parsed: Value = serde_json::from_slice(bytes)
        .map_err(|_| GatewayError::Input("request body must be a JSON object".to_string()))?;
    let body = parsed
        .as_object()
        .ok_or_else(|| GatewayError::Input("request body must be a JSON object".to_string()))?;

    let slug = required_string(body, "slug")?;
    let site_name = required_string(body, "siteName")?;
    let site_url = required_string(body, "siteUrl")?;
    let api_url = optional_string(body, "apiUrl")?;
    let open_api_url = optional_string(body, "openApiUrl")?;

    if api_url.is_none() && open_api_url.is_none() {
        return Err(GatewayError::Input(
            "apiUrl or openApiUrl is required".to_string(),
        ));
    }

    if !slug_is_valid(&slug) {
        return Err(GatewayError::Input(
            "slug must be 2-40 lowercase letters, digits or hyphens, \
             with no leading or trailing hyphen"
                .to_string(),
        ));
    }

    if RESERVED_SLUGS.contains(&slug.as_str()) {
        return Err(GatewayError::Input(format!("slug {:?} is reserved", slug)));
    }

    let rate_limit = match field(body, "rateLimit") {
        Field::Absent => 60,
        Field::Num(n) if n.is_finite() && n.fract() == 0.0 && (1.0..=1000.0).contains(&n) => {
            n as u32
        }
        _ => {
            return Err(GatewayError::Input(
                "rateLimit must be an integer between 1 and 1000".to_string(),
            ))
        }
    };

    Ok(RegistrationRequest {
        slug,
        site_name,
        site_url,
        api_url,
        open_api_url,
        rate_limit,
    })
}

/// `^[a-z0-9][a-z0-9-]{0,38}[a-z0-9]$`, checked by a character walk — a
/// regex is never compiled from request data.
fn slug_is_valid(slug: &str) -> bool {
    let bytes = slug.as_bytes();
    if bytes.len() < 2 || bytes.len() > 40 {
        return false;
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

async fn guard_url(name: &str, raw: &str) -> Result<(), GatewayError> {
    guard::validate(raw)
        .await
        .map_err(|e| GatewayError::Input(format!("{}: {}", name, e)))
}

/// Fetch the OpenAPI descriptor with the configured deadline and the 5 MB
/// cap — `Content-Length` first, then the streamed byte count.
async fn fetch_spec(state: &GatewayState, spec_url: &str) -> Result<String, GatewayError> {
    let mut response = state
        .http
        .get(spec_url)
        .timeout(std::time::Duration::from_millis(state.config.fetch_timeout_ms))
        .send()
        .await
        .map_err(|e| {
            tracing::warn!("admin: spec fetch failed, error={}", e);
            GatewayError::SpecFetch(e.to_string())
        })?;

    if !response.status().is_success() {
        return Err(GatewayError::SpecFetch(format!(
            "upstream answered {}",
            response.status()
        )));
    }

    if let Some(cl) = response.content_length() {
        if cl > MAX_SPEC_BYTES as u64 {
            return Err(GatewayError::Input(
                "OpenAPI spec too large (max 5 MB)".to_string(),
            ));
        }
    }

    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| GatewayError::SpecFetch(e.to_string()))?
    {
        if buf.len() + chunk.len() > MAX_SPEC_BYTES {
            return Err(GatewayError::Input(
                "OpenAPI spec too large (max 5 MB)".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk);
    }

    String::from_utf8(buf)
        .map_err(|_| GatewayError::SpecFetch("spec is not valid UTF-8".to_string()))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Admin bearer auth. No configured key fails closed; key comparison is
/// constant-time.
pub(crate) fn authorize(
    config: &crate::config::GatewayConfig,
    headers: &HeaderMap,
) -> Result<(), GatewayError> {
    let Some(expected) = config.admin_api_key.as_deref() else {
        return Err(GatewayError::AdminDisabled);
    };

    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    match presented {
        Some(key) if timing_safe_eq(key.as_bytes(), expected.as_bytes()) => Ok(()),
        Some(_) => Err(GatewayError::Auth("invalid admin key".to_string())),
        None => Err(GatewayError::Auth("missing admin key".to_string())),
    }
}

/// Constant-time equality over fixed-length buffers. A length mismatch
/// still performs a dummy compare so the early return does not leak length
/// information through timing.
fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        let _ = b.ct_eq(b);
        return false;
    }
    a.ct_eq(b).into()
}

/// Base URL for links in the registration response. A configured `BASE_URL`
/// always wins; forwarded headers are honored only behind a trusted proxy,
/// so an untrusted `Host` can never end up in stored links.
fn response_base_url(config: &crate::config::GatewayConfig, headers: &HeaderMap) -> String {
    if config.base_url.is_some() || !config.trusted_proxy {
        return config.public_base_url();
    }

    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
        });

    match host {
        Some(host) => format!("{}://{}", proto, host),
        None => config.public_base_url(),
    }
}
