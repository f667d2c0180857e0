use crate::capability::{invoke_upstream, CallArgs, Capability};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::limit::SlidingWindowLimiter;
use crate::registry::SiteRegistration;
use crate::respond::{self, BoxBody};
use crate::session::SessionStore;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use hyper::{Request, Response};
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

/// Mount prefix for the agent-protocol surface, relative to the tenant slug.
const WELL_KNOWN: &str = "/.well-known";

/// Cap on proxied capability request bodies.
const CAPABILITY_BODY_LIMIT: usize = 1024 * 1024;

/// The per-tenant router ("door"): discovery documents, session lifecycle,
/// and the compiled capability routes for one registration.
///
/// A Door owns its session store and rate limiter and holds no reference
/// back to the gateway; the gateway hands it the stripped request path and
/// the resolved client IP. `handle` returns `None` when the path is not
/// ours so the gateway can fall through to its global 404 with the original
/// path restored.
pub struct Door {
    registration: SiteRegistration,
    capabilities: Vec<Capability>,
    sessions: Arc<SessionStore>,
    limiter: Arc<SlidingWindowLimiter>,
    client: reqwest::Client,
    config: Arc<GatewayConfig>,
}

impl Door {
    /// Build a Door and start its background compaction tasks.
    pub fn new(
        registration: SiteRegistration,
        capabilities: Vec<Capability>,
        config: Arc<GatewayConfig>,
        client: reqwest::Client,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionStore::new(config.session_ttl_secs));
        sessions.start_compaction();

        let limiter = Arc::new(SlidingWindowLimiter::new());
        limiter.start_compaction();

        Arc::new(Self {
            registration,
            capabilities,
            sessions,
            limiter,
            client,
            config,
        })
    }

    pub fn registration(&self) -> &SiteRegistration {
        &self.registration
    }

    pub fn capability_count(&self) -> usize {
        self.capabilities.len()
    }

    /// Tear down the session store and rate limiter. Sessions die with the
    /// Door regardless of remaining TTL.
    pub fn destroy(&self) {
        self.sessions.destroy();
        self.limiter.destroy();
        tracing::info!("door: destroyed, slug={}", self.registration.slug);
    }

    /// Public URL of this tenant's mount point.
    fn public_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.public_base_url(),
            self.registration.slug
        )
    }

    /// Dispatch a request whose `/<slug>` prefix has already been stripped.
    ///
    /// Route order: OPTIONS short-circuit → discovery → session →
    /// capability table in compile order. `None` means "not ours".
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        path: &str,
        client_ip: IpAddr,
    ) -> Option<Response<BoxBody>>
    where
        B: hyper::body::Body,
        B::Data: bytes::Buf,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let origin = req
            .headers()
            .get(http::header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if req.method() == Method::OPTIONS {
            let resp = Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(respond::empty_body())
                .unwrap();
            return Some(self.decorate(resp, origin.as_deref()));
        }

        let rest = path.strip_prefix(WELL_KNOWN)?;
        let method = req.method().clone();

        let resp = if method == Method::GET && rest == "/agents.txt" {
            self.agents_txt()
        } else if method == Method::GET && rest == "/agents.json" {
            self.agents_json()
        } else if method == Method::POST && rest == "/agents/api/session" {
            self.create_session()
        } else if method == Method::DELETE && rest == "/agents/api/session" {
            self.end_session(req.headers())
        } else {
            let tail = rest.strip_prefix("/agents/api/")?;
            let mut segments: Vec<&str> = tail.split('/').collect();
            if segments.last() == Some(&"") {
                segments.pop();
            }

            let (cap, bound) = self.capabilities.iter().find_map(|cap| {
                if cap.method != method {
                    return None;
                }
                cap.route.matches(&segments).map(|b| (cap, b))
            })?;

            self.call_capability(cap, bound, req, client_ip).await
        };

        let mut buf = itoa::Buffer::new();
        metrics::counter!(
            "gateway_door_requests_total",
            "slug" => self.registration.slug.clone(),
            "status_code" => buf.format(resp.status().as_u16()).to_owned(),
        )
        .increment(1);

        Some(self.decorate(resp, origin.as_deref()))
    }

    /// Plain-text capability summary.
    fn agents_txt(&self) -> Response<BoxBody> {
        let base = self.public_url();
        let mut out = String::new();
        out.push_str(&format!(
            "# {} — agent capabilities\n# {}\n\n",
            self.registration.site_name, self.registration.site_url
        ));
        out.push_str(&format!("Manifest: {}{}/agents.json\n", base, WELL_KNOWN));
        out.push_str(&format!(
            "Session:  POST {}{}/agents/api/session\n\n",
            base, WELL_KNOWN
        ));

        for cap in &self.capabilities {
            out.push_str(&format!(
                "{:6} {}{}/agents/api{}{}\n",
                cap.method.as_str(),
                base,
                WELL_KNOWN,
                cap.route,
                if cap.requires_session {
                    "  (session required)"
                } else {
                    ""
                },
            ));
            if !cap.params.is_empty() {
                let names: Vec<String> = cap
                    .params
                    .iter()
                    .map(|(n, s)| {
                        if s.required {
                            format!("{}*", n)
                        } else {
                            n.clone()
                        }
                    })
                    .collect();
                out.push_str(&format!("       params: {}\n", names.join(", ")));
            }
        }

        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; charset=utf-8")
            .body(respond::full_body(out))
            .unwrap()
    }

    /// JSON manifest advertising the capability table.
    fn agents_json(&self) -> Response<BoxBody> {
        let capabilities: Vec<serde_json::Value> = self
            .capabilities
            .iter()
            .map(|c| c.manifest_entry())
            .collect();

        let manifest = json!({
            "schema_version": "1.0",
            "site": {
                "name": self.registration.site_name,
                "url": self.registration.site_url,
                "description": format!("Agent capabilities for {}", self.registration.site_name),
            },
            "capabilities": capabilities,
        });
        respond::json_response(StatusCode::OK, &manifest)
    }

    fn create_session(&self) -> Response<BoxBody> {
        let names: Vec<String> = self.capabilities.iter().map(|c| c.name.clone()).collect();
        let session = self.sessions.create(names);
        respond::ok_envelope(json!({
            "session_token": session.token,
            "expires_at": session.expires_at.to_rfc3339(),
            "capabilities": session.capabilities,
        }))
    }

    /// Ending a session always reports success, known token or not.
    fn end_session(&self, headers: &HeaderMap) -> Response<BoxBody> {
        if let Some(token) = session_token(headers) {
            self.sessions.end(&token);
        }
        respond::ok_envelope(json!({ "ended": true }))
    }

    async fn call_capability<B>(
        &self,
        cap: &Capability,
        bound: Vec<(String, String)>,
        req: Request<B>,
        client_ip: IpAddr,
    ) -> Response<BoxBody>
    where
        B: hyper::body::Body,
        B::Data: bytes::Buf,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let decision = self
            .limiter
            .check(&client_ip.to_string(), self.registration.rate_limit)
            .await;
        if !decision.allowed {
            metrics::counter!(
                "gateway_rate_limit_rejected_total",
                "slug" => self.registration.slug.clone(),
            )
            .increment(1);
            return respond::from_error(&GatewayError::RateLimited {
                retry_after_secs: decision.retry_after_secs(),
            });
        }

        if cap.requires_session {
            match session_token(req.headers()) {
                None => {
                    return respond::from_error(&GatewayError::Auth(
                        "Session required".to_string(),
                    ))
                }
                Some(token) => {
                    if self.sessions.validate(&token).is_none() {
                        return respond::from_error(&GatewayError::Auth(
                            "Invalid or expired session".to_string(),
                        ));
                    }
                }
            }
        }

        let query = req.uri().query().map(|q| q.to_string());
        let needs_body = cap.method != Method::GET && cap.method != Method::DELETE;

        let (parts, body) = req.into_parts();
        let body_value = if needs_body {
            let bytes =
                match respond::read_body_capped(&parts.headers, body, CAPABILITY_BODY_LIMIT).await
                {
                    Ok(b) => b,
                    Err(e) => return respond::from_error(&e),
                };
            if bytes.is_empty() {
                None
            } else {
                match serde_json::from_slice(&bytes) {
                    Ok(v) => Some(v),
                    Err(_) => {
                        return respond::from_error(&GatewayError::Input(
                            "request body must be valid JSON".to_string(),
                        ))
                    }
                }
            }
        } else {
            None
        };

        let args = CallArgs {
            params: bound.into_iter().collect::<HashMap<_, _>>(),
            query,
            body: body_value,
        };

        let upstream_start = Instant::now();
        let result = invoke_upstream(&self.client, &self.registration.api_url, cap, args).await;
        metrics::histogram!(
            "gateway_upstream_request_duration_seconds",
            "slug" => self.registration.slug.clone(),
            "capability" => cap.name.clone(),
        )
        .record(upstream_start.elapsed().as_secs_f64());

        match result {
            Ok(data) => respond::ok_envelope(data),
            Err(e) => respond::from_error(&e),
        }
    }

    /// Attach CORS headers and the manifest advertisement to a response.
    fn decorate(&self, mut resp: Response<BoxBody>, origin: Option<&str>) -> Response<BoxBody> {
        let headers = resp.headers_mut();

        if self.config.cors_origins.is_empty() {
            headers.insert(
                http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
        } else {
            headers.insert(http::header::VARY, HeaderValue::from_static("Origin"));
            if let Some(origin) = origin.filter(|o| self.config.cors_allows(o)) {
                if let Ok(v) = HeaderValue::from_str(origin) {
                    headers.insert(http::header::ACCESS_CONTROL_ALLOW_ORIGIN, v);
                }
            }
        }
        headers.insert(
            http::header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
        );
        headers.insert(
            http::header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization, X-Session-Token"),
        );

        let link = format!(
            "<{}{}/agents.json>; rel=\"agent-manifest\"",
            self.public_url(),
            WELL_KNOWN
        );
        if let Ok(v) = HeaderValue::from_str(&link) {
            headers.insert(http::header::LINK, v);
        }

        resp
    }
}

/// Session token from `Authorization: Bearer` or `X-Session-Token`.
fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-session-token")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
