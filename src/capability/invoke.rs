use super::Capability;
use crate::error::GatewayError;
use http::Method;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Deadline for a single upstream capability call.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters percent-encoded when a parameter value is substituted into a
/// path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%')
    .add(b'\\');

/// Arguments for one capability invocation, assembled by the tenant router
/// from the incoming request.
#[derive(Debug, Default)]
pub struct CallArgs {
    /// Path-parameter bindings (`:id` captures and body-promoted params).
    pub params: HashMap<String, String>,
    /// Raw query string of the incoming request, if any.
    pub query: Option<String>,
    /// Parsed JSON request body, if any.
    pub body: Option<Value>,
}

/// Perform one upstream call for a capability.
///
/// The base URL was pinned and guard-validated at registration; no DNS
/// re-validation happens here. On non-2xx only the status code crosses back
/// to the caller — the upstream body goes to the debug log and nowhere
/// else.
pub async fn invoke_upstream(
    client: &reqwest::Client,
    base_url: &str,
    cap: &Capability,
    args: CallArgs,
) -> Result<Value, GatewayError> {
    let path = resolve_path(&cap.path_template, &args.params)?;
    let url = build_url(base_url, &path, &cap.method, args.query.as_deref());

    let mut request = client
        .request(cap.method.clone(), &url)
        .timeout(UPSTREAM_TIMEOUT);

    if cap.method != Method::GET && cap.method != Method::DELETE {
        if let Some(ref body) = args.body {
            if !body.is_null() {
                request = request.json(body);
            }
        }
    }

    let response = request.send().await.map_err(|e| {
        tracing::warn!(
            "upstream: call failed, capability={}, error={}",
            cap.name,
            e
        );
        if e.is_timeout() {
            GatewayError::Upstream(504)
        } else {
            GatewayError::Upstream(502)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(
            "upstream: non-2xx, capability={}, status={}, body_len={}",
            cap.name,
            status,
            body.len()
        );
        return Err(GatewayError::Upstream(status.as_u16()));
    }

    response.json::<Value>().await.map_err(|e| {
        tracing::debug!(
            "upstream: invalid JSON response, capability={}, error={}",
            cap.name,
            e
        );
        GatewayError::Input("upstream returned invalid JSON".to_string())
    })
}

/// Substitute `{k}` placeholders with URL-encoded values from `params`.
fn resolve_path(
    template: &str,
    params: &HashMap<String, String>,
) -> Result<String, GatewayError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            // Unbalanced braces pass through untouched.
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let key = &after[..close];
        match params.get(key) {
            Some(value) => {
                out.extend(utf8_percent_encode(value, PATH_SEGMENT));
            }
            None => {
                return Err(GatewayError::Input(format!(
                    "missing path parameter: {}",
                    key
                )))
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Assemble the upstream URL. GET/DELETE carry the caller's query string;
/// other verbs never do (their input travels in the JSON body).
fn build_url(base_url: &str, path: &str, method: &Method, query: Option<&str>) -> String {
    let mut url = String::with_capacity(base_url.len() + path.len() + 16);
    url.push_str(base_url.trim_end_matches('/'));
    url.push_str(path);
    if *method == Method::GET || *method == Method::DELETE {
        if let Some(q) = query {
            if !q.is_empty() {
                url.push('?');
                url.push_str(q);
            }
        }
    }
    url
}
