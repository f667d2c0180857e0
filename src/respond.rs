use crate::error::GatewayError;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use serde_json::{json, Value};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// JSON response with the given status.
pub fn json_response(status: StatusCode, value: &Value) -> hyper::Response<BoxBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    hyper::Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

/// `{ok:true, data:…}` success envelope.
pub fn ok_envelope(data: Value) -> hyper::Response<BoxBody> {
    json_response(StatusCode::OK, &json!({ "ok": true, "data": data }))
}

/// `{ok:false, error:…}` failure envelope.
pub fn error_envelope(status: StatusCode, message: &str) -> hyper::Response<BoxBody> {
    json_response(status, &json!({ "ok": false, "error": message }))
}

/// Envelope for a `GatewayError`, with `Retry-After` on rate limits.
pub fn from_error(err: &GatewayError) -> hyper::Response<BoxBody> {
    let mut resp = error_envelope(err.status(), &err.client_message());
    if let GatewayError::RateLimited { retry_after_secs } = err {
        let mut buf = itoa::Buffer::new();
        if let Ok(v) = http::HeaderValue::from_str(buf.format(*retry_after_secs)) {
            resp.headers_mut().insert(http::header::RETRY_AFTER, v);
        }
    }
    resp
}

/// Buffer a request body, failing once it exceeds `cap` bytes. The
/// `Content-Length` header (when present) rejects before any body bytes are
/// read; `Limited` enforces the cap on the actual stream either way.
pub async fn read_body_capped<B>(
    headers: &http::HeaderMap,
    body: B,
    cap: usize,
) -> Result<Bytes, GatewayError>
where
    B: hyper::body::Body,
    B::Data: bytes::Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if let Some(cl) = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if cl > cap as u64 {
            return Err(GatewayError::PayloadTooLarge);
        }
    }

    let collected = Limited::new(body, cap).collect().await.map_err(|e| {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            GatewayError::PayloadTooLarge
        } else {
            GatewayError::Input("failed to read request body".to_string())
        }
    })?;
    Ok(collected.to_bytes())
}
