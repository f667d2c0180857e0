use http::StatusCode;
use std::fmt;

/// Gateway-level error kinds.
///
/// Every request handler converts one of these into a JSON envelope at its
/// own boundary; nothing upstream-controlled (URLs, bodies, backtraces) is
/// ever included in the client-facing message.
#[derive(Debug)]
pub enum GatewayError {
    /// Malformed or rejected client input (missing field, bad slug, unsafe URL).
    Input(String),
    /// Slug already registered.
    Conflict(String),
    /// Registration cap reached.
    Quota,
    /// Missing or invalid admin key / session token.
    Auth(String),
    /// Admin surface disabled because no admin key is configured.
    AdminDisabled,
    /// Sliding-window limit exceeded; carries the suggested retry delay.
    RateLimited { retry_after_secs: u64 },
    /// Request body over the configured cap.
    PayloadTooLarge,
    /// OpenAPI descriptor could not be fetched, was too large, or did not parse.
    SpecFetch(String),
    /// Upstream capability call failed with this HTTP status.
    Upstream(u16),
    /// Outbound HTTP transport error.
    Http(reqwest::Error),
    /// Unexpected failure; full detail goes to the log, not the client.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Input(msg) => write!(f, "{}", msg),
            GatewayError::Conflict(msg) => write!(f, "{}", msg),
            GatewayError::Quota => write!(f, "registration limit reached"),
            GatewayError::Auth(msg) => write!(f, "{}", msg),
            GatewayError::AdminDisabled => {
                write!(f, "admin API disabled: ADMIN_API_KEY is not configured")
            }
            GatewayError::RateLimited { .. } => write!(f, "Rate limit exceeded"),
            GatewayError::PayloadTooLarge => write!(f, "payload too large"),
            GatewayError::SpecFetch(_) => write!(f, "Could not load OpenAPI spec"),
            GatewayError::Upstream(status) => write!(f, "Upstream returned {}", status),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// HTTP status this error maps to on the wire.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Input(_) => StatusCode::BAD_REQUEST,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Quota => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::AdminDisabled => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::SpecFetch(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_REQUEST,
            GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to echo to a client. Internal and transport errors are
    /// collapsed to a generic line; everything else displays as-is.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Internal(_) | GatewayError::Http(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}
