use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

/// HTTP header name for request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Explicit client identity sent by trusted front ends
pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

const ANONYMOUS_CLIENT: &str = "anonymous";
const MAX_CLIENT_KEY_LEN: usize = 128;

/// Extension type for storing request ID in request extensions
#[derive(Clone, Debug)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity used for rate limiting, independent of any session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl ClientKey {
    /// `x-client-id`, else the first `x-forwarded-for` hop, else `anonymous`
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };

        let key = header(CLIENT_ID_HEADER)
            .or_else(|| {
                header(FORWARDED_FOR_HEADER)
                    .and_then(|hops| hops.split(',').next())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or(ANONYMOUS_CLIENT);

        Self(key.chars().take(MAX_CLIENT_KEY_LEN).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Middleware that resolves the request ID and client key into request extensions.
///
/// An incoming `x-request-id` UUID is kept, otherwise a new one is generated.
/// The request ID is echoed back in the response headers.
pub async fn request_context_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .map(RequestId)
        .unwrap_or_else(RequestId::new);
    let client_key = ClientKey::from_headers(request.headers());

    request.extensions_mut().insert(request_id.clone());
    request.extensions_mut().insert(client_key);

    let mut response = next.run(request).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id.to_string()) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// Tracing span carrying request ID and client key
pub fn make_request_span(request: &Request<Body>) -> tracing::Span {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let client = request
        .extensions()
        .get::<ClientKey>()
        .map(|key| key.0.clone())
        .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string());

    tracing::info_span!(
        "http_request",
        method = %request.method(),
        uri = %request.uri(),
        request_id = %request_id,
        client = %client,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_client_key_prefers_client_id() {
        let key = ClientKey::from_headers(&headers(&[
            (CLIENT_ID_HEADER, "app-42"),
            (FORWARDED_FOR_HEADER, "10.0.0.1"),
        ]));
        assert_eq!(key.as_str(), "app-42");
    }

    #[test]
    fn test_client_key_uses_first_forwarded_hop() {
        let key = ClientKey::from_headers(&headers(&[(
            FORWARDED_FOR_HEADER,
            " 203.0.113.7 , 10.0.0.1",
        )]));
        assert_eq!(key.as_str(), "203.0.113.7");
    }

    #[test]
    fn test_client_key_defaults_to_anonymous() {
        assert_eq!(ClientKey::from_headers(&HeaderMap::new()).as_str(), "anonymous");
        assert_eq!(
            ClientKey::from_headers(&headers(&[(CLIENT_ID_HEADER, "  ")])).as_str(),
            "anonymous"
        );
    }
}
