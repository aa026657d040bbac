use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::fmt;
use tracing::Instrument;
use uuid::Uuid;

pub static CORRELATION_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

/// Identifier shared by every log line, database row and response header that
/// belongs to a single HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_header(value: Option<&HeaderValue>) -> Self {
        value
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(Self)
            .unwrap_or_else(Self::new)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub async fn correlate(mut request: Request, next: Next) -> Response {
    let correlation_id = CorrelationId::from_header(request.headers().get(&CORRELATION_HEADER));
    request.extensions_mut().insert(correlation_id);

    let span = tracing::info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response
            .headers_mut()
            .insert(CORRELATION_HEADER.clone(), value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuses_valid_header() {
        let id = Uuid::new_v4();
        let header = HeaderValue::from_str(&id.to_string()).unwrap();

        let correlation_id = CorrelationId::from_header(Some(&header));

        assert_eq!(correlation_id.as_uuid(), id);
    }

    #[test]
    fn test_generates_on_missing_or_invalid_header() {
        let header = HeaderValue::from_static("not-a-uuid");

        let from_invalid = CorrelationId::from_header(Some(&header));
        let from_missing = CorrelationId::from_header(None);

        assert_ne!(from_invalid, from_missing);
        assert_eq!(from_missing.as_uuid().get_version_num(), 4);
    }
}
