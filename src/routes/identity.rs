//! Caller identity taken from request headers.

use axum::{
    body::Body,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::error::AppError;

pub(crate) const FACILITATOR_HEADER: &str = "x-facilitator-id";
pub(crate) const PARTICIPANT_TOKEN_HEADER: &str = "x-participant-token";

/// Facilitator user id asserted by the upstream identity provider.
#[derive(Debug, Clone, Copy)]
pub struct Facilitator(pub Uuid);

/// Reject requests without a well-formed facilitator id and expose it to handlers.
pub(crate) async fn require_facilitator(
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let raw = req
        .headers()
        .get(FACILITATOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            AppError::Unauthorized(format!("missing facilitator header `{FACILITATOR_HEADER}`"))
        })?;
    let id = Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::Unauthorized("malformed facilitator id".into()))?;

    req.extensions_mut().insert(Facilitator(id));
    Ok(next.run(req).await)
}

/// Bearer token of the calling participant.
pub(crate) fn participant_token(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get(PARTICIPANT_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            AppError::Unauthorized(format!(
                "missing participant header `{PARTICIPANT_TOKEN_HEADER}`"
            ))
        })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn blank_participant_token_is_unauthorized() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            participant_token(&headers),
            Err(AppError::Unauthorized(_))
        ));

        headers.insert(PARTICIPANT_TOKEN_HEADER, HeaderValue::from_static("  "));
        assert!(participant_token(&headers).is_err());

        headers.insert(PARTICIPANT_TOKEN_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(participant_token(&headers).unwrap(), "abc");
    }
}
