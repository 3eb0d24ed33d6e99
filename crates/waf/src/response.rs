//! Blocked-response construction
//!
//! Builds the response emitted when the firewall blocks a request: a plain
//! text default naming the reason, or a per-status override from the
//! `custom_responses` map. Write idempotence is enforced by the caller via
//! the `response_written` latch on [`crate::state::WafState`].

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::Full;
use std::collections::HashMap;
use tracing::warn;

use palisade_config::CustomBlockResponse;

use crate::state::BlockReason;

/// Status used for rate-limit blocks
pub const RATE_LIMIT_STATUS: u16 = 429;

/// Build the response for a block decision.
pub fn block_response(
    status_code: u16,
    reason: &BlockReason,
    custom_responses: &HashMap<u16, CustomBlockResponse>,
) -> Response<Full<Bytes>> {
    if let Some(custom) = custom_responses.get(&status_code) {
        return custom_response(custom);
    }

    let status =
        StatusCode::from_u16(status_code).unwrap_or(StatusCode::FORBIDDEN);
    let body = format!("Request blocked by WAF. Reason: {reason}");

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn custom_response(custom: &CustomBlockResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(custom.status_code).unwrap_or(StatusCode::FORBIDDEN);

    let mut response = Response::new(Full::new(Bytes::from(custom.body.clone())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

    for (name, value) in &custom.headers {
        let parsed = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        );
        match parsed {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => {
                warn!(header = %name, "Skipping invalid custom response header");
            }
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let collected = response.into_body().collect().await.unwrap();
        String::from_utf8(collected.to_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_default_block_response() {
        let response = block_response(403, &BlockReason::IpBlacklist, &HashMap::new());

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(
            body_string(response).await,
            "Request blocked by WAF. Reason: ip_blacklist"
        );
    }

    #[tokio::test]
    async fn test_rate_limit_status() {
        let response = block_response(RATE_LIMIT_STATUS, &BlockReason::RateLimit, &HashMap::new());
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            body_string(response).await,
            "Request blocked by WAF. Reason: rate_limit"
        );
    }

    #[tokio::test]
    async fn test_custom_response_override() {
        let mut custom = HashMap::new();
        custom.insert(
            403,
            CustomBlockResponse {
                status_code: 403,
                headers: [("Retry-After".to_string(), "60".to_string())]
                    .into_iter()
                    .collect(),
                body: "Access Denied".to_string(),
            },
        );

        let response = block_response(403, &BlockReason::AnomalyThreshold, &custom);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()["retry-after"], "60");
        assert_eq!(body_string(response).await, "Access Denied");
    }

    #[tokio::test]
    async fn test_custom_response_can_remap_status() {
        let mut custom = HashMap::new();
        custom.insert(
            403,
            CustomBlockResponse {
                status_code: 418,
                headers: HashMap::new(),
                body: "teapot".to_string(),
            },
        );

        let response = block_response(403, &BlockReason::AnomalyThreshold, &custom);
        assert_eq!(response.status().as_u16(), 418);
    }

    #[tokio::test]
    async fn test_invalid_custom_header_skipped() {
        let mut custom = HashMap::new();
        custom.insert(
            403,
            CustomBlockResponse {
                status_code: 403,
                headers: [("bad header name".to_string(), "x".to_string())]
                    .into_iter()
                    .collect(),
                body: String::new(),
            },
        );

        let response = block_response(403, &BlockReason::AnomalyThreshold, &custom);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!response.headers().contains_key("bad header name"));
    }
}
