//! Handler-chain integration
//!
//! [`WafHandler`] wraps a downstream HTTP handler: phases 1 and 2 run
//! before the handler, phase 3 against the response headers, phase 4
//! against the response body. The request body is intercepted exactly once
//! and handed to the handler as a replayable buffered body.
//!
//! Cancellation: the host dropping the request future cancels inspection at
//! the next await point; no partial block response is ever written.

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use palisade_common::{LogSeverity, RequestEvent};

use crate::engine::Waf;
use crate::logging::LogEntry;
use crate::request::RequestContext;
use crate::response::block_response;
use crate::state::{BlockReason, InspectionPhase, WafState};

/// WAF middleware over a downstream handler
#[derive(Clone)]
pub struct WafHandler {
    waf: Arc<Waf>,
}

impl WafHandler {
    pub fn new(waf: Arc<Waf>) -> Self {
        Self { waf }
    }

    pub fn waf(&self) -> &Arc<Waf> {
        &self.waf
    }

    /// Inspect a request around `next`, the downstream handler.
    pub async fn handle<B, F, Fut>(
        &self,
        req: Request<B>,
        peer: SocketAddr,
        next: F,
    ) -> Response<Full<Bytes>>
    where
        B: http_body::Body,
        B::Error: std::fmt::Display,
        F: FnOnce(Request<Full<Bytes>>) -> Fut,
        Fut: Future<Output = Response<Full<Bytes>>>,
    {
        // The metrics endpoint is answered directly, outside inspection.
        if let Some(endpoint) = &self.waf.config.metrics_endpoint {
            if req.method() == Method::GET && req.uri().path() == endpoint.as_str() {
                return self.metrics_response();
            }
        }

        self.waf.metrics().record_request();

        let (parts, body) = req.into_parts();
        let client_ip = self.waf.client_ip(peer, &parts.headers);
        let mut ctx =
            RequestContext::new(&parts.method, &parts.uri, parts.headers.clone(), client_ip);
        let mut state = WafState::new();

        // Phase 1: decision stack, then pre-routing rules.
        self.waf.run_decision_stack(&ctx, &mut state).await;
        if !state.is_blocked() {
            self.waf
                .evaluate_phase(InspectionPhase::RequestHeaders, &ctx, &mut state);
        }
        if state.is_blocked() {
            return self.write_block(&ctx, &mut state);
        }

        // Buffer the body once; rules see at most the configured cap.
        let full_body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                return self.bad_request(&mut state);
            }
        };

        let cap = self.waf.config.max_body_bytes;
        let truncated = full_body.len() > cap;
        let inspectable = if truncated {
            full_body.slice(..cap)
        } else {
            full_body.clone()
        };
        if truncated {
            self.waf.log().emit(
                LogEntry::new(LogSeverity::Warn, RequestEvent::BodyTruncated.to_string())
                    .field("body_bytes", full_body.len() as u64)
                    .field("inspected_bytes", cap as u64),
            );
        }
        ctx.set_body(inspectable, truncated);

        // Phase 2: body and arguments.
        self.waf
            .evaluate_phase(InspectionPhase::RequestBody, &ctx, &mut state);
        if state.is_blocked() {
            return self.write_block(&ctx, &mut state);
        }

        // Downstream handler with a replayable body.
        let downstream_req = Request::from_parts(parts, Full::new(full_body));
        let response = next(downstream_req).await;

        // Phase 3: response headers; a block here truncates emission.
        let (resp_parts, resp_body) = response.into_parts();
        ctx.set_response(resp_parts.status.as_u16(), resp_parts.headers.clone());
        self.waf
            .evaluate_phase(InspectionPhase::ResponseHeaders, &ctx, &mut state);
        if state.is_blocked() {
            return self.write_block(&ctx, &mut state);
        }

        let resp_bytes = match resp_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => match e {},
        };
        ctx.set_response_body(resp_bytes.clone());

        // Phase 4 cannot retract bytes already on the wire: a crossing
        // match is observed and logged, never emitted.
        let blocked_before = state.is_blocked();
        self.waf
            .evaluate_phase(InspectionPhase::ResponseBody, &ctx, &mut state);
        if state.is_blocked() && !blocked_before {
            self.waf.log().emit(
                LogEntry::new(LogSeverity::Warn, RequestEvent::PostSendBlock.to_string())
                    .field("client_ip", ctx.client_ip.to_string())
                    .field("path", ctx.path.clone())
                    .field("total_score", state.total_score()),
            );
        }

        self.waf.metrics().record_allowed();
        state.mark_response_written();
        Response::from_parts(resp_parts, Full::new(resp_bytes))
    }

    /// Emit the blocked response exactly once.
    fn write_block(&self, ctx: &RequestContext, state: &mut WafState) -> Response<Full<Bytes>> {
        self.waf.metrics().record_blocked();
        if !state.mark_response_written() {
            // Latch already consumed; nothing further may be written.
            return Response::new(Full::new(Bytes::new()));
        }

        let reason = state
            .block_reason
            .clone()
            .unwrap_or(BlockReason::AnomalyThreshold);
        let status = if state.status_code == 0 {
            self.waf.config.block_status_code
        } else {
            state.status_code
        };

        self.waf.log().emit(
            LogEntry::new(LogSeverity::Debug, "block_response_written")
                .field("status", status)
                .field("path", ctx.path.clone()),
        );
        block_response(status, &reason, &self.waf.config.custom_responses)
    }

    fn bad_request(&self, state: &mut WafState) -> Response<Full<Bytes>> {
        state.mark_response_written();
        let mut response = Response::new(Full::new(Bytes::from_static(b"400 Bad Request")));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        response
    }

    fn metrics_response(&self) -> Response<Full<Bytes>> {
        let snapshot = self.waf.metrics_snapshot();
        match serde_json::to_vec(&snapshot) {
            Ok(body) => {
                let mut response = Response::new(Full::new(Bytes::from(body)));
                response.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                response
            }
            Err(e) => {
                warn!(error = %e, "Failed to serialize metrics snapshot");
                let mut response = Response::new(Full::new(Bytes::new()));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_config::Config;
    use std::io::Write;

    const PEER: &str = "198.51.100.1:52000";

    fn rules_file(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{json}").unwrap();
        file
    }

    async fn handler_with(config: Config) -> (WafHandler, crate::logging::LogWorker) {
        let (waf, worker) = Waf::build(config).unwrap();
        (WafHandler::new(waf), worker)
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn post(uri: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    async fn ok_handler(_req: Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        Response::new(Full::new(Bytes::from_static(b"downstream ok")))
    }

    async fn body_of(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_clean_request_passes_through() {
        let (handler, _worker) = handler_with(Config::default()).await;
        let response = handler
            .handle(get("/index.html"), PEER.parse().unwrap(), ok_handler)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "downstream ok");

        let snap = handler.waf().metrics_snapshot();
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.allowed_requests, 1);
        assert_eq!(snap.blocked_requests, 0);
    }

    #[tokio::test]
    async fn test_phase1_block_skips_downstream() {
        let rules = rules_file(
            r#"[{"id": "ua", "phase": 1, "pattern": "sqlmap", "targets": ["HEADERS:User-Agent"],
                 "score": 1, "mode": "block"}]"#,
        );
        let mut config = Config::default();
        config.rule_files = vec![rules.path().to_path_buf()];
        let (handler, _worker) = handler_with(config).await;

        let req = Request::builder()
            .uri("/")
            .header("User-Agent", "sqlmap/1.7")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let downstream_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls = Arc::clone(&downstream_calls);
        let response = handler
            .handle(req, PEER.parse().unwrap(), move |_req| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Response::new(Full::new(Bytes::new())) }
            })
            .await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_of(response).await;
        assert!(body.starts_with("Request blocked by WAF. Reason: rule:ua"));
        // The downstream handler never ran.
        assert_eq!(downstream_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_phase2_inspects_buffered_body() {
        let rules = rules_file(
            r#"[{"id": "sqli", "phase": 2, "pattern": "(?i)union\\s+select", "targets": ["BODY"],
                 "score": 1, "mode": "block"}]"#,
        );
        let mut config = Config::default();
        config.rule_files = vec![rules.path().to_path_buf()];
        let (handler, _worker) = handler_with(config).await;

        let response = handler
            .handle(
                post("/search", b"q=1 UNION SELECT password FROM users"),
                PEER.parse().unwrap(),
                ok_handler,
            )
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // A clean body reaches the handler intact.
        let response = handler
            .handle(
                post("/search", b"q=kittens"),
                PEER.parse().unwrap(),
                |req| async move {
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    assert_eq!(&body[..], b"q=kittens");
                    Response::new(Full::new(body))
                },
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "q=kittens");
    }

    #[tokio::test]
    async fn test_body_cap_truncates_inspection_not_delivery() {
        let rules = rules_file(
            r#"[{"id": "tail", "phase": 2, "pattern": "needle", "targets": ["BODY"],
                 "score": 1, "mode": "block"}]"#,
        );
        let mut config = Config::default();
        config.rule_files = vec![rules.path().to_path_buf()];
        config.max_body_bytes = 8;
        let (handler, _worker) = handler_with(config).await;

        // The marker sits beyond the cap: rules only see the prefix, and the
        // downstream handler still receives the full body.
        let response = handler
            .handle(
                post("/upload", b"prefix__needle"),
                PEER.parse().unwrap(),
                |req| async move {
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    assert_eq!(&body[..], b"prefix__needle");
                    Response::new(Full::new(Bytes::new()))
                },
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_phase3_block_truncates_response() {
        let rules = rules_file(
            r#"[{"id": "leak", "phase": 3, "pattern": "secret-backend", "targets": ["RESPONSE_HEADERS:Server"],
                 "score": 1, "mode": "block"}]"#,
        );
        let mut config = Config::default();
        config.rule_files = vec![rules.path().to_path_buf()];
        let (handler, _worker) = handler_with(config).await;

        let response = handler
            .handle(get("/"), PEER.parse().unwrap(), |_req| async {
                Response::builder()
                    .header("Server", "secret-backend/2.1")
                    .body(Full::new(Bytes::from_static(b"confidential")))
                    .unwrap()
            })
            .await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_of(response).await;
        assert!(!body.contains("confidential"));
    }

    #[tokio::test]
    async fn test_phase4_cannot_retract_response() {
        let rules = rules_file(
            r#"[{"id": "resp", "phase": 4, "pattern": "internal-token", "targets": ["RESPONSE_BODY"],
                 "score": 1, "mode": "block"}]"#,
        );
        let mut config = Config::default();
        config.rule_files = vec![rules.path().to_path_buf()];
        let (handler, _worker) = handler_with(config).await;

        let response = handler
            .handle(get("/"), PEER.parse().unwrap(), |_req| async {
                Response::new(Full::new(Bytes::from_static(b"internal-token=xyz")))
            })
            .await;

        // The match is observed and logged, but the emitted response stands.
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "internal-token=xyz");
        let snap = handler.waf().metrics_snapshot();
        assert_eq!(snap.rule_hits["resp"], 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let mut config = Config::default();
        config.metrics_endpoint = Some("/waf_metrics".to_string());
        let (handler, _worker) = handler_with(config).await;

        // One inspected request first.
        handler
            .handle(get("/page"), PEER.parse().unwrap(), ok_handler)
            .await;

        let downstream_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls = Arc::clone(&downstream_calls);
        let response = handler
            .handle(get("/waf_metrics"), PEER.parse().unwrap(), move |_req| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Response::new(Full::new(Bytes::new())) }
            })
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(downstream_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(
            response.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );
        let parsed: serde_json::Value =
            serde_json::from_str(&body_of(response).await).unwrap();
        assert_eq!(parsed["total_requests"], 1);
        assert!(parsed["version"].is_string());
    }

    #[tokio::test]
    async fn test_custom_response_override() {
        let rules = rules_file(
            r#"[{"id": "deny", "phase": 1, "pattern": "/admin", "targets": ["PATH"],
                 "score": 1, "mode": "block"}]"#,
        );
        let mut config = Config::default();
        config.rule_files = vec![rules.path().to_path_buf()];
        config.custom_responses.insert(
            403,
            palisade_config::CustomBlockResponse {
                status_code: 403,
                headers: [("Retry-After".to_string(), "60".to_string())]
                    .into_iter()
                    .collect(),
                body: "Access Denied".to_string(),
            },
        );
        let (handler, _worker) = handler_with(config).await;

        let response = handler
            .handle(get("/admin"), PEER.parse().unwrap(), ok_handler)
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()["retry-after"], "60");
        assert_eq!(body_of(response).await, "Access Denied");
    }
}
