//! Transport-agnostic submission API and the inbound rate-limit gate.
//!
//! Any HTTP server can adapt [`ApiRequest`]/[`ApiResponse`] to its own types;
//! the routing, status codes, bodies and rate-limit headers live here.

use crate::batch::{BatchAccumulator, WorkPayload};
use crate::config::InboundConfig;
use crate::resilience::sliding_window::{RateLimitDecision, SlidingWindowLimiter};
use crate::{Error, ErrorContext, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    /// Client identity used for inbound limiting, usually the remote address.
    pub identity: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            identity: identity.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, identity: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            identity: identity.into(),
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl ApiResponse {
    pub fn json(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    fn error(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self::json(status, json!({ "error": code, "message": message.into() }))
    }

    fn serialized<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(body) => Self::json(StatusCode::OK, body),
            Err(e) => Self::error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
        }
    }
}

fn invalid_submission(msg: &str, field: &str, details: impl Into<String>) -> Error {
    Error::validation_with_context(
        msg,
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details)
            .with_source("batch_api"),
    )
}

fn parse_submission(body: Option<&Value>) -> Result<WorkPayload> {
    let body = body.ok_or_else(|| invalid_submission("missing body", "body", "expected a JSON object"))?;
    let parsed: SubmitRequest = serde_json::from_value(body.clone())
        .map_err(|e| invalid_submission("malformed submission", "body", e.to_string()))?;
    let data = STANDARD
        .decode(parsed.data_base64.trim())
        .map_err(|e| invalid_submission("data_base64 is not valid base64", "data_base64", e.to_string()))?;
    Ok(WorkPayload::new(data).with_options(parsed.options))
}

/// 400 response for a [`Error::Validation`]; undecodable payload bytes get their own code.
fn bad_request(err: &Error) -> ApiResponse {
    let field = err.context().and_then(|c| c.field_path.as_deref());
    let code = match field {
        Some("data_base64") => "invalid_payload",
        _ => "invalid_request",
    };
    let mut resp = ApiResponse::error(StatusCode::BAD_REQUEST, code, err.to_string());
    resp.body["field"] = json!(field);
    resp
}

/// Body of `POST /batch/submit`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub data_base64: String,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug)]
pub enum GateDecision {
    Exempt,
    /// Admitted; the headers must be attached to the response.
    Allowed(HeaderMap),
    Rejected(ApiResponse),
}

/// Inbound limiter plus the set of paths that bypass it.
pub struct InboundGate {
    limiter: SlidingWindowLimiter,
    exempt: HashSet<String>,
}

impl InboundGate {
    pub fn new(cfg: &InboundConfig) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(cfg.sliding_window()),
            exempt: cfg.exempt_paths.iter().cloned().collect(),
        }
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt.contains(path)
    }

    pub fn check(&self, path: &str, identity: &str) -> GateDecision {
        if self.is_exempt(path) {
            return GateDecision::Exempt;
        }
        let decision = self.limiter.is_allowed(identity);
        if decision.allowed {
            return GateDecision::Allowed(decision.headers());
        }
        tracing::warn!(
            identity,
            path,
            retry_after = decision.retry_after_secs,
            "inbound request rate limited"
        );
        GateDecision::Rejected(rejection(&decision))
    }
}

fn rejection(decision: &RateLimitDecision) -> ApiResponse {
    let mut resp = ApiResponse::json(
        StatusCode::TOO_MANY_REQUESTS,
        json!({
            "error": "rate_limit_exceeded",
            "message": "Too many requests. Please try again later.",
            "retry_after": decision.retry_after_secs,
        }),
    );
    resp.headers = decision.headers();
    resp
}

/// Routes for submission and status polling.
pub struct BatchApi {
    accumulator: Arc<BatchAccumulator>,
    gate: InboundGate,
}

impl BatchApi {
    pub fn new(accumulator: Arc<BatchAccumulator>, inbound: &InboundConfig) -> Self {
        Self {
            accumulator,
            gate: InboundGate::new(inbound),
        }
    }

    pub fn accumulator(&self) -> &Arc<BatchAccumulator> {
        &self.accumulator
    }

    pub fn gate(&self) -> &InboundGate {
        &self.gate
    }

    pub fn handle(&self, req: &ApiRequest) -> ApiResponse {
        let headers = match self.gate.check(&req.path, &req.identity) {
            GateDecision::Rejected(resp) => return resp,
            GateDecision::Allowed(h) => Some(h),
            GateDecision::Exempt => None,
        };

        let mut resp = self.route(req);
        if let Some(h) = headers {
            resp.headers.extend(h);
        }
        resp
    }

    fn route(&self, req: &ApiRequest) -> ApiResponse {
        let path = req.path.trim_end_matches('/');
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match (req.method.as_str(), segments.as_slice()) {
            ("GET", []) => self.describe(),
            ("GET", ["health"]) => ApiResponse::json(StatusCode::OK, json!({ "status": "healthy" })),
            ("POST", ["batch", "submit"]) => self.submit(req.body.as_ref()),
            (_, ["batch", "submit"]) => ApiResponse::error(
                StatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                "use POST to submit work",
            ),
            ("GET", ["batch", "status", id]) => match self.accumulator.unit_status(id) {
                Some(status) => ApiResponse::serialized(&status),
                None => ApiResponse::error(StatusCode::NOT_FOUND, "not_found", "Request not found"),
            },
            ("GET", ["batch", id]) => match self.accumulator.batch_status(id) {
                Some(status) => ApiResponse::serialized(&status),
                None => ApiResponse::error(StatusCode::NOT_FOUND, "not_found", "Batch not found"),
            },
            _ => ApiResponse::error(StatusCode::NOT_FOUND, "not_found", "no such route"),
        }
    }

    fn submit(&self, body: Option<&Value>) -> ApiResponse {
        match parse_submission(body) {
            Ok(payload) => {
                let id = self.accumulator.submit(payload);
                ApiResponse::json(StatusCode::OK, json!({ "status": "queued", "request_id": id }))
            }
            Err(e) => bad_request(&e),
        }
    }

    fn describe(&self) -> ApiResponse {
        ApiResponse::json(
            StatusCode::OK,
            json!({
                "service": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "endpoints": {
                    "submit": "POST /batch/submit",
                    "request_status": "GET /batch/status/{request_id}",
                    "batch_status": "GET /batch/{batch_id}",
                    "health": "GET /health",
                },
            }),
        )
    }
}
