//! Submission and status routes behind the inbound rate-limit gate.

use admission_core::api::{ApiRequest, BatchApi};
use admission_core::batch::{worker_fn, BatchAccumulator, BatchConfig, WorkPayload};
use admission_core::config::InboundConfig;
use admission_core::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::StatusCode;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const CLIENT: &str = "203.0.113.7";

fn api(max_batch_size: usize, rpm: u32) -> BatchApi {
    let worker = Arc::new(worker_fn(|p: WorkPayload| async move {
        Ok::<_, Error>(json!({
            "bytes": p.data.len(),
            "target": p.options["target_lang"],
        }))
    }));
    let config = BatchConfig::new()
        .with_max_batch_size(max_batch_size)
        .with_batch_timeout(Duration::from_secs(60));
    let accumulator = Arc::new(BatchAccumulator::new(config, worker));
    BatchApi::new(accumulator, &InboundConfig::default().with_requests_per_minute(rpm))
}

fn submit_body(data: &[u8]) -> serde_json::Value {
    json!({ "data_base64": STANDARD.encode(data), "options": { "target_lang": "English" } })
}

#[tokio::test]
async fn test_submit_then_poll_status() {
    let api = api(2, 60);

    let resp = api.handle(&ApiRequest::post("/batch/submit", CLIENT, submit_body(b"page-1")));
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["status"], "queued");
    let id = resp.body["request_id"].as_str().unwrap().to_string();

    let status = api.handle(&ApiRequest::get(format!("/batch/status/{id}"), CLIENT));
    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(status.body["status"], "pending");
    assert!(status.body["batch_id"].is_null());

    api.handle(&ApiRequest::post("/batch/submit", CLIENT, submit_body(b"page-22")));
    api.accumulator().shutdown().await;

    let status = api.handle(&ApiRequest::get(format!("/batch/status/{id}"), CLIENT));
    assert_eq!(status.body["status"], "completed");
    assert_eq!(status.body["batch_status"], "completed");
    assert_eq!(status.body["result"]["bytes"], 6);
    assert_eq!(status.body["result"]["target"], "English");

    let batch_id = status.body["batch_id"].as_str().unwrap().to_string();
    let batch = api.handle(&ApiRequest::get(format!("/batch/{batch_id}"), CLIENT));
    assert_eq!(batch.status, StatusCode::OK);
    assert_eq!(batch.body["total_units"], 2);
    assert_eq!(batch.body["completed_count"], 2);
    assert_eq!(batch.body["units"].as_array().unwrap().len(), 2);
    assert_eq!(batch.body["units"][0]["unit_id"], id.as_str());
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let api = api(6, 60);
    let unit = api.handle(&ApiRequest::get("/batch/status/nope", CLIENT));
    assert_eq!(unit.status, StatusCode::NOT_FOUND);
    assert_eq!(unit.body["error"], "not_found");

    let batch = api.handle(&ApiRequest::get("/batch/nope", CLIENT));
    assert_eq!(batch.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let api = api(6, 60);

    let bad = api.handle(&ApiRequest::post(
        "/batch/submit",
        CLIENT,
        json!({ "data_base64": "%%% not base64 %%%" }),
    ));
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    assert_eq!(bad.body["error"], "invalid_payload");
    assert_eq!(bad.body["field"], "data_base64");

    let missing = api.handle(&ApiRequest::post("/batch/submit", CLIENT, json!({ "options": {} })));
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing.body["error"], "invalid_request");

    let wrong_method = api.handle(&ApiRequest::get("/batch/submit", CLIENT));
    assert_eq!(wrong_method.status, StatusCode::METHOD_NOT_ALLOWED);

    assert_eq!(api.accumulator().stats().pending_units, 0);
}

#[tokio::test]
async fn test_rate_limit_headers_and_rejection() {
    let api = api(6, 2);

    let first = api.handle(&ApiRequest::get("/batch/status/x", CLIENT));
    assert_eq!(first.headers["x-ratelimit-limit-minute"], "2");
    assert_eq!(first.headers["x-ratelimit-remaining-minute"], "2");
    assert_eq!(first.headers["x-ratelimit-limit-hour"], "1000");
    assert!(first.headers.contains_key("x-ratelimit-remaining-hour"));

    api.handle(&ApiRequest::post("/batch/submit", CLIENT, submit_body(b"p")));
    let rejected = api.handle(&ApiRequest::post("/batch/submit", CLIENT, submit_body(b"p")));
    assert_eq!(rejected.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.body["error"], "rate_limit_exceeded");
    let retry_after: u64 = rejected.headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after > 0 && retry_after <= 61);
    assert!(rejected.headers.contains_key("x-ratelimit-reset"));
    assert_eq!(rejected.headers["x-ratelimit-remaining-minute"], "0");

    // Only the admitted submission was queued.
    assert_eq!(api.accumulator().stats().pending_units, 1);

    // Another client is unaffected.
    let other = api.handle(&ApiRequest::get("/batch/status/x", "198.51.100.1"));
    assert_eq!(other.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_exempt_routes_bypass_limits() {
    let api = api(6, 1);
    for _ in 0..5 {
        let health = api.handle(&ApiRequest::get("/health", CLIENT));
        assert_eq!(health.status, StatusCode::OK);
        assert_eq!(health.body["status"], "healthy");
        assert!(!health.headers.contains_key("x-ratelimit-limit-minute"));
    }

    let root = api.handle(&ApiRequest::get("/", CLIENT));
    assert_eq!(root.status, StatusCode::OK);
    assert_eq!(root.body["endpoints"]["submit"], "POST /batch/submit");

    // The limited route still has its single slot.
    let status = api.handle(&ApiRequest::get("/batch/status/x", CLIENT));
    assert_eq!(status.status, StatusCode::NOT_FOUND);
}
