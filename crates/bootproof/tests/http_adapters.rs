mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use bootproof::broker::{ConnectionBroker, ConnectionLease, HttpBroker};
use bootproof::model::VerificationResultType;
use bootproof::notify::{EvidenceUploader, HttpEvidenceUploader, NotificationContext, Notifier, WebhookNotifier};

use common::HttpFixture;

fn context(screenshot: Option<std::path::PathBuf>) -> NotificationContext {
    NotificationContext {
        asset_key: "agent-1".into(),
        hostname: "fileserver".into(),
        snapshot_epoch: 1_700_000_000,
        result: VerificationResultType::FailureUnrecoverable,
        message: Some("missing services: W3SVC".into()),
        captured_at: 1_700_003_700,
        screenshot_path: screenshot,
        screenshot_sha256: Some("ab".repeat(32)),
        missing_services: vec!["W3SVC".into()],
        missing_applications: Vec::new(),
    }
}

#[test]
fn broker_leases_and_releases_over_http() {
    let server = HttpFixture::start(vec![
        (200, r#"{"lease_id":"L-7","address":"10.0.0.5"}"#),
        (204, ""),
    ]);
    let broker: Arc<dyn ConnectionBroker> = Arc::new(
        HttpBroker::new(&server.base_url, Some("s3cret".into()), Duration::from_secs(5)).expect("broker"),
    );

    let lease = ConnectionLease::acquire(broker, "hv-east", "agent-1").expect("acquire");
    let conn = lease.connection().clone();
    assert!(conn.brokered);
    assert_eq!(conn.name, "hv-east");
    assert_eq!(conn.address.as_deref(), Some("10.0.0.5"));
    assert_eq!(conn.lease_id.as_deref(), Some("L-7"));
    lease.release().expect("release");

    let reqs = server.requests();
    assert_eq!(reqs.len(), 2);
    assert_eq!(reqs[0].method, "POST");
    assert_eq!(reqs[0].path, "/v1/verification/connections");
    assert_eq!(reqs[0].authorization.as_deref(), Some("Bearer s3cret"));
    let body: serde_json::Value = serde_json::from_str(&reqs[0].body).expect("json");
    assert_eq!(body["connection"], "hv-east");
    assert_eq!(body["asset"], "agent-1");
    assert_eq!(reqs[1].method, "DELETE");
    assert_eq!(reqs[1].path, "/v1/verification/connections/L-7");
}

#[test]
fn broker_error_status_fails_acquire() {
    let server = HttpFixture::start(vec![(503, r#"{"error":"busy"}"#)]);
    let broker = HttpBroker::new(&server.base_url, None, Duration::from_secs(5)).expect("broker");
    let err = broker.acquire("hv-east", "agent-1").unwrap_err();
    assert!(err.to_string().contains("503"));
}

#[test]
fn webhook_posts_the_verification_event() {
    let server = HttpFixture::start(vec![(200, "{}")]);
    let notifier = WebhookNotifier::new(format!("{}/hooks/verify", server.base_url), None, Duration::from_secs(5))
        .expect("notifier");
    notifier.notify(&context(None)).expect("notify");

    let reqs = server.requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].method, "POST");
    assert_eq!(reqs[0].path, "/hooks/verify");
    assert!(reqs[0].authorization.is_none());
    let body: serde_json::Value = serde_json::from_str(&reqs[0].body).expect("json");
    assert_eq!(body["event"], "screenshot_verification");
    assert_eq!(body["asset_key"], "agent-1");
    assert_eq!(body["result"], "FAILURE_UNRECOVERABLE");
    assert_eq!(body["missing_services"][0], "W3SVC");
}

#[test]
fn webhook_rejection_is_an_error() {
    let server = HttpFixture::start(vec![(500, "{}")]);
    let notifier = WebhookNotifier::new(server.base_url.clone(), None, Duration::from_secs(5)).expect("notifier");
    assert!(notifier.notify(&context(None)).is_err());
}

#[test]
fn evidence_is_uploaded_as_base64() {
    let dir = tempfile::tempdir().expect("tempdir");
    let image = dir.path().join("shot.png");
    fs::write(&image, b"png-bytes").expect("write");

    let server = HttpFixture::start(vec![(201, "{}")]);
    let uploader = HttpEvidenceUploader::new(
        format!("{}/evidence/", server.base_url),
        Some("tok".into()),
        Duration::from_secs(5),
    )
    .expect("uploader");
    uploader.upload(&context(Some(image))).expect("upload");

    let reqs = server.requests();
    assert_eq!(reqs[0].method, "PUT");
    assert_eq!(reqs[0].path, "/evidence/agent-1/1700000000");
    assert_eq!(reqs[0].authorization.as_deref(), Some("Bearer tok"));
    let body: serde_json::Value = serde_json::from_str(&reqs[0].body).expect("json");
    assert_eq!(body["image_base64"], "cG5nLWJ5dGVz");
    assert_eq!(body["snapshot"], 1_700_000_000);
}

#[test]
fn evidence_upload_without_screenshot_sends_nothing() {
    let uploader = HttpEvidenceUploader::new("http://127.0.0.1:9", None, Duration::from_secs(1)).expect("uploader");
    uploader.upload(&context(None)).expect("upload");
}
