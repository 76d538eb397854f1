//! Mailbox client and webhook sink against a mock HTTP server.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tally_core::{
    AttachmentSource, ErrorKind, MonitoringEvent, MonitoringSink, ProcessingRun, SearchIntent,
};
use tally_jobs::sinks::{sign, EVENT_HEADER, SIGNATURE_HEADER};
use tally_jobs::{HttpMailboxSource, MailboxConfig, WebhookSink};

fn mailbox(server: &MockServer) -> HttpMailboxSource {
    HttpMailboxSource::new(MailboxConfig {
        base_url: server.uri(),
        api_key: Some("mailbox-key".to_string()),
        timeout_seconds: 5,
    })
    .unwrap()
}

#[tokio::test]
async fn test_mailbox_search_sends_intent_and_parses_attachments() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(header("X-api-key", "mailbox-key"))
        .and(body_partial_json(json!({
            "sender_email": "billing@acme.test",
            "subject_contains": "invoice",
            "days_back": 3
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "attachments": [{
                "message_id": "m-1",
                "attachment_id": "a-1",
                "attachment_name": "invoice.pdf",
                "sender_email": "billing@acme.test",
                "subject": "Invoice 7",
                "size_bytes": 1200,
                "content_type": "application/pdf",
                "received_at": "2026-03-01T08:30:00Z"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let intent = SearchIntent::new(3)
        .with_sender("billing@acme.test")
        .with_subject("invoice");
    let found = mailbox(&server).search(&intent).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].attachment_name, "invoice.pdf");
    assert_eq!(found[0].size_bytes, 1200);
}

#[tokio::test]
async fn test_mailbox_download_decodes_base64() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/download"))
        .and(body_partial_json(json!({"message_id": "m-1", "attachment_id": "a-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content_base64": STANDARD.encode(b"%PDF-1.7 body")
        })))
        .mount(&server)
        .await;

    let bytes = mailbox(&server).download("m-1", "a-1").await.unwrap();
    assert_eq!(&bytes[..], b"%PDF-1.7 body");
}

#[tokio::test]
async fn test_mailbox_bad_base64_is_source_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/download"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"content_base64": "not base64!"})),
        )
        .mount(&server)
        .await;

    let err = mailbox(&server).download("m-1", "a-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(err.to_string().contains("base64"));
}

#[tokio::test]
async fn test_mailbox_status_mapping() {
    for (status, kind) in [
        (429, ErrorKind::Transient),
        (503, ErrorKind::Transient),
        (401, ErrorKind::Fatal),
        (404, ErrorKind::Fatal),
        (400, ErrorKind::Fatal),
    ] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let err = mailbox(&server)
            .search(&SearchIntent::new(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), kind, "status {}", status);
    }
}

fn run_completed() -> MonitoringEvent {
    let mut run = ProcessingRun::start(SearchIntent::new(1));
    run.attachments_discovered = 2;
    run.finish();
    MonitoringEvent::RunCompleted { run }
}

#[tokio::test]
async fn test_webhook_posts_signed_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/tally"))
        .and(header(EVENT_HEADER, "run.completed"))
        .and(header_exists(SIGNATURE_HEADER))
        .and(body_partial_json(json!({
            "event_type": "run.completed",
            "payload_version": 1,
            "payload": {"type": "run_completed"}
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let sink = WebhookSink::new(
        format!("{}/hooks/tally", server.uri()),
        Some("s3cret".to_string()),
    )
    .unwrap();
    sink.publish(&run_completed()).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let signature = request
        .headers
        .get(SIGNATURE_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(
        signature,
        format!("sha256={}", sign("s3cret", &request.body).unwrap())
    );
}

#[tokio::test]
async fn test_webhook_failure_kinds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let sink = WebhookSink::new(server.uri(), None).unwrap();
    let err = sink.publish(&run_completed()).await.unwrap_err();
    assert!(err.is_transient());
}
