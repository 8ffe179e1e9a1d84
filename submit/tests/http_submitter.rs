#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use portal_submit::{
    CancelSignal, HttpSubmitter, RetryPolicy, SubmissionCoordinator, SubmitError, Submitter,
};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone, Serialize)]
struct PhoneUpdate {
    code: String,
    phone: String,
}

#[derive(Debug, PartialEq, Deserialize)]
struct Ack {
    id: u64,
    status: String,
}

fn update() -> PhoneUpdate {
    PhoneUpdate {
        code: "A123".to_string(),
        phone: "+34 600 000 000".to_string(),
    }
}

fn submitter(server: &MockServer) -> HttpSubmitter<PhoneUpdate, Ack> {
    HttpSubmitter::new(format!("{}/api/update-phone", server.uri()))
}

#[tokio::test]
async fn posts_json_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/update-phone"))
        .and(header("authorization", "Bearer secret"))
        .and(body_json(json!({ "code": "A123", "phone": "+34 600 000 000" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": 7, "status": "received" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let ack = submitter(&server)
        .with_token(Some("secret".to_string()))
        .submit(&update(), CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(
        ack,
        Ack {
            id: 7,
            status: "received".to_string()
        }
    );
}

#[tokio::test]
async fn client_errors_carry_backend_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({ "detail": "Invalid phone number" })),
        )
        .mount(&server)
        .await;

    let err = submitter(&server)
        .submit(&update(), CancelSignal::new())
        .await
        .unwrap_err();

    match err {
        SubmitError::Rejected { status, message } => {
            assert_eq!(status, 422);
            assert_eq!(message, "Invalid phone number");
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_keep_retry_after_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(503)
                .insert_header("retry-after", "1")
                .set_body_string("maintenance"),
        )
        .mount(&server)
        .await;

    let err = submitter(&server)
        .submit(&update(), CancelSignal::new())
        .await
        .unwrap_err();

    match err {
        SubmitError::Server {
            status,
            message,
            retry_after,
        } => {
            assert_eq!(status, 503);
            assert_eq!(message, "maintenance");
            assert_eq!(retry_after, Some(Duration::from_secs(1)));
        }
        other => panic!("expected Server, got {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_backend_is_a_network_error() {
    // Reserve a port, then close it so nothing is listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/api/update-phone", listener.local_addr().unwrap());
    drop(listener);

    let err = HttpSubmitter::<PhoneUpdate, Ack>::new(url)
        .submit(&update(), CancelSignal::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SubmitError::Network(_)), "got {err:?}");
}

#[tokio::test]
async fn coordinator_retries_transient_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": 1, "status": "ok" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let coordinator = SubmissionCoordinator::new(
        submitter(&server),
        RetryPolicy::new(5_000, 2, 10, 1_000),
    );

    let ack = coordinator.submit(update()).await.unwrap();

    assert_eq!(ack.id, 1);
    assert_eq!(coordinator.state().retry_count, 1);
}

#[tokio::test]
async fn slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": 1, "status": "ok" }))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let coordinator = SubmissionCoordinator::new(
        submitter(&server),
        RetryPolicy::new(200, 0, 10, 1_000),
    );

    let err = coordinator.submit(update()).await.unwrap_err();

    assert!(
        matches!(err, SubmitError::TimedOut { timeout } if timeout == Duration::from_millis(200)),
        "got {err:?}"
    );
    assert_eq!(coordinator.live_timeouts(), 0);
}
