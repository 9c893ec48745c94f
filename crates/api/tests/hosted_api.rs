//! Integration tests for `POST /hosted-training`.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use common::{body_json, post_json, TEST_SECRET};
use serde_json::json;
use studio_core::keys::{DATASETS_BUCKET, WEIGHTS_BUCKET};

fn callback_body(status: &str) -> serde_json::Value {
    json!({
        "id": "training-1",
        "status": status,
        "output": null,
    })
}

// ---------------------------------------------------------------------------
// Test: bodies matching neither shape list the keys found
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_body_is_rejected_with_its_keys() {
    let app = common::build_test_app();
    let response = post_json(app.router(), "/hosted-training", json!({ "foo": 1 })).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    let error = json["error"].as_str().unwrap();
    assert!(error.starts_with("Unknown request type. Keys found:"));
    assert!(error.contains("foo"));
}

// ---------------------------------------------------------------------------
// Test: callbacks must carry user_id and studio_id in the query
// ---------------------------------------------------------------------------

#[tokio::test]
async fn callback_without_query_ids_is_400() {
    let app = common::build_test_app();
    let uri = format!("/hosted-training?user_id=user-1&secret={TEST_SECRET}");
    let response = post_json(app.router(), &uri, callback_body("succeeded")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Missing user_id or studio_id in query params");
}

// ---------------------------------------------------------------------------
// Test: callbacks with a wrong or missing secret are 401
// ---------------------------------------------------------------------------

#[tokio::test]
async fn callback_with_wrong_secret_is_401() {
    let app = common::build_test_app();

    let response = post_json(
        app.router(),
        "/hosted-training?user_id=user-1&studio_id=studio-1&secret=nope",
        callback_body("succeeded"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Invalid webhook secret");

    let response = post_json(
        app.router(),
        "/hosted-training?user_id=user-1&studio_id=studio-1",
        callback_body("succeeded"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ---------------------------------------------------------------------------
// Test: unsuccessful trainings are acknowledged and ignored
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_training_callback_is_ignored() {
    let app = common::build_test_app();
    let uri = format!("/hosted-training?user_id=user-1&studio_id=studio-1&secret={TEST_SECRET}");
    let response = post_json(app.router(), &uri, callback_body("failed")).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ignored");
    assert_eq!(json["reason"], "Training status: failed");
}

// ---------------------------------------------------------------------------
// Test: a succeeded callback without a .tar output is 400
// ---------------------------------------------------------------------------

#[tokio::test]
async fn succeeded_callback_without_archive_is_400() {
    let app = common::build_test_app();
    let uri = format!("/hosted-training?user_id=user-1&studio_id=studio-1&secret={TEST_SECRET}");
    let body = json!({
        "id": "training-1",
        "status": "succeeded",
        "output": { "weights": "https://example.com/out.zip" },
    });
    let response = post_json(app.router(), &uri, body).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "No trained model (.tar) found in output");
}

// ---------------------------------------------------------------------------
// Test: dataset submissions without crop data are 400
// ---------------------------------------------------------------------------

#[tokio::test]
async fn training_without_crop_data_is_400() {
    let app = common::build_test_app();
    let body = json!({
        "object_key": "user-1/studio-1",
        "gender": "man",
        "user_id": "user-1",
        "plan": "basic",
        "studio_id": "studio-1",
    });
    let response = post_json(app.router(), "/hosted-training", body).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to download crop data:"));
}

// ---------------------------------------------------------------------------
// Test: crop data pointing at missing images yields no dataset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn training_without_usable_images_is_400() {
    let app = common::build_test_app();
    app.store.insert(
        DATASETS_BUCKET,
        "user-1/studio-1/crop_data.json",
        br#"{"gone.jpg": {}}"#.to_vec(),
    );
    let body = json!({
        "object_key": "user-1/studio-1",
        "gender": "man",
        "user_id": "user-1",
        "plan": "basic",
        "studio_id": "studio-1",
    });
    let response = post_json(app.router(), "/hosted-training", body).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "No images were successfully processed");
    assert!(app.store.keys(DATASETS_BUCKET).iter().all(|k| !k.ends_with("datasets.zip")));
}

// ---------------------------------------------------------------------------
// Test: without hosted configuration the route answers 500
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hosted_training_requires_configuration() {
    let app = common::build_test_app_without_hosted();
    let uri = format!("/hosted-training?user_id=user-1&studio_id=studio-1&secret={TEST_SECRET}");
    let response = post_json(app.router(), &uri, callback_body("failed")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Hosted training is not configured");
    assert_eq!(json["code"], "NOT_CONFIGURED");
}

// ---------------------------------------------------------------------------
// Test: a slow weights download outlives the intake request timeout
// ---------------------------------------------------------------------------

/// Tar archive holding `output/lora.safetensors`.
fn trained_archive(weights: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(weights.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "output/lora.safetensors", weights)
        .unwrap();
    builder.into_inner().unwrap()
}

/// Serves `archive` at `/trained.tar` after `delay`.
async fn slow_archive_server(archive: Vec<u8>, delay: Duration) -> String {
    let app = Router::new().route(
        "/trained.tar",
        get(move || {
            let archive = archive.clone();
            async move {
                tokio::time::sleep(delay).await;
                archive
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/trained.tar")
}

#[tokio::test]
async fn slow_callback_completion_is_not_cut_off_by_request_timeout() {
    let mut config = common::test_config();
    config.request_timeout_secs = 1;
    config.hosted_request_timeout_secs = 30;
    let app = common::build_test_app_with_config(config);

    let url = slow_archive_server(trained_archive(b"lora-weights"), Duration::from_millis(1500)).await;
    let uri = format!("/hosted-training?user_id=user-1&studio_id=studio-1&secret={TEST_SECRET}");
    let body = json!({
        "id": "training-1",
        "status": "succeeded",
        "output": { "weights": url },
    });
    let response = post_json(app.router(), &uri, body).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "success");
    let stored = app.store.keys(WEIGHTS_BUCKET);
    assert_eq!(stored.len(), 1);
    assert_eq!(app.store.object(WEIGHTS_BUCKET, &stored[0]).unwrap().body, b"lora-weights");
}

// ---------------------------------------------------------------------------
// Test: the hosted route is still bounded by its own timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hosted_route_uses_its_own_timeout() {
    let mut config = common::test_config();
    config.request_timeout_secs = 1;
    config.hosted_request_timeout_secs = 1;
    let app = common::build_test_app_with_config(config);

    let url = slow_archive_server(trained_archive(b"w"), Duration::from_secs(3)).await;
    let uri = format!("/hosted-training?user_id=user-1&studio_id=studio-1&secret={TEST_SECRET}");
    let body = json!({
        "id": "training-1",
        "status": "succeeded",
        "output": { "weights": url },
    });
    let response = post_json(app.router(), &uri, body).await;
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert!(app.store.keys(WEIGHTS_BUCKET).is_empty());
}
