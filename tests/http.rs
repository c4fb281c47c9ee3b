use std::time::Duration;

use authdialog::{router, AppState, Config};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    router(AppState::from_config(&Config::default()).unwrap())
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Wait until a prompt is presenting and return its snapshot.
async fn presenting(app: &Router) -> Value {
    for _ in 0..200 {
        let (status, json) = send(app, "GET", "/prompt", None).await;
        if status == StatusCode::OK {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no prompt presented");
}

async fn respond(app: &Router, id: u64, action: Value) -> (StatusCode, Value) {
    send(app, "POST", &format!("/prompt/{id}/respond"), Some(action)).await
}

/// Sign `message`, approving the biometric prompt that signing raises.
async fn sign_approved(app: &Router, message: &str) -> String {
    let signing = {
        let app = app.clone();
        let message = message.to_string();
        tokio::spawn(async move { send(&app, "POST", "/sign", Some(json!({ "message": message }))).await })
    };

    let prompt = presenting(app).await;
    assert_eq!(prompt["prompt"]["kind"], "biometric");
    let id = prompt["id"].as_u64().unwrap();
    let (status, _) = respond(app, id, json!({ "action": "authenticate" })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = signing.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    json["signature"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn create_sign_verify_same_message() {
    let app = app();
    let (status, key) = send(&app, "POST", "/key", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(key["alias"], "MY_KEY");

    let signature = sign_approved(&app, "100").await;
    let (status, json) = send(
        &app,
        "POST",
        "/verify",
        Some(json!({ "message": "100", "signature": signature })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["verified"], true);
}

#[tokio::test]
async fn signature_of_other_message_fails_verification() {
    let app = app();
    send(&app, "POST", "/key", None).await;

    let signature = sign_approved(&app, "200").await;
    let (_, json) = send(
        &app,
        "POST",
        "/verify",
        Some(json!({ "message": "100", "signature": signature })),
    )
    .await;
    assert_eq!(json["verified"], false);
}

#[tokio::test]
async fn absent_signature_fails_verification() {
    let app = app();
    send(&app, "POST", "/key", None).await;
    let (status, json) = send(&app, "POST", "/verify", Some(json!({ "message": "100" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["verified"], false);
}

#[tokio::test]
async fn sign_without_key_is_absent_not_a_crash() {
    let app = app();
    let (status, json) = send(&app, "POST", "/sign", Some(json!({ "message": "100" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "key_not_found");
    // Signing never raised a prompt.
    let (status, _) = send(&app, "GET", "/prompt", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn regenerated_key_rejects_old_signature() {
    let app = app();
    send(&app, "POST", "/key", None).await;
    let old_signature = sign_approved(&app, "100").await;

    let (status, _) = send(&app, "POST", "/key", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, json) = send(
        &app,
        "POST",
        "/verify",
        Some(json!({ "message": "100", "signature": old_signature })),
    )
    .await;
    assert_eq!(json["verified"], false);
}

#[tokio::test]
async fn dismissed_signing_prompt_returns_401() {
    let app = app();
    send(&app, "POST", "/key", None).await;

    let signing = {
        let app = app.clone();
        tokio::spawn(async move { send(&app, "POST", "/sign", Some(json!({ "message": "100" }))).await })
    };
    let id = presenting(&app).await["id"].as_u64().unwrap();
    let (status, json) = respond(&app, id, json!({ "action": "dismiss" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["delivered"], "outcome");

    let (status, json) = signing.await.unwrap();
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "authentication_not_satisfied");
}

#[tokio::test]
async fn fingerprint_prompt_reports_help_then_error() {
    let app = app();
    let prompt = {
        let app = app.clone();
        tokio::spawn(async move { send(&app, "POST", "/prompt/fingerprint", None).await })
    };

    let id = presenting(&app).await["id"].as_u64().unwrap();
    let (_, json) = respond(
        &app,
        id,
        json!({ "action": "help", "code": 1, "message": "Finger moved too fast" }),
    )
    .await;
    assert_eq!(json["delivered"], "event");

    let (_, json) = respond(&app, id, json!({ "action": "fail" })).await;
    assert_eq!(json["delivered"], "event");

    let snapshot = presenting(&app).await;
    assert_eq!(snapshot["events"].as_array().unwrap().len(), 2);

    respond(
        &app,
        id,
        json!({ "action": "error", "code": 7, "message": "Too many attempts" }),
    )
    .await;

    let (status, json) = prompt.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "error");
    assert!(json["text"].as_str().unwrap().contains("code: 7"));
}

#[tokio::test]
async fn credential_prompt_can_be_dismissed_by_application() {
    let app = app();
    let prompt = {
        let app = app.clone();
        tokio::spawn(async move {
            send(
                &app,
                "POST",
                "/prompt/credential",
                Some(json!({ "title": "Unlock" })),
            )
            .await
        })
    };

    let snapshot = presenting(&app).await;
    assert_eq!(snapshot["prompt"]["kind"], "device_credential");
    let id = snapshot["id"].as_u64().unwrap();

    let (status, _) = send(&app, "DELETE", &format!("/prompt/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, json) = prompt.await.unwrap();
    assert_eq!(json["outcome"], "dismissed_by_application");
}

#[tokio::test]
async fn confirmation_prompt_confirms_and_blocks_second_prompt() {
    let app = app();
    let prompt = {
        let app = app.clone();
        tokio::spawn(async move {
            send(
                &app,
                "POST",
                "/prompt/confirmation",
                Some(json!({ "prompt_text": "100", "extra_data": "AAAA" })),
            )
            .await
        })
    };

    let id = presenting(&app).await["id"].as_u64().unwrap();

    let (status, json) = send(&app, "POST", "/prompt/fingerprint", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "prompt_busy");

    let (status, _) = respond(&app, id, json!({ "action": "authenticate" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    respond(&app, id, json!({ "action": "confirm" })).await;
    let (status, json) = prompt.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "confirmed_by_user");
}

#[tokio::test]
async fn key_is_attested() {
    let app = app();
    let (_, created) = send(&app, "POST", "/key", None).await;
    let (status, fetched) = send(&app, "GET", "/key", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["public_key"], fetched["public_key"]);
    assert!(fetched["public_key_digest"]
        .as_str()
        .unwrap()
        .starts_with("sha256:"));
    assert_eq!(fetched["attestation"]["device_info"]["security_level"], "software");
}
