//! # HTTP Boundary Tests (v0.1)
//!
//! Exposure server + tunnel client over a loopback listener:
//! - auth, allow-list, status mapping (200/400/401/403/404/405/500)
//! - schema rejections surface as 500 with the error kind, onError fires
//! - the tunnel client mirrors the exposure contract

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use weft::builders::{hook, resource, task};
use weft::http::{serve, ExposureConfig, TunnelClient, TunnelPolicy};
use weft::{boot, BootOptions, Runtime};

type Log = Arc<Mutex<Vec<String>>>;

async fn booted_app() -> (Runtime, Log) {
    let errors: Log = Arc::new(Mutex::new(Vec::new()));

    let double = task("double")
        .input_schema(json!({
            "type": "object",
            "properties": {"v": {"type": "number"}},
            "required": ["v"],
        }))
        .run_value(|input, _| Ok(json!(input["v"].as_f64().unwrap_or(0.0) * 2.0)))
        .build()
        .unwrap();

    let errors_clone = errors.clone();
    let on_error = hook("on-error")
        .on_id(double.on_error_id())
        .run(move |event, _deps| {
            let errors = errors_clone.clone();
            async move {
                errors
                    .lock()
                    .push(event.data["kind"].as_str().unwrap_or("?").to_string());
                Ok(())
            }
        })
        .build()
        .unwrap();

    let ping = weft::builders::event("ping").build().unwrap();

    let app = resource("app")
        .register(vec![double.into(), on_error.into(), ping.into()])
        .build()
        .unwrap();
    let runtime = boot(app, BootOptions::new()).await.unwrap();
    (runtime, errors)
}

async fn serve_app(runtime: Runtime, config: ExposureConfig) -> SocketAddr {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (local, _handle) = serve(runtime, config, addr).await.unwrap();
    local
}

#[tokio::test]
async fn task_call_round_trips() {
    let (runtime, _errors) = booted_app().await;
    let addr = serve_app(runtime, ExposureConfig::default()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/__runtime/task/double"))
        .json(&json!({"input": {"v": 21}}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["result"], 42.0);
}

#[tokio::test]
async fn schema_rejection_maps_to_500_and_fires_on_error_once() {
    let (runtime, errors) = booted_app().await;
    let addr = serve_app(runtime, ExposureConfig::default()).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/__runtime/task/double"))
        .json(&json!({"input": {"v": "x"}}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "task.input");
    assert_eq!(errors.lock().clone(), vec!["task.input"]);
}

#[tokio::test]
async fn auth_rejects_missing_and_wrong_tokens() {
    let (runtime, _errors) = booted_app().await;
    let addr = serve_app(
        runtime,
        ExposureConfig::default().with_token("secret-token"),
    )
    .await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/__runtime/task/double");

    let missing = client.post(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = client
        .post(&url)
        .header("x-runner-token", "nope")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let right = client
        .post(&url)
        .header("x-runner-token", "secret-token")
        .json(&json!({"input": {"v": 1}}))
        .send()
        .await
        .unwrap();
    assert_eq!(right.status(), 200);
}

#[tokio::test]
async fn unknown_ids_paths_and_methods_map_to_404_and_405() {
    let (runtime, _errors) = booted_app().await;
    let addr = serve_app(runtime, ExposureConfig::default()).await;
    let client = reqwest::Client::new();

    let unknown_task = client
        .post(format!("http://{addr}/__runtime/task/ghost"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_task.status(), 404);

    let unknown_path = client
        .post(format!("http://{addr}/nowhere"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_path.status(), 404);

    let wrong_method = client
        .get(format!("http://{addr}/__runtime/task/double"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_method.status(), 405);
}

#[tokio::test]
async fn malformed_json_body_is_a_400() {
    let (runtime, _errors) = booted_app().await;
    let addr = serve_app(runtime, ExposureConfig::default()).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/__runtime/task/double"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "INVALID_JSON");
}

#[tokio::test]
async fn multipart_requires_the_manifest_field() {
    let (runtime, _errors) = booted_app().await;
    let addr = serve_app(runtime, ExposureConfig::default()).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/__runtime/task/double");

    // Manifest present: the task runs with the manifest input.
    let form = reqwest::multipart::Form::new()
        .text("__manifest", r#"{"input": {"v": 5}}"#)
        .text("attachment", "ignored file content");
    let ok = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(ok.status(), 200);
    let body: Value = ok.json().await.unwrap();
    assert_eq!(body["result"], 10.0);

    // Missing manifest.
    let form = reqwest::multipart::Form::new().text("other", "data");
    let missing = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(missing.status(), 400);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["code"], "MISSING_MANIFEST");

    // Manifest that is not JSON.
    let form = reqwest::multipart::Form::new().text("__manifest", "{broken");
    let invalid = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(invalid.status(), 400);
    let body: Value = invalid.json().await.unwrap();
    assert_eq!(body["error"]["code"], "INVALID_MULTIPART");
}

#[tokio::test]
async fn event_emission_round_trips() {
    let (runtime, _errors) = booted_app().await;
    let addr = serve_app(runtime, ExposureConfig::default()).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/__runtime/event/ping"))
        .json(&json!({"payload": {"n": 1}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn tunnel_allow_list_gates_exposed_ids() {
    let allowed = task("allowed")
        .run_value(|input, _| Ok(input))
        .build()
        .unwrap();
    let restricted = task("restricted")
        .run_value(|input, _| Ok(input))
        .build()
        .unwrap();
    let edge = resource("edge")
        .tag(weft::http::tunnel_tag().with(
            TunnelPolicy::server(vec!["allowed".into()], vec![]).to_config(),
        ))
        .build()
        .unwrap();

    let app = resource("app")
        .register(vec![allowed.into(), restricted.into(), edge.into()])
        .build()
        .unwrap();
    let runtime = boot(app, BootOptions::new()).await.unwrap();
    let addr = serve_app(runtime, ExposureConfig::default()).await;
    let client = reqwest::Client::new();

    let ok = client
        .post(format!("http://{addr}/__runtime/task/allowed"))
        .json(&json!({"input": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    let forbidden = client
        .post(format!("http://{addr}/__runtime/task/restricted"))
        .json(&json!({"input": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), 403);
}

#[tokio::test]
async fn tunnel_client_mirrors_the_surface() {
    let (runtime, _errors) = booted_app().await;
    let addr = serve_app(
        runtime,
        ExposureConfig::default().with_token("tunnel-secret"),
    )
    .await;

    let client = TunnelClient::new(&format!("http://{addr}/__runtime"))
        .unwrap()
        .with_token("tunnel-secret");

    let result = client.run_task("double", json!({"v": 8})).await.unwrap();
    assert_eq!(result, 16.0);

    client.emit_event("ping", json!({"n": 2})).await.unwrap();

    let err = client.run_task("ghost", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), "registration.missing");
}
