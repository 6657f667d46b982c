use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use corvus_engine::prelude::*;
use corvus_sandbox_mock::MockRuntime;
use corvus_server::prelude::*;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::time::Duration;
use tower::ServiceExt;

type TestEngine = Engine<MockRuntime, InMemoryMetrics>;

async fn create_test_app(cpu_slots: usize) -> (Router, TestEngine) {
    create_app_with(cpu_slots, MockRuntime::new()).await
}

async fn create_app_with(cpu_slots: usize, runtime: MockRuntime) -> (Router, TestEngine) {
    let config = EngineConfig {
        cpu_slots,
        gpu_slots: 0,
        ..Default::default()
    };
    let engine = Engine::start(config, runtime, InMemoryMetrics::new())
        .await
        .unwrap();
    let services = CoreServices {
        engine: engine.clone(),
        auth: DevAuth::with_admins(["root"]),
    };
    (CorvusServer::default().build(services), engine)
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn submit(app: &Router, token: &str, script: &str) -> JobId {
    let body = json!({ "script": script, "profile": "small" });
    let (status, value) = send(app, request("POST", "/jobs", Some(token), Some(body))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(value["status"], "queued");
    value["job_id"].as_str().unwrap().parse().unwrap()
}

async fn wait_terminal(engine: &TestEngine, id: JobId) -> Job {
    for _ in 0..100_000 {
        let job = engine.status(id).unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never finished");
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _engine) = create_test_app(1).await;
    let response = app
        .oneshot(request("GET", "/health", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_reports_unreachable_runtime() {
    let runtime = MockRuntime::new();
    let (app, _engine) = create_app_with(1, runtime.clone()).await;
    runtime.set_unavailable(true);

    let (status, body) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("mock runtime disabled"));
}

#[tokio::test(start_paused = true)]
async fn test_submit_and_fetch_job() {
    let (app, engine) = create_test_app(1).await;
    let id = submit(&app, "alice", "print hi\nexit 0").await;

    wait_terminal(&engine, id).await;

    let (status, job) = send(&app, request("GET", &format!("/jobs/{id}"), Some("alice"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "succeeded");
    assert_eq!(job["owner_id"], "alice");
    assert_eq!(job["exit_code"], 0);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let (app, _engine) = create_test_app(1).await;
    let body = json!({ "script": "exit 0" });

    let (status, _) = send(&app, request("POST", "/jobs", None, Some(body))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let id = JobId::new_v4();
    let (status, _) = send(&app, request("GET", &format!("/jobs/{id}/logs"), None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(start_paused = true)]
async fn test_other_owner_is_forbidden() {
    let (app, _engine) = create_test_app(1).await;
    let id = submit(&app, "alice", "sleep 30\nexit 0").await;

    let (status, _) = send(&app, request("GET", &format!("/jobs/{id}"), Some("mallory"), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let cancel = format!("/jobs/{id}/cancel");
    let (status, _) = send(&app, request("POST", &cancel, Some("mallory"), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, request("GET", &format!("/jobs/{id}"), Some("root"), None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn test_admin_cancels_any_job() {
    let (app, engine) = create_test_app(1).await;
    let running = submit(&app, "alice", "sleep 30\nexit 0").await;
    let queued = submit(&app, "bob", "exit 0").await;

    let (status, ack) = send(
        &app,
        request("POST", &format!("/jobs/{queued}/cancel"), Some("root"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["result"], "cancelled");

    let (status, _) = send(
        &app,
        request("POST", &format!("/jobs/{running}/cancel"), Some("root"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(wait_terminal(&engine, running).await.status, JobStatus::Cancelled);

    let (_, ack) = send(
        &app,
        request("POST", &format!("/jobs/{running}/cancel"), Some("alice"), None),
    )
    .await;
    assert_eq!(ack["result"], "already_terminal");
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let (app, _engine) = create_test_app(1).await;
    let id = JobId::new_v4();

    let (status, body) = send(&app, request("GET", &format!("/jobs/{id}"), Some("alice"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn test_invalid_payload_is_bad_request() {
    let (app, _engine) = create_test_app(1).await;

    let body = json!({ "script": "exit 0", "profile": "enormous" });
    let (status, _) = send(&app, request("POST", "/jobs", Some("alice"), Some(body))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let body = json!({ "script": "exit 0", "profile": "gpu" });
    let (status, _) = send(&app, request("POST", "/jobs", Some("alice"), Some(body))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(start_paused = true)]
async fn test_list_jobs_only_shows_own() {
    let (app, _engine) = create_test_app(1).await;
    let first = submit(&app, "alice", "exit 0").await;
    std::thread::sleep(Duration::from_millis(2));
    submit(&app, "bob", "exit 0").await;
    std::thread::sleep(Duration::from_millis(2));
    let second = submit(&app, "alice", "exit 0").await;

    let (status, jobs) = send(&app, request("GET", "/jobs", Some("alice"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = jobs
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![second.to_string(), first.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_pools_report_capacity() {
    let (app, _engine) = create_test_app(3).await;

    let (status, pools) = send(&app, request("GET", "/pools", Some("alice"), None)).await;
    assert_eq!(status, StatusCode::OK);
    let cpu = pools
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["class"] == "cpu")
        .unwrap();
    assert_eq!(cpu["max_concurrent"], 3);
    assert_eq!(cpu["in_use"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_submit_after_shutdown_is_unavailable() {
    let (app, engine) = create_test_app(1).await;
    engine.shutdown().await;

    let body = json!({ "script": "exit 0" });
    let (status, _) = send(&app, request("POST", "/jobs", Some("alice"), Some(body))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_analyze_previews_allocation() {
    let (app, _engine) = create_test_app(1).await;
    let body = json!({ "script": "import pandas as pd\ndf = pd.read_csv('x')\n" });

    let (status, value) = send(&app, request("POST", "/jobs/analyze", Some("alice"), Some(body))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["analysis"]["profile"], "medium");
    assert_eq!(value["analysis"]["mode"], "cpu");
    assert_eq!(value["gpu_available"], false);
    assert!(
        value["analysis"]["libraries"]
            .as_array()
            .unwrap()
            .contains(&json!("pandas"))
    );

    let body = json!({ "script": "exit 0" });
    let (status, _) = send(&app, request("POST", "/jobs/analyze", None, Some(body))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

fn count_for(pairs: &Value, status: &str) -> u64 {
    pairs
        .as_array()
        .unwrap()
        .iter()
        .find(|pair| pair[0] == status)
        .and_then(|pair| pair[1].as_u64())
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_metrics_summary_counts_jobs() {
    let (app, engine) = create_test_app(2).await;
    let ok = submit(&app, "alice", "exit 0").await;
    let failed = submit(&app, "bob", "exit 3").await;
    wait_terminal(&engine, ok).await;
    wait_terminal(&engine, failed).await;

    let (status, summary) = send(&app, request("GET", "/metrics/summary", Some("alice"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(count_for(&summary["jobs"], "succeeded"), 1);
    assert_eq!(count_for(&summary["jobs"], "failed"), 1);
    assert_eq!(count_for(&summary["jobs"], "running"), 0);
    assert_eq!(summary["shutting_down"], false);
    assert_eq!(summary["pools"].as_array().unwrap().len(), 2);

    let completions = &summary["completions"];
    assert_eq!(completions["total_jobs"], 2);
    assert_eq!(count_for(&completions["by_status"], "failed"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_user_metrics_cover_only_the_caller() {
    let (app, engine) = create_test_app(2).await;
    let first = submit(&app, "alice", "exit 0").await;
    let second = submit(&app, "alice", "exit 1").await;
    submit(&app, "bob", "exit 0").await;
    wait_terminal(&engine, first).await;
    wait_terminal(&engine, second).await;

    let (status, usage) = send(&app, request("GET", "/metrics/user", Some("alice"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["owner_id"], "alice");
    assert_eq!(usage["total_jobs"], 2);
    assert_eq!(usage["active_jobs"], 0);
    assert_eq!(count_for(&usage["by_status"], "succeeded"), 1);
    assert_eq!(count_for(&usage["by_status"], "failed"), 1);
    assert!(usage["average_run_secs"].as_f64().unwrap() >= 0.0);
}
