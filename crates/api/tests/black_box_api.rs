use std::sync::Arc;
use std::time::Duration;

use jobq_api::app::{AppServices, build_app, build_services_with};
use jobq_infra::QueueConfig;
use jobq_infra::jobs::{FnExecutor, TaskExecutor, WorkerPoolHandle};
use reqwest::StatusCode;
use serde_json::{Value, json};

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(config: QueueConfig) -> Self {
        let executor: Arc<dyn TaskExecutor> = Arc::new(FnExecutor::new(|payload: &str| {
            Ok(!payload.starts_with("fail"))
        }));
        let services = Arc::new(build_services_with(config, executor).await.unwrap());

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = build_app(Arc::clone(&services));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn start_workers(&self) -> WorkerPoolHandle {
        self.services.start_workers()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        workers: 2,
        poll_interval: Duration::from_millis(10),
        ..QueueConfig::default()
    }
}

async fn submit(client: &reqwest::Client, server: &TestServer, body: Value) -> (StatusCode, Value) {
    let res = client
        .post(server.url("/api/jobs"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn metrics_eventually<F>(client: &reqwest::Client, server: &TestServer, done: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    for _ in 0..200 {
        let metrics: Value = client
            .get(server.url("/api/metrics"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if done(&metrics) {
            return metrics;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("metrics did not reach the expected state within timeout");
}

#[tokio::test]
async fn health_is_ok() {
    let server = TestServer::spawn(fast_config()).await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn submit_then_fetch_and_list() {
    let server = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    let (status, job) = submit(
        &client,
        &server,
        json!({"tenant_id": "t1", "payload": "p1", "max_retries": 3}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["status"], "pending");
    assert_eq!(job["tenant_id"], "t1");
    assert_eq!(job["payload"], "p1");
    assert_eq!(job["retry_count"], 0);
    assert_eq!(job["max_retries"], 3);
    assert!(job["trace_id"].is_string());
    assert!(job.get("leased_until").is_none());

    let id = job["id"].as_str().unwrap();
    let res = client
        .get(server.url(&format!("/api/jobs/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fetched: Value = res.json().await.unwrap();
    assert_eq!(fetched["id"], id);

    let list: Value = client
        .get(server.url("/api/jobs?status=pending&tenant_id=t1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);
    assert_eq!(list["jobs"][0]["id"], id);

    let other: Value = client
        .get(server.url("/api/jobs?tenant_id=t2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(other["count"], 0);
}

#[tokio::test]
async fn idempotent_submission_returns_existing_job() {
    let server = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();
    let body = json!({"tenant_id": "t1", "payload": "p1", "idempotency_key": "order-42"});

    let (first_status, first) = submit(&client, &server, body.clone()).await;
    let (second_status, second) = submit(&client, &server, body).await;

    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first["id"], second["id"]);

    let list: Value = client
        .get(server.url("/api/jobs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let server = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    let (status, body) = submit(&client, &server, json!({"payload": "p1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, body) = submit(&client, &server, json!({"tenant_id": "t1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(server.url("/api/jobs"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");

    let res = client
        .get(server.url("/api/jobs?status=sleeping"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_status");

    let res = client
        .get(server.url("/api/jobs/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let server = TestServer::spawn(fast_config()).await;
    let id = jobq_core::JobId::new();

    let res = reqwest::get(server.url(&format!("/api/jobs/{id}"))).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn rate_limited_submission_is_too_many_requests() {
    let server = TestServer::spawn(QueueConfig {
        rate_limit: 2,
        ..fast_config()
    })
    .await;
    let client = reqwest::Client::new();

    for i in 0..2 {
        let (status, _) = submit(&client, &server, json!({"tenant_id": "t1", "payload": format!("p{i}")})).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = submit(&client, &server, json!({"tenant_id": "t1", "payload": "p2"})).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate_limited");

    // Other tenants are unaffected.
    let (status, _) = submit(&client, &server, json!({"tenant_id": "t2", "payload": "p"})).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn workers_complete_and_dead_letter_jobs() {
    let server = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    submit(&client, &server, json!({"tenant_id": "t1", "payload": "ok"})).await;
    submit(&client, &server, json!({"tenant_id": "t1", "payload": "fail-always", "max_retries": 2})).await;

    let workers = server.start_workers();
    let metrics = metrics_eventually(&client, &server, |m| {
        m["completed_jobs"] == 1 && m["dlq_jobs"] == 1
    })
    .await;

    assert_eq!(metrics["total_jobs"], 2);
    assert_eq!(metrics["failed_jobs"], 0);
    assert_eq!(metrics["running_jobs"], 0);
    assert_eq!(metrics["total_retries"], 2);

    let list: Value = client
        .get(server.url("/api/jobs?status=failed"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["jobs"][0]["error_message"], "max retries exceeded");

    workers.shutdown().await;
}

#[tokio::test]
async fn snapshot_reports_jobs_and_metrics() {
    let server = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    submit(&client, &server, json!({"tenant_id": "t1", "payload": "p"})).await;

    let snapshot: Value = client
        .get(server.url("/api/snapshot"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(snapshot["metrics"]["pending_jobs"], 1);
}

#[tokio::test]
async fn stream_pushes_snapshot_after_submission() {
    let server = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    let mut res = client.get(server.url("/api/stream")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let (_, job) = submit(&client, &server, json!({"tenant_id": "t1", "payload": "p"})).await;
    let id = job["id"].as_str().unwrap().to_string();

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        let mut buf = String::new();
        while let Some(chunk) = res.chunk().await.unwrap() {
            buf.push_str(&String::from_utf8_lossy(&chunk));
            if buf.contains("event: snapshot") && buf.contains(&id) {
                return buf;
            }
        }
        buf
    })
    .await
    .expect("no snapshot event received");

    assert!(received.contains("\"submitted\""));
}
