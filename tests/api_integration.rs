//! Integration tests for the task execution HTTP API.
//!
//! Each test spins up an Axum server on a random port against an in-memory
//! store and drives the real REST contract with reqwest.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;

use task_executor::api::{self, AppState};
use task_executor::config::Settings;
use task_executor::store::{LibSqlStore, Store};
use task_executor::workers::{StubExecutor, Sweeper, WorkerManager};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

struct TestServer {
    base: String,
    client: reqwest::Client,
    store: Arc<dyn Store>,
    manager: Arc<WorkerManager>,
    draining: Arc<std::sync::atomic::AtomicBool>,
    settings: Settings,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post_json(&self, path: &str, body: &Value) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("request failed");
        let status = resp.status().as_u16();
        let body = resp.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn get_json(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("request failed");
        let status = resp.status().as_u16();
        let body = resp.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    /// Poll a task until it reaches a terminal status or the deadline hits.
    async fn wait_for_terminal(&self, task_id: &str) -> Value {
        for _ in 0..200 {
            let (_, task) = self.get_json(&format!("/api/v1/tasks/{task_id}")).await;
            let status = task["status"].as_str().unwrap_or_default();
            if ["completed", "failed", "timeout", "cancelled"].contains(&status) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {task_id} never reached a terminal status");
    }
}

fn test_settings() -> Settings {
    Settings {
        num_internal_workers: 0,
        auto_start_workers: false,
        worker_poll_interval: Duration::from_millis(50),
        worker_heartbeat_timeout: Duration::from_secs(60),
        ..Settings::default()
    }
}

/// Start a server on a random port. Workers only start when the settings say so.
async fn start_server(settings: Settings) -> TestServer {
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_memory(settings.worker_heartbeat_timeout)
            .await
            .unwrap(),
    );
    let executor = Arc::new(
        StubExecutor::new(Arc::clone(&store)).with_step_delay(Duration::from_millis(5)),
    );
    let manager = Arc::new(WorkerManager::new(
        settings.clone(),
        Arc::clone(&store),
        executor,
    ));
    if settings.auto_start_workers {
        manager.start().await.unwrap();
    }

    let state = AppState::new(Arc::clone(&store), Arc::clone(&manager), settings.clone());
    let draining = Arc::clone(&state.draining);
    let app = api::router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
        store,
        manager,
        draining,
        settings,
    }
}

fn register_body(worker_id: &str, backend: &str) -> Value {
    json!({
        "worker_id": worker_id,
        "backend_type": backend,
        "capabilities": {"max_parallel_tasks": 1, "supported_problems": []},
        "metadata": {"host": "test"},
    })
}

// ── Round-trip laws ─────────────────────────────────────────────────

#[tokio::test]
async fn task_creation_applies_defaults() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;

        let (status, created) = server
            .post_json("/api/v1/tasks", &json!({"problem_id": "misconfig-1"}))
            .await;
        assert_eq!(status, 201);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["backend_type"], "internal");
        assert_eq!(created["priority"], 5);

        let id = created["id"].as_str().unwrap();
        let (status, fetched) = server.get_json(&format!("/api/v1/tasks/{id}")).await;
        assert_eq!(status, 200);
        assert_eq!(fetched["problem_id"], "misconfig-1");
        assert_eq!(fetched["parameters"]["max_steps"], 30);
        assert_eq!(fetched["parameters"]["timeout_minutes"], 30.0);
        assert_eq!(fetched["parameters"]["agent_config"]["model"], "gpt-4");
        assert!(fetched["worker_id"].is_null());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn register_heartbeat_claim_complete_cycle() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;

        let (status, _) = server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-100-kind", "internal"),
            )
            .await;
        assert_eq!(status, 201);

        let (status, _) = server
            .post_json(
                "/api/v1/workers/worker-100-kind/heartbeat",
                &json!({"status": "idle"}),
            )
            .await;
        assert_eq!(status, 200);

        let (_, task) = server
            .post_json("/api/v1/tasks", &json!({"problem_id": "p1"}))
            .await;
        let task_id = task["id"].as_str().unwrap().to_string();

        let (status, claimed) = server
            .post_json("/api/v1/workers/worker-100-kind/claim", &json!({}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(claimed["id"], task_id.as_str());
        assert_eq!(claimed["status"], "running");
        assert_eq!(claimed["worker_id"], "worker-100-kind");

        let (status, completed) = server
            .post_json(
                &format!("/api/v1/workers/worker-100-kind/tasks/{task_id}/complete"),
                &json!({"score": 1}),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(completed["status"], "completed");
        assert_eq!(completed["result"]["score"], 1);

        let (_, worker) = server.get_json("/api/v1/workers/worker-100-kind").await;
        assert_eq!(worker["status"], "idle");
        assert_eq!(worker["tasks_completed"], 1);

        let (_, stats) = server
            .get_json("/api/v1/workers/worker-100-kind/stats")
            .await;
        assert_eq!(stats["success_rate"], 1.0);
    })
    .await
    .expect("test timed out");
}

// ── End-to-end scenarios ────────────────────────────────────────────

#[tokio::test]
async fn happy_path_with_internal_worker() {
    timeout(TEST_TIMEOUT, async {
        let settings = Settings {
            num_internal_workers: 1,
            auto_start_workers: true,
            ..test_settings()
        };
        let server = start_server(settings).await;

        let (status, task) = server
            .post_json(
                "/api/v1/tasks",
                &json!({"problem_id": "X", "parameters": {"max_steps": 3}}),
            )
            .await;
        assert_eq!(status, 201);
        let task_id = task["id"].as_str().unwrap().to_string();

        let finished = server.wait_for_terminal(&task_id).await;
        assert_eq!(finished["status"], "completed");
        assert_eq!(finished["result"]["success"], true);
        assert_eq!(finished["worker_id"], "worker-001-kind");

        // The completion log lands just after the status flip.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (_, logs) = server
            .get_json(&format!("/api/v1/tasks/{task_id}/logs"))
            .await;
        // One creation entry, three execution steps, one completion entry.
        assert_eq!(logs["logs"].as_array().unwrap().len(), 5);

        let (_, worker) = server.get_json("/api/v1/workers/worker-001-kind").await;
        assert_eq!(worker["tasks_completed"], 1);

        server.manager.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn priority_order_is_respected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;
        server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-100-kind", "internal"),
            )
            .await;

        for (problem, priority) in [("p-1", 1), ("p-5", 5), ("p-3", 3)] {
            let (status, _) = server
                .post_json(
                    "/api/v1/tasks",
                    &json!({"problem_id": problem, "priority": priority}),
                )
                .await;
            assert_eq!(status, 201);
        }

        let mut claimed_order = Vec::new();
        for _ in 0..3 {
            let (_, claimed) = server
                .post_json("/api/v1/workers/worker-100-kind/claim", &json!({}))
                .await;
            let id = claimed["id"].as_str().unwrap().to_string();
            claimed_order.push(claimed["problem_id"].as_str().unwrap().to_string());
            server
                .post_json(
                    &format!("/api/v1/workers/worker-100-kind/tasks/{id}/complete"),
                    &json!({"ok": true}),
                )
                .await;
        }

        assert_eq!(claimed_order, vec!["p-5", "p-3", "p-1"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn backend_affinity_is_strict() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;
        server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-001-kind", "internal"),
            )
            .await;

        let (_, task) = server
            .post_json(
                "/api/v1/tasks",
                &json!({
                    "problem_id": "orch-1",
                    "parameters": {"backend_type": "orchestrator"},
                }),
            )
            .await;
        let task_id = task["id"].as_str().unwrap().to_string();

        // The internal worker never sees the orchestrator task.
        let (status, claimed) = server
            .post_json("/api/v1/workers/worker-001-kind/claim", &json!({}))
            .await;
        assert_eq!(status, 200);
        assert!(claimed.is_null());

        let (_, still_pending) = server.get_json(&format!("/api/v1/tasks/{task_id}")).await;
        assert_eq!(still_pending["status"], "pending");

        server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-100-kind", "orchestrator"),
            )
            .await;
        let (_, claimed) = server
            .post_json("/api/v1/workers/worker-100-kind/claim", &json!({}))
            .await;
        assert_eq!(claimed["id"], task_id.as_str());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn overdue_task_times_out() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;
        server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-100-kind", "internal"),
            )
            .await;

        let (_, task) = server
            .post_json(
                "/api/v1/tasks",
                &json!({
                    "problem_id": "slow",
                    "parameters": {"timeout_minutes": 0.001},
                }),
            )
            .await;
        let task_id = task["id"].as_str().unwrap().to_string();

        let (_, claimed) = server
            .post_json("/api/v1/workers/worker-100-kind/claim", &json!({}))
            .await;
        assert_eq!(claimed["status"], "running");

        // The worker never completes; the sweeper enforces the deadline.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sweeper = Sweeper::new(
            Arc::clone(&server.store),
            server.settings.timeout_check_interval,
            server.settings.worker_heartbeat_timeout,
        );
        sweeper.sweep_once().await;

        let (_, task) = server.get_json(&format!("/api/v1/tasks/{task_id}")).await;
        assert_eq!(task["status"], "timeout");

        let (_, logs) = server
            .get_json(&format!("/api/v1/tasks/{task_id}/logs?level=error"))
            .await;
        assert!(!logs["logs"].as_array().unwrap().is_empty());

        let (_, worker) = server.get_json("/api/v1/workers/worker-100-kind").await;
        assert_eq!(worker["status"], "idle");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_running_task() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;
        server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-100-kind", "internal"),
            )
            .await;

        let (_, task) = server
            .post_json("/api/v1/tasks", &json!({"problem_id": "p"}))
            .await;
        let task_id = task["id"].as_str().unwrap().to_string();
        server
            .post_json("/api/v1/workers/worker-100-kind/claim", &json!({}))
            .await;

        let (status, cancelled) = server
            .post_json(&format!("/api/v1/tasks/{task_id}/cancel"), &json!({}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(cancelled["status"], "cancelled");

        // Completing afterwards is a state-machine violation.
        let (status, body) = server
            .post_json(
                &format!("/api/v1/workers/worker-100-kind/tasks/{task_id}/complete"),
                &json!({"ok": true}),
            )
            .await;
        assert_eq!(status, 409);
        assert_eq!(body["error"]["kind"], "Conflict");
        assert!(body["request_id"].is_string());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_claims_yield_one_winner() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;
        for worker in ["worker-101-kind", "worker-102-kind"] {
            server
                .post_json(
                    "/api/v1/workers/register",
                    &register_body(worker, "internal"),
                )
                .await;
        }
        server
            .post_json("/api/v1/tasks", &json!({"problem_id": "single"}))
            .await;

        let claim_body_1 = json!({});
        let claim_body_2 = json!({});
        let (first, second) = tokio::join!(
            server.post_json("/api/v1/workers/worker-101-kind/claim", &claim_body_1),
            server.post_json("/api/v1/workers/worker-102-kind/claim", &claim_body_2),
        );

        let winners = [first.1, second.1]
            .iter()
            .filter(|v| !v.is_null())
            .count();
        assert_eq!(winners, 1);
    })
    .await
    .expect("test timed out");
}

// ── Boundary behaviors ──────────────────────────────────────────────

#[tokio::test]
async fn scale_boundaries() {
    timeout(TEST_TIMEOUT, async {
        let settings = Settings {
            num_internal_workers: 2,
            auto_start_workers: true,
            ..test_settings()
        };
        let server = start_server(settings).await;

        let (status, body) = server
            .post_json("/api/v1/workers/internal/scale?num_workers=51", &json!({}))
            .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"]["kind"], "ValidationError");

        let (status, body) = server
            .post_json("/api/v1/workers/internal/scale?num_workers=0", &json!({}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["current_workers"], 0);

        let (_, status_body) = server.get_json("/api/v1/workers/internal/status").await;
        assert_eq!(status_body["num_workers"], 0);
        assert_eq!(status_body["running"], false);

        server.manager.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_completed_is_conflict() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;
        server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-100-kind", "internal"),
            )
            .await;
        let (_, task) = server
            .post_json("/api/v1/tasks", &json!({"problem_id": "p"}))
            .await;
        let task_id = task["id"].as_str().unwrap().to_string();
        server
            .post_json("/api/v1/workers/worker-100-kind/claim", &json!({}))
            .await;
        server
            .post_json(
                &format!("/api/v1/workers/worker-100-kind/tasks/{task_id}/complete"),
                &json!({"ok": true}),
            )
            .await;

        let (status, _) = server
            .post_json(&format!("/api/v1/tasks/{task_id}/cancel"), &json!({}))
            .await;
        assert_eq!(status, 409);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_backend_type_is_accepted() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;

        let (status, task) = server
            .post_json(
                "/api/v1/tasks",
                &json!({
                    "problem_id": "exotic",
                    "parameters": {"backend_type": "quantum"},
                }),
            )
            .await;
        assert_eq!(status, 201);
        assert_eq!(task["backend_type"], "quantum");

        // No worker of that type exists, so the task stays pending.
        server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-100-kind", "internal"),
            )
            .await;
        let (_, claimed) = server
            .post_json("/api/v1/workers/worker-100-kind/claim", &json!({}))
            .await;
        assert!(claimed.is_null());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_worker_id_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;
        let (status, body) = server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-1-internal", "internal"),
            )
            .await;
        assert_eq!(status, 409);
        assert_eq!(body["error"]["kind"], "Conflict");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn draining_refuses_new_work() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;
        server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-100-kind", "internal"),
            )
            .await;
        server.draining.store(true, Ordering::Relaxed);

        let (status, body) = server
            .post_json("/api/v1/tasks", &json!({"problem_id": "late"}))
            .await;
        assert_eq!(status, 503);
        assert_eq!(body["error"]["kind"], "ServiceUnavailable");

        let (status, _) = server
            .post_json("/api/v1/workers/worker-100-kind/claim", &json!({}))
            .await;
        assert_eq!(status, 503);
    })
    .await
    .expect("test timed out");
}

// ── Conversations and observability ─────────────────────────────────

#[tokio::test]
async fn conversations_are_recorded_and_listable() {
    timeout(TEST_TIMEOUT, async {
        let settings = Settings {
            num_internal_workers: 1,
            auto_start_workers: true,
            ..test_settings()
        };
        let server = start_server(settings).await;

        let (_, task) = server
            .post_json(
                "/api/v1/tasks",
                &json!({"problem_id": "conv-test", "parameters": {"max_steps": 2}}),
            )
            .await;
        let task_id = task["id"].as_str().unwrap().to_string();
        server.wait_for_terminal(&task_id).await;

        let (status, listed) = server.get_json("/api/v1/llm-conversations").await;
        assert_eq!(status, 200);
        assert_eq!(listed["total"], 1);
        let conv_id = listed["conversations"][0]["id"].as_str().unwrap().to_string();
        assert_eq!(listed["conversations"][0]["message_count"], 4);
        assert_eq!(listed["conversations"][0]["success"], true);

        let (_, conversation) = server
            .get_json(&format!("/api/v1/llm-conversations/{conv_id}"))
            .await;
        assert_eq!(conversation["task_id"], task_id.as_str());
        assert_eq!(
            conversation["metadata"]["cluster_id"],
            "aiopslab-worker-001-kind"
        );

        let (_, assistant_only) = server
            .get_json(&format!(
                "/api/v1/llm-conversations/{conv_id}/messages?role=assistant"
            ))
            .await;
        assert_eq!(assistant_only["messages"].as_array().unwrap().len(), 2);

        let (_, by_task) = server
            .get_json(&format!(
                "/api/v1/llm-conversations/task/{task_id}/conversations"
            ))
            .await;
        assert_eq!(by_task.as_array().unwrap().len(), 1);

        let (_, stats) = server
            .get_json("/api/v1/llm-conversations/stats/summary")
            .await;
        assert_eq!(stats["total_conversations"], 1);
        assert_eq!(stats["total_messages"], 4);

        server.manager.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ops_endpoints_respond() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;

        let (status, root) = server.get_json("/").await;
        assert_eq!(status, 200);
        assert_eq!(root["name"], "AIOpsLab Task Execution API");

        let (status, health) = server.get_json("/health").await;
        assert_eq!(status, 200);
        // Database is up but no workers are registered yet.
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["database"]["connected"], true);

        server
            .post_json(
                "/api/v1/workers/register",
                &register_body("worker-100-kind", "internal"),
            )
            .await;
        let (_, health) = server.get_json("/health").await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["workers"]["total"], 1);

        server
            .post_json("/api/v1/tasks", &json!({"problem_id": "q"}))
            .await;
        let (status, queue) = server.get_json("/queue/stats").await;
        assert_eq!(status, 200);
        assert_eq!(queue["pending"], 1);
        assert_eq!(queue["total"], 1);

        let resp = server
            .client
            .get(server.url("/metrics"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let text = resp.text().await.unwrap();
        assert!(text.contains("task_queue_size"));
        assert!(text.contains("worker_count"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn responses_carry_request_id() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(test_settings()).await;

        let resp = server
            .client
            .get(server.url("/health"))
            .header("x-request-id", "test-trace-1")
            .send()
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get("x-request-id").unwrap(),
            "test-trace-1"
        );

        let resp = server.client.get(server.url("/health")).send().await.unwrap();
        assert!(resp.headers().contains_key("x-request-id"));
    })
    .await
    .expect("test timed out");
}
