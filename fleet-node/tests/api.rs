use fleet_core::load::FixedSampler;
use fleet_core::node::{FleetConfig, NodeHandle};
use fleet_core::transport::{Envelope, HttpTransport};
use fleet_core::FleetNode;
use fleet_node::api::{self, ApiState};
use serde_json::{json, Value};
use shared::messages::{FleetMessage, Heartbeat};
use shared::types::{LoadEstimate, NodeInfo, Role};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use task_queue::{EchoProvider, ModelTable, TaskExecutor};
use tokio::time::Instant;

async fn boot_node(id: &str) -> (String, Arc<FleetNode<HttpTransport>>, NodeHandle) {
    let config = FleetConfig {
        heartbeat_interval: Duration::from_millis(50),
        load_sample_interval: Duration::from_millis(20),
        dispatch_interval: Duration::from_millis(10),
        announce_interval: Duration::from_millis(100),
        ..FleetConfig::default()
    };
    let executor = TaskExecutor::new(Arc::new(EchoProvider), ModelTable::default(), 4, 1);
    let (transport, inbound) =
        HttpTransport::new(id.into(), HashMap::new(), Duration::from_millis(500));
    let node = FleetNode::new(
        NodeInfo {
            id: id.into(),
            url: "http://127.0.0.1:0".into(),
            location: "hallway".into(),
        },
        "supervisor".into(),
        Vec::new(),
        config,
        transport,
        Box::new(FixedSampler(30.0)),
        executor,
        None,
    );
    let handle = node.start().await;

    let app = api::router(ApiState {
        node: Arc::clone(&node),
        inbound,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), node, handle)
}

async fn poll_task_status(client: &reqwest::Client, base: &str, task_id: &str, want: &str) -> Value {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let task: Value = client
            .get(format!("{base}/api/tasks/{task_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if task["status"] == want {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "task never reached {want}: {task}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn submitted_task_completes_and_is_pollable() {
    let (base, _node, handle) = boot_node("supervisor").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/tasks"))
        .json(&json!({
            "task_type": "reasoning",
            "payload": { "question": "which rooms are occupied" },
            "urgency": "high",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let task = poll_task_status(&client, &base, &task_id, "completed").await;
    assert_eq!(task["assigned_to"], "supervisor");
    assert!(task["output"].as_str().unwrap().starts_with('['));

    // The finished task shows up under its status filter.
    let done: Vec<Value> = client
        .get(format!("{base}/api/tasks?status=completed"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(done.iter().any(|t| t["id"] == task_id.as_str()));

    handle.shutdown();
}

#[tokio::test]
async fn worker_answers_submissions_with_a_coordinator_hint() {
    // A node that is not the supervisor and has no peers still knows who
    // it believes coordinates.
    let (base, _node, handle) = boot_node("office").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/tasks"))
        .json(&json!({ "task_type": "reasoning", "payload": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["coordinator"], "supervisor");

    handle.shutdown();
}

#[tokio::test]
async fn sensor_ingest_becomes_a_sensor_management_task() {
    let (base, _node, handle) = boot_node("supervisor").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/sensors"))
        .json(&json!({
            "node_id": "supervisor",
            "temperature": 22.5,
            "humidity": 40.0,
            "air_quality": 80,
            "timestamp": "2026-08-22T09:15:00Z",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let task: Value = client
        .get(format!("{base}/api/tasks/{task_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(task["task_type"], "sensor_management");
    // Routed with the reporting node's location tag.
    assert_eq!(task["location"], "hallway");

    handle.shutdown();
}

#[tokio::test]
async fn implausible_readings_are_rejected() {
    let (base, _node, handle) = boot_node("supervisor").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/sensors"))
        .json(&json!({
            "node_id": "supervisor",
            "temperature": 20.0,
            "humidity": 140.0,
            "air_quality": 80,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("humidity"));

    handle.shutdown();
}

#[tokio::test]
async fn unknown_and_malformed_task_ids_are_distinguished() {
    let (base, _node, handle) = boot_node("supervisor").await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!(
            "{base}/api/tasks/00000000-0000-0000-0000-000000000000"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .get(format!("{base}/api/tasks/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    handle.shutdown();
}

#[tokio::test]
async fn status_health_logs_and_metrics_respond() {
    let (base, _node, handle) = boot_node("supervisor").await;
    let client = reqwest::Client::new();

    let status: Value = client
        .get(format!("{base}/api/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["node_id"], "supervisor");
    assert_eq!(status["role"], "coordinator");
    assert_eq!(status["coordinator"], "supervisor");

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let logs: Value = client
        .get(format!("{base}/api/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(logs["logs"].is_array());

    let metrics: Value = client
        .get(format!("{base}/api/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(metrics["counters"]["tasks_completed"].is_u64());
    assert!(metrics["queue"]["pending"].is_u64());

    handle.shutdown();
}

#[tokio::test]
async fn internal_messages_reach_the_health_table() {
    let (base, node, handle) = boot_node("supervisor").await;
    let client = reqwest::Client::new();

    let envelope = Envelope {
        from: "visitor".into(),
        message: FleetMessage::Heartbeat(Heartbeat {
            sender: "visitor".into(),
            role: Role::Worker,
            load: LoadEstimate::Known(12),
            seq: 1,
        }),
    };
    let resp = client
        .post(format!("{base}/internal/messages"))
        .json(&envelope)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let status = node.status().await;
        if status
            .peers
            .iter()
            .any(|p| p.id == "visitor" && p.load == Some(12))
        {
            break;
        }
        assert!(Instant::now() < deadline, "heartbeat never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown();
}
