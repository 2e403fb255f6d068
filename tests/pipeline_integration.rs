//! Integration tests for the pipeline HTTP surface.
//!
//! Each test spins up the real Axum router on a random port with the full
//! service graph behind it and drives it over HTTP with reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

use convo_pipeline::analysis::{KeywordIntentAnalyzer, LexiconEmotionAnalyzer, RealTimeProcessor};
use convo_pipeline::api;
use convo_pipeline::config::PipelineConfig;
use convo_pipeline::error::WebhookError;
use convo_pipeline::ingestion::IngestionQueue;
use convo_pipeline::orchestrator::{
    ConversationEvent, InMemoryMonitor, NotificationHub, PipelineOrchestrator, WebhookDelivery,
    WebhookPayload,
};
use convo_pipeline::tenant::TenantConfigManager;
use convo_pipeline::tenant::model::WebhookSettings;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Records webhook deliveries instead of posting them.
#[derive(Default)]
struct RecordingWebhooks {
    delivered: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl WebhookDelivery for RecordingWebhooks {
    async fn deliver(
        &self,
        target: &WebhookSettings,
        payload: &WebhookPayload,
    ) -> Result<(), WebhookError> {
        self.delivered
            .lock()
            .await
            .push((target.url.clone(), payload.event_type.clone()));
        Ok(())
    }
}

struct Server {
    base: String,
    client: reqwest::Client,
    orchestrator: Arc<PipelineOrchestrator>,
    webhooks: Arc<RecordingWebhooks>,
}

/// Start the service graph and the router on a random port.
async fn start_server() -> Server {
    let config = PipelineConfig::default();
    let webhooks = Arc::new(RecordingWebhooks::default());
    let orchestrator = PipelineOrchestrator::new(
        config.orchestrator,
        IngestionQueue::new(config.ingestion),
        RealTimeProcessor::new(
            config.processor,
            Arc::new(LexiconEmotionAnalyzer::new()),
            Arc::new(KeywordIntentAnalyzer::new()),
        ),
        TenantConfigManager::new(config.tenants),
        Arc::new(InMemoryMonitor::new()),
        Arc::new(NotificationHub::new()),
        webhooks.clone(),
    );
    orchestrator.start().await;

    let app = api::router(Arc::clone(&orchestrator));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        base: format!("http://127.0.0.1:{port}"),
        client: reqwest::Client::new(),
        orchestrator,
        webhooks,
    }
}

impl Server {
    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn put(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .put(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    /// Wait until the orchestrator has picked up `tenant_id` at `version`.
    async fn await_policy(&self, tenant_id: &str, version: u64) {
        loop {
            let current = self.orchestrator.tenant_policy(tenant_id).await;
            if current.is_some_and(|p| p.version >= version) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn message(tenant: &str, conversation: &str, text: &str) -> Value {
    json!({
        "tenant_id": tenant,
        "conversation_id": conversation,
        "content": {"text": text},
    })
}

// ── Messages ─────────────────────────────────────────────────────────

#[tokio::test]
async fn message_is_analyzed_with_insights() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, body) = server
            .post(
                "/api/messages",
                message("default", "c1", "This is terrible, I want to speak to a manager now!"),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["success"], true);
        assert!(body["message_id"].is_string());
        assert_eq!(body["result"]["emotion"]["sentiment"], "negative");
        assert_eq!(body["result"]["intent"]["primary_intent"], "escalation");
        assert!(body["analysis"]["insights"].is_object());
        assert!(!body["analysis"]["recommendations"].as_array().unwrap().is_empty());

        server.orchestrator.cleanup().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_tenant_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, body) = server
            .post("/api/messages", message("ghost", "c1", "hello"))
            .await;
        assert_eq!(status, 422);
        assert_eq!(body["success"], false);
        assert!(body["errors"][0].as_str().unwrap().contains("ghost"));

        server.orchestrator.cleanup().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn batch_preserves_order_and_reports_invalid_entries() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let batch = json!([
            message("default", "c1", "hello there"),
            {"tenant_id": "default", "conversation_id": "c2", "content": {}},
            message("default", "c3", "thanks for the help"),
        ]);
        let (status, body) = server.post("/api/messages/batch", batch).await;
        assert_eq!(status, 200);
        let outcomes = body.as_array().unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0]["success"], true);
        assert_eq!(outcomes[1]["success"], false);
        assert_eq!(outcomes[2]["success"], true);
        assert_eq!(outcomes[2]["result"]["conversation_id"], "c3");

        server.orchestrator.cleanup().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn subscribers_see_processed_messages() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let mut rx = server.orchestrator.subscribe("live-1").await;

        let (_, body) = server
            .post("/api/messages", message("default", "live-1", "where is my package"))
            .await;
        let event = rx.recv().await.unwrap();
        match event {
            ConversationEvent::MessageProcessed { message_id, .. } => {
                assert_eq!(body["message_id"], message_id.to_string());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        server.orchestrator.cleanup().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_messages_in_one_conversation_get_their_own_analysis() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (a, b, c) = tokio::join!(
            server.post("/api/messages", message("default", "busy", "my order is late")),
            server.post("/api/messages", message("default", "busy", "I want a refund now")),
            server.post("/api/messages", message("default", "busy", "thanks, that helps")),
        );
        for (status, body) in [a, b, c] {
            assert_eq!(status, 200);
            assert_eq!(body["success"], true);
            let id = &body["message_id"];
            assert_eq!(&body["result"]["message_id"], id);
            if body["analysis"].is_object() {
                assert_eq!(&body["analysis"]["result"]["message_id"], id);
            }
        }

        let (_, metrics) = server.get("/api/metrics").await;
        assert_eq!(metrics["queue"]["processing"], 0);
        assert_eq!(metrics["queue"]["completed"], 3);

        server.orchestrator.cleanup().await;
    })
    .await
    .expect("test timed out");
}

// ── Tenant configuration ─────────────────────────────────────────────

#[tokio::test]
async fn invalid_rate_limit_is_rejected_valid_one_bumps_version() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, body) = server
            .put(
                "/api/tenants/t1/config",
                json!({"settings": {"rate_limiting": {"requests_per_minute": 0}}}),
            )
            .await;
        assert_eq!(status, 400);
        assert!(!body["errors"].as_array().unwrap().is_empty());
        let (status, _) = server.get("/api/tenants/t1/config").await;
        assert_eq!(status, 404);

        let (status, body) = server
            .put(
                "/api/tenants/t1/config",
                json!({"settings": {"rate_limiting": {"requests_per_minute": 500}}, "updated_by": "ops"}),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["configuration"]["metadata"]["version"], 1);

        let (_, body) = server
            .put(
                "/api/tenants/t1/config",
                json!({"settings": {"rate_limiting": {"requests_per_minute": 600}}}),
            )
            .await;
        assert_eq!(body["configuration"]["metadata"]["version"], 2);
        assert_eq!(
            body["configuration"]["settings"]["rate_limiting"]["requests_per_minute"],
            600
        );

        server.orchestrator.cleanup().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rollback_creates_new_version_with_old_settings() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        server
            .put(
                "/api/tenants/t1/config",
                json!({"settings": {"caching": {"ttl_seconds": 120}}}),
            )
            .await;
        server
            .put(
                "/api/tenants/t1/config",
                json!({"settings": {"caching": {"ttl_seconds": 900}}}),
            )
            .await;

        let (status, body) = server
            .post("/api/tenants/t1/rollback", json!({"version": 1}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["metadata"]["version"], 3);
        assert_eq!(body["settings"]["caching"]["ttl_seconds"], 120);

        let (_, history) = server.get("/api/tenants/t1/history?limit=1").await;
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["metadata"]["version"], 2);

        let (status, _) = server
            .post("/api/tenants/t1/rollback", json!({"version": 42}))
            .await;
        assert_eq!(status, 404);

        server.orchestrator.cleanup().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn configured_tenant_processes_and_disabling_stops_it() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        server
            .put(
                "/api/tenants/acme/config",
                json!({"settings": {
                    "webhook": {"url": "https://hooks.example.com/acme", "events": ["message.processed"]}
                }}),
            )
            .await;
        server.await_policy("acme", 1).await;

        let (status, _) = server
            .post("/api/messages", message("acme", "c1", "my order is late"))
            .await;
        assert_eq!(status, 200);
        assert_eq!(
            *server.webhooks.delivered.lock().await,
            vec![(
                "https://hooks.example.com/acme".to_string(),
                "message.processed".to_string()
            )]
        );

        let (status, body) = server
            .put("/api/tenants/acme/enabled", json!({"enabled": false}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["enabled"], false);
        server.await_policy("acme", 2).await;

        let (status, body) = server
            .post("/api/messages", message("acme", "c1", "hello?"))
            .await;
        assert_eq!(status, 422);
        assert!(body["errors"][0].as_str().unwrap().contains("disabled"));

        server.orchestrator.cleanup().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn export_then_import_round_trips_tenants() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        server
            .put(
                "/api/tenants/t1/config",
                json!({"settings": {"quality": {"min_confidence": 0.8}}}),
            )
            .await;
        let (status, exported) = server.get("/api/config/export?tenant_id=t1").await;
        assert_eq!(status, 200);
        assert_eq!(exported["tenants"][0]["tenant_id"], "t1");

        let response = server
            .client
            .post(format!("{}/api/config/import?overwrite=true", server.base))
            .body(exported.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let report: Value = response.json().await.unwrap();
        assert_eq!(report["imported"].as_array().unwrap().len(), 1);

        let (_, current) = server.get("/api/tenants/t1/config").await;
        assert_eq!(current["metadata"]["version"], 2);

        server.orchestrator.cleanup().await;
    })
    .await
    .expect("test timed out");
}

// ── Health and metrics ───────────────────────────────────────────────

#[tokio::test]
async fn health_and_metrics_report_activity() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        server
            .post("/api/messages", message("default", "c1", "hi, quick question"))
            .await;

        let (status, health) = server.get("/api/health").await;
        assert_eq!(status, 200);
        assert_eq!(health["state"], "healthy");
        assert_eq!(health["components"].as_array().unwrap().len(), 5);
        assert_eq!(health["metrics"]["total_processed"], 1);

        let (status, metrics) = server.get("/api/metrics").await;
        assert_eq!(status, 200);
        assert_eq!(metrics["monitor"]["successes"], 1);
        assert_eq!(metrics["queue"]["completed"], 1);

        server.orchestrator.cleanup().await;
    })
    .await
    .expect("test timed out");
}
