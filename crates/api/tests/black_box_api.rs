use std::sync::Arc;
use std::time::Duration;

use jobrelay_api::app::services::{AppServices, build_services};
use jobrelay_events::{MessageBus, ReceiveSettings, SubscriptionConfig, Topic, TriggerCommand};
use jobrelay_infra::ServiceConfig;
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod with in-memory backends, bound to an ephemeral port.
        let config = ServiceConfig {
            deploy_env: "blackbox".to_string(),
            ..ServiceConfig::default()
        };
        let services = Arc::new(build_services(config).expect("failed to build services"));
        let app = jobrelay_api::app::build_app(services.clone());
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
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        self.services.shutdown_token().cancel();
    }
}

#[tokio::test]
async fn ping_reports_a_healthy_store() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/ping")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cacheDropped"], 0);

    let res = client.get(server.url("/register")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn trigger_requires_a_job_name() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for body in [json!({"job": ""}), json!({"job": "   "}), json!({})] {
        let res = client
            .post(server.url("/jobs/trigger"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{body}");
        let err: serde_json::Value = res.json().await.unwrap();
        assert_eq!(err["error"], "validation_error");
    }
}

#[tokio::test]
async fn trigger_publishes_a_trigger_command() {
    let server = TestServer::spawn().await;
    let publisher = server.services.publisher();
    let topic = publisher.topic_name(Topic::Trigger);
    publisher
        .bus()
        .create_subscription("probe", &SubscriptionConfig::new(topic))
        .unwrap();
    let probe = publisher
        .bus()
        .subscribe("probe", &ReceiveSettings::default())
        .unwrap();

    let res = reqwest::Client::new()
        .post(server.url("/jobs/trigger"))
        .json(&json!({"job": "CronSendLittleMessage"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["job"], "CronSendLittleMessage");
    assert!(body["messageId"].as_str().is_some_and(|id| !id.is_empty()));

    let msg = tokio::task::spawn_blocking(move || probe.recv_timeout(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("trigger was not published");
    let cmd: TriggerCommand = serde_json::from_slice(msg.data()).unwrap();
    assert_eq!(cmd.job, "CronSendLittleMessage");
    assert!(cmd.trigger_time > 0);
    msg.ack();
}

#[tokio::test]
async fn jobs_lists_the_builtin_jobs() {
    let server = TestServer::spawn().await;

    let res = reqwest::Client::new()
        .get(server.url("/jobs"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["jobs"], json!(["CronSendLittleMessage", "SendHugeMessage"]));
}
