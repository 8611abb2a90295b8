//! Shared test fixtures: in-memory databases and local HTTP stand-ins for
//! the agent service and webhook receivers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::models::{CreateTask, NotificationChannel, NotifyBehavior};

/// Fresh in-memory database with the real migrations applied. A single
/// connection keeps every handle on the same memory store.
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");
    pool
}

/// Default config with millisecond-scale retry backoff so delivery tests
/// finish quickly.
pub fn fast_retry_config() -> Config {
    let mut config = Config::default();
    config.agent.url = "http://127.0.0.1:9/agent".to_string();
    config.agent.timeout_seconds = 5;
    config.webhook_retry.initial_backoff_ms = 10;
    config.webhook_retry.max_backoff_ms = 50;
    config
}

pub fn sample_create_task(user_id: &str, channels: Vec<NotificationChannel>) -> CreateTask {
    CreateTask {
        user_id: user_id.to_string(),
        name: "release watch".to_string(),
        schedule: "0 9 * * *".to_string(),
        search_query: "next stable release date".to_string(),
        condition_description: "a concrete release date is announced".to_string(),
        notify_behavior: NotifyBehavior::Once,
        notification_channels: channels,
    }
}

/// Serve a fixed agent envelope on a random local port; returns the URL.
pub async fn spawn_agent_stub(response: Value) -> String {
    spawn_agent_stub_delayed(response, Duration::ZERO).await
}

/// Same, but the handler stalls before answering (for timeout tests).
pub async fn spawn_agent_stub_delayed(response: Value, delay: Duration) -> String {
    let app = Router::new().route(
        "/agent",
        post(move || {
            let response = response.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Json(response)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind agent stub");
    let url = format!("http://{}/agent", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    url
}

#[derive(Clone)]
struct WebhookStubState {
    statuses: Arc<Vec<u16>>,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

/// A local webhook receiver that answers with a scripted status sequence
/// (the last entry repeats) and records every request body.
pub struct WebhookStub {
    pub url: String,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

impl WebhookStub {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn last_body(&self) -> Value {
        self.bodies
            .lock()
            .expect("webhook stub bodies poisoned")
            .last()
            .cloned()
            .unwrap_or(Value::Null)
    }
}

pub async fn spawn_webhook_stub(statuses: Vec<u16>) -> WebhookStub {
    assert!(!statuses.is_empty(), "webhook stub needs at least one status");

    async fn handler(State(state): State<WebhookStubState>, Json(body): Json<Value>) -> StatusCode {
        let n = state.hits.fetch_add(1, Ordering::SeqCst);
        state
            .bodies
            .lock()
            .expect("webhook stub bodies poisoned")
            .push(body);
        let idx = n.min(state.statuses.len() - 1);
        StatusCode::from_u16(state.statuses[idx]).unwrap_or(StatusCode::OK)
    }

    let state = WebhookStubState {
        statuses: Arc::new(statuses),
        hits: Arc::new(AtomicUsize::new(0)),
        bodies: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .route("/hook", post(handler).put(handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind webhook stub");
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    WebhookStub {
        url,
        hits: state.hits,
        bodies: state.bodies,
    }
}
