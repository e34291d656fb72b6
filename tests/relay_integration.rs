//! Integration tests for the relay HTTP surface.
//!
//! Each test spins up a stub gateway and the relay router on random ports
//! and exercises the real REST / webhook / SSE contract with reqwest.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;
use chrono::{TimeZone, Utc};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use remind_relay::delivery::{DeliveryStatus, ManualClock, Patient, Reminder};
use remind_relay::store::DeliveryStore;
use remind_relay::webhook::sign;
use remind_relay::{Relay, RelayConfig};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const WEBHOOK_SECRET: &str = "integration-secret";
const OWNER: &str = "vol-1";

/// Start a stub gateway answering every send with `status` and `body`.
async fn start_gateway(status: StatusCode, body: &'static str) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = Router::new().route(
        "/send/message",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (status, [("content-type", "application/json")], body)
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

fn config(gateway_url: &str) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.gateway.endpoint = gateway_url.to_string();
    config.gateway.timeout = Duration::from_secs(2);
    config.webhook_secret = SecretString::from(WEBHOOK_SECRET);
    config
}

/// Noon in Jakarta, outside the default quiet hours.
fn noon_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 1, 10, 5, 0, 0).unwrap(),
    ))
}

/// Start the relay router on a random port, return (base url, relay).
async fn start_relay(config: &RelayConfig, store: Arc<DeliveryStore>) -> (String, Arc<Relay>) {
    let relay = Arc::new(Relay::with_store(config, store, noon_clock()).unwrap());
    let app = relay.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://{addr}"), relay)
}

async fn seed(relay: &Relay, phone: &str, reminder_ids: &[&str]) {
    let mut patient = Patient::new("p1", "Siti", phone).with_created_by(OWNER);
    for id in reminder_ids {
        patient = patient.with_reminder(Reminder::new(*id, "Minum obat").with_description("Setelah makan"));
    }
    relay.store().insert_patient(patient).await;
}

async fn post_action(base: &str, reminder_id: &str, action: &str) -> (StatusCode, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/patients/p1/reminders/{reminder_id}/{action}"))
        .header("X-User-Id", OWNER)
        .header("X-User-Role", "volunteer")
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
    (status, resp.json().await.unwrap())
}

async fn post_webhook(base: &str, body: &[u8], signature: Option<&str>) -> (StatusCode, Value) {
    let mut req = reqwest::Client::new()
        .post(format!("{base}/api/webhook/gateway"))
        .header("content-type", "application/json")
        .body(body.to_vec());
    if let Some(sig) = signature {
        req = req.header("X-Webhook-Signature", sig);
    }
    let resp = req.send().await.unwrap();
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
    (status, resp.json().await.unwrap())
}

// ── Delivery ────────────────────────────────────────────────────────

#[tokio::test]
async fn send_delivers_and_records_message_id() {
    timeout(TEST_TIMEOUT, async {
        let (gw, hits) = start_gateway(StatusCode::OK, r#"{"success":true,"messageId":"m-1"}"#).await;
        let (base, relay) = start_relay(&config(&gw), DeliveryStore::in_memory()).await;
        seed(&relay, "0812-3456-7890", &["r1"]).await;

        let (status, body) = post_action(&base, "r1", "send").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "sent");
        assert_eq!(body["data"]["code"], "SENT");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let reminder = relay.store().get_reminder("p1", "r1").await.unwrap();
        assert_eq!(reminder.delivery_status, DeliveryStatus::Sent);
        assert_eq!(reminder.gateway_message_id.as_deref(), Some("m-1"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn open_breaker_queues_without_calling_gateway() {
    timeout(TEST_TIMEOUT, async {
        let (gw, hits) = start_gateway(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"boom"}"#).await;
        let mut config = config(&gw);
        config.breaker.failure_threshold = 2;
        let (base, relay) = start_relay(&config, DeliveryStore::in_memory()).await;
        seed(&relay, "081234567890", &["r1", "r2", "r3"]).await;

        let (status, body) = post_action(&base, "r1", "send").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["status"], "retrying");

        let (_, body) = post_action(&base, "r2", "send").await;
        assert_eq!(body["data"]["status"], "queued");
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let (status, body) = post_action(&base, "r3", "send").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["data"]["status"], "queued");
        assert_eq!(body["data"]["code"], "GATEWAY_UNAVAILABLE");
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let health: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
        assert_eq!(health["gateway"]["circuit_state"], "open");
        assert_eq!(health["gateway"]["available"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_phone_is_rejected_without_gateway_call() {
    timeout(TEST_TIMEOUT, async {
        let (gw, hits) = start_gateway(StatusCode::OK, r#"{"success":true}"#).await;
        let (base, relay) = start_relay(&config(&gw), DeliveryStore::in_memory()).await;
        seed(&relay, "invalid-phone", &["r1"]).await;

        let (status, body) = post_action(&base, "r1", "send").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_PHONE");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let reminder = relay.store().get_reminder("p1", "r1").await.unwrap();
        assert_eq!(reminder.delivery_status, DeliveryStatus::Pending);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_only_unsent_reminders() {
    timeout(TEST_TIMEOUT, async {
        let (gw, _hits) = start_gateway(StatusCode::OK, r#"{"success":true,"messageId":"m-2"}"#).await;
        let (base, relay) = start_relay(&config(&gw), DeliveryStore::in_memory()).await;
        seed(&relay, "081234567890", &["r1", "r2"]).await;

        post_action(&base, "r1", "send").await;
        let (status, body) = post_action(&base, "r1", "cancel").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_STATUS");

        let (status, body) = post_action(&base, "r2", "cancel").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "cancelled");

        let reminder = relay.store().get_reminder("p1", "r2").await.unwrap();
        assert_eq!(reminder.cancelled_by.as_deref(), Some(OWNER));
        assert!(reminder.cancelled_at.is_some());
    })
    .await
    .expect("test timed out");
}

// ── Webhook ─────────────────────────────────────────────────────────

#[tokio::test]
async fn webhook_is_verified_and_idempotent() {
    timeout(TEST_TIMEOUT, async {
        let (gw, _hits) = start_gateway(StatusCode::OK, r#"{"success":true,"messageId":"m-9"}"#).await;
        let (base, relay) = start_relay(&config(&gw), DeliveryStore::in_memory()).await;
        seed(&relay, "081234567890", &["r1"]).await;
        post_action(&base, "r1", "send").await;

        let body = serde_json::to_vec(&json!({
            "event": "message.ack",
            "message": {"id": "m-9", "status": "delivered"}
        }))
        .unwrap();

        let (status, resp) = post_webhook(&base, &body, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(resp["code"], "MISSING_SIGNATURE");

        let (status, resp) = post_webhook(&base, &body, Some(&sign(&body, "wrong").unwrap())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(resp["code"], "INVALID_SIGNATURE");

        let sig = sign(&body, WEBHOOK_SECRET).unwrap();
        let (status, resp) = post_webhook(&base, &body, Some(&sig)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["message"], "Reminder status updated to 'delivered'");
        let delivered_at = relay.store().get_reminder("p1", "r1").await.unwrap().delivered_at;
        assert!(delivered_at.is_some());

        let (status, resp) = post_webhook(&base, &body, Some(&sig)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["message"], "Webhook already processed");
        let reminder = relay.store().get_reminder("p1", "r1").await.unwrap();
        assert_eq!(reminder.delivered_at, delivered_at);
        assert_eq!(reminder.delivery_status, DeliveryStatus::Delivered);

        let garbage = b"{not json";
        let (status, resp) = post_webhook(&base, garbage, Some(&sign(garbage, WEBHOOK_SECRET).unwrap())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["code"], "INVALID_PAYLOAD");
    })
    .await
    .expect("test timed out");
}

// ── Live stream ─────────────────────────────────────────────────────

/// Read SSE chunks until the accumulated text contains `needle`.
async fn read_until(resp: &mut reqwest::Response, buffer: &mut String, needle: &str) {
    while !buffer.contains(needle) {
        let chunk = resp.chunk().await.unwrap().expect("stream ended early");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn sse_streams_status_changes() {
    timeout(TEST_TIMEOUT, async {
        let (gw, _hits) = start_gateway(StatusCode::OK, r#"{"success":true,"messageId":"m-3"}"#).await;
        let (base, relay) = start_relay(&config(&gw), DeliveryStore::in_memory()).await;
        seed(&relay, "081234567890", &["r1"]).await;

        let mut stream = reqwest::get(format!("{base}/api/sse/delivery-status")).await.unwrap();
        assert_eq!(stream.status().as_u16(), 200);
        let mut buffer = String::new();
        read_until(&mut stream, &mut buffer, "event: connection.established").await;
        assert_eq!(relay.events().observer_count(), 1);

        post_action(&base, "r1", "send").await;
        read_until(&mut stream, &mut buffer, "event: delivery.status.updated").await;
        read_until(&mut stream, &mut buffer, r#""status":"sent""#).await;
        assert!(buffer.contains(r#""reminder_id":"r1""#));
    })
    .await
    .expect("test timed out");
}

// ── Persistence ─────────────────────────────────────────────────────

#[tokio::test]
async fn sent_state_survives_restart() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("patients.json");

        let (gw, _hits) = start_gateway(StatusCode::OK, r#"{"success":true,"messageId":"m-4"}"#).await;
        let store = DeliveryStore::open(&path).await.unwrap();
        let (base, relay) = start_relay(&config(&gw), store).await;
        seed(&relay, "081234567890", &["r1"]).await;
        post_action(&base, "r1", "send").await;
        relay.store().flush().await.unwrap();

        let reopened = DeliveryStore::open(&path).await.unwrap();
        let reminder = reopened.get_reminder("p1", "r1").await.unwrap();
        assert_eq!(reminder.delivery_status, DeliveryStatus::Sent);
        assert_eq!(reminder.gateway_message_id.as_deref(), Some("m-4"));
        assert_eq!(reminder.description, "Setelah makan");
    })
    .await
    .expect("test timed out");
}
