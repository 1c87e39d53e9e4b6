//! End-to-end webhook ingress tests over real HTTP: validation order,
//! auth modes, and dispatch handoff.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::Mac;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use tether::config::WebhookConfig;
use tether::core::webhook::server::{HookDispatcher, WebhookServer};
use tether::core::webhook::store::{WebhookEntry, WebhookStore};

struct RecordingDispatcher {
    received: Mutex<Vec<(String, Map<String, Value>)>>,
}

#[async_trait]
impl HookDispatcher for RecordingDispatcher {
    async fn dispatch(&self, hook_id: String, payload: Map<String, Value>) {
        self.received.lock().await.push((hook_id, payload));
    }
}

struct Harness {
    base: String,
    _server: WebhookServer,
    dispatcher: Arc<RecordingDispatcher>,
    _dir: tempfile::TempDir,
}

async fn start_harness(rate_limit: u32) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(WebhookStore::new(dir.path().join("webhooks.json")));

    store
        .add_hook(WebhookEntry {
            id: "bearer-hook".into(),
            title: "Bearer".into(),
            mode: "wake".into(),
            prompt_template: "Event: {{kind}}".into(),
            token: "per-hook-token".into(),
            ..Default::default()
        })
        .unwrap();
    store
        .add_hook(WebhookEntry {
            id: "disabled-hook".into(),
            title: "Disabled".into(),
            mode: "wake".into(),
            prompt_template: "x".into(),
            enabled: false,
            ..Default::default()
        })
        .unwrap();
    store
        .add_hook(WebhookEntry {
            id: "sig-hook".into(),
            title: "Signed".into(),
            mode: "wake".into(),
            prompt_template: "x".into(),
            auth_mode: "hmac".into(),
            hmac_secret: "k".into(),
            hmac_header: "X-Sig".into(),
            hmac_algorithm: "sha256".into(),
            hmac_encoding: "hex".into(),
            hmac_sig_prefix: "sha256=".into(),
            ..Default::default()
        })
        .unwrap();

    let config = WebhookConfig {
        enabled: true,
        host: "127.0.0.1".into(),
        port: 0,
        token: "global-token".into(),
        max_body_bytes: 262_144,
        rate_limit_per_minute: rate_limit,
    };
    let dispatcher = Arc::new(RecordingDispatcher {
        received: Mutex::new(Vec::new()),
    });
    let server = WebhookServer::start(&config, store, dispatcher.clone())
        .await
        .unwrap();
    let base = format!("http://{}", server.local_addr);
    Harness {
        base,
        _server: server,
        dispatcher,
        _dir: dir,
    }
}

fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let harness = start_harness(100).await;
    let resp = reqwest::get(format!("{}/health", harness.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn validation_chain_returns_documented_codes_in_order() {
    let harness = start_harness(100).await;
    let client = reqwest::Client::new();

    // Content type checked before the body is even parsed.
    let resp = client
        .post(format!("{}/hooks/bearer-hook", harness.base))
        .header("content-type", "text/plain")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 415);

    // Non-object JSON bodies rejected.
    for bad_body in ["not json", "[1,2,3]", "42"] {
        let resp = client
            .post(format!("{}/hooks/bearer-hook", harness.base))
            .header("content-type", "application/json")
            .body(bad_body.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "body: {bad_body}");
    }

    // Unknown hook, even with bad auth, yields 404: lookup precedes auth.
    let resp = client
        .post(format!("{}/hooks/no-such-hook", harness.base))
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Disabled precedes auth.
    let resp = client
        .post(format!("{}/hooks/disabled-hook", harness.base))
        .header("content-type", "application/json")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Auth failure last.
    let resp = client
        .post(format!("{}/hooks/bearer-hook", harness.base))
        .header("content-type", "application/json")
        .header("authorization", "Bearer wrong")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn bearer_auth_accepts_and_dispatches() {
    let harness = start_harness(100).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/hooks/bearer-hook", harness.base))
        .header("content-type", "application/json")
        .header("authorization", "Bearer per-hook-token")
        .body(json!({"kind": "push"}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], true);

    // Dispatch is async; give it a moment.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let received = harness.dispatcher.received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "bearer-hook");
    assert_eq!(received[0].1["kind"], "push");
}

#[tokio::test]
async fn hmac_hex_signature_round_trip() {
    let harness = start_harness(100).await;
    let client = reqwest::Client::new();
    let body = br#"{"a":1}"#;

    let good = sign_body("k", body);
    let resp = client
        .post(format!("{}/hooks/sig-hook", harness.base))
        .header("content-type", "application/json")
        .header("X-Sig", &good)
        .body(body.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    // Flip one hex digit: must fail.
    let mut tampered = good.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == '0' { '1' } else { '0' });
    let resp = client
        .post(format!("{}/hooks/sig-hook", harness.base))
        .header("content-type", "application/json")
        .header("X-Sig", &tampered)
        .body(body.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn rate_limit_fires_before_everything_else() {
    let harness = start_harness(2).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .post(format!("{}/hooks/no-such-hook", harness.base))
            .header("content-type", "application/json")
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }
    // Third request trips the limiter even though the hook is unknown and
    // the content type is wrong: 429 wins over 415/404.
    let resp = client
        .post(format!("{}/hooks/no-such-hook", harness.base))
        .header("content-type", "text/plain")
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
}
