//! Outbound delivery seam: observers hand results to whoever owns the
//! chat transport without knowing anything about it.

use async_trait::async_trait;

use crate::core::webhook::store::WebhookResult;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a cron job's outcome (title, result text, status code).
    async fn cron_result(&self, title: &str, text: &str, status: &str);

    /// Deliver a webhook dispatch outcome.
    async fn webhook_result(&self, result: &WebhookResult);

    /// Deliver a heartbeat alert for one chat.
    async fn heartbeat_alert(&self, chat_id: i64, text: &str);
}

/// Swallow-everything notifier for tests and headless runs.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn cron_result(&self, _title: &str, _text: &str, _status: &str) {}
    async fn webhook_result(&self, _result: &WebhookResult) {}
    async fn heartbeat_alert(&self, _chat_id: i64, _text: &str) {}
}
