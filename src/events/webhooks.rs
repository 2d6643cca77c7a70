use std::time::Duration;

use crate::{
    config::{self, CONFIG},
    db::{Db, WebhookDefinition},
};

use super::{notifications::render_template, Event};

/// POST the event to every enabled webhook subscribed to it, with bounded
/// retries and exponential backoff. A template, when set, shapes the body;
/// otherwise the raw payload is sent.
pub async fn dispatch(db: &Db, client: &reqwest::Client, event: &Event) {
    let webhooks = match db.list_webhooks().await {
        Ok(webhooks) => webhooks,
        Err(e) => {
            tracing::error!("Failed to load webhooks: {e}");
            return;
        }
    };
    for webhook in webhooks {
        if !webhook.enabled || !webhook.subscribes_to(event.name()) {
            continue;
        }
        deliver(db, client, &webhook, event).await;
    }
}

async fn deliver(db: &Db, client: &reqwest::Client, webhook: &WebhookDefinition, event: &Event) {
    let retries: config::WebhookRetries = CONFIG.get_value();
    let timeout: config::CollaboratorTimeoutSeconds = CONFIG.get_value();
    let payload = event.payload();

    let body = match &webhook.template {
        Some(template) => {
            let rendered = render_template(template, event.name(), &payload);
            serde_json::from_str::<serde_json::Value>(&rendered).unwrap_or_else(|_| {
                serde_json::json!({ "event": event.name(), "message": rendered })
            })
        }
        None => {
            let mut body = serde_json::Map::new();
            body.insert(
                "event".to_string(),
                serde_json::Value::String(event.name().to_string()),
            );
            body.extend(payload.clone());
            serde_json::Value::Object(body)
        }
    };

    let mut status: Option<i64> = None;
    for attempt in 0..=retries.0 {
        if attempt > 0 {
            let backoff = Duration::from_millis(500 * 2u64.pow(attempt - 1));
            tokio::time::sleep(backoff).await;
        }
        let response = client
            .post(&webhook.url)
            .timeout(Duration::from_secs(timeout.0))
            .json(&body)
            .send()
            .await;
        match response {
            Ok(response) => {
                let code = response.status();
                status = Some(code.as_u16() as i64);
                if code.is_success() {
                    break;
                }
                // 4xx will not get better on retry
                if code.is_client_error() {
                    tracing::warn!(
                        webhook = %webhook.name,
                        status = code.as_u16(),
                        "Webhook rejected the payload"
                    );
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(
                    webhook = %webhook.name,
                    attempt,
                    "Webhook delivery failed: {e}"
                );
            }
        }
    }

    if let Err(e) = db.record_webhook_run(webhook.id, status).await {
        tracing::error!("Failed to record webhook run: {e}");
    }
}
