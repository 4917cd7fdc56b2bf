//! Webhook delivery for inbound events.
//!
//! Each event is delivered by a fire-and-forget task so the session's
//! event-dispatch loop is never held across retries: up to 3 attempts with
//! quadratic backoff (`attempt²` seconds), 30 s per request, any 2xx counts
//! as delivered.

use crate::config::WebhookConfig;
use crate::wa::MessageKind;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// The JSON envelope POSTed to a session's webhook URL.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    pub session_id: String,
    pub from: String,
    pub from_name: String,
    pub to: String,
    pub timestamp: i64,
    pub id: String,
    pub is_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub message_type: MessageKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    config: Arc<WebhookConfig>,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()
            .unwrap_or_default();
        Self {
            client,
            config: Arc::new(config),
        }
    }

    /// Deliver on a detached task.
    pub fn spawn_delivery(&self, url: String, event: WebhookEvent) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.deliver(&url, &event).await;
        });
    }

    /// Deliver synchronously. Returns true once a 2xx is seen.
    pub async fn deliver(&self, url: &str, event: &WebhookEvent) -> bool {
        for attempt in 1..=self.config.max_attempts {
            match self.client.post(url).json(event).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(
                        "webhook delivered for session {} (attempt {})",
                        event.session_id,
                        attempt
                    );
                    return true;
                }
                Ok(resp) => {
                    tracing::warn!(
                        "webhook for session {} got {} (attempt {}/{})",
                        event.session_id,
                        resp.status(),
                        attempt,
                        self.config.max_attempts
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "webhook for session {} failed: {} (attempt {}/{})",
                        event.session_id,
                        e,
                        attempt,
                        self.config.max_attempts
                    );
                }
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
        tracing::error!(
            "webhook for session {} dropped after {} attempts",
            event.session_id,
            self.config.max_attempts
        );
        false
    }
}

/// Quadratic backoff: 1s, 4s, 9s, …
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt) * u64::from(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> WebhookEvent {
        WebhookEvent {
            session_id: "15551234567".into(),
            from: "15550001111".into(),
            from_name: "Ada".into(),
            to: "15551234567".into(),
            timestamp: 1700000000,
            id: "MSG1".into(),
            is_group: false,
            group_id: None,
            message_type: MessageKind::Text,
            message: "hello".into(),
            media_url: None,
        }
    }

    #[test]
    fn test_backoff_is_quadratic() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(3), Duration::from_secs(9));
    }

    #[test]
    fn test_envelope_omits_empty_optionals() {
        let json = serde_json::to_value(event()).expect("json");
        assert!(json.get("group_id").is_none());
        assert!(json.get("media_url").is_none());
        assert_eq!(json["message_type"], "text");
    }

    #[tokio::test]
    async fn test_deliver_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let dispatcher = WebhookDispatcher::new(WebhookConfig {
            max_attempts: 3,
            timeout_s: 5,
        });
        let url = format!("{}/hook", server.url());
        assert!(dispatcher.deliver(&url, &event()).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_deliver_gives_up_after_max_attempts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let dispatcher = WebhookDispatcher::new(WebhookConfig {
            max_attempts: 2,
            timeout_s: 5,
        });
        let url = format!("{}/hook", server.url());
        assert!(!dispatcher.deliver(&url, &event()).await);
        mock.assert_async().await;
    }
}
