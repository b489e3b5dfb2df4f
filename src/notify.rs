use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Reply, Ticket};

/// Outbound notification to a ticket owner. Delivery is fire-and-forget:
/// failures are logged and never surface into the request that triggered them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn reply_posted(&self, ticket: &Ticket, reply: &Reply);
}

/// Default sink: structured log line only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn reply_posted(&self, ticket: &Ticket, reply: &Reply) {
        tracing::info!(
            ticket_id = ticket.id,
            reply_id = reply.id,
            owner = ticket.user_id,
            "new reply notification for ticket owner"
        );
    }
}

#[derive(Serialize)]
struct ReplyEvent<'a> {
    event: &'static str,
    ticket_id: i64,
    ticket_title: &'a str,
    owner_id: i64,
    reply_id: i64,
    author_id: i64,
    from_support: bool,
}

/// POSTs a JSON event to a configured webhook (chat bridge, mail relay, ...).
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn reply_posted(&self, ticket: &Ticket, reply: &Reply) {
        let event = ReplyEvent {
            event: "reply_posted",
            ticket_id: ticket.id,
            ticket_title: &ticket.title,
            owner_id: ticket.user_id,
            reply_id: reply.id,
            author_id: reply.author_id,
            from_support: reply.from_support,
        };
        match self.client.post(&self.url).json(&event).send().await {
            Ok(resp) if !resp.status().is_success() => {
                log::warn!("notification webhook returned {}", resp.status());
            }
            Ok(_) => {}
            Err(e) => log::warn!("notification webhook delivery failed: {e}"),
        }
    }
}

/// Webhook when RHD_NOTIFY_WEBHOOK is set, log-only otherwise.
pub fn build_notifier() -> Arc<dyn Notifier> {
    match std::env::var("RHD_NOTIFY_WEBHOOK") {
        Ok(url) if !url.is_empty() => {
            log::info!("reply notifications via webhook");
            Arc::new(WebhookNotifier::new(url))
        }
        _ => Arc::new(LogNotifier),
    }
}
