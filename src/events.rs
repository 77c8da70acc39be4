//! Purchase-log event pipeline.
//!
//! Services emit events over an mpsc channel; a background task formats them
//! and posts the audit line to the configured log channel. Log delivery is
//! best-effort: failures are warned about and dropped, never propagated into
//! the order flow.

use crate::clients::ChatClient;
use crate::pricing::format_brl;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Everything a purchase-log line needs, captured at emit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseLog {
    pub status: String,
    pub buyer_id: String,
    pub nick: String,
    pub email: String,
    pub coins: i32,
    pub amount: Decimal,
    pub order_id: String,
    pub payment_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(PurchaseLog),
    OrderStatusChanged(PurchaseLog),
    OrderDelivered(PurchaseLog),
    DeliveryFailed(PurchaseLog),
}

impl Event {
    fn log(&self) -> &PurchaseLog {
        match self {
            Event::OrderCreated(log)
            | Event::OrderStatusChanged(log)
            | Event::OrderDelivered(log)
            | Event::DeliveryFailed(log) => log,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Enqueues an event; a full or closed pipeline is logged and swallowed
    /// so the purchase flow never blocks on logging.
    pub fn send(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!(error = %e, "failed to enqueue purchase log event");
        }
    }
}

fn format_purchase_log(log: &PurchaseLog) -> String {
    format!(
        "🧾 **PURCHASE LOG (COINS)**\n\
         • Status: **{}**\n\
         • Buyer: **{}** (<@{}>)\n\
         • Nick: **{}**\n\
         • Email: **{}**\n\
         • Pack: **{} coins**\n\
         • Amount: **{}**\n\
         • Order: **{}**\n\
         • Payment: **{}**\n\
         • At: <t:{}:F>",
        log.status,
        log.buyer_id,
        log.buyer_id,
        if log.nick.is_empty() { "—" } else { &log.nick },
        if log.email.is_empty() { "—" } else { &log.email },
        log.coins,
        format_brl(log.amount),
        log.order_id,
        log.payment_id.as_deref().unwrap_or("—"),
        log.timestamp.timestamp(),
    )
}

/// Drains the event channel and posts each entry to the log channel.
/// Runs until every `EventSender` is dropped.
pub async fn process_events(
    mut receiver: mpsc::Receiver<Event>,
    chat: Arc<dyn ChatClient>,
    log_channel_id: String,
) {
    info!(log_channel_id = %log_channel_id, "purchase log processor started");
    while let Some(event) = receiver.recv().await {
        let text = format_purchase_log(event.log());
        if let Err(e) = chat.send_message(&log_channel_id, &text).await {
            warn!(error = %e, "failed to post purchase log");
        }
    }
    info!("purchase log processor stopped");
}
