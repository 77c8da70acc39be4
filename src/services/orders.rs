//! The order lifecycle orchestrator.
//!
//! Drives a purchase from pack selection through payment approval to
//! delivery, writing every transition to the ledger. The ledger's
//! terminal-state check plus the runtime delivery lock together guarantee the
//! grant side effect runs at most once per order, even when the gateway
//! redelivers the same webhook concurrently.

use crate::{
    clients::{ChatClient, DeliveryClient, OpenCharge, PaymentGateway},
    errors::ServiceError,
    events::{Event, EventSender, PurchaseLog},
    guards::GuardService,
    pricing::{find_pack, format_brl, price},
    services::ledger::{NewOrder, OrderLedger},
    services::tickets::{looks_like_email, TicketService},
};
use crate::entities::order::{Model as OrderModel, OrderStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub struct OrderService {
    ledger: Arc<OrderLedger>,
    guards: Arc<GuardService>,
    gateway: Arc<dyn PaymentGateway>,
    delivery: Arc<dyn DeliveryClient>,
    chat: Arc<dyn ChatClient>,
    tickets: TicketService,
    events: EventSender,
    auto_close_after_delivery: Duration,
}

fn make_order_id(buyer_id: &str) -> String {
    format!("ORD-{}-{}", buyer_id, Utc::now().timestamp_millis())
}

fn purchase_log(order: &OrderModel, payment_id: Option<&str>) -> PurchaseLog {
    PurchaseLog {
        status: order.status.clone(),
        buyer_id: order.buyer_id.clone(),
        nick: order.nick.clone(),
        email: order.email.clone(),
        coins: order.coins,
        amount: order.amount,
        order_id: order.order_id.clone(),
        payment_id: payment_id.map(str::to_string),
        timestamp: Utc::now(),
    }
}

impl OrderService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<OrderLedger>,
        guards: Arc<GuardService>,
        gateway: Arc<dyn PaymentGateway>,
        delivery: Arc<dyn DeliveryClient>,
        chat: Arc<dyn ChatClient>,
        tickets: TicketService,
        events: EventSender,
        auto_close_after_delivery: Duration,
    ) -> Self {
        Self {
            ledger,
            guards,
            gateway,
            delivery,
            chat,
            tickets,
            events,
            auto_close_after_delivery,
        }
    }

    /// Pack selection: opens a charge with the gateway and records a PENDING
    /// order. The per-channel lock serializes attempts in one ticket; a
    /// second click while a link is being generated gets a "please wait"
    /// instead of a second charge.
    #[instrument(skip(self))]
    pub async fn create_order(
        &self,
        channel_id: &str,
        buyer_id: &str,
        pack_id: &str,
    ) -> Result<String, ServiceError> {
        let session = self.tickets.session(channel_id).ok_or_else(|| {
            ServiceError::NotFound("Use this inside an open ticket.".to_string())
        })?;
        if session.buyer_id != buyer_id {
            return Err(ServiceError::Unauthorized(
                "Only the ticket owner can pick a pack.".to_string(),
            ));
        }

        // Held until this handler returns; TTL covers a crash mid-flight.
        let _lock = self.guards.lock_channel(channel_id).map_err(|wait| {
            ServiceError::InvalidOperation(format!(
                "Wait {}s, a payment link is being generated…",
                wait.as_secs().max(1)
            ))
        })?;

        let pack = find_pack(pack_id)
            .ok_or_else(|| ServiceError::ValidationError("Unknown pack.".to_string()))?;

        if session.nick.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Nick missing: send it as a message or use /setnick.".to_string(),
            ));
        }
        if session.email.trim().is_empty() || !looks_like_email(session.email.trim()) {
            return Err(ServiceError::ValidationError(
                "Email missing or invalid: send it as a message or use /setemail.".to_string(),
            ));
        }

        if let Some(active) = self.ledger.find_active_in_channel(channel_id).await? {
            return Err(ServiceError::Conflict(format!(
                "There is already a pending order in this ticket.\n🧾 Order: **{}**",
                active.order_id
            )));
        }

        let order_id = make_order_id(buyer_id);
        let amount = price(pack);

        // Gateway failure aborts before any ledger write: no Order exists
        // until a charge was actually opened.
        let charge = self
            .gateway
            .open_charge(OpenCharge {
                title: format!("{} Coins", pack.coins),
                description: format!("Nick: {} | Coins: {}", session.nick, pack.coins),
                amount,
                payer_email: session.email.clone(),
                external_reference: order_id.clone(),
            })
            .await?;

        let order = self
            .ledger
            .create(NewOrder {
                order_id: order_id.clone(),
                preference_id: charge.preference_id,
                buyer_id: buyer_id.to_string(),
                channel_id: channel_id.to_string(),
                nick: session.nick.clone(),
                email: session.email.clone(),
                pack_id: pack.id.to_string(),
                coins: pack.coins,
                amount,
            })
            .await?;

        self.tickets.bind_order(channel_id, &order_id);

        let announcement = format!(
            "✅ **Payment link generated!**\n\
             👤 Nick: **{}**\n\
             🪙 Coins: **{}**\n\
             💰 Amount: **{}**\n\
             🧾 Order: **{}**\n\n\
             👉 **Click to pay:** {}\n\n\
             ✅ Delivery is automatic after approval.",
            session.nick,
            pack.coins,
            format_brl(amount),
            order_id,
            charge.pay_link,
        );
        if let Err(e) = self.chat.send_message(channel_id, &announcement).await {
            warn!(error = %e, channel_id, "failed to post pay link");
        }

        self.events
            .send(Event::OrderCreated(purchase_log(&order, None)));

        info!(order_id = %order_id, "order created, pay link posted");
        Ok(format!("✅ Payment link posted in <#{channel_id}>."))
    }

    /// Webhook-driven status update and, on approval, delivery. Safe to call
    /// repeatedly with the same payment id; never reports an error to the
    /// webhook layer.
    pub async fn process_payment(&self, payment_id: &str) {
        // Runtime layer: one in-flight delivery per payment id. A concurrent
        // duplicate is dropped here without touching the ledger.
        let _lease = match self.guards.begin_delivery(payment_id) {
            Some(lease) => lease,
            None => {
                debug!(payment_id, "payment already being processed, dropping duplicate");
                return;
            }
        };

        if let Err(e) = self.process_payment_inner(payment_id).await {
            error!(payment_id, error = %e, "webhook payment processing failed");
        }
    }

    async fn process_payment_inner(&self, payment_id: &str) -> Result<(), ServiceError> {
        // Ledger layer: a payment in a post-delivery state is done. A failed
        // grant is handled manually, never re-attempted from a replay, since
        // the grant may have landed despite the error response.
        if let Some(existing) = self.ledger.get_by_payment_id(payment_id).await? {
            if matches!(
                existing.status(),
                OrderStatus::Delivered | OrderStatus::DeliveryError
            ) {
                debug!(payment_id, status = %existing.status, "payment already settled, nothing to do");
                return Ok(());
            }
        }

        // Re-fetch the authoritative status by id; the webhook body's own
        // status field is never trusted.
        let payment = match self.gateway.get_payment(payment_id).await? {
            Some(payment) => payment,
            None => {
                info!(payment_id, "payment unknown to gateway, ignoring");
                return Ok(());
            }
        };

        let status = OrderStatus::parse(&payment.status);
        let order_id = payment.external_reference;
        if order_id.is_empty() {
            info!(payment_id, "payment carries no order reference, ignoring");
            return Ok(());
        }

        if self.ledger.get_by_order_id(&order_id).await?.is_none() {
            info!(payment_id, order_id = %order_id, "order not in ledger, ignoring");
            return Ok(());
        }

        // Every fetched status lands in the ledger so history is complete.
        let order = self
            .ledger
            .update_status(&order_id, payment_id, status)
            .await?;

        if status != OrderStatus::Approved {
            info!(order_id = %order_id, status = %status, "payment not approved, no delivery");
            self.events
                .send(Event::OrderStatusChanged(purchase_log(&order, Some(payment_id))));
            return Ok(());
        }

        // Time has passed since the channel-active check; re-check right
        // before the side effect.
        if let Some(fresh) = self.ledger.get_by_order_id(&order_id).await? {
            if fresh.status() == OrderStatus::Delivered {
                debug!(order_id = %order_id, "delivered while we were looking, skipping");
                return Ok(());
            }
        }

        let _ = self
            .chat
            .send_message(
                &order.channel_id,
                &format!(
                    "✅ Payment approved!\n🧾 Order: **{}**\n🧾 Payment: **{}**\n🚀 Delivering **{} coins**…",
                    order_id, payment_id, order.coins
                ),
            )
            .await;

        match self.delivery.grant(&order.nick, order.coins, &order_id).await {
            Ok(outcome) if outcome.success => {
                let delivered = self
                    .ledger
                    .update_status(&order_id, payment_id, OrderStatus::Delivered)
                    .await?;
                self.events
                    .send(Event::OrderDelivered(purchase_log(&delivered, Some(payment_id))));
                let _ = self
                    .chat
                    .send_message(&order.channel_id, "🎉 **Coins delivered!**")
                    .await;
                self.tickets
                    .schedule_delete(&order.channel_id, self.auto_close_after_delivery);
                info!(order_id = %order_id, "order delivered");
            }
            Ok(outcome) => {
                // Falsy success indicator: terminal, manual follow-up, no retry.
                let failed = self
                    .ledger
                    .update_status(&order_id, payment_id, OrderStatus::DeliveryError)
                    .await?;
                self.events
                    .send(Event::DeliveryFailed(purchase_log(&failed, Some(payment_id))));
                let _ = self
                    .chat
                    .send_message(
                        &order.channel_id,
                        &format!("❌ Delivery error: `{}`", outcome.raw),
                    )
                    .await;
                warn!(order_id = %order_id, "delivery reported failure");
            }
            Err(e) => {
                let failed = self
                    .ledger
                    .update_status(&order_id, payment_id, OrderStatus::DeliveryError)
                    .await?;
                self.events
                    .send(Event::DeliveryFailed(purchase_log(&failed, Some(payment_id))));
                let _ = self
                    .chat
                    .send_message(&order.channel_id, &format!("❌ Delivery error: `{e}`"))
                    .await;
                error!(order_id = %order_id, error = %e, "delivery call failed");
            }
        }

        Ok(())
    }
}
