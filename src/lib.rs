//! Coin shop storefront service.
//!
//! Receives decoded customer interactions from the chat gateway process and
//! payment notifications from the gateway webhook, and drives the purchase
//! flow: ticket, pricing, charge, webhook-triggered delivery. Everything
//! durable lives in the order ledger; locks, dedupe windows and ticket
//! sessions are in-memory and disposable.

pub mod clients;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod guards;
pub mod handlers;
pub mod migrator;
pub mod pricing;
pub mod services;

use crate::{
    clients::{ChatClient, DeliveryClient, PaymentGateway},
    config::AppConfig,
    db::DbPool,
    events::{Event, EventSender},
    guards::{GuardConfig, GuardService},
    services::ledger::OrderLedger,
    services::orders::OrderService,
    services::tickets::{TicketConfig, TicketService},
};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: Arc<AppConfig>,
    pub guards: Arc<GuardService>,
    pub tickets: TicketService,
    pub orders: Arc<OrderService>,
}

/// Wires services together around the given collaborator clients. Returns
/// the state plus the purchase-log receiver the caller must drain (see
/// [`events::process_events`]).
pub fn build_state(
    config: Arc<AppConfig>,
    db: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    delivery: Arc<dyn DeliveryClient>,
    chat: Arc<dyn ChatClient>,
) -> (AppState, mpsc::Receiver<Event>) {
    let guards = Arc::new(GuardService::new(GuardConfig::from(config.as_ref())));
    let ledger = Arc::new(OrderLedger::new(Arc::clone(&db)));

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let tickets = TicketService::new(
        Arc::clone(&ledger),
        Arc::clone(&guards),
        Arc::clone(&chat),
        TicketConfig {
            cooldown: config.ticket_cooldown(),
            inactivity_close: config.inactivity_close(),
            delete_delay: config.delete_delay(),
        },
    );

    let orders = Arc::new(OrderService::new(
        ledger,
        Arc::clone(&guards),
        gateway,
        delivery,
        chat,
        tickets.clone(),
        EventSender::new(event_tx),
        config.auto_close_after_delivery(),
    ));

    (
        AppState {
            db,
            config,
            guards,
            tickets,
            orders,
        },
        event_rx,
    )
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/webhook", post(handlers::webhooks::mercado_pago_webhook))
        .route("/api/v1/events", post(handlers::events::handle_event))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}
