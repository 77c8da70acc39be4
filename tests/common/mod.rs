//! Shared harness for integration tests: an in-memory database, fake
//! collaborator clients with inspectable call records, and a fully wired
//! router.

// not every test binary uses every helper
#![allow(dead_code)]

use async_trait::async_trait;
use coinshop_api::{
    app, build_state,
    clients::{Charge, ChatClient, DeliveryClient, DeliveryOutcome, OpenCharge, Payment, PaymentGateway},
    config::AppConfig,
    db, events,
    errors::ServiceError,
    AppState,
};
use axum::Router;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        host: "127.0.0.1".into(),
        port: 0,
        environment: "development".into(),
        log_level: "debug".into(),
        log_json: false,
        mp_access_token: "TEST-TOKEN".into(),
        mp_base_url: "http://127.0.0.1:0".into(),
        mp_notification_url: None,
        mp_webhook_secret: None,
        delivery_api_url: "http://127.0.0.1:0/give".into(),
        delivery_api_token: "test-delivery-token".into(),
        discord_bot_token: "test-bot-token".into(),
        guild_id: "guild-1".into(),
        ticket_category_id: "category-1".into(),
        log_channel_id: "log-channel".into(),
        support_role_id: None,
        http_timeout_secs: 2,
        ack_timeout_secs: 2,
        ticket_cooldown_secs: 60,
        inactivity_close_secs: 600,
        delete_delay_ms: 10,
        auto_close_after_delivery_ms: 10,
        interaction_dedupe_ms: 12_000,
        channel_lock_ms: 15_000,
        ticket_lock_ms: 30_000,
        delivery_lock_ms: 120_000,
    }
}

/// Chat fake: hands out sequential channel ids and records every message and
/// deletion.
#[derive(Default)]
pub struct FakeChat {
    next_channel: AtomicUsize,
    pub messages: Mutex<Vec<(String, String)>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeChat {
    pub fn messages_to(&self, channel_id: &str) -> Vec<String> {
        self.messages
            .lock()
            .expect("messages lock")
            .iter()
            .filter(|(channel, _)| channel == channel_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn create_ticket_channel(
        &self,
        _name: &str,
        _buyer_id: &str,
    ) -> Result<String, ServiceError> {
        let n = self.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("chan-{n}"))
    }

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<(), ServiceError> {
        self.messages
            .lock()
            .expect("messages lock")
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<(), ServiceError> {
        self.deleted
            .lock()
            .expect("deleted lock")
            .push(channel_id.to_string());
        Ok(())
    }
}

/// Gateway fake: records opened charges and serves payment lookups from a
/// map the test fills in.
#[derive(Default)]
pub struct FakeGateway {
    pub charges: Mutex<Vec<OpenCharge>>,
    payments: Mutex<HashMap<String, Payment>>,
}

impl FakeGateway {
    pub fn register_payment(&self, payment_id: &str, status: &str, external_reference: &str) {
        self.payments.lock().expect("payments lock").insert(
            payment_id.to_string(),
            Payment {
                status: status.to_string(),
                external_reference: external_reference.to_string(),
            },
        );
    }

    pub fn charges_opened(&self) -> usize {
        self.charges.lock().expect("charges lock").len()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn open_charge(&self, request: OpenCharge) -> Result<Charge, ServiceError> {
        let mut charges = self.charges.lock().expect("charges lock");
        charges.push(request);
        let n = charges.len();
        Ok(Charge {
            preference_id: format!("pref-{n}"),
            pay_link: format!("https://pay.test/pref-{n}"),
        })
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Option<Payment>, ServiceError> {
        Ok(self
            .payments
            .lock()
            .expect("payments lock")
            .get(payment_id)
            .cloned())
    }
}

/// Delivery fake: counts grants; flips to failure mode on demand.
pub struct FakeDelivery {
    pub grants: AtomicUsize,
    succeed: AtomicBool,
}

impl Default for FakeDelivery {
    fn default() -> Self {
        Self {
            grants: AtomicUsize::new(0),
            succeed: AtomicBool::new(true),
        }
    }
}

impl FakeDelivery {
    pub fn fail_grants(&self) {
        self.succeed.store(false, Ordering::SeqCst);
    }

    pub fn grant_count(&self) -> usize {
        self.grants.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryClient for FakeDelivery {
    async fn grant(
        &self,
        _nick: &str,
        _coins: i32,
        _order_id: &str,
    ) -> Result<DeliveryOutcome, ServiceError> {
        self.grants.fetch_add(1, Ordering::SeqCst);
        if self.succeed.load(Ordering::SeqCst) {
            Ok(DeliveryOutcome {
                success: true,
                raw: json!({ "ok": true }),
            })
        } else {
            Ok(DeliveryOutcome {
                success: false,
                raw: json!({ "ok": false, "error": "player offline" }),
            })
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub config: Arc<AppConfig>,
    pub chat: Arc<FakeChat>,
    pub gateway: Arc<FakeGateway>,
    pub delivery: Arc<FakeDelivery>,
}

pub async fn spawn_app(webhook_secret: Option<&str>) -> TestApp {
    let mut cfg = test_config();
    cfg.mp_webhook_secret = webhook_secret.map(str::to_string);
    let config = Arc::new(cfg);

    let pool = db::establish_connection("sqlite::memory:")
        .await
        .expect("database connection");
    db::run_migrations(&pool).await.expect("migrations");

    let chat = Arc::new(FakeChat::default());
    let gateway = Arc::new(FakeGateway::default());
    let delivery = Arc::new(FakeDelivery::default());

    let chat_dyn: Arc<dyn ChatClient> = Arc::clone(&chat) as Arc<dyn ChatClient>;
    let gateway_dyn: Arc<dyn PaymentGateway> = Arc::clone(&gateway) as Arc<dyn PaymentGateway>;
    let delivery_dyn: Arc<dyn DeliveryClient> = Arc::clone(&delivery) as Arc<dyn DeliveryClient>;

    let (state, event_rx) = build_state(
        Arc::clone(&config),
        Arc::new(pool),
        gateway_dyn,
        delivery_dyn,
        Arc::clone(&chat_dyn),
    );
    tokio::spawn(events::process_events(
        event_rx,
        chat_dyn,
        config.log_channel_id.clone(),
    ));

    TestApp {
        router: app(state.clone()),
        state,
        config,
        chat,
        gateway,
        delivery,
    }
}

/// Polls a condition until it holds or the deadline passes. Used to observe
/// work handed off to background tasks.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
