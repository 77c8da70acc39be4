mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use coinshop_api::entities::order::{Entity as Orders, OrderStatus};
use common::{eventually, spawn_app, TestApp};
use http_body_util::BodyExt;
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

async fn post_event(router: &Router, mut event: Value) -> String {
    if event.get("event_id").is_none() {
        event["event_id"] = json!(Uuid::new_v4().to_string());
    }
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/events")
                .header("content-type", "application/json")
                .body(Body::from(event.to_string()))
                .expect("request built"),
        )
        .await
        .expect("router responded");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body read")
        .to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("ack json");
    body["ack"].as_str().unwrap_or_default().to_string()
}

/// Opens a ticket for buyer-1 and fills in nick and email through free-text
/// messages, the way a customer actually does it.
async fn open_ready_ticket(app: &TestApp) -> String {
    let ack = post_event(
        &app.router,
        json!({ "type": "open_ticket", "user_id": "buyer-1", "username": "Steve" }),
    )
    .await;
    assert!(ack.contains("chan-1"), "unexpected ack: {ack}");

    post_event(
        &app.router,
        json!({ "type": "message", "channel_id": "chan-1", "author_id": "buyer-1", "content": "SteveInGame" }),
    )
    .await;
    post_event(
        &app.router,
        json!({ "type": "message", "channel_id": "chan-1", "author_id": "buyer-1", "content": "steve@example.com" }),
    )
    .await;

    "chan-1".to_string()
}

async fn created_order_id(app: &TestApp) -> String {
    app.gateway
        .charges
        .lock()
        .expect("charges lock")
        .last()
        .expect("a charge was opened")
        .external_reference
        .clone()
}

async fn order_status(app: &TestApp, order_id: &str) -> Option<OrderStatus> {
    Orders::find_by_id(order_id)
        .one(app.state.db.as_ref())
        .await
        .expect("order query")
        .map(|o| o.status())
}

async fn webhook(app: &TestApp, payment_id: &str) {
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "type": "payment", "data": { "id": payment_id } }).to_string(),
                ))
                .expect("request built"),
        )
        .await
        .expect("router responded");
    assert_eq!(response.status(), StatusCode::OK);
}

async fn wait_for_status(app: &TestApp, order_id: &str, expected: OrderStatus) {
    for _ in 0..200 {
        if order_status(app, order_id).await == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "order {order_id} never reached {expected}, last seen {:?}",
        order_status(app, order_id).await
    );
}

#[tokio::test]
async fn full_purchase_flow_delivers_and_logs() {
    let app = spawn_app(None).await;
    let channel = open_ready_ticket(&app).await;

    let ack = post_event(
        &app.router,
        json!({ "type": "select_pack", "channel_id": channel, "user_id": "buyer-1", "pack_id": "c10" }),
    )
    .await;
    assert!(ack.contains("Payment link"), "unexpected ack: {ack}");

    let charges = app.gateway.charges.lock().expect("charges lock");
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].amount, dec!(10));
    assert_eq!(charges[0].payer_email, "steve@example.com");
    drop(charges);

    let order_id = created_order_id(&app).await;
    assert_eq!(order_status(&app, &order_id).await, Some(OrderStatus::Pending));
    assert!(app
        .chat
        .messages_to(&channel)
        .iter()
        .any(|m| m.contains("Click to pay")));

    app.gateway.register_payment("pay-1", "approved", &order_id);
    webhook(&app, "pay-1").await;

    wait_for_status(&app, &order_id, OrderStatus::Delivered).await;
    assert_eq!(app.delivery.grant_count(), 1);
    assert!(app
        .chat
        .messages_to(&channel)
        .iter()
        .any(|m| m.contains("Coins delivered")));

    // purchase log lands in the log channel
    eventually("purchase log posted", || {
        app.chat
            .messages_to("log-channel")
            .iter()
            .any(|m| m.contains("DELIVERED") && m.contains(&order_id))
    })
    .await;

    // the ticket channel is closed automatically after delivery
    eventually("ticket channel deleted", || {
        app.chat
            .deleted
            .lock()
            .expect("deleted lock")
            .contains(&channel)
    })
    .await;
}

#[tokio::test]
async fn webhook_replay_after_delivery_grants_nothing() {
    let app = spawn_app(None).await;
    let channel = open_ready_ticket(&app).await;
    post_event(
        &app.router,
        json!({ "type": "select_pack", "channel_id": channel, "user_id": "buyer-1", "pack_id": "c25" }),
    )
    .await;
    let order_id = created_order_id(&app).await;
    app.gateway.register_payment("pay-1", "approved", &order_id);

    webhook(&app, "pay-1").await;
    wait_for_status(&app, &order_id, OrderStatus::Delivered).await;

    for _ in 0..5 {
        webhook(&app, "pay-1").await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(app.delivery.grant_count(), 1);
    assert_eq!(order_status(&app, &order_id).await, Some(OrderStatus::Delivered));
}

#[tokio::test]
async fn failed_grant_marks_delivery_error_and_surfaces_payload() {
    let app = spawn_app(None).await;
    app.delivery.fail_grants();

    let channel = open_ready_ticket(&app).await;
    post_event(
        &app.router,
        json!({ "type": "select_pack", "channel_id": channel, "user_id": "buyer-1", "pack_id": "c10" }),
    )
    .await;
    let order_id = created_order_id(&app).await;
    app.gateway.register_payment("pay-1", "approved", &order_id);

    webhook(&app, "pay-1").await;
    wait_for_status(&app, &order_id, OrderStatus::DeliveryError).await;

    assert!(app
        .chat
        .messages_to(&channel)
        .iter()
        .any(|m| m.contains("Delivery error") && m.contains("player offline")));

    // a replay never retries a failed grant
    webhook(&app, "pay-1").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(app.delivery.grant_count(), 1);
    assert_eq!(
        order_status(&app, &order_id).await,
        Some(OrderStatus::DeliveryError)
    );
}

#[tokio::test]
async fn non_approved_webhook_updates_status_without_delivery() {
    let app = spawn_app(None).await;
    let channel = open_ready_ticket(&app).await;
    post_event(
        &app.router,
        json!({ "type": "select_pack", "channel_id": channel, "user_id": "buyer-1", "pack_id": "c10" }),
    )
    .await;
    let order_id = created_order_id(&app).await;
    app.gateway.register_payment("pay-1", "rejected", &order_id);

    webhook(&app, "pay-1").await;
    wait_for_status(&app, &order_id, OrderStatus::Rejected).await;
    assert_eq!(app.delivery.grant_count(), 0);
}

#[tokio::test]
async fn missing_email_blocks_pack_selection() {
    let app = spawn_app(None).await;
    post_event(
        &app.router,
        json!({ "type": "open_ticket", "user_id": "buyer-1", "username": "Steve" }),
    )
    .await;
    post_event(
        &app.router,
        json!({ "type": "message", "channel_id": "chan-1", "author_id": "buyer-1", "content": "SteveInGame" }),
    )
    .await;

    let ack = post_event(
        &app.router,
        json!({ "type": "select_pack", "channel_id": "chan-1", "user_id": "buyer-1", "pack_id": "c10" }),
    )
    .await;
    assert!(ack.contains("⚠️"), "unexpected ack: {ack}");
    assert!(ack.contains("Email"), "unexpected ack: {ack}");
    assert_eq!(app.gateway.charges_opened(), 0);
}

#[tokio::test]
async fn duplicate_event_id_is_acknowledged_without_rework() {
    let app = spawn_app(None).await;
    let channel = open_ready_ticket(&app).await;

    let event = json!({
        "type": "select_pack",
        "event_id": "evt-dup",
        "channel_id": channel,
        "user_id": "buyer-1",
        "pack_id": "c10",
    });
    let first = post_event(&app.router, event.clone()).await;
    assert!(first.contains("Payment link"), "unexpected ack: {first}");

    let second = post_event(&app.router, event).await;
    assert!(second.contains("already being processed"), "unexpected ack: {second}");
    assert_eq!(app.gateway.charges_opened(), 1);
}

#[tokio::test]
async fn concurrent_pack_selections_create_exactly_one_order() {
    let app = spawn_app(None).await;
    let channel = open_ready_ticket(&app).await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let router = app.router.clone();
        let event = json!({
            "type": "select_pack",
            "event_id": format!("evt-race-{i}"),
            "channel_id": channel,
            "user_id": "buyer-1",
            "pack_id": "c10",
        });
        tasks.push(tokio::spawn(async move { post_event(&router, event).await }));
    }

    let mut accepted = 0;
    let mut rejected = 0;
    for task in tasks {
        let ack = task.await.expect("task finished");
        if ack.contains("Payment link") {
            accepted += 1;
        } else {
            // losers hit either the channel lock or the active-order check
            assert!(ack.contains("⚠️"), "unexpected ack: {ack}");
            rejected += 1;
        }
    }

    assert_eq!(accepted, 1, "exactly one selection wins");
    assert_eq!(rejected, 7);
    assert_eq!(app.gateway.charges_opened(), 1);
}

#[tokio::test]
async fn second_order_in_same_ticket_is_rejected() {
    let app = spawn_app(None).await;
    let channel = open_ready_ticket(&app).await;
    post_event(
        &app.router,
        json!({ "type": "select_pack", "channel_id": channel, "user_id": "buyer-1", "pack_id": "c10" }),
    )
    .await;
    let first_order = created_order_id(&app).await;

    let ack = post_event(
        &app.router,
        json!({ "type": "select_pack", "channel_id": channel, "user_id": "buyer-1", "pack_id": "c50" }),
    )
    .await;
    assert!(ack.contains("⚠️"), "unexpected ack: {ack}");
    assert!(ack.contains(&first_order), "unexpected ack: {ack}");
    assert_eq!(app.gateway.charges_opened(), 1);
}

#[tokio::test]
async fn stranger_cannot_order_in_someone_elses_ticket() {
    let app = spawn_app(None).await;
    let channel = open_ready_ticket(&app).await;

    let ack = post_event(
        &app.router,
        json!({ "type": "select_pack", "channel_id": channel, "user_id": "mallory", "pack_id": "c10" }),
    )
    .await;
    assert!(ack.contains("⚠️"), "unexpected ack: {ack}");
    assert_eq!(app.gateway.charges_opened(), 0);
}

#[tokio::test]
async fn closing_ticket_deletes_channel() {
    let app = spawn_app(None).await;
    let channel = open_ready_ticket(&app).await;

    let ack = post_event(
        &app.router,
        json!({ "type": "close_ticket", "channel_id": channel, "user_id": "buyer-1" }),
    )
    .await;
    assert!(ack.contains("Closing"), "unexpected ack: {ack}");

    eventually("channel deleted after close", || {
        app.chat
            .deleted
            .lock()
            .expect("deleted lock")
            .contains(&channel)
    })
    .await;
}
