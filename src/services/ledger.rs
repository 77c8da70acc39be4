//! The idempotency ledger: durable Order records plus customer profiles.
//!
//! This is the durability boundary. Once a transition is written here it
//! survives restart; every other piece of state (locks, dedupe windows,
//! sessions) is disposable.

use crate::{
    db::DbPool,
    entities::customer_profile::{
        ActiveModel as ProfileActiveModel, Entity as ProfileEntity, Model as ProfileModel,
    },
    entities::order::{
        self, ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel,
        OrderStatus,
    },
    errors::ServiceError,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Fields fixed at order creation; everything else starts empty/PENDING.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: String,
    pub preference_id: String,
    pub buyer_id: String,
    pub channel_id: String,
    pub nick: String,
    pub email: String,
    pub pack_id: String,
    pub coins: i32,
    pub amount: Decimal,
}

#[derive(Clone)]
pub struct OrderLedger {
    db: Arc<DbPool>,
}

impl OrderLedger {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Inserts a new PENDING order. A duplicate order id is an invariant
    /// violation (the generation scheme makes collisions practically
    /// impossible), reported loudly instead of silently ignored.
    #[instrument(skip(self, new_order), fields(order_id = %new_order.order_id))]
    pub async fn create(&self, new_order: NewOrder) -> Result<OrderModel, ServiceError> {
        let db = &*self.db;

        if OrderEntity::find_by_id(&new_order.order_id)
            .one(db)
            .await?
            .is_some()
        {
            error!(order_id = %new_order.order_id, "duplicate order id on create");
            return Err(ServiceError::Conflict(format!(
                "order {} already exists",
                new_order.order_id
            )));
        }

        let now = Utc::now();
        let model = OrderActiveModel {
            order_id: Set(new_order.order_id.clone()),
            payment_id: Set(String::new()),
            preference_id: Set(new_order.preference_id),
            buyer_id: Set(new_order.buyer_id),
            channel_id: Set(new_order.channel_id),
            nick: Set(new_order.nick),
            email: Set(new_order.email),
            pack_id: Set(new_order.pack_id),
            coins: Set(new_order.coins),
            amount: Set(new_order.amount),
            status: Set(OrderStatus::Pending.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await?;

        info!(order_id = %model.order_id, "order recorded as PENDING");
        Ok(model)
    }

    pub async fn get_by_order_id(&self, order_id: &str) -> Result<Option<OrderModel>, ServiceError> {
        Ok(OrderEntity::find_by_id(order_id).one(&*self.db).await?)
    }

    pub async fn get_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        if payment_id.is_empty() {
            return Ok(None);
        }
        Ok(OrderEntity::find()
            .filter(order::Column::PaymentId.eq(payment_id))
            .one(&*self.db)
            .await?)
    }

    /// Overwrites the mutable fields of an order. Safe to call repeatedly
    /// with the same terminal status, since webhook delivery is
    /// at-least-once.
    #[instrument(skip(self, status), fields(status = %status))]
    pub async fn update_status(
        &self,
        order_id: &str,
        payment_id: &str,
        status: OrderStatus,
    ) -> Result<OrderModel, ServiceError> {
        let db = &*self.db;

        let existing = OrderEntity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {order_id} not found")))?;

        let old_status = existing.status.clone();
        let mut active: OrderActiveModel = existing.into();
        active.payment_id = Set(payment_id.to_string());
        active.status = Set(status.to_string());
        active.updated_at = Set(Utc::now());

        let updated = active.update(db).await?;
        info!(order_id, old_status = %old_status, new_status = %status, "order status written");
        Ok(updated)
    }

    /// Most recent non-terminal order bound to a channel, if any. Enforces
    /// the one-active-order-per-channel rule via lookup-before-create.
    pub async fn find_active_in_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::ChannelId.eq(channel_id))
            .filter(order::Column::Status.is_in([
                OrderStatus::Pending.to_string(),
                OrderStatus::Approved.to_string(),
            ]))
            .order_by_desc(order::Column::CreatedAt)
            .one(&*self.db)
            .await?)
    }

    /// Creates or refreshes a customer profile; `None` fields keep their
    /// stored value.
    #[instrument(skip(self))]
    pub async fn upsert_profile(
        &self,
        customer_id: &str,
        nick: Option<&str>,
        email: Option<&str>,
    ) -> Result<ProfileModel, ServiceError> {
        let db = &*self.db;
        let now = Utc::now();

        match ProfileEntity::find_by_id(customer_id).one(db).await? {
            Some(existing) => {
                let mut active: ProfileActiveModel = existing.into();
                if let Some(nick) = nick {
                    active.nick = Set(nick.to_string());
                }
                if let Some(email) = email {
                    active.email = Set(email.to_string());
                }
                active.updated_at = Set(now);
                Ok(active.update(db).await?)
            }
            None => Ok(ProfileActiveModel {
                customer_id: Set(customer_id.to_string()),
                nick: Set(nick.unwrap_or_default().to_string()),
                email: Set(email.unwrap_or_default().to_string()),
                updated_at: Set(now),
            }
            .insert(db)
            .await?),
        }
    }

    pub async fn get_profile(
        &self,
        customer_id: &str,
    ) -> Result<Option<ProfileModel>, ServiceError> {
        Ok(ProfileEntity::find_by_id(customer_id).one(&*self.db).await?)
    }
}
