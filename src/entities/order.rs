use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString};

/// A single purchase attempt. Rows are never deleted; terminal states are
/// permanent history.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    /// `ORD-{buyer_id}-{unix_millis}`, generated at pack selection.
    #[sea_orm(primary_key, auto_increment = false)]
    pub order_id: String,

    /// Gateway payment id; empty until the first webhook resolves one.
    pub payment_id: String,

    /// Gateway checkout-preference (charge) id.
    pub preference_id: String,

    pub buyer_id: String,
    pub channel_id: String,
    pub nick: String,
    pub email: String,
    pub pack_id: String,
    pub coins: i32,
    pub amount: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle status of an order.
///
/// `Pending` and `Approved` are the active (non-terminal) states; everything
/// else is permanent. Gateway statuses map case-insensitively and anything
/// the gateway invents later maps to `Unknown` rather than failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum OrderStatus {
    Pending,
    Approved,
    Authorized,
    InProcess,
    InMediation,
    Rejected,
    Cancelled,
    Refunded,
    ChargedBack,
    Delivered,
    DeliveryError,
    Unknown,
}

impl OrderStatus {
    /// Parses a gateway or stored status string, mapping unrecognized values
    /// to `Unknown`.
    pub fn parse(s: &str) -> Self {
        OrderStatus::from_str(s).unwrap_or(OrderStatus::Unknown)
    }

    /// Whether the order still occupies its channel.
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Approved)
    }
}

impl Model {
    pub fn status(&self) -> OrderStatus {
        OrderStatus::parse(&self.status)
    }
}
