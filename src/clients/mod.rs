//! Outbound collaborator clients: payment gateway, game delivery API, and
//! the chat platform. Each is a trait at the seam plus a reqwest-backed
//! implementation with a bounded timeout.

pub mod chat;
pub mod delivery;
pub mod payment;

pub use chat::{ChatClient, DiscordRestClient};
pub use delivery::{DeliveryClient, DeliveryOutcome, GameApiClient};
pub use payment::{Charge, OpenCharge, Payment, PaymentGateway, MercadoPagoGateway};
