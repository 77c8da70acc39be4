pub mod customer_profile;
pub mod order;

pub use customer_profile::Entity as CustomerProfile;
pub use order::Entity as Order;
