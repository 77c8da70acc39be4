pub mod ledger;
pub mod orders;
pub mod tickets;
