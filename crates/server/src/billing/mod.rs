//! Subscription billing on top of the payment reconciler.

pub mod routes;
mod service;

pub use routes::BillingState;
pub use service::{BillingService, Checkout, SubscribeInput};
