//! Telegapay gateway client, payment reconciliation and its HTTP surface.

mod client;
pub mod reconciler;
pub mod routes;

pub use client::TelegapayClient;
pub use reconciler::{PaymentReconciler, ReconcilerSettings};
pub use routes::TelegapayState;
