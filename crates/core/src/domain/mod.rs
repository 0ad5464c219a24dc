pub mod connection;
pub mod metadata;
pub mod payment;
pub mod subscription;
