//! # fellowship-server
//!
//! HTTP service for the Fellowship community engine.
//!
//! - **Gateway**: every group, membership and message operation is
//!   authorized and applied in one storage transaction
//! - **Identity**: bearer session tokens signed by the identity platform
//! - **Subscriptions**: snapshots signed by the payment server, stored and
//!   cached, from which entitlements are resolved
//! - **Assistant / billing**: thin adapters to the AI guide and the billing
//!   provider
//! - **REST API** (axum) exposing all of the above

pub mod api;
pub mod assistant;
pub mod billing;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod subscriptions;
pub mod upstream;
