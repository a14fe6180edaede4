//! # fellowship-store
//!
//! SQLite storage for groups, memberships, messages and subscription
//! snapshots.
//!
//! The crate exposes a synchronous [`Database`] handle that serializes access
//! to one `rusqlite::Connection`. Every read or write runs inside a
//! transaction through [`Database::read`] / [`Database::write`], and the typed
//! CRUD helpers for every domain model live on the transaction handle
//! [`Txn`], so a caller can load facts, decide, and mutate atomically.

pub mod database;
pub mod groups;
pub mod memberships;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod subscriptions;

mod codec;
mod error;

pub use database::{Database, Txn};
pub use error::StoreError;
pub use models::*;
