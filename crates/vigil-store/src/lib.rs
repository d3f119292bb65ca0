//! # vigil-store
//!
//! Local SQLite storage for Vigil conversations and messages.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and answers the same page and point reads the
//! hosted backend does: newest-first pages of non-deleted messages enriched
//! with sender details and reply counts, scoped to a tenant.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
