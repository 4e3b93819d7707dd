//! # Tally Ledger
//!
//! Accounts and money movement. `CARD_CREATED` on [`CARD_EVENTS_TOPIC`]
//! opens the holder's account and links their cards to it through the
//! cards service. Transfers address cards, which [`CardResolver`] turns
//! into accounts; top-ups and withdrawals address accounts directly.
//! Every balance change commits with its event, published on [`TOPIC`].
//!
//! All commands accept an optional idempotency key and retry lost
//! optimistic-lock races a few times before reporting a transient conflict.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod domain;
pub mod events;
pub mod handlers;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod postgres;
pub mod resolver;
pub mod service;
pub mod store;

#[cfg(test)]
mod chain;

pub use client::HttpCardDirectory;
pub use config::ResolverConfig;
pub use domain::{Account, Transfer, TransferRequest, Turnover};
pub use handlers::CardCreatedHandler;
pub use postgres::{PgLedgerStore, SCHEMA};
pub use resolver::CardResolver;
pub use service::{LedgerService, TOP_UP, TRANSFER, WITHDRAW};
pub use store::{LedgerStore, LedgerWrite};

/// Topic this service publishes to.
pub const TOPIC: &str = "ledger-events";

/// Topic carrying `CARD_CREATED`.
pub const CARD_EVENTS_TOPIC: &str = "card-events";

/// Service name used for configuration defaults.
pub const SERVICE_NAME: &str = "ledger";
