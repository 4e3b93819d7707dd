//! # Tally Cards
//!
//! Payment cards. Every new user gets a default USD debit card when
//! `USER_CREATED` arrives on [`USER_EVENTS_TOPIC`]; each new card emits
//! `CARD_CREATED` on [`TOPIC`] so the ledger can open an account and link
//! it back through [`CardDirectory`](tally_core::directory::CardDirectory),
//! which [`CardService`] implements.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod domain;
pub mod events;
pub mod handlers;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod postgres;
pub mod service;
pub mod store;

pub use domain::{Card, CardType, CreateCardRequest};
pub use handlers::UserCreatedHandler;
pub use postgres::{PgCardStore, SCHEMA};
pub use service::{CREATE_CARD, CardService};
pub use store::{CardStore, CardWrite};

/// Topic this service publishes to.
pub const TOPIC: &str = "card-events";

/// Topic carrying `USER_CREATED`.
pub const USER_EVENTS_TOPIC: &str = "user-events";

/// Service name used for configuration defaults.
pub const SERVICE_NAME: &str = "cards";
