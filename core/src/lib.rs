//! # Tally Core
//!
//! Shared building blocks for the Tally services.
//!
//! Every service in the workspace (registration, users, cards, ledger) applies
//! commands and reacts to events exactly-once-in-effect. The pieces that make
//! that possible live here:
//!
//! - [`money`]: fixed-point amounts, normalized to two decimals half-to-even
//! - [`error`]: the closed [`LedgerError`](error::LedgerError) taxonomy and its
//!   boundary translation into [`ApiError`](error::ApiError)
//! - [`idempotency`]: request fingerprints and the idempotency guard
//! - [`outbox`]: outbox records and the atomic [`Commit`](outbox::Commit) unit
//! - [`event`] / [`event_bus`]: the wire envelope and the bus abstraction
//! - [`directory`]: the card lookup contract used across service boundaries
//!
//! ## Data flow
//!
//! ```text
//! command ──► idempotency guard ──► mutate (versioned) ──► Commit { writes, record, outbox }
//!                                                               │
//!                                     publisher ◄── outbox ◄────┘
//!                                         │
//!                                         ▼
//!                                    event bus ──► consumers (idempotent, retrying)
//! ```

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod correlation;
pub mod directory;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod ids;
pub mod idempotency;
pub mod money;
pub mod outbox;
pub mod version;

/// Boxed future returned by dyn-compatible store traits.
pub type StoreFuture<'a, T> =
    futures::future::BoxFuture<'a, Result<T, error::LedgerError>>;

/// Environment module - injected dependencies.
///
/// All time-dependent code reads the clock through [`Clock`](environment::Clock)
/// so tests can pin it.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
