//! # Tally Testing
//!
//! Testing utilities for the tally services.
//!
//! This crate provides:
//! - In-memory implementations of the store and bus seams
//! - A fixed clock
//! - proptest strategies for money
//!
//! ## Example
//!
//! ```ignore
//! use tally_testing::{InMemoryEventBus, InMemoryStore, test_clock};
//!
//! #[tokio::test]
//! async fn provisioning_emits_one_event() {
//!     let store = Arc::new(InMemoryStore::<CardTables>::new());
//!     let service = CardService::new(store.clone(), Arc::new(test_clock()));
//!
//!     service.provision_default_cards(owner, &CorrelationId::generate()).await.unwrap();
//!
//!     assert_eq!(store.outbox_records().await.len(), 1);
//! }
//! ```

mod bus;
mod store;

use chrono::{DateTime, Utc};
use tally_core::environment::Clock;

/// Mock implementations of the service seams.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    pub use crate::bus::InMemoryEventBus;
    pub use crate::store::{InMemoryStore, TableWrite};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use tally_testing::mocks::FixedClock;
    /// use tally_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities.
pub mod helpers {
    /// Send test logs to the captured test output. Safe to call repeatedly.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    /// Positive amounts with two decimal places, 0.01 to `max_cents / 100`.
    pub fn amount_up_to(max_cents: i64) -> impl Strategy<Value = Decimal> {
        (1..=max_cents.max(1)).prop_map(|cents| Decimal::new(cents, 2))
    }

    /// Amounts with up to four decimal places, including zero and negatives.
    pub fn any_amount() -> impl Strategy<Value = Decimal> {
        (-1_000_000_i64..=1_000_000).prop_map(|raw| Decimal::new(raw, 4))
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, InMemoryEventBus, InMemoryStore, TableWrite, test_clock};
