//! # Tally Registration
//!
//! Owns login credentials. A successful [`register`](RegistrationService::register)
//! stores the credentials and emits `USER_REGISTERED` on
//! [`TOPIC`]; the users service picks it up from there. When the users
//! service blocks someone it emits `USER_BLOCKED`, and
//! [`UserBlockedHandler`] flips the local flag.
//!
//! Password handling and token issuance live outside this crate.

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

pub use domain::{Credentials, RegisterRequest};
pub use handlers::UserBlockedHandler;
pub use postgres::{PgRegistrationStore, SCHEMA};
pub use service::RegistrationService;
pub use store::{RegistrationStore, RegistrationWrite};

/// Topic this service publishes to.
pub const TOPIC: &str = "registered-events";

/// Topic carrying `USER_BLOCKED`.
pub const USER_EVENTS_TOPIC: &str = "user-events";

/// Service name used for configuration defaults.
pub const SERVICE_NAME: &str = "registration";
