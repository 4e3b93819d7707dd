//! # Tally Users
//!
//! User profiles. Users are created either directly through
//! [`create_user`](UserService::create_user) or from a `USER_REGISTERED`
//! event on [`REGISTERED_TOPIC`]; both paths emit `USER_CREATED` on
//! [`TOPIC`], which starts card provisioning. Blocking a user emits
//! `USER_BLOCKED` on the same topic. Renames and soft deletes are local and
//! emit nothing.

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

pub use domain::{CreateUserRequest, UpdateUserRequest, User, UserStatus};
pub use handlers::UserRegisteredHandler;
pub use postgres::{PgUserStore, SCHEMA};
pub use service::{CREATE_USER, RegisteredUser, UserService};
pub use store::{UserStore, UserWrite};

/// Topic this service publishes to.
pub const TOPIC: &str = "user-events";

/// Topic carrying `USER_REGISTERED`.
pub const REGISTERED_TOPIC: &str = "registered-events";

/// Service name used for configuration defaults.
pub const SERVICE_NAME: &str = "users";
