//! Persistence seam of the users service.

use crate::domain::User;
use tally_core::StoreFuture;
use tally_core::idempotency::IdempotencyStore;
use tally_core::ids::UserId;
use tally_core::outbox::Commit;
use tally_core::version::Version;

/// Primary key of `users`.
pub const USERS_PKEY: &str = "users_pkey";

/// Unique constraint on `users.email`.
pub const USERS_EMAIL_KEY: &str = "users_email_key";

/// One write inside a users commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserWrite {
    /// Insert a new user
    Insert(User),
    /// Replace a user if its stored version is still `expected`
    Update {
        /// New state, version already advanced
        user: User,
        /// Version the change was based on
        expected: Version,
    },
}

/// User storage plus the shared idempotency table.
pub trait UserStore: IdempotencyStore {
    /// User by id.
    fn user(&self, id: UserId) -> StoreFuture<'_, Option<User>>;

    /// User by normalized email.
    fn user_by_email(&self, email: String) -> StoreFuture<'_, Option<User>>;

    /// Apply writes, idempotency record and outbox rows atomically.
    ///
    /// A stale [`UserWrite::Update`] fails the whole commit with
    /// `ConcurrencyConflict`.
    fn commit(&self, commit: Commit<UserWrite>) -> StoreFuture<'_, ()>;
}
