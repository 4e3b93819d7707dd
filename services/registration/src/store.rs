//! Persistence seam of the registration service.

use crate::domain::Credentials;
use tally_core::StoreFuture;
use tally_core::idempotency::IdempotencyStore;
use tally_core::ids::UserId;
use tally_core::outbox::Commit;

/// Unique constraint on `credentials.email`.
pub const CREDENTIALS_EMAIL_KEY: &str = "credentials_email_key";

/// Primary key of `credentials`.
pub const CREDENTIALS_PKEY: &str = "credentials_pkey";

/// One write inside a registration commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationWrite {
    /// Store new credentials
    Insert(Credentials),
    /// Mark a user blocked
    Block(UserId),
}

/// Credentials storage plus the shared idempotency table.
pub trait RegistrationStore: IdempotencyStore {
    /// Credentials by user id.
    fn credentials(&self, user_id: UserId) -> StoreFuture<'_, Option<Credentials>>;

    /// Credentials by normalized email.
    fn credentials_by_email(&self, email: String) -> StoreFuture<'_, Option<Credentials>>;

    /// Apply writes, idempotency record and outbox rows atomically.
    fn commit(&self, commit: Commit<RegistrationWrite>) -> StoreFuture<'_, ()>;
}
