//! In-memory [`RegistrationStore`] for tests.

use crate::domain::Credentials;
use crate::store::{CREDENTIALS_EMAIL_KEY, CREDENTIALS_PKEY, RegistrationStore, RegistrationWrite};
use std::collections::HashMap;
use tally_core::StoreFuture;
use tally_core::error::LedgerError;
use tally_core::ids::UserId;
use tally_core::outbox::Commit;
use tally_testing::{InMemoryStore, TableWrite};

/// The `credentials` table.
#[derive(Clone, Debug, Default)]
pub struct RegistrationTables {
    /// Rows by user id
    pub credentials: HashMap<UserId, Credentials>,
}

/// Registration store backed by memory.
pub type InMemoryRegistrationStore = InMemoryStore<RegistrationTables>;

impl TableWrite<RegistrationTables> for RegistrationWrite {
    fn check(&self, tables: &RegistrationTables) -> Result<(), LedgerError> {
        match self {
            Self::Insert(new) => {
                if tables.credentials.contains_key(&new.user_id) {
                    return Err(LedgerError::UniqueViolation {
                        constraint: CREDENTIALS_PKEY.to_string(),
                    });
                }
                if tables.credentials.values().any(|c| c.email == new.email) {
                    return Err(LedgerError::UniqueViolation {
                        constraint: CREDENTIALS_EMAIL_KEY.to_string(),
                    });
                }
                Ok(())
            }
            Self::Block(user_id) if !tables.credentials.contains_key(user_id) => {
                Err(LedgerError::UserNotFound(*user_id))
            }
            Self::Block(_) => Ok(()),
        }
    }

    fn apply(self, tables: &mut RegistrationTables) {
        match self {
            Self::Insert(credentials) => {
                tables.credentials.insert(credentials.user_id, credentials);
            }
            Self::Block(user_id) => {
                if let Some(credentials) = tables.credentials.get_mut(&user_id) {
                    credentials.blocked = true;
                }
            }
        }
    }
}

impl RegistrationStore for InMemoryStore<RegistrationTables> {
    fn credentials(&self, user_id: UserId) -> StoreFuture<'_, Option<Credentials>> {
        Box::pin(async move { Ok(self.read(|t| t.credentials.get(&user_id).cloned()).await) })
    }

    fn credentials_by_email(&self, email: String) -> StoreFuture<'_, Option<Credentials>> {
        Box::pin(async move {
            Ok(self
                .read(|t| t.credentials.values().find(|c| c.email == email).cloned())
                .await)
        })
    }

    fn commit(&self, commit: Commit<RegistrationWrite>) -> StoreFuture<'_, ()> {
        Box::pin(InMemoryStore::commit(self, commit))
    }
}
