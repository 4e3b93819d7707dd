//! In-memory [`UserStore`] for tests.

use crate::domain::User;
use crate::store::{USERS_EMAIL_KEY, USERS_PKEY, UserStore, UserWrite};
use std::collections::HashMap;
use tally_core::StoreFuture;
use tally_core::error::LedgerError;
use tally_core::ids::UserId;
use tally_core::outbox::Commit;
use tally_testing::{InMemoryStore, TableWrite};

/// The `users` table.
#[derive(Clone, Debug, Default)]
pub struct UserTables {
    /// Rows by id
    pub users: HashMap<UserId, User>,
}

/// Users store backed by memory.
pub type InMemoryUserStore = InMemoryStore<UserTables>;

impl TableWrite<UserTables> for UserWrite {
    fn check(&self, tables: &UserTables) -> Result<(), LedgerError> {
        match self {
            Self::Insert(user) if tables.users.contains_key(&user.id) => Err(LedgerError::UniqueViolation {
                constraint: USERS_PKEY.to_string(),
            }),
            Self::Insert(user) if tables.users.values().any(|u| u.email == user.email) => {
                Err(LedgerError::UniqueViolation {
                    constraint: USERS_EMAIL_KEY.to_string(),
                })
            }
            Self::Insert(_) => Ok(()),
            Self::Update { user, expected } => match tables.users.get(&user.id) {
                Some(stored) if stored.version == *expected => Ok(()),
                Some(_) => Err(LedgerError::conflict("user", user.id)),
                None => Err(LedgerError::UserNotFound(user.id)),
            },
        }
    }

    fn apply(self, tables: &mut UserTables) {
        match self {
            Self::Insert(user) | Self::Update { user, .. } => {
                tables.users.insert(user.id, user);
            }
        }
    }
}

impl UserStore for InMemoryStore<UserTables> {
    fn user(&self, id: UserId) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move { Ok(self.read(|t| t.users.get(&id).cloned()).await) })
    }

    fn user_by_email(&self, email: String) -> StoreFuture<'_, Option<User>> {
        Box::pin(async move { Ok(self.read(|t| t.users.values().find(|u| u.email == email).cloned()).await) })
    }

    fn commit(&self, commit: Commit<UserWrite>) -> StoreFuture<'_, ()> {
        Box::pin(InMemoryStore::commit(self, commit))
    }
}
