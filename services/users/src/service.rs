//! User commands and queries.

use crate::domain::{CreateUserRequest, UpdateUserRequest, User};
use crate::events::{AGGREGATE_TYPE, UserBlocked, UserCreated};
use crate::store::{USERS_EMAIL_KEY, USERS_PKEY, UserStore, UserWrite};
use std::sync::Arc;
use tally_core::correlation::CorrelationId;
use tally_core::environment::Clock;
use tally_core::error::LedgerError;
use tally_core::idempotency::{Claim, IdempotencyKey, guard};
use tally_core::ids::UserId;
use tally_core::outbox::{Commit, OutboxRecord};
use tally_runtime::retry::{RetryPolicy, retry_with_predicate};

/// Idempotency operation of [`UserService::create_user`].
pub const CREATE_USER: &str = "CREATE_USER";

/// A user carried by `USER_REGISTERED`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredUser {
    /// Id assigned at registration
    pub user_id: UserId,
    /// Display name
    pub username: String,
    /// Email
    pub email: String,
}

/// Users command handler.
pub struct UserService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: UserStore> UserService<S> {
    /// Build on a store and a clock.
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create a user directly.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] for bad fields
    /// - [`LedgerError::UserAlreadyExists`] when the email is taken
    /// - [`LedgerError::IdempotencyConflict`] on key reuse with another request
    pub async fn create_user(
        &self,
        request: CreateUserRequest,
        key: Option<&IdempotencyKey>,
        correlation: &CorrelationId,
    ) -> Result<User, LedgerError> {
        let request = request.normalized()?;
        guard(
            self.store.as_ref(),
            key,
            &request,
            CREATE_USER,
            |claim| self.create(&request, claim, correlation),
            |id| self.get(UserId::from_uuid(id)),
        )
        .await
    }

    async fn create(
        &self,
        request: &CreateUserRequest,
        claim: Option<Claim>,
        correlation: &CorrelationId,
    ) -> Result<User, LedgerError> {
        if self.store.user_by_email(request.email.clone()).await?.is_some() {
            return Err(LedgerError::UserAlreadyExists(request.email.clone()));
        }
        let user = User::new(
            UserId::new(),
            request.username.clone(),
            request.email.clone(),
            self.clock.now(),
        );
        self.insert(user, claim, correlation).await
    }

    /// Create the profile for a registered user, keeping the registration id.
    ///
    /// Redelivery is harmless: an existing profile, or losing the insert race
    /// on the primary key, counts as done.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UserAlreadyExists`] if another user holds the
    /// email, or a storage error.
    pub async fn register_user(
        &self,
        registered: RegisteredUser,
        correlation: &CorrelationId,
    ) -> Result<(), LedgerError> {
        let user_id = registered.user_id;
        if self.store.user(user_id).await?.is_some() {
            tracing::info!(%user_id, "User already exists");
            return Ok(());
        }

        let user = User::new(
            user_id,
            registered.username.trim().to_string(),
            registered.email.trim().to_lowercase(),
            self.clock.now(),
        );
        match self.insert(user, None, correlation).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_unique_violation_on(USERS_PKEY) => {
                tracing::info!(%user_id, "User created concurrently");
                Ok(())
            }
            // The email check can fire before the key check on a racing insert.
            Err(err @ LedgerError::UserAlreadyExists(_)) => {
                if self.store.user(user_id).await?.is_some() {
                    tracing::info!(%user_id, "User created concurrently");
                    return Ok(());
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn insert(
        &self,
        user: User,
        claim: Option<Claim>,
        correlation: &CorrelationId,
    ) -> Result<User, LedgerError> {
        let now = user.created_at;
        let event = UserCreated {
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
        };
        let commit = Commit::new()
            .write(UserWrite::Insert(user.clone()))
            .idempotency(claim.map(|c| c.record(user.id, now)))
            .event(OutboxRecord::for_event(AGGREGATE_TYPE, &event, Some(correlation), now)?);

        match self.store.commit(commit).await {
            Err(err) if err.is_unique_violation_on(USERS_EMAIL_KEY) => {
                Err(LedgerError::UserAlreadyExists(user.email))
            }
            Err(err) => Err(err),
            Ok(()) => {
                tracing::info!(user_id = %user.id, "User created");
                Ok(user)
            }
        }
    }

    /// Block a user and announce it. Blocking twice emits one event.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UserNotFound`], or the version conflict if
    /// every optimistic attempt lost.
    pub async fn block(&self, user_id: UserId, correlation: &CorrelationId) -> Result<User, LedgerError> {
        retry_with_predicate(
            RetryPolicy::optimistic(),
            || self.block_once(user_id, correlation),
            LedgerError::is_concurrency_conflict,
        )
        .await
    }

    async fn block_once(&self, user_id: UserId, correlation: &CorrelationId) -> Result<User, LedgerError> {
        let mut user = self.get(user_id).await?;
        let expected = user.version;
        if !user.block() {
            return Ok(user);
        }

        let now = self.clock.now();
        let event = UserBlocked { user_id };
        let commit = Commit::new()
            .write(UserWrite::Update {
                user: user.clone(),
                expected,
            })
            .event(OutboxRecord::for_event(AGGREGATE_TYPE, &event, Some(correlation), now)?);
        self.store.commit(commit).await?;

        tracing::info!(%user_id, "User blocked");
        Ok(user)
    }

    /// Rename a user.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] for a bad username
    /// - [`LedgerError::UserNotFound`] for unknown or deleted users
    /// - the version conflict if every optimistic attempt lost
    pub async fn update_username(&self, user_id: UserId, request: UpdateUserRequest) -> Result<User, LedgerError> {
        let request = request.normalized()?;
        retry_with_predicate(
            RetryPolicy::optimistic(),
            || self.update_username_once(user_id, &request.username),
            LedgerError::is_concurrency_conflict,
        )
        .await
    }

    async fn update_username_once(&self, user_id: UserId, username: &str) -> Result<User, LedgerError> {
        let mut user = self.get(user_id).await?;
        let expected = user.version;
        if !user.rename(username) {
            return Ok(user);
        }

        self.store
            .commit(Commit::new().write(UserWrite::Update {
                user: user.clone(),
                expected,
            }))
            .await?;
        tracing::info!(%user_id, "User updated");
        Ok(user)
    }

    /// Soft-delete a user. Deleting twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UserNotFound`] for an unknown id, or the version
    /// conflict if every optimistic attempt lost.
    pub async fn delete(&self, user_id: UserId) -> Result<(), LedgerError> {
        retry_with_predicate(
            RetryPolicy::optimistic(),
            || self.delete_once(user_id),
            LedgerError::is_concurrency_conflict,
        )
        .await
    }

    async fn delete_once(&self, user_id: UserId) -> Result<(), LedgerError> {
        let mut user = self
            .store
            .user(user_id)
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))?;
        let expected = user.version;
        if !user.soft_delete() {
            return Ok(());
        }

        self.store
            .commit(Commit::new().write(UserWrite::Update { user, expected }))
            .await?;
        tracing::info!(%user_id, "User deleted");
        Ok(())
    }

    /// One live user.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UserNotFound`] if there is none or it was deleted.
    pub async fn get(&self, user_id: UserId) -> Result<User, LedgerError> {
        self.store
            .user(user_id)
            .await?
            .filter(|user| !user.deleted)
            .ok_or(LedgerError::UserNotFound(user_id))
    }

    /// Live user by email, matched case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UserEmailNotFound`] if there is none or it was
    /// deleted.
    pub async fn get_by_email(&self, email: &str) -> Result<User, LedgerError> {
        let email = email.trim().to_lowercase();
        self.store
            .user_by_email(email.clone())
            .await?
            .filter(|user| !user.deleted)
            .ok_or(LedgerError::UserEmailNotFound(email))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::domain::UserStatus;
    use crate::events::{USER_BLOCKED, USER_CREATED};
    use crate::memory::InMemoryUserStore;
    use tally_core::version::Version;
    use tally_testing::test_clock;

    fn service() -> (Arc<InMemoryUserStore>, UserService<InMemoryUserStore>) {
        let store = Arc::new(InMemoryUserStore::new());
        (store.clone(), UserService::new(store, Arc::new(test_clock())))
    }

    fn registered(user_id: UserId) -> RegisteredUser {
        RegisteredUser {
            user_id,
            username: "mike".into(),
            email: "mike@example.com".into(),
        }
    }

    #[tokio::test]
    async fn create_user_emits_user_created() {
        let (store, service) = service();
        let user = service
            .create_user(CreateUserRequest::new("mike", "mike@example.com"), None, &CorrelationId::new("req-3"))
            .await
            .unwrap();

        let outbox = store.outbox_records().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_type, USER_CREATED);
        assert_eq!(outbox[0].aggregate_id, user.id.to_string());
        assert_eq!(outbox[0].payload["userId"], user.id.to_string());
        assert_eq!(outbox[0].correlation_id.as_deref(), Some("req-3"));
    }

    #[tokio::test]
    async fn create_user_replays_and_rejects_duplicates() {
        let (store, service) = service();
        let key = IdempotencyKey::new("k1").unwrap();
        let cid = CorrelationId::generate();
        let request = CreateUserRequest::new("mike", "mike@example.com");

        let first = service.create_user(request.clone(), Some(&key), &cid).await.unwrap();
        let replay = service.create_user(request.clone(), Some(&key), &cid).await.unwrap();
        assert_eq!(first, replay);

        let err = service.create_user(request, None, &cid).await.unwrap_err();
        assert!(matches!(err, LedgerError::UserAlreadyExists(_)));
        assert_eq!(store.outbox_records().await.len(), 1);
    }

    #[tokio::test]
    async fn create_user_that_loses_the_key_race_replays() {
        let (store, service) = service();
        let key = IdempotencyKey::new("k1").unwrap();
        let cid = CorrelationId::generate();
        let request = CreateUserRequest::new("mike", "mike@example.com");
        let first = service.create_user(request.clone(), Some(&key), &cid).await.unwrap();

        store.stale_idempotency_lookups(1).await;
        let second = service.create_user(request, Some(&key), &cid).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.outbox_records().await.len(), 1);
    }

    #[tokio::test]
    async fn registered_user_is_created_once() {
        let (store, service) = service();
        let user_id = UserId::new();
        let cid = CorrelationId::new("kafka-1");

        service.register_user(registered(user_id), &cid).await.unwrap();
        service.register_user(registered(user_id), &cid).await.unwrap();

        assert_eq!(service.get(user_id).await.unwrap().email, "mike@example.com");
        assert_eq!(store.outbox_records().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_registrations_converge() {
        let (store, service) = service();
        let service = Arc::new(service);
        let user_id = UserId::new();

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .register_user(registered(user_id), &CorrelationId::generate())
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.read(|t| t.users.len()).await, 1);
        assert_eq!(store.outbox_records().await.len(), 1);
    }

    #[tokio::test]
    async fn block_emits_once_and_bumps_version() {
        let (store, service) = service();
        let user_id = UserId::new();
        let cid = CorrelationId::generate();
        service.register_user(registered(user_id), &cid).await.unwrap();

        let blocked = service.block(user_id, &cid).await.unwrap();
        service.block(user_id, &cid).await.unwrap();

        assert_eq!(blocked.status, UserStatus::Blocked);
        assert_eq!(blocked.version, Version::new(1));
        let events: Vec<_> = store
            .outbox_records()
            .await
            .into_iter()
            .map(|r| r.event_type)
            .collect();
        assert_eq!(events, vec![USER_CREATED.to_string(), USER_BLOCKED.to_string()]);
    }

    #[tokio::test]
    async fn block_retries_version_conflicts() {
        let (store, service) = service();
        let user_id = UserId::new();
        let cid = CorrelationId::generate();
        service.register_user(registered(user_id), &cid).await.unwrap();
        store
            .inject_commit_failures([LedgerError::conflict("user", user_id)])
            .await;

        let blocked = service.block(user_id, &cid).await.unwrap();

        assert_eq!(blocked.status, UserStatus::Blocked);
    }

    #[tokio::test]
    async fn block_surfaces_persistent_conflicts_as_transient() {
        let (store, service) = service();
        let user_id = UserId::new();
        let cid = CorrelationId::generate();
        service.register_user(registered(user_id), &cid).await.unwrap();
        store
            .inject_commit_failures((0..3).map(|_| LedgerError::conflict("user", user_id)))
            .await;

        let err = service.block(user_id, &cid).await.unwrap_err();

        assert!(err.is_concurrency_conflict());
        assert!(err.is_retryable());
        assert_eq!(service.get(user_id).await.unwrap().status, UserStatus::Active);
    }

    #[tokio::test]
    async fn get_by_email_ignores_case() {
        let (_store, service) = service();
        let user_id = UserId::new();
        service
            .register_user(registered(user_id), &CorrelationId::generate())
            .await
            .unwrap();

        assert_eq!(service.get_by_email(" MIKE@example.com").await.unwrap().id, user_id);
        assert_eq!(
            service.get_by_email("anna@example.com").await.unwrap_err(),
            LedgerError::UserEmailNotFound("anna@example.com".into())
        );
    }

    #[tokio::test]
    async fn update_username_validates_and_emits_nothing() {
        let (store, service) = service();
        let user_id = UserId::new();
        service
            .register_user(registered(user_id), &CorrelationId::generate())
            .await
            .unwrap();

        let renamed = service
            .update_username(user_id, UpdateUserRequest::new(" michael "))
            .await
            .unwrap();
        let err = service
            .update_username(user_id, UpdateUserRequest::new(""))
            .await
            .unwrap_err();

        assert_eq!(renamed.username, "michael");
        assert_eq!(renamed.version, Version::new(1));
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(service.get(user_id).await.unwrap().username, "michael");
        assert_eq!(store.outbox_records().await.len(), 1);
    }

    #[tokio::test]
    async fn update_username_retries_version_conflicts() {
        let (store, service) = service();
        let user_id = UserId::new();
        service
            .register_user(registered(user_id), &CorrelationId::generate())
            .await
            .unwrap();
        store
            .inject_commit_failures([LedgerError::conflict("user", user_id)])
            .await;

        let renamed = service
            .update_username(user_id, UpdateUserRequest::new("michael"))
            .await
            .unwrap();

        assert_eq!(renamed.username, "michael");
    }

    #[tokio::test]
    async fn deleted_users_are_hidden() {
        let (store, service) = service();
        let user_id = UserId::new();
        let cid = CorrelationId::generate();
        service.register_user(registered(user_id), &cid).await.unwrap();

        service.delete(user_id).await.unwrap();
        service.delete(user_id).await.unwrap();

        assert!(matches!(service.get(user_id).await, Err(LedgerError::UserNotFound(_))));
        assert!(matches!(
            service.get_by_email("mike@example.com").await,
            Err(LedgerError::UserEmailNotFound(_))
        ));
        assert!(matches!(
            service.update_username(user_id, UpdateUserRequest::new("anna")).await,
            Err(LedgerError::UserNotFound(_))
        ));
        let stored = store.read(|t| t.users[&user_id].clone()).await;
        assert!(stored.deleted);
        assert_eq!(stored.version, Version::new(1));

        service.register_user(registered(user_id), &cid).await.unwrap();
        assert_eq!(store.outbox_records().await.len(), 1);
    }

    #[tokio::test]
    async fn deleting_an_unknown_user_is_not_found() {
        let (_store, service) = service();
        let err = service.delete(UserId::new()).await.unwrap_err();
        assert!(matches!(err, LedgerError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let (_store, service) = service();
        let err = service.get(UserId::new()).await.unwrap_err();
        assert!(matches!(err, LedgerError::UserNotFound(_)));
    }
}
