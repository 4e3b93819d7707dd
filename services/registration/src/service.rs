//! Registration commands.

use crate::domain::{Credentials, RegisterRequest};
use crate::events::{AGGREGATE_TYPE, USER_REGISTERED, UserRegistered};
use crate::store::{CREDENTIALS_EMAIL_KEY, RegistrationStore, RegistrationWrite};
use std::sync::Arc;
use tally_core::correlation::CorrelationId;
use tally_core::environment::Clock;
use tally_core::error::LedgerError;
use tally_core::idempotency::{Claim, IdempotencyKey, guard};
use tally_core::ids::UserId;
use tally_core::outbox::{Commit, OutboxRecord};

/// Registration command handler.
pub struct RegistrationService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: RegistrationStore> RegistrationService<S> {
    /// Build on a store and a clock.
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Register a new user.
    ///
    /// With an idempotency key, a repeat of the same request returns the
    /// credentials created the first time.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] for bad fields
    /// - [`LedgerError::UserAlreadyExists`] when the email is taken
    /// - [`LedgerError::IdempotencyConflict`] when the key was used for
    ///   a different request
    pub async fn register(
        &self,
        request: RegisterRequest,
        key: Option<&IdempotencyKey>,
        correlation: &CorrelationId,
    ) -> Result<Credentials, LedgerError> {
        let request = request.normalized()?;
        guard(
            self.store.as_ref(),
            key,
            &request,
            USER_REGISTERED,
            |claim| self.create(&request, claim, correlation),
            |id| self.credentials(UserId::from_uuid(id)),
        )
        .await
    }

    async fn create(
        &self,
        request: &RegisterRequest,
        claim: Option<Claim>,
        correlation: &CorrelationId,
    ) -> Result<Credentials, LedgerError> {
        if self
            .store
            .credentials_by_email(request.email.clone())
            .await?
            .is_some()
        {
            return Err(LedgerError::UserAlreadyExists(request.email.clone()));
        }

        let now = self.clock.now();
        let credentials = Credentials {
            user_id: UserId::new(),
            username: request.username.clone(),
            email: request.email.clone(),
            blocked: false,
            created_at: now,
        };
        let event = UserRegistered {
            user_id: credentials.user_id,
            username: credentials.username.clone(),
            email: credentials.email.clone(),
        };
        let commit = Commit::new()
            .write(RegistrationWrite::Insert(credentials.clone()))
            .idempotency(claim.map(|c| c.record(credentials.user_id, now)))
            .event(OutboxRecord::for_event(AGGREGATE_TYPE, &event, Some(correlation), now)?);

        match self.store.commit(commit).await {
            Err(err) if err.is_unique_violation_on(CREDENTIALS_EMAIL_KEY) => {
                return Err(LedgerError::UserAlreadyExists(request.email.clone()));
            }
            result => result?,
        }

        tracing::info!(user_id = %credentials.user_id, "User registered");
        Ok(credentials)
    }

    /// Credentials of one user.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UserNotFound`] if there are none.
    pub async fn credentials(&self, user_id: UserId) -> Result<Credentials, LedgerError> {
        self.store
            .credentials(user_id)
            .await?
            .ok_or(LedgerError::UserNotFound(user_id))
    }

    /// Mark a user blocked. Unknown or already blocked users are left alone.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the update fails.
    pub async fn block_user(&self, user_id: UserId) -> Result<(), LedgerError> {
        let Some(credentials) = self.store.credentials(user_id).await? else {
            tracing::info!(%user_id, "No credentials to block");
            return Ok(());
        };
        if credentials.blocked {
            tracing::debug!(%user_id, "Credentials already blocked");
            return Ok(());
        }

        self.store
            .commit(Commit::new().write(RegistrationWrite::Block(user_id)))
            .await?;
        tracing::info!(%user_id, "Credentials blocked");
        Ok(())
    }
}
