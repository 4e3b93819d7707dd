//! HTTP client for the cards service.

use crate::config::ResolverConfig;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tally_core::directory::{CardDirectory, CardView, DirectoryFuture, RemoteError};
use tally_core::ids::{AccountId, CardId, UserId};
use tally_runtime::retry::{RetryPolicy, retry_with_predicate};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkAccountRequest {
    account_id: AccountId,
}

/// [`CardDirectory`] over the cards service REST API.
///
/// Each request has its own deadline. Connection failures are retried a
/// limited number of times; timeouts and HTTP errors are not.
#[derive(Clone)]
pub struct HttpCardDirectory {
    client: Client,
    base_url: String,
    attempts: usize,
}

impl HttpCardDirectory {
    /// Client for the configured cards service.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the HTTP client cannot be created.
    pub fn new(config: &ResolverConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.card_service_url.clone(),
            attempts: config.request_attempts,
        })
    }

    async fn send<F>(&self, request: F) -> Result<Response, RemoteError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let (client, request) = (&self.client, &request);
        retry_with_predicate(
            RetryPolicy::fixed(self.attempts, Duration::from_millis(200)),
            || async move {
                let response = request(client).send().await.map_err(transport_error)?;
                check_status(response).await
            },
            |err| matches!(err, RemoteError::Transport(_)),
        )
        .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.send(|client| client.get(&url)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Transport(format!("unreadable response from {url}: {e}")))
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(err.to_string())
    } else {
        RemoteError::Transport(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound),
        status => {
            let message = response.text().await.unwrap_or_default();
            Err(RemoteError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

impl CardDirectory for HttpCardDirectory {
    fn card(&self, id: CardId) -> DirectoryFuture<'_, CardView> {
        Box::pin(async move { self.get_json(&format!("/cards/{id}")).await })
    }

    fn cards_for_owner(&self, owner: UserId) -> DirectoryFuture<'_, Vec<CardView>> {
        Box::pin(async move { self.get_json(&format!("/cards/{owner}/user")).await })
    }

    fn link_account(&self, card: CardId, account: AccountId) -> DirectoryFuture<'_, ()> {
        Box::pin(async move {
            let url = format!("{}/cards/{card}/account", self.base_url);
            let body = LinkAccountRequest { account_id: account };
            self.send(|client| client.patch(&url).json(&body)).await?;
            Ok(())
        })
    }
}
