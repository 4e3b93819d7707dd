//! Correlation ids.
//!
//! A correlation id follows one logical operation across services: it arrives
//! with a request, is stored on every outbox row the operation writes, travels
//! as the [`CORRELATION_HEADER`] on the published message and is adopted by
//! the consumer that handles it.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Message/request header carrying the correlation id.
pub const CORRELATION_HEADER: &str = "X-Request-Id";

/// Opaque correlation id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for a request that arrived without one.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Id for a consumed message: the header value when present and
    /// non-blank, otherwise a synthesized `kafka-<uuid>`.
    #[must_use]
    pub fn from_message_header(header: Option<&str>) -> Self {
        match header.map(str::trim) {
            Some(value) if !value.is_empty() => Self(value.to_string()),
            _ => Self(format!("kafka-{}", Uuid::new_v4())),
        }
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
