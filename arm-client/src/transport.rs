// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The wire-level transport seam.
//!
//! TLS, connection pooling, and credential handling live behind
//! [`ResourceTransport`]; this crate only sees raw responses.  Production
//! wires a real HTTP client in here, tests wire an in-memory fake.

use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// Handle for a long-running remote operation accepted by a `put`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperationHandle(pub String);

/// A raw response from the remote resource API, prior to classification.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
    /// Concurrency token of the resource representation, when the remote
    /// side supplied one.
    pub etag: Option<String>,
    /// Resume hint accompanying a throttling response.
    pub retry_after: Option<Duration>,
    /// Present when the remote side accepted the request as a long-running
    /// operation rather than completing it inline.
    pub operation: Option<OperationHandle>,
}

impl TransportResponse {
    /// A minimal successful response carrying `body`.
    pub fn ok(body: serde_json::Value) -> TransportResponse {
        TransportResponse {
            status: StatusCode::OK,
            body,
            etag: None,
            retry_after: None,
            operation: None,
        }
    }

    /// A response with the given status and no body.
    pub fn status_only(status: StatusCode) -> TransportResponse {
        TransportResponse {
            status,
            body: serde_json::Value::Null,
            etag: None,
            retry_after: None,
            operation: None,
        }
    }
}

/// An error raised before any HTTP response was observed: connection
/// failures, local encoding problems, and the like.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("communication error: {0}")]
    Communication(String),

    #[error("request could not be constructed: {0}")]
    InvalidRequest(String),
}

/// Raw operations against the remote resource API.
///
/// One method per verb the control plane uses.  Implementations perform no
/// classification and no rate limiting; both belong to
/// [`crate::RateLimitedRetryClient`].
#[async_trait]
pub trait ResourceTransport: Send + Sync {
    /// `GET /resource/{id}`.
    async fn get(
        &self,
        resource_id: &str,
    ) -> Result<TransportResponse, TransportError>;

    /// `GET` on a resource collection; the body carries a `value` array in
    /// the remote API's list envelope.
    async fn list(
        &self,
        collection_id: &str,
    ) -> Result<TransportResponse, TransportError>;

    /// `PUT /resource/{id}`, with an optional `If-Match` concurrency token.
    async fn put(
        &self,
        resource_id: &str,
        body: serde_json::Value,
        etag: Option<&str>,
    ) -> Result<TransportResponse, TransportError>;

    /// `DELETE /resource/{id}`.
    async fn delete(
        &self,
        resource_id: &str,
    ) -> Result<TransportResponse, TransportError>;

    /// Poll the given long-running operation until it reaches a terminal
    /// state, returning the terminal response.
    async fn wait_for_operation(
        &self,
        operation: &OperationHandle,
    ) -> Result<TransportResponse, TransportError>;
}

/// A shared transport is itself a transport: every call forwards to the
/// inner value.  This lets a single transport be handed to a client while a
/// caller retains a handle to it.
#[async_trait]
impl<T: ResourceTransport + ?Sized> ResourceTransport for Arc<T> {
    async fn get(
        &self,
        resource_id: &str,
    ) -> Result<TransportResponse, TransportError> {
        (**self).get(resource_id).await
    }

    async fn list(
        &self,
        collection_id: &str,
    ) -> Result<TransportResponse, TransportError> {
        (**self).list(collection_id).await
    }

    async fn put(
        &self,
        resource_id: &str,
        body: serde_json::Value,
        etag: Option<&str>,
    ) -> Result<TransportResponse, TransportError> {
        (**self).put(resource_id, body, etag).await
    }

    async fn delete(
        &self,
        resource_id: &str,
    ) -> Result<TransportResponse, TransportError> {
        (**self).delete(resource_id).await
    }

    async fn wait_for_operation(
        &self,
        operation: &OperationHandle,
    ) -> Result<TransportResponse, TransportError> {
        (**self).wait_for_operation(operation).await
    }
}
