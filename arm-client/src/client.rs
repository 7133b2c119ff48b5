// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The rate-limited, retry-aware resource client.

use crate::limiter::RateLimitPolicy;
use crate::limiter::RateLimiter;
use crate::transport::OperationHandle;
use crate::transport::ResourceTransport;
use crate::transport::TransportError;
use crate::transport::TransportResponse;
use chrono::DateTime;
use chrono::Utc;
use cirrus_common::api::Error;
use cirrus_common::api::ResourceType;
use cirrus_common::OpContext;
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::sync::Mutex;
use std::time::Duration;

/// Which token budget (and sticky throttle slot) a call consumes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallKind {
    Read,
    Write,
}

/// A decoded resource representation together with its concurrency token.
#[derive(Clone, Debug)]
pub struct Resource<R> {
    pub body: R,
    pub etag: Option<String>,
}

/// Resume delay applied to a throttling response that carried no hint.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Generic gate and classifier for every remote resource operation.
///
/// Each call is admitted through the token budget for its kind, checked
/// against the sticky retry-after timestamp for that kind (an endpoint that
/// throttled us gets no further pressure until its resume time), and its
/// response is classified into [`Error`] exactly once.  No operation retries
/// internally.
///
/// The client is shared read-only across concurrent callers; limiter and
/// throttle state update atomically underneath.
pub struct RateLimitedRetryClient<T> {
    log: Logger,
    transport: T,
    reader: RateLimiter,
    writer: RateLimiter,
    retry_after_read: Mutex<Option<DateTime<Utc>>>,
    retry_after_write: Mutex<Option<DateTime<Utc>>>,
}

impl<T: ResourceTransport> RateLimitedRetryClient<T> {
    pub fn new(
        log: &Logger,
        transport: T,
        reader: RateLimitPolicy,
        writer: RateLimitPolicy,
    ) -> RateLimitedRetryClient<T> {
        RateLimitedRetryClient {
            log: log.new(o!("component" => "arm-client")),
            transport,
            reader: RateLimiter::new(reader),
            writer: RateLimiter::new(writer),
            retry_after_read: Mutex::new(None),
            retry_after_write: Mutex::new(None),
        }
    }

    /// Fetch and decode one resource.
    pub async fn get<R: DeserializeOwned>(
        &self,
        opctx: &OpContext,
        resource_id: &str,
    ) -> Result<Resource<R>, Error> {
        self.admit(CallKind::Read)?;
        debug!(self.log, "resource get"; "resource_id" => resource_id);
        let response = opctx
            .run_until_deadline("get resource", async {
                self.transport.get(resource_id).await.map_err(Error::from)
            })
            .await?;
        let response = self.classify(CallKind::Read, resource_id, response)?;
        let etag = response.etag;
        let body = serde_json::from_value(response.body).map_err(|e| {
            Error::internal_error(&format!(
                "decoding resource {}: {}",
                resource_id, e
            ))
        })?;
        Ok(Resource { body, etag })
    }

    /// Fetch a resource collection, decoding each entry of the remote list
    /// envelope's `value` array.
    pub async fn list<R: DeserializeOwned>(
        &self,
        opctx: &OpContext,
        collection_id: &str,
    ) -> Result<Vec<R>, Error> {
        self.admit(CallKind::Read)?;
        debug!(self.log, "resource list"; "collection_id" => collection_id);
        let response = opctx
            .run_until_deadline("list resources", async {
                self.transport.list(collection_id).await.map_err(Error::from)
            })
            .await?;
        let mut response =
            self.classify(CallKind::Read, collection_id, response)?;
        let entries = match response.body.get_mut("value") {
            Some(value) => value.take(),
            None => serde_json::Value::Array(Vec::new()),
        };
        serde_json::from_value(entries).map_err(|e| {
            Error::internal_error(&format!(
                "decoding collection {}: {}",
                collection_id, e
            ))
        })
    }

    /// Create or update one resource.
    ///
    /// With `wait_for_completion`, blocks until a long-running operation
    /// accepted by the remote side reaches a terminal state; otherwise
    /// returns as soon as the request is accepted.
    pub async fn create_or_update<B: Serialize + Sync>(
        &self,
        opctx: &OpContext,
        resource_id: &str,
        body: &B,
        etag: Option<&str>,
        wait_for_completion: bool,
    ) -> Result<(), Error> {
        self.admit(CallKind::Write)?;
        debug!(
            self.log, "resource put";
            "resource_id" => resource_id,
            "wait_for_completion" => wait_for_completion,
        );
        let payload = serde_json::to_value(body).map_err(|e| {
            Error::internal_error(&format!(
                "encoding resource {}: {}",
                resource_id, e
            ))
        })?;
        let response = opctx
            .run_until_deadline("update resource", async {
                self.transport
                    .put(resource_id, payload, etag)
                    .await
                    .map_err(Error::from)
            })
            .await?;
        let response = self.classify(CallKind::Write, resource_id, response)?;

        if wait_for_completion {
            if let Some(operation) = response.operation {
                let terminal = opctx
                    .run_until_deadline("wait for operation", async {
                        self.transport
                            .wait_for_operation(&operation)
                            .await
                            .map_err(Error::from)
                    })
                    .await?;
                self.classify(CallKind::Write, resource_id, terminal)?;
            }
        }
        Ok(())
    }

    /// Delete one resource.  A resource that is already absent is success.
    pub async fn delete(
        &self,
        opctx: &OpContext,
        resource_id: &str,
    ) -> Result<(), Error> {
        self.admit(CallKind::Write)?;
        debug!(self.log, "resource delete"; "resource_id" => resource_id);
        let response = opctx
            .run_until_deadline("delete resource", async {
                self.transport.delete(resource_id).await.map_err(Error::from)
            })
            .await?;
        match self.classify(CallKind::Write, resource_id, response) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Admission gate: sticky throttle state first, then the token budget.
    /// Fails without any network call when either rejects.
    fn admit(&self, kind: CallKind) -> Result<(), Error> {
        if let Some(resume) = self.throttle_resume(kind) {
            if Utc::now() < resume {
                return Err(Error::throttled(resume));
            }
        }
        let limiter = match kind {
            CallKind::Read => &self.reader,
            CallKind::Write => &self.writer,
        };
        limiter.try_claim().map_err(|wait| {
            let wait = chrono::Duration::from_std(wait)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            Error::throttled(Utc::now() + wait)
        })
    }

    /// Classify a raw response into the taxonomy.  This is the single point
    /// where classification happens; the returned `Error` is never wrapped
    /// again on its way up.
    fn classify(
        &self,
        kind: CallKind,
        resource_id: &str,
        response: TransportResponse,
    ) -> Result<TransportResponse, Error> {
        let status = response.status;
        if status.is_success() {
            return Ok(response);
        }
        let error = match status {
            StatusCode::NOT_FOUND => {
                Error::not_found(ResourceType::Resource, resource_id)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = response.retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
                let resume = Utc::now()
                    + chrono::Duration::from_std(wait)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                self.note_throttled(kind, resume);
                Error::throttled(resume)
            }
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Error::conflict(&format!(
                    "remote model of {} changed: {}",
                    resource_id,
                    error_message(&response.body, status),
                ))
            }
            _ => Error::request_error(
                status,
                &error_message(&response.body, status),
            ),
        };
        warn!(
            self.log, "remote call failed";
            "resource_id" => resource_id,
            "status" => status.as_u16(),
            "error" => %error,
        );
        Err(error)
    }

    fn throttle_resume(&self, kind: CallKind) -> Option<DateTime<Utc>> {
        *self.retry_after_slot(kind).lock().unwrap()
    }

    /// Record a throttling resume time, keeping the latest one observed.
    fn note_throttled(&self, kind: CallKind, resume: DateTime<Utc>) {
        let mut slot = self.retry_after_slot(kind).lock().unwrap();
        match *slot {
            Some(existing) if existing >= resume => {}
            _ => *slot = Some(resume),
        }
    }

    fn retry_after_slot(
        &self,
        kind: CallKind,
    ) -> &Mutex<Option<DateTime<Utc>>> {
        match kind {
            CallKind::Read => &self.retry_after_read,
            CallKind::Write => &self.retry_after_write,
        }
    }
}

/// Best-effort extraction of the remote API's error message envelope.
fn error_message(body: &serde_json::Value, status: StatusCode) -> String {
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| {
            status.canonical_reason().unwrap_or("unknown error").to_owned()
        })
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        // No HTTP response was observed, so there is nothing to classify;
        // these indicate a local or connectivity problem.
        Error::internal_error(&e.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn opctx() -> OpContext {
        OpContext::new(&test_logger())
    }

    /// Transport returning canned responses in order, counting calls.
    #[derive(Default)]
    struct FakeTransport {
        responses: Mutex<VecDeque<TransportResponse>>,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn with_responses(
            responses: Vec<TransportResponse>,
        ) -> FakeTransport {
            FakeTransport {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses.lock().unwrap().pop_front().ok_or_else(|| {
                TransportError::Communication("no canned response".into())
            })
        }
    }

    #[async_trait]
    impl ResourceTransport for FakeTransport {
        async fn get(
            &self,
            _resource_id: &str,
        ) -> Result<TransportResponse, TransportError> {
            self.next()
        }

        async fn list(
            &self,
            _collection_id: &str,
        ) -> Result<TransportResponse, TransportError> {
            self.next()
        }

        async fn put(
            &self,
            _resource_id: &str,
            _body: serde_json::Value,
            _etag: Option<&str>,
        ) -> Result<TransportResponse, TransportError> {
            self.next()
        }

        async fn delete(
            &self,
            _resource_id: &str,
        ) -> Result<TransportResponse, TransportError> {
            self.next()
        }

        async fn wait_for_operation(
            &self,
            _operation: &OperationHandle,
        ) -> Result<TransportResponse, TransportError> {
            self.next()
        }
    }

    fn client_with(
        transport: FakeTransport,
    ) -> RateLimitedRetryClient<FakeTransport> {
        RateLimitedRetryClient::new(
            &test_logger(),
            transport,
            RateLimitPolicy::Always,
            RateLimitPolicy::Always,
        )
    }

    #[tokio::test]
    async fn test_get_decodes_resource() {
        let client = client_with(FakeTransport::with_responses(vec![
            TransportResponse {
                etag: Some("w/123".into()),
                ..TransportResponse::ok(json!({"name": "vm1"}))
            },
        ]));
        let resource: Resource<serde_json::Value> =
            client.get(&opctx(), "/vm/vm1").await.unwrap();
        assert_eq!(resource.body["name"], "vm1");
        assert_eq!(resource.etag.as_deref(), Some("w/123"));
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let client = client_with(FakeTransport::with_responses(vec![
            TransportResponse::status_only(StatusCode::NOT_FOUND),
        ]));
        let result: Result<Resource<serde_json::Value>, _> =
            client.get(&opctx(), "/vm/vm1").await;
        assert_matches!(result, Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_throttle_is_sticky_per_kind() {
        let client = client_with(FakeTransport::with_responses(vec![
            TransportResponse {
                retry_after: Some(Duration::from_secs(120)),
                ..TransportResponse::status_only(
                    StatusCode::TOO_MANY_REQUESTS,
                )
            },
            TransportResponse::ok(json!({})),
        ]));

        let result: Result<Resource<serde_json::Value>, _> =
            client.get(&opctx(), "/vm/vm1").await;
        let resume = match result {
            Err(Error::Throttled { retry_after }) => retry_after,
            other => panic!("expected Throttled, got {:?}", other),
        };
        assert!(resume > Utc::now());
        assert_eq!(client.transport.calls(), 1);

        // The reader is now fenced: no network call happens.
        let result: Result<Resource<serde_json::Value>, _> =
            client.get(&opctx(), "/vm/vm1").await;
        assert_matches!(result, Err(Error::Throttled { .. }));
        assert_eq!(client.transport.calls(), 1);

        // The writer budget is independent.
        client
            .create_or_update(&opctx(), "/vm/vm1", &json!({}), None, false)
            .await
            .unwrap();
        assert_eq!(client.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_never_limiter_fails_without_network() {
        let transport = FakeTransport::with_responses(vec![
            TransportResponse::ok(json!({})),
        ]);
        let client = RateLimitedRetryClient::new(
            &test_logger(),
            transport,
            RateLimitPolicy::Never,
            RateLimitPolicy::Always,
        );
        let result: Result<Resource<serde_json::Value>, _> =
            client.get(&opctx(), "/vm/vm1").await;
        assert_matches!(result, Err(Error::Throttled { .. }));
        assert_eq!(client.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_absent_is_success() {
        let client = client_with(FakeTransport::with_responses(vec![
            TransportResponse::status_only(StatusCode::NOT_FOUND),
        ]));
        client.delete(&opctx(), "/disk/gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_status_class_retriability() {
        let client = client_with(FakeTransport::with_responses(vec![
            TransportResponse::status_only(StatusCode::BAD_GATEWAY),
            TransportResponse::status_only(StatusCode::BAD_REQUEST),
        ]));
        let e = client
            .create_or_update(&opctx(), "/vm/vm1", &json!({}), None, false)
            .await
            .unwrap_err();
        assert_matches!(e, Error::RequestError { retriable: true, .. });

        let e = client
            .create_or_update(&opctx(), "/vm/vm1", &json!({}), None, false)
            .await
            .unwrap_err();
        assert_matches!(e, Error::RequestError { retriable: false, .. });
    }

    #[tokio::test]
    async fn test_conflict_classification() {
        let client = client_with(FakeTransport::with_responses(vec![
            TransportResponse::status_only(StatusCode::PRECONDITION_FAILED),
        ]));
        let e = client
            .create_or_update(
                &opctx(),
                "/vm/vm1",
                &json!({}),
                Some("w/stale"),
                false,
            )
            .await
            .unwrap_err();
        assert_matches!(e, Error::Conflict { .. });
    }

    #[tokio::test]
    async fn test_wait_for_completion_polls_operation() {
        let accepted = TransportResponse {
            status: StatusCode::ACCEPTED,
            operation: Some(OperationHandle("op-1".into())),
            ..TransportResponse::ok(serde_json::Value::Null)
        };
        let client = client_with(FakeTransport::with_responses(vec![
            accepted,
            TransportResponse::ok(json!({"status": "Succeeded"})),
        ]));
        client
            .create_or_update(&opctx(), "/vm/vm1", &json!({}), None, true)
            .await
            .unwrap();
        assert_eq!(client.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_list_decodes_envelope() {
        let client = client_with(FakeTransport::with_responses(vec![
            TransportResponse::ok(json!({
                "value": [{"name": "a"}, {"name": "b"}],
            })),
        ]));
        let entries: Vec<serde_json::Value> =
            client.list(&opctx(), "/vmss/agents/vms").await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
