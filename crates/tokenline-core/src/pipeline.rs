//! Authenticated request pipeline.
//!
//! Every business call passes two interception points:
//! - before send, the current access token is attached as a bearer token
//! - on a 401, the session is renewed through the `RenewalCoordinator` and
//!   the request is resent once with the new token
//!
//! A request is never resent twice. If the renewal fails the caller sees the
//! original authorization failure; the coordinator has already ended the session.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::api::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::{RenewalCoordinator, SessionStore};

pub struct RequestPipeline {
    store: Arc<SessionStore>,
    coordinator: Arc<RenewalCoordinator>,
    transport: Arc<dyn Transport>,
}

impl RequestPipeline {
    pub fn new(
        store: Arc<SessionStore>,
        coordinator: Arc<RenewalCoordinator>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            coordinator,
            transport,
        }
    }

    /// Send a request and return the response, or the `ApiError` matching a
    /// non-success status.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.intercept(request).await?.error_for_status()
    }

    /// Send a request and parse a successful JSON response
    pub async fn execute_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        self.execute(request).await?.json()
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.execute_json(ApiRequest::get(path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.execute_json(ApiRequest::post(path).with_json(body)?).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.execute_json(ApiRequest::put(path).with_json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(ApiRequest::delete(path)).await.map(|_| ())
    }

    async fn intercept(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let bearer = self.store.access_token();
        let response = self.transport.send(&request, bearer.as_deref()).await?;

        if !self.should_renew(&request, &response) {
            return Ok(response);
        }

        request.retried = true;
        debug!(path = %request.path, "Authorization failed, renewing before retry");

        match self.coordinator.renew_now().await {
            Ok(token) => {
                debug!(path = %request.path, "Retrying with renewed token");
                self.transport.send(&request, Some(&token)).await
            }
            Err(e) => {
                warn!(path = %request.path, error = %e, "Renewal failed, giving up on request");
                Ok(response)
            }
        }
    }

    fn should_renew(&self, request: &ApiRequest, response: &ApiResponse) -> bool {
        response.is_unauthorized() && !request.retried && self.store.refresh_token().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;
    use tokio::sync::broadcast;

    use super::*;
    use crate::auth::storage::MemoryStorage;
    use crate::testutil::{sample_session, FakeIdentity, FakeTransport, RefreshScript};

    struct Harness {
        store: Arc<SessionStore>,
        identity: Arc<FakeIdentity>,
        transport: Arc<FakeTransport>,
        pipeline: Arc<RequestPipeline>,
        failures: Arc<AtomicUsize>,
    }

    fn harness(identity: FakeIdentity, transport: FakeTransport) -> Harness {
        let store = Arc::new(SessionStore::new(Arc::new(MemoryStorage::new())));
        store.write(sample_session("A1", "R1"));
        let identity = Arc::new(identity);
        let transport = Arc::new(transport);
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        let (tx, _rx) = broadcast::channel(16);
        let coordinator = Arc::new(RenewalCoordinator::new(
            Arc::clone(&store),
            identity.clone(),
            tx,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        let pipeline = Arc::new(RequestPipeline::new(
            Arc::clone(&store),
            coordinator,
            transport.clone(),
        ));
        Harness {
            store,
            identity,
            transport,
            pipeline,
            failures,
        }
    }

    #[tokio::test]
    async fn test_attaches_current_access_token() {
        let h = harness(FakeIdentity::new(), FakeTransport::accepting(&["A1"]));

        let body: Value = h.pipeline.get("/tasks").await.expect("request");
        assert_eq!(body["token"], "A1");
        assert_eq!(h.identity.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_sends_unauthenticated_without_session() {
        let h = harness(FakeIdentity::new(), FakeTransport::accepting(&[]));
        h.store.clear();

        let body: Value = h.pipeline.get("/public/health").await.expect("request");
        assert_eq!(body["token"], Value::Null);
        assert_eq!(h.transport.sent(), vec![("/public/health".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_renews_and_retries_once_on_401() {
        let h = harness(FakeIdentity::new(), FakeTransport::accepting(&["A2"]));

        let body: Value = h.pipeline.get("/tasks").await.expect("retried request");
        assert_eq!(body["token"], "A2");
        assert_eq!(
            h.transport.sent(),
            vec![
                ("/tasks".to_string(), Some("A1".to_string())),
                ("/tasks".to_string(), Some("A2".to_string())),
            ]
        );
        assert_eq!(h.store.refresh_token().as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_retry_body_is_resent() {
        let h = harness(FakeIdentity::new(), FakeTransport::accepting(&["A2"]));

        let body: Value = h
            .pipeline
            .post("/tasks", &serde_json::json!({"title": "write report"}))
            .await
            .expect("retried request");
        assert_eq!(body["echo"]["title"], "write report");
    }

    #[tokio::test]
    async fn test_second_401_is_not_retried_again() {
        // the renewed token is rejected as well
        let h = harness(FakeIdentity::new(), FakeTransport::accepting(&[]));

        let result = h.pipeline.get::<Value>("/tasks").await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(h.transport.sent_count(), 2);
        assert_eq!(h.identity.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_already_retried_request_passes_through() {
        let h = harness(FakeIdentity::new(), FakeTransport::accepting(&[]));

        let mut request = ApiRequest::get("/tasks");
        request.retried = true;
        let result = h.pipeline.execute(request).await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(h.transport.sent_count(), 1);
        assert_eq!(h.identity.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_renewal_without_refresh_token() {
        let h = harness(FakeIdentity::new(), FakeTransport::accepting(&[]));
        let mut session = h.store.read();
        session.refresh_token = None;
        h.store.write(session);

        let result = h.pipeline.get::<Value>("/tasks").await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(h.identity.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_renewal_surfaces_original_401() {
        let h = harness(
            FakeIdentity::new().with_refresh(RefreshScript::Reject),
            FakeTransport::accepting(&[]),
        );

        let result = h.pipeline.get::<Value>("/tasks").await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(h.transport.sent_count(), 1);
        assert!(h.store.access_token().is_none());
    }

    #[tokio::test]
    async fn test_other_failures_pass_through() {
        let h = harness(FakeIdentity::new(), FakeTransport::accepting(&["A1"]));

        let result = h.pipeline.get::<Value>("/unreachable").await;
        assert!(matches!(result, Err(ApiError::ServerError(_))));
        assert_eq!(h.identity.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_renewal() {
        let h = harness(FakeIdentity::new(), FakeTransport::accepting(&["A2"]));

        let calls = (0..8).map(|i| {
            let pipeline = Arc::clone(&h.pipeline);
            async move { pipeline.get::<Value>(&format!("/tasks/{}", i)).await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(h.identity.refresh_calls(), 1);
        for result in results {
            assert_eq!(result.expect("retried request")["token"], "A2");
        }
        assert_eq!(h.transport.sent_count(), 16);
    }

    #[tokio::test]
    async fn test_concurrent_401s_fail_uniformly() {
        let h = harness(
            FakeIdentity::new().with_refresh(RefreshScript::Reject),
            FakeTransport::accepting(&[]),
        );

        let calls = (0..8).map(|_| {
            let pipeline = Arc::clone(&h.pipeline);
            async move { pipeline.get::<Value>("/tasks").await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(h.identity.refresh_calls(), 1);
        assert!(results.iter().all(|r| matches!(r, Err(ApiError::Unauthorized))));
        crate::testutil::settle().await;
        assert_eq!(h.failures.load(Ordering::SeqCst), 1);
    }
}
