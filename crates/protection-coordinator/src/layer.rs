//! Tower middleware that runs every request through a
//! [`ProtectionCoordinator`] before it reaches the wrapped service.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tower_layer::Layer;
use tower_service::Service;

use crate::{ProtectionCoordinator, RequestContext, ResponseOutcome};
use protection_core::ProtectionError;

/// Extracts a [`RequestContext`] from a framework's request type.
///
/// Implement this for whatever request type the wrapped service expects
/// (an `axum`/`http` request, a test harness's own struct, ...).
pub trait RequestContextSource {
    fn protection_context(&self) -> RequestContext;
}

/// Extracts the HTTP status code a response carries, so the coordinator
/// can feed it back into the behavioral, reputation and circuit-breaker
/// components after the inner service runs.
pub trait ResponseStatusSource {
    fn protection_status_code(&self) -> u16;
}

/// Error returned by [`ProtectionService`]: either the coordinator denied
/// the request before it reached the inner service, or the inner service
/// itself failed.
#[derive(Debug)]
pub enum ProtectionServiceError<E> {
    Denied(ProtectionError),
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ProtectionServiceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied(err) => write!(f, "request denied: {err}"),
            Self::Inner(err) => write!(f, "inner service error: {err}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ProtectionServiceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Denied(err) => Some(err),
            Self::Inner(err) => Some(err),
        }
    }
}

/// A Tower layer that wraps a service with a shared [`ProtectionCoordinator`].
///
/// # Example
///
/// ```rust,no_run
/// use protection_coordinator::{ProtectionCoordinator, ProtectionLayer};
/// use protection_core::settings::ProtectionSettings;
/// use std::sync::Arc;
///
/// let coordinator = Arc::new(ProtectionCoordinator::new(ProtectionSettings::default()));
/// let layer = ProtectionLayer::new(coordinator);
/// ```
#[derive(Clone)]
pub struct ProtectionLayer {
    coordinator: Arc<ProtectionCoordinator>,
}

impl ProtectionLayer {
    pub fn new(coordinator: Arc<ProtectionCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl<S> Layer<S> for ProtectionLayer {
    type Service = ProtectionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ProtectionService {
            inner: service,
            coordinator: self.coordinator.clone(),
        }
    }
}

/// Service produced by [`ProtectionLayer`]. Evaluates each request against
/// the coordinator, forwards admitted requests to the inner service, and
/// reports the outcome back once the inner service completes.
#[derive(Clone)]
pub struct ProtectionService<S> {
    inner: S,
    coordinator: Arc<ProtectionCoordinator>,
}

impl<S> ProtectionService<S> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, Req> Service<Req> for ProtectionService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: ResponseStatusSource + Send + 'static,
    S::Error: Send + 'static,
    Req: RequestContextSource + Send + 'static,
{
    type Response = S::Response;
    type Error = ProtectionServiceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ProtectionServiceError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let mut inner = self.inner.clone();
        let coordinator = self.coordinator.clone();
        let ctx = req.protection_context();

        Box::pin(async move {
            // `before_request` already admits fail-open on an internal
            // error (spec.md §7), so any `Err` reaching here is a
            // deliberate denial.
            let decision = coordinator
                .before_request(ctx.clone())
                .await
                .map_err(ProtectionServiceError::Denied)?;

            let start = Instant::now();
            let response = inner.call(req).await.map_err(ProtectionServiceError::Inner)?;
            let outcome = ResponseOutcome {
                status_code: response.protection_status_code(),
                duration: start.elapsed(),
            };
            coordinator.after_response(&ctx, &decision, outcome).await;

            Ok(response)
        })
    }
}
