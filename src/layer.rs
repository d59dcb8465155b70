//! Tower middleware that puts an [`AbuseGuard`] in front of a service.
//!
//! The layer runs the gate before the inner service and feeds inner failures back as
//! backend errors. Suspicious-input detection stays with the handler, which knows
//! which request fields are user-influenced.
//!
//! ```
//! use std::sync::Arc;
//! use tower::{service_fn, Layer, ServiceExt};
//! use tripwire::{AbuseGuard, GuardConfig, GuardLayer};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let guard: Arc<AbuseGuard> = Arc::new(AbuseGuard::new(GuardConfig::default()));
//! let layer = GuardLayer::new(guard, |req: &(String, u32)| req.0.clone());
//! let svc = layer.layer(service_fn(|(_, n): (String, u32)| async move {
//!     Ok::<_, std::io::Error>(n * 2)
//! }));
//!
//! let out = svc.oneshot(("10.0.0.1".to_string(), 21)).await.unwrap();
//! assert_eq!(out, 42);
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;

use crate::guard::{AbuseGuard, GuardKey};
use crate::telemetry::TelemetrySink;
use crate::GuardError;

/// A layer that gates requests through a shared [`AbuseGuard`]. `key_fn` maps a request
/// to the origin key it is accounted against.
pub struct GuardLayer<K, T, F> {
    guard: Arc<AbuseGuard<K, T>>,
    key_fn: F,
}

impl<K, T, F> GuardLayer<K, T, F> {
    /// Create a new guard layer.
    pub fn new(guard: Arc<AbuseGuard<K, T>>, key_fn: F) -> Self {
        Self { guard, key_fn }
    }
}

impl<K, T, F: Clone> Clone for GuardLayer<K, T, F> {
    fn clone(&self) -> Self {
        Self { guard: self.guard.clone(), key_fn: self.key_fn.clone() }
    }
}

impl<S, K, T, F> Layer<S> for GuardLayer<K, T, F>
where
    F: Clone,
{
    type Service = GuardService<S, K, T, F>;

    fn layer(&self, service: S) -> Self::Service {
        GuardService { inner: service, guard: self.guard.clone(), key_fn: self.key_fn.clone() }
    }
}

/// Middleware service produced by [`GuardLayer`].
pub struct GuardService<S, K, T, F> {
    inner: S,
    guard: Arc<AbuseGuard<K, T>>,
    key_fn: F,
}

impl<S: Clone, K, T, F: Clone> Clone for GuardService<S, K, T, F> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), guard: self.guard.clone(), key_fn: self.key_fn.clone() }
    }
}

impl<S, K, T, F, Req> Service<Req> for GuardService<S, K, T, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Display + Send + 'static,
    K: GuardKey + Sync,
    T: TelemetrySink + Sync,
    F: Fn(&Req) -> K,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        if let Some(retry_after) = self.guard.check(&key).retry_after {
            return Box::pin(async move { Err(GuardError::Blocked { retry_after }) });
        }

        // Swap so the instance driven by poll_ready is the one that is called.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let guard = self.guard.clone();

        Box::pin(async move {
            match inner.call(req).await {
                Ok(resp) => Ok(resp),
                Err(e) => {
                    guard.record_backend_error(key, &e.to_string());
                    Err(GuardError::Inner(e))
                }
            }
        })
    }
}
