//! Consumer-facing load contract.
//!
//! Every non-streaming response carries four load headers derived
//! deterministically from the controller snapshot, plus `Retry-After` when
//! the recommendation is to come back later. The mapping lives in
//! [`LoadSnapshot::from_state`]; [`LoadHeadersLayer`] evaluates it once per
//! request for any `tower` stack.

use pin_project::pin_project;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

use crate::backpressure::{BackpressureController, BackpressureState, DegradationLevel};

pub const HEADER_LOAD_LEVEL: &str = "X-System-Load-Level";
pub const HEADER_LOAD_SCORE: &str = "X-System-Load-Score";
pub const HEADER_RECOMMENDED_ACTION: &str = "X-Recommended-Action";
pub const HEADER_SUGGESTED_RATE_LIMIT: &str = "X-Suggested-Rate-Limit";
pub const HEADER_SUGGESTED_BATCH_SIZE: &str = "X-Suggested-Batch-Size";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadLevel {
    Optimal,
    Busy,
    Stressed,
    Critical,
}

impl LoadLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadLevel::Optimal => "optimal",
            LoadLevel::Busy => "busy",
            LoadLevel::Stressed => "stressed",
            LoadLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Continue,
    SlowDown,
    ReduceLoad,
    TryLater,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::Continue => "continue",
            RecommendedAction::SlowDown => "slow_down",
            RecommendedAction::ReduceLoad => "reduce_load",
            RecommendedAction::TryLater => "try_later",
        }
    }
}

/// One evaluation of the header contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadSnapshot {
    pub level: LoadLevel,
    /// 0..=100; higher is better.
    pub score: u8,
    pub action: RecommendedAction,
    pub suggested_rate_limit: u32,
    pub suggested_batch_size: u32,
    pub retry_after: Option<Duration>,
}

impl LoadSnapshot {
    pub fn from_state(state: &BackpressureState) -> Self {
        let level = match state.level {
            DegradationLevel::None => LoadLevel::Optimal,
            DegradationLevel::Low => {
                if state.queue_depth < 500 {
                    LoadLevel::Optimal
                } else {
                    LoadLevel::Busy
                }
            }
            DegradationLevel::Medium => LoadLevel::Busy,
            DegradationLevel::High => LoadLevel::Stressed,
            DegradationLevel::Critical => LoadLevel::Critical,
        };

        let mean_headroom = if state.ratios.is_empty() {
            1.0
        } else {
            state.ratios.iter().map(|(_, r)| 1.0 - r).sum::<f64>() / state.ratios.len() as f64
        };
        let score = (mean_headroom * 100.0).round().clamp(0.0, 100.0) as u8;

        let action = match level {
            LoadLevel::Optimal => RecommendedAction::Continue,
            LoadLevel::Busy => RecommendedAction::SlowDown,
            LoadLevel::Stressed => RecommendedAction::ReduceLoad,
            LoadLevel::Critical => RecommendedAction::TryLater,
        };
        let (suggested_rate_limit, suggested_batch_size) = match level {
            LoadLevel::Optimal => (1_000, 100),
            LoadLevel::Busy => (500, 50),
            LoadLevel::Stressed => (100, 10),
            LoadLevel::Critical => (10, 1),
        };
        let retry_after = (action == RecommendedAction::TryLater)
            .then(|| Duration::from_secs(30));

        Self { level, score, action, suggested_rate_limit, suggested_batch_size, retry_after }
    }

    /// Header pairs in contract order; `Retry-After` present iff the action
    /// is `try_later`.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LOAD_LEVEL, self.level.as_str().to_string()),
            (HEADER_LOAD_SCORE, self.score.to_string()),
            (HEADER_RECOMMENDED_ACTION, self.action.as_str().to_string()),
            (HEADER_SUGGESTED_RATE_LIMIT, self.suggested_rate_limit.to_string()),
            (HEADER_SUGGESTED_BATCH_SIZE, self.suggested_batch_size.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push((HEADER_RETRY_AFTER, retry_after.as_secs().to_string()));
        }
        headers
    }
}

/// Where the layer reads the controller snapshot from.
pub trait LoadStateSource: Send + Sync {
    fn load_state(&self) -> Arc<BackpressureState>;
}

impl LoadStateSource for BackpressureController {
    fn load_state(&self) -> Arc<BackpressureState> {
        self.state()
    }
}

/// Requests that identify themselves as status/health traffic bypass the
/// critical-overload rejection.
pub trait LoadLabelled {
    fn is_status_endpoint(&self) -> bool {
        false
    }
}

/// Responses that can absorb the header contract.
pub trait LoadAware {
    fn apply_load(&mut self, snapshot: &LoadSnapshot);
}

/// Error of the wrapped service, or an overload rejection.
#[derive(Debug)]
pub enum LoadGateError<E> {
    Overloaded { retry_after: Duration },
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for LoadGateError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadGateError::Overloaded { retry_after } => {
                write!(f, "system critically overloaded, retry after {}s", retry_after.as_secs())
            }
            LoadGateError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for LoadGateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadGateError::Inner(e) => Some(e),
            LoadGateError::Overloaded { .. } => None,
        }
    }
}

/// Layer applying the header contract around any service.
#[derive(Clone)]
pub struct LoadHeadersLayer {
    source: Arc<dyn LoadStateSource>,
}

impl LoadHeadersLayer {
    pub fn new(source: Arc<dyn LoadStateSource>) -> Self {
        Self { source }
    }
}

impl<S> Layer<S> for LoadHeadersLayer {
    type Service = LoadHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadHeadersService { inner, source: self.source.clone() }
    }
}

pub struct LoadHeadersService<S> {
    inner: S,
    source: Arc<dyn LoadStateSource>,
}

impl<S: Clone> Clone for LoadHeadersService<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), source: self.source.clone() }
    }
}

impl<S, Req> Service<Req> for LoadHeadersService<S>
where
    S: Service<Req>,
    S::Response: LoadAware,
    Req: LoadLabelled,
{
    type Response = S::Response;
    type Error = LoadGateError<S::Error>;
    type Future = LoadHeadersFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LoadGateError::Inner)
    }

    fn call(&mut self, request: Req) -> Self::Future {
        // one snapshot read per request, before dispatch
        let snapshot = LoadSnapshot::from_state(&self.source.load_state());

        if snapshot.level == LoadLevel::Critical && !request.is_status_endpoint() {
            let retry_after = snapshot.retry_after.unwrap_or(Duration::from_secs(30));
            return LoadHeadersFuture {
                kind: FutureKind::Rejected { retry_after },
            };
        }
        LoadHeadersFuture {
            kind: FutureKind::Forward { future: self.inner.call(request), snapshot },
        }
    }
}

#[pin_project]
pub struct LoadHeadersFuture<F> {
    #[pin]
    kind: FutureKind<F>,
}

#[pin_project(project = FutureKindProj)]
enum FutureKind<F> {
    Rejected {
        retry_after: Duration,
    },
    Forward {
        #[pin]
        future: F,
        snapshot: LoadSnapshot,
    },
}

impl<F, R, E> Future for LoadHeadersFuture<F>
where
    F: Future<Output = Result<R, E>>,
    R: LoadAware,
{
    type Output = Result<R, LoadGateError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().kind.project() {
            FutureKindProj::Rejected { retry_after } => {
                Poll::Ready(Err(LoadGateError::Overloaded { retry_after: *retry_after }))
            }
            FutureKindProj::Forward { future, snapshot } => match future.poll(cx) {
                Poll::Ready(Ok(mut response)) => {
                    response.apply_load(snapshot);
                    Poll::Ready(Ok(response))
                }
                Poll::Ready(Err(e)) => Poll::Ready(Err(LoadGateError::Inner(e))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
