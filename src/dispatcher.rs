//! Bounded fan-out of independent generation requests.
//!
//! The server accepts one request per connection but batches concurrently
//! open streams on its side, so throughput comes from keeping `max_workers`
//! streams open at once. Each worker claims the next unstarted request in
//! input order from a shared cursor and reports `(index, outcome)` to a
//! single collector, which owns one pre-sized slot per request.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::abort_guard::AbortGuard;
use crate::accumulator::LineObserver;
use crate::error::{BatchPartialFailure, DispatchError, StreamError, TaskError};
use crate::progress::{NoProgress, ProgressSink};
use crate::request::{GenerationRequest, GenerationResult};
use crate::task::GenerationTask;
use crate::transport::Transport;

/// What the dispatcher does when one request fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Record the failure in the request's slot and finish the rest.
    #[default]
    #[serde(rename = "continue", alias = "continue-on-error")]
    ContinueOnError,
    /// Cancel the batch at the first failure.
    FailFast,
}

/// Final state of one request slot.
#[derive(Debug)]
pub enum SlotOutcome {
    Completed(GenerationResult),
    Failed(StreamError),
    /// Was running when the batch was cancelled.
    Cancelled,
    /// Never handed to a worker.
    NotStarted,
}

impl SlotOutcome {
    pub fn result(&self) -> Option<&GenerationResult> {
        match self {
            SlotOutcome::Completed(res) => Some(res),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StreamError> {
        match self {
            SlotOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, SlotOutcome::Completed(_))
    }
}

/// Per-index outcome of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    slots: Vec<SlotOutcome>,
}

impl BatchOutcome {
    fn pending(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| SlotOutcome::NotStarted).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SlotOutcome> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[SlotOutcome] {
        &self.slots
    }

    pub fn into_slots(self) -> Vec<SlotOutcome> {
        self.slots
    }

    /// Completed results, in input order.
    pub fn completed(&self) -> impl Iterator<Item = &GenerationResult> {
        self.slots.iter().filter_map(SlotOutcome::result)
    }

    /// Indices whose stream failed.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.indices_where(|slot| matches!(slot, SlotOutcome::Failed(_)))
    }

    /// Indices that did not complete for any reason.
    pub fn incomplete_indices(&self) -> Vec<usize> {
        self.indices_where(|slot| !slot.is_completed())
    }

    pub fn is_partial_failure(&self) -> bool {
        self.slots.iter().any(|slot| !slot.is_completed())
    }

    /// All results, or the set of indices that are missing one.
    pub fn into_results(self) -> Result<Vec<GenerationResult>, BatchPartialFailure> {
        if self.is_partial_failure() {
            return Err(BatchPartialFailure {
                failed: self.incomplete_indices(),
                outcome: self,
            });
        }
        Ok(self
            .slots
            .into_iter()
            .filter_map(|slot| match slot {
                SlotOutcome::Completed(res) => Some(res),
                _ => None,
            })
            .collect())
    }

    fn indices_where(&self, pred: impl Fn(&SlotOutcome) -> bool) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| pred(slot))
            .map(|(i, _)| i)
            .collect()
    }
}

type Report = (usize, Result<GenerationResult, TaskError>);

/// Runs many [`GenerationTask`]s on a fixed-size worker pool.
///
/// # Examples
/// ```
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use futures::stream;
/// use genpool::{
///     BoundedDispatcher, GenerationRequest, StreamError, TokenEvent, TokenEventStream, Transport,
/// };
///
/// struct Echo;
///
/// #[async_trait]
/// impl Transport for Echo {
///     async fn open_stream(
///         &self,
///         req: &GenerationRequest,
///     ) -> Result<TokenEventStream, StreamError> {
///         let tok = TokenEvent::text(req.prompt().to_uppercase());
///         Ok(Box::pin(stream::once(async move { Ok(tok) })))
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let dispatcher = BoundedDispatcher::new(Arc::new(Echo), 4).unwrap();
/// let requests = ["a", "b", "c"].map(GenerationRequest::new).to_vec();
/// let results = dispatcher.dispatch(requests).await.unwrap().into_results().unwrap();
/// let texts: Vec<_> = results.iter().map(|r| r.text.as_str()).collect();
/// assert_eq!(texts, ["A", "B", "C"]);
/// # });
/// ```
#[derive(Clone)]
pub struct BoundedDispatcher {
    transport: Arc<dyn Transport>,
    max_workers: usize,
    policy: FailurePolicy,
}

impl BoundedDispatcher {
    /// Creates a dispatcher with `max_workers` concurrent slots. Zero workers
    /// is rejected.
    pub fn new(transport: Arc<dyn Transport>, max_workers: usize) -> Result<Self, DispatchError> {
        if max_workers == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_workers must be at least 1".into(),
            ));
        }
        Ok(Self {
            transport,
            max_workers,
            policy: FailurePolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Run a batch without progress reporting or external cancellation.
    pub async fn dispatch(
        &self,
        requests: Vec<GenerationRequest>,
    ) -> Result<BatchOutcome, DispatchError> {
        self.dispatch_with(requests, &NoProgress, CancellationToken::new())
            .await
    }

    /// Run a batch, reporting progress to `progress` and stopping early when
    /// `cancel` fires.
    ///
    /// On cancellation the outcome is returned normally: finished requests
    /// keep their results, running ones are marked
    /// [`Cancelled`](SlotOutcome::Cancelled) and the rest
    /// [`NotStarted`](SlotOutcome::NotStarted). Under
    /// [`FailurePolicy::FailFast`] the first failure cancels the batch and is
    /// returned as [`DispatchError::Aborted`].
    pub async fn dispatch_with(
        &self,
        requests: Vec<GenerationRequest>,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<BatchOutcome, DispatchError> {
        let total = requests.len();
        progress.start(total);
        if total == 0 {
            progress.finish();
            return Ok(BatchOutcome::default());
        }

        let requests: Arc<[GenerationRequest]> = requests.into();
        let cursor = Arc::new(AtomicUsize::new(0));
        let batch = cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<Report>();

        let workers = self.max_workers.min(total);
        debug!(total, workers, policy = ?self.policy, "dispatching batch");
        let _guards: Vec<AbortGuard<()>> = (0..workers)
            .map(|worker| {
                AbortGuard::new(tokio::spawn(run_worker(
                    worker,
                    self.transport.clone(),
                    requests.clone(),
                    cursor.clone(),
                    batch.clone(),
                    self.policy,
                    tx.clone(),
                )))
            })
            .collect();
        drop(tx);

        let mut outcome = BatchOutcome::pending(total);
        let mut done = 0usize;
        let mut first_failure = None;
        while let Some((index, report)) = rx.recv().await {
            outcome.slots[index] = match report {
                Ok(result) => SlotOutcome::Completed(result),
                Err(TaskError::Cancelled) => {
                    trace!(index, "request cancelled");
                    SlotOutcome::Cancelled
                }
                Err(TaskError::Stream(e)) => {
                    warn!(index, error = %e, "request failed");
                    if self.policy == FailurePolicy::FailFast && first_failure.is_none() {
                        first_failure = Some(index);
                    }
                    SlotOutcome::Failed(e)
                }
            };
            if !matches!(outcome.slots[index], SlotOutcome::Cancelled) {
                done += 1;
                progress.advance(done, total);
            }
        }
        progress.finish();

        match first_failure {
            Some(first_index) => {
                error!(first_index, completed = done, "batch aborted");
                Err(DispatchError::Aborted {
                    first_index,
                    outcome,
                })
            }
            None => {
                debug!(completed = done, total, "batch finished");
                Ok(outcome)
            }
        }
    }

    /// Single-request path: run `request` directly, optionally streaming it
    /// to `observer`, and surface its error to the caller.
    pub async fn dispatch_one(
        &self,
        request: &GenerationRequest,
        observer: Option<&mut dyn LineObserver>,
    ) -> Result<GenerationResult, TaskError> {
        let mut task = GenerationTask::new(0, request);
        if let Some(observer) = observer {
            task = task.observe(observer);
        }
        task.execute(self.transport.as_ref()).await
    }
}

async fn run_worker(
    worker: usize,
    transport: Arc<dyn Transport>,
    requests: Arc<[GenerationRequest]>,
    cursor: Arc<AtomicUsize>,
    cancel: CancellationToken,
    policy: FailurePolicy,
    tx: mpsc::UnboundedSender<Report>,
) {
    trace!(worker, "worker started");
    loop {
        let index = cursor.fetch_add(1, Ordering::SeqCst);
        let Some(request) = requests.get(index) else {
            break;
        };
        // a claim made after cancellation is dropped and its slot stays unstarted
        if cancel.is_cancelled() {
            trace!(worker, index, "cancelled before start");
            break;
        }
        trace!(worker, index, "claimed request");
        let task = GenerationTask::new(index, request).cancel_on(cancel.clone());
        let report = match AssertUnwindSafe(task.execute(transport.as_ref()))
            .catch_unwind()
            .await
        {
            Ok(report) => report,
            Err(_) => Err(StreamError::Other("generation task panicked".into()).into()),
        };
        // stop siblings from claiming more work before the report is collected
        if policy == FailurePolicy::FailFast && matches!(report, Err(TaskError::Stream(_))) {
            cancel.cancel();
        }
        if tx.send((index, report)).is_err() {
            break;
        }
    }
    trace!(worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::LineFlusher;
    use crate::test_helpers::{EchoTransport, FailingTransport, StaticTransport};

    #[test]
    fn zero_workers_is_rejected() {
        let res = BoundedDispatcher::new(Arc::new(EchoTransport), 0);
        assert!(matches!(res, Err(DispatchError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn empty_batch_never_touches_transport() {
        let transport = Arc::new(StaticTransport::new("x"));
        let dispatcher = BoundedDispatcher::new(transport.clone(), 4).unwrap();
        let outcome = dispatcher.dispatch(Vec::new()).await.unwrap();
        assert!(outcome.is_empty());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn results_follow_input_order() {
        let dispatcher = BoundedDispatcher::new(Arc::new(EchoTransport), 3).unwrap();
        let prompts: Vec<String> = (0..10).map(|i| format!("p{i}")).collect();
        let requests = prompts.iter().map(GenerationRequest::new).collect();
        let results = dispatcher
            .dispatch(requests)
            .await
            .unwrap()
            .into_results()
            .unwrap();
        for (i, res) in results.iter().enumerate() {
            assert_eq!(res.index, i);
            assert_eq!(res.text, prompts[i]);
        }
    }

    #[tokio::test]
    async fn failures_are_recorded_per_index() {
        let dispatcher = BoundedDispatcher::new(Arc::new(FailingTransport), 2).unwrap();
        let requests = vec![GenerationRequest::new("a"), GenerationRequest::new("b")];
        let outcome = dispatcher.dispatch(requests).await.unwrap();
        assert_eq!(outcome.failed_indices(), vec![0, 1]);
        let err = outcome.into_results().unwrap_err();
        assert_eq!(err.failed, vec![0, 1]);
        assert_eq!(err.to_string(), "2 of 2 requests did not complete");
    }

    #[tokio::test]
    async fn dispatch_one_returns_text() {
        let dispatcher = BoundedDispatcher::new(Arc::new(EchoTransport), 1).unwrap();
        let req = GenerationRequest::new("echo");
        let res = dispatcher.dispatch_one(&req, None).await.unwrap();
        assert_eq!(res.index, 0);
        assert_eq!(res.text, "echo");
    }

    #[tokio::test]
    async fn observer_may_outlive_the_request() {
        let dispatcher = BoundedDispatcher::new(Arc::new(EchoTransport), 1).unwrap();
        let mut flusher = LineFlusher::new(Vec::new());
        for prompt in ["one", "two"] {
            let req = GenerationRequest::new(prompt);
            dispatcher
                .dispatch_one(&req, Some(&mut flusher))
                .await
                .unwrap();
        }
        assert_eq!(flusher.get_ref().as_slice(), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn worker_drops_claims_made_after_cancellation() {
        let transport = Arc::new(StaticTransport::new("x"));
        let requests: Arc<[GenerationRequest]> = vec![GenerationRequest::new("a")].into();
        let cursor = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_worker(
            0,
            transport.clone(),
            requests,
            cursor.clone(),
            cancel,
            FailurePolicy::ContinueOnError,
            tx,
        )
        .await;
        assert!(rx.recv().await.is_none());
        assert_eq!(cursor.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn failure_policy_names() {
        #[derive(Deserialize)]
        struct Wrap {
            policy: FailurePolicy,
        }
        let w: Wrap = toml::from_str("policy = \"fail-fast\"").unwrap();
        assert_eq!(w.policy, FailurePolicy::FailFast);
        let w: Wrap = toml::from_str("policy = \"continue\"").unwrap();
        assert_eq!(w.policy, FailurePolicy::ContinueOnError);
    }
}
