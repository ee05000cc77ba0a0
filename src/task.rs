use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::accumulator::{LineObserver, TokenStreamAccumulator};
use crate::error::TaskError;
use crate::request::{GenerationRequest, GenerationResult};
use crate::transport::Transport;

/// One request bound to its batch position, ready to run on a transport.
///
/// A task never retries. A failed stream is reported to whoever executes it.
pub struct GenerationTask<'a> {
    index: usize,
    request: &'a GenerationRequest,
    observer: Option<&'a mut dyn LineObserver>,
    cancel: CancellationToken,
}

impl<'a> GenerationTask<'a> {
    pub fn new(index: usize, request: &'a GenerationRequest) -> Self {
        Self {
            index,
            request,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Stream visible fragments to `observer` while the task runs.
    pub fn observe(mut self, observer: &'a mut dyn LineObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Abort the task, closing its stream, once `cancel` fires.
    pub fn cancel_on(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Open a stream on `transport` and accumulate it into a result.
    pub async fn execute(self, transport: &dyn Transport) -> Result<GenerationResult, TaskError> {
        let Self {
            index,
            request,
            observer,
            cancel,
        } = self;

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskError::Cancelled),
            stream = transport.open_stream(request) => stream?,
        };
        debug!(index, "stream opened");

        let mut acc = TokenStreamAccumulator::new(request.stop_sequences().iter().cloned());
        if let Some(observer) = observer {
            acc = acc.observe(observer);
        }
        let done = acc.run_until_cancelled(stream, &cancel).await?;
        Ok(GenerationResult {
            index,
            text: done.text,
            finish_reason: done.finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::LineFlusher;
    use crate::error::StreamError;
    use crate::test_helpers::{FailingTransport, StaticTransport};

    #[tokio::test]
    async fn wraps_text_with_index() {
        let transport = StaticTransport::new("hello world");
        let req = GenerationRequest::new("hi");
        let res = GenerationTask::new(3, &req)
            .execute(&transport)
            .await
            .unwrap();
        assert_eq!(res.index, 3);
        assert_eq!(res.text, "hello world");
    }

    #[tokio::test]
    async fn streams_to_observer() {
        let transport = StaticTransport::new("one two");
        let req = GenerationRequest::new("hi");
        let mut flusher = LineFlusher::new(Vec::new());
        GenerationTask::new(0, &req)
            .observe(&mut flusher)
            .execute(&transport)
            .await
            .unwrap();
        assert_eq!(flusher.get_ref().as_slice(), b"one two\n");
    }

    #[tokio::test]
    async fn propagates_stream_error() {
        let req = GenerationRequest::new("hi");
        let err = GenerationTask::new(0, &req)
            .execute(&FailingTransport)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Stream(StreamError::Other(_))));
    }

    #[tokio::test]
    async fn cancelled_task_never_opens_a_stream() {
        let transport = StaticTransport::new("unused");
        let req = GenerationRequest::new("hi");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = GenerationTask::new(0, &req)
            .cancel_on(cancel)
            .execute(&transport)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(transport.calls(), 0);
    }
}
