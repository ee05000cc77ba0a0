use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;

use crate::error::StreamError;
use crate::request::GenerationRequest;
use crate::token::TokenEventStream;
use crate::transport::Transport;

/// Round-robin pool of [`Transport`]s, typically one per server replica.
///
/// Each stream is opened on the next transport in the pool. If opening fails
/// the following transports are tried in order; the last error is returned
/// only if all of them fail. A stream that fails after it was opened is not
/// moved to another replica.
///
/// # Examples
/// ```
/// use std::sync::Arc;
/// use genpool::{RoundRobinTransport, TgiTransport, Transport};
///
/// let pool = RoundRobinTransport::new(vec![
///     Arc::new(TgiTransport::new("http://gpu-a:8080")) as Arc<dyn Transport>,
///     Arc::new(TgiTransport::new("http://gpu-b:8080")),
/// ]);
/// assert_eq!(pool.len(), 2);
/// ```
#[derive(Clone)]
pub struct RoundRobinTransport {
    transports: Vec<Arc<dyn Transport>>,
    next: Arc<AtomicUsize>,
}

impl RoundRobinTransport {
    /// Creates a new pool. Panics if `transports` is empty.
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        assert!(!transports.is_empty(), "transport pool cannot be empty");
        Self {
            transports,
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    fn pick(&self) -> Arc<dyn Transport> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        self.transports[idx % self.transports.len()].clone()
    }
}

#[async_trait]
impl Transport for RoundRobinTransport {
    async fn open_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<TokenEventStream, StreamError> {
        let mut last = None;
        for _ in 0..self.transports.len() {
            match self.pick().open_stream(request).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::warn!(error = %e, "transport failed, trying next");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| StreamError::Other("all transports failed".into())))
    }
}
