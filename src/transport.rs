use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StreamError;
use crate::request::GenerationRequest;
use crate::token::TokenEventStream;

/// Connection to a remote text-generation server.
///
/// Implementations must stream tokens incrementally. Each call is an
/// independent request; the dispatcher relies on servers batching
/// concurrently open streams on their side.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a token stream for `request`.
    ///
    /// The stream ends when the server recognizes a stop sequence, the
    /// token budget is exhausted or the connection closes.
    async fn open_stream(&self, request: &GenerationRequest)
    -> Result<TokenEventStream, StreamError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn open_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<TokenEventStream, StreamError> {
        (**self).open_stream(request).await
    }
}
