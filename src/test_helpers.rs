use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream;

use crate::error::StreamError;
use crate::request::GenerationRequest;
use crate::token::{TokenEvent, TokenEventStream};
use crate::transport::Transport;

/// [`Transport`] that returns a fixed reply, one token per word with its
/// trailing space.
#[derive(Default)]
pub struct StaticTransport {
    pub reply: String,
    calls: AtomicUsize,
}

impl StaticTransport {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StaticTransport {
    async fn open_stream(
        &self,
        _request: &GenerationRequest,
    ) -> Result<TokenEventStream, StreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let words: Vec<Result<TokenEvent, StreamError>> = self
            .reply
            .split_inclusive(' ')
            .map(|w| Ok(TokenEvent::text(w)))
            .collect();
        Ok(Box::pin(stream::iter(words)))
    }
}

/// [`Transport`] whose streams can never be opened.
pub struct FailingTransport;

#[async_trait]
impl Transport for FailingTransport {
    async fn open_stream(
        &self,
        _request: &GenerationRequest,
    ) -> Result<TokenEventStream, StreamError> {
        Err(StreamError::Other("fail".into()))
    }
}

/// [`Transport`] echoing the prompt back followed by an end-of-sequence token.
pub struct EchoTransport;

#[async_trait]
impl Transport for EchoTransport {
    async fn open_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<TokenEventStream, StreamError> {
        let events = vec![
            Ok(TokenEvent::text(request.prompt().to_string())),
            Ok(TokenEvent::special("</s>")),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}
