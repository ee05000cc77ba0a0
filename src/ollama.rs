use async_trait::async_trait;
use ollama_rs::{
    Ollama,
    generation::chat::{ChatMessage, ChatMessageResponseStream, request::ChatMessageRequest},
    models::ModelOptions,
};
use tokio_stream::StreamExt;

use crate::error::StreamError;
use crate::request::GenerationRequest;
use crate::token::{FinishReason, TokenEvent, TokenEventStream};
use crate::transport::Transport;

/// Ollama takes an `i32` seed; larger seeds are clamped.
fn seed_option(seed: u64) -> i32 {
    i32::try_from(seed).unwrap_or_else(|_| {
        tracing::warn!(seed, "seed out of range for ollama, clamping");
        i32::MAX
    })
}

/// Build a chat request carrying the prompt as a single user turn.
fn build_request(model: &str, request: &GenerationRequest) -> ChatMessageRequest {
    let sampling = request.sampling();
    let budget = i32::try_from(request.max_new_tokens().get()).unwrap_or(i32::MAX);
    let mut options = ModelOptions::default().num_predict(budget);
    if !request.stop_sequences().is_empty() {
        options = options.stop(request.stop_sequences().to_vec());
    }
    if let Some(t) = sampling.temperature {
        options = options.temperature(t);
    }
    if let Some(p) = sampling.top_p {
        options = options.top_p(p);
    }
    if let Some(k) = sampling.top_k {
        options = options.top_k(k);
    }
    if let Some(penalty) = sampling.repetition_penalty {
        options = options.repeat_penalty(penalty);
    }
    if let Some(seed) = sampling.seed {
        options = options.seed(seed_option(seed));
    }
    tracing::trace!(%model, budget, "ollama request");
    ChatMessageRequest::new(
        model.to_string(),
        vec![ChatMessage::user(request.prompt().to_string())],
    )
    .options(options)
}

/// Map an Ollama response stream into a [`TokenEventStream`].
///
/// Ollama leaves the stop word out of the text, so the final `done` chunk is
/// tagged with a finish reason: `Length` when the reported token count reached
/// `budget`, a plain `Stop` otherwise.
fn map_stream(stream: ChatMessageResponseStream, budget: u32) -> TokenEventStream {
    let mapped = stream.map(move |res| match res {
        Ok(resp) => {
            let event = TokenEvent::text(resp.message.content);
            if !resp.done {
                return Ok(event);
            }
            let generated = resp.final_data.map(|data| data.eval_count);
            let reason = match generated {
                Some(count) if count >= u64::from(budget) => FinishReason::Length,
                _ => FinishReason::Stop,
            };
            tracing::trace!(?generated, ?reason, "ollama stream done");
            Ok(event.with_finish(reason))
        }
        Err(e) => {
            tracing::error!(?e, "ollama stream error");
            Err(StreamError::Other(format!("ollama stream error: {e:?}")))
        }
    });
    Box::pin(mapped)
}

/// [`Transport`] backed by an [`Ollama`] server.
///
/// Ollama has no notion of special tokens, so every event is visible text.
#[derive(Clone)]
pub struct OllamaTransport {
    client: Ollama,
    model: String,
}

impl OllamaTransport {
    pub fn new(client: Ollama, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Returns the configured model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Transport for OllamaTransport {
    async fn open_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<TokenEventStream, StreamError> {
        let req = build_request(&self.model, request);
        let stream = self
            .client
            .send_chat_messages_stream(req)
            .await
            .map_err(|e| StreamError::Other(e.to_string()))?;
        Ok(map_stream(stream, request.max_new_tokens().get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::TokenStreamAccumulator;
    use httpmock::prelude::*;
    use reqwest::Client;
    use url::Url;

    #[tokio::test]
    async fn yields_all_tokens() {
        let server = MockServer::start_async().await;
        let body = concat!(
            "{\"model\":\"m\",\"created_at\":\"n\",\"message\":{\"role\":\"assistant\",\"content\":\"he\"},\"done\":false}\n",
            "{\"model\":\"m\",\"created_at\":\"n\",\"message\":{\"role\":\"assistant\",\"content\":\"llo\"},\"done\":true}"
        );
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).body(body);
            })
            .await;

        let http = Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .unwrap();
        let url = Url::parse(&server.base_url()).unwrap();
        let host = format!("{}://{}", url.scheme(), url.host_str().unwrap());
        let port = url.port_or_known_default().unwrap();
        let client = Ollama::new_with_client(host, port, http);
        let transport = OllamaTransport::new(client, "m");
        let stream = transport
            .open_stream(&GenerationRequest::new("hi"))
            .await
            .unwrap();
        let text = TokenStreamAccumulator::new(Vec::<String>::new())
            .run(stream)
            .await
            .unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn oversized_seed_is_clamped() {
        assert_eq!(seed_option(7), 7);
        assert_eq!(seed_option(u64::MAX), i32::MAX);
        assert_eq!(seed_option(u64::from(u32::MAX)), i32::MAX);
    }

    #[tokio::test]
    async fn done_chunk_at_budget_is_a_length_stop() {
        let server = MockServer::start_async().await;
        let body = concat!(
            "{\"model\":\"m\",\"created_at\":\"n\",\"message\":{\"role\":\"assistant\",\"content\":\"a b\"},\"done\":false}\n",
            "{\"model\":\"m\",\"created_at\":\"n\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,",
            "\"done_reason\":\"length\",\"total_duration\":1,\"load_duration\":1,\"prompt_eval_count\":1,",
            "\"prompt_eval_duration\":1,\"eval_count\":2,\"eval_duration\":1}"
        );
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).body(body);
            })
            .await;

        let url = Url::parse(&server.base_url()).unwrap();
        let host = format!("{}://{}", url.scheme(), url.host_str().unwrap());
        let client = Ollama::new_with_client(host, url.port().unwrap(), Client::new());
        let request = GenerationRequest::new("hi")
            .with_max_new_tokens(std::num::NonZeroU32::new(2).unwrap());
        let stream = OllamaTransport::new(client, "m")
            .open_stream(&request)
            .await
            .unwrap();
        let events: Vec<_> = stream.collect().await;
        let last = events.last().unwrap().as_ref().unwrap();
        assert_eq!(last.finish, Some(FinishReason::Length));
        assert!(events[0].as_ref().unwrap().finish.is_none());
    }
}
