//! [`Transport`] for text-generation-inference style servers.
//!
//! Requests go to `POST {base}/generate_stream`; the response is a
//! server-sent-event body with one JSON payload per `data:` line.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::StreamError;
use crate::request::{GenerationRequest, SamplingParams};
use crate::token::{FinishReason, TokenEvent, TokenEventStream};
use crate::transport::Transport;

#[derive(Serialize)]
struct GenerateBody<'a> {
    inputs: &'a str,
    parameters: Parameters<'a>,
}

#[derive(Serialize)]
struct Parameters<'a> {
    max_new_tokens: u32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    #[serde(flatten)]
    sampling: &'a SamplingParams,
}

#[derive(Deserialize)]
struct StreamChunk {
    token: Option<WireToken>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    details: Option<Details>,
}

#[derive(Deserialize)]
struct Details {
    finish_reason: String,
}

#[derive(Deserialize)]
struct WireToken {
    #[serde(default)]
    id: Option<u32>,
    text: String,
    #[serde(default)]
    logprob: Option<f32>,
    #[serde(default)]
    special: bool,
}

/// Reassembles SSE lines that may be split across network chunks.
#[derive(Default)]
pub(crate) struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Whatever is left once the body ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Parse one SSE line. Non-data lines, comments and keep-alives yield `None`.
pub(crate) fn parse_line(line: &str) -> Result<Option<TokenEvent>, StreamError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let chunk: StreamChunk = serde_json::from_str(data)?;
    if let Some(error) = chunk.error {
        let kind = chunk.error_type.unwrap_or_else(|| "generation".into());
        return Err(StreamError::Server(format!("{kind}: {error}")));
    }
    let finish = chunk
        .details
        .map(|details| FinishReason::from_wire(&details.finish_reason));
    Ok(chunk.token.map(|tok| TokenEvent {
        text: tok.text,
        special: tok.special,
        id: tok.id,
        logprob: tok.logprob,
        finish,
    }))
}

/// HTTP client for a single inference server.
#[derive(Clone, Debug)]
pub struct TgiTransport {
    client: reqwest::Client,
    base_url: String,
}

impl TgiTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Use a preconfigured [`reqwest::Client`] (timeouts, TLS, proxies).
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for TgiTransport {
    async fn open_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<TokenEventStream, StreamError> {
        let url = format!("{}/generate_stream", self.base_url.trim_end_matches('/'));
        let body = GenerateBody {
            inputs: request.prompt(),
            parameters: Parameters {
                max_new_tokens: request.max_new_tokens().get(),
                stop: request.stop_sequences(),
                sampling: request.sampling(),
            },
        };
        trace!(%url, prompt = %request.prompt(), "opening generation stream");
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes = resp.bytes_stream();
        let out = stream! {
            let mut lines = SseLineBuffer::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(error = %e, "stream read failed");
                        yield Err(StreamError::from(e));
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    trace!(%line, "sse line");
                    match parse_line(&line) {
                        Ok(Some(event)) => yield Ok(event),
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            if let Some(line) = lines.finish() {
                match parse_line(&line) {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => {}
                    Err(e) => yield Err(e),
                }
            }
        };
        Ok(Box::pin(out))
    }
}
