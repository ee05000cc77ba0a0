//! Caller-owned chat transcript built on the single-request path.

use std::num::NonZeroU32;

use tracing::{debug, warn};

use crate::accumulator::LineObserver;
use crate::dispatcher::BoundedDispatcher;
use crate::error::TaskError;
use crate::request::{GenerationRequest, SamplingParams};

/// Markers that end an assistant turn.
pub const DEFAULT_STOP_SEQUENCES: [&str; 2] = ["Human:", "-----"];

const TURN_DELIMITER: &str = "\n-----\n";

/// Split a trailing stop sequence off `text`.
///
/// Returns the text without the marker and the marker that matched, checked
/// in the order given. `None` means the text ends in no stop sequence.
///
/// ```
/// let (text, stop) = genpool::strip_stop_suffix("hello Human:", &["Human:", "-----"]);
/// assert_eq!(text, "hello ");
/// assert_eq!(stop, Some("Human:"));
/// ```
pub fn strip_stop_suffix<'t, 's, S>(text: &'t str, stops: &'s [S]) -> (&'t str, Option<&'s str>)
where
    S: AsRef<str>,
{
    for stop in stops {
        let stop = stop.as_ref();
        if stop.is_empty() {
            continue;
        }
        if let Some(stripped) = text.strip_suffix(stop) {
            return (stripped, Some(stop));
        }
    }
    (text, None)
}

/// Assistant reply for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    /// Reply with any trailing stop marker removed.
    pub text: String,
    /// The turn did not end normally: the model ran out of budget or the
    /// reply ended in no stop marker and the server gave no finish reason.
    pub stopped_early: bool,
}

/// A conversation transcript owned by the caller.
///
/// The transcript only changes when [`send`](ChatSession::send) succeeds, so
/// a failed turn leaves the session as it was.
#[derive(Debug, Clone)]
pub struct ChatSession {
    state: String,
    stop_sequences: Vec<String>,
    max_new_tokens: NonZeroU32,
    sampling: SamplingParams,
}

impl ChatSession {
    /// Start a session from a preamble (persona or system prompt).
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            state: preamble.into(),
            stop_sequences: DEFAULT_STOP_SEQUENCES.map(String::from).to_vec(),
            max_new_tokens: crate::request::DEFAULT_MAX_NEW_TOKENS,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_stop_sequences<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences = stops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: NonZeroU32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Full transcript so far.
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn into_state(self) -> String {
        self.state
    }

    /// Prompt for the next turn without committing it.
    fn next_prompt(&self, message: &str) -> String {
        format!(
            "{}{TURN_DELIMITER}Human: {}\n\nAssistant:",
            self.state,
            message.trim()
        )
    }

    /// Send one user message and append the assistant's reply.
    pub async fn send(
        &mut self,
        dispatcher: &BoundedDispatcher,
        message: &str,
        observer: Option<&mut dyn LineObserver>,
    ) -> Result<ChatReply, TaskError> {
        let prompt = self.next_prompt(message);
        let request = GenerationRequest::new(prompt)
            .with_max_new_tokens(self.max_new_tokens)
            .with_stop_sequences(self.stop_sequences.iter().cloned())
            .with_sampling(self.sampling.clone());
        let result = dispatcher.dispatch_one(&request, observer).await?;

        let (text, stop) = strip_stop_suffix(&result.text, &self.stop_sequences);
        // servers that swallow the stop word still say why they stopped
        let stopped_early = match (stop, result.finish_reason) {
            (Some(_), _) => false,
            (None, Some(reason)) => reason.is_truncation(),
            (None, None) => true,
        };
        if stopped_early {
            warn!(
                len = result.text.len(),
                finish = ?result.finish_reason,
                "reply ended without a stop sequence"
            );
        }
        debug!(reply = %text, ?stop, "chat turn complete");
        let reply = ChatReply {
            text: text.to_string(),
            stopped_early,
        };
        self.state = request.prompt().to_string();
        self.state.push_str(&reply.text);
        Ok(reply)
    }
}
