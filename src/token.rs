use futures::stream::BoxStream;
use serde::Serialize;

use crate::error::StreamError;

/// Why the server stopped generating, when it says so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The token budget ran out.
    Length,
    /// The model emitted its end-of-sequence token.
    EndOfSequence,
    /// One of the request's stop sequences was produced.
    StopSequence,
    /// The server finished the turn without saying more precisely why.
    Stop,
}

impl FinishReason {
    /// Map a server-reported reason string. Unknown strings count as a
    /// regular stop.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "length" => Self::Length,
            "eos_token" => Self::EndOfSequence,
            "stop_sequence" => Self::StopSequence,
            _ => Self::Stop,
        }
    }

    /// The turn was cut off rather than ended by the model.
    pub fn is_truncation(self) -> bool {
        matches!(self, Self::Length)
    }
}

/// One increment of a streaming generation response.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEvent {
    /// Text fragment as produced by the server.
    pub text: String,
    /// Control token (end-of-sequence and the like). Never part of the
    /// visible output.
    pub special: bool,
    /// Vocabulary id, when the server reports one.
    pub id: Option<u32>,
    /// Log-probability of this token, when the server reports one.
    pub logprob: Option<f32>,
    /// Set on the final event of a stream by servers that report it.
    pub finish: Option<FinishReason>,
}

impl TokenEvent {
    /// A regular, visible token.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            special: false,
            id: None,
            logprob: None,
            finish: None,
        }
    }

    /// A control token.
    pub fn special(text: impl Into<String>) -> Self {
        Self {
            special: true,
            ..Self::text(text)
        }
    }

    /// Mark this event as the end of the stream.
    pub fn with_finish(mut self, reason: FinishReason) -> Self {
        self.finish = Some(reason);
        self
    }
}

/// Lazy stream of token events for a single request.
pub type TokenEventStream = BoxStream<'static, Result<TokenEvent, StreamError>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_reasons() {
        assert_eq!(FinishReason::from_wire("length"), FinishReason::Length);
        assert_eq!(FinishReason::from_wire("eos_token"), FinishReason::EndOfSequence);
        assert_eq!(FinishReason::from_wire("stop_sequence"), FinishReason::StopSequence);
        assert_eq!(FinishReason::from_wire("stop"), FinishReason::Stop);
        assert!(FinishReason::Length.is_truncation());
        assert!(!FinishReason::Stop.is_truncation());
    }
}
