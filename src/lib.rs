//! Client-side batching for streaming text-generation servers.
//!
//! A [`Transport`] opens one token stream per [`GenerationRequest`]; a
//! [`TokenStreamAccumulator`] folds that stream into text, optionally echoing
//! complete lines through a [`LineObserver`]; a [`BoundedDispatcher`] keeps a
//! fixed number of streams open at once and returns results in input order.
//! [`ChatSession`] layers a caller-owned transcript on the single-request path.

mod abort_guard;
mod accumulator;
mod chat;
mod config;
mod dispatcher;
mod error;
pub mod logger;
mod ollama;
mod progress;
mod prompt_source;
mod request;
mod retry;
mod round_robin;
mod shutdown;
mod task;
#[cfg(test)]
pub mod test_helpers;
mod tgi;
mod token;
mod transport;

pub use accumulator::{Completion, LineFlusher, LineObserver, TokenStreamAccumulator};
pub use chat::{ChatReply, ChatSession, DEFAULT_STOP_SEQUENCES, strip_stop_suffix};
pub use config::{
    Backend, ChatConfig, Config, DispatchConfig, GenerationConfig, RetryConfig, ServerConfig,
};
pub use dispatcher::{BatchOutcome, BoundedDispatcher, FailurePolicy, SlotOutcome};
pub use error::{BatchPartialFailure, DispatchError, StreamError, TaskError};
pub use ollama::OllamaTransport;
pub use progress::{IndicatifProgress, NoProgress, ProgressSink};
pub use prompt_source::{fetch_preamble, load_preamble};
pub use request::{DEFAULT_MAX_NEW_TOKENS, GenerationRequest, GenerationResult, SamplingParams};
pub use retry::{RetryPolicy, RetryTransport};
pub use round_robin::RoundRobinTransport;
pub use shutdown::shutdown_signal;
pub use task::GenerationTask;
pub use tgi::TgiTransport;
pub use token::{FinishReason, TokenEvent, TokenEventStream};
pub use transport::Transport;
