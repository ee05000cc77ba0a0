//! Turns a live token stream into final text.
//!
//! [`TokenStreamAccumulator`] only assembles what it is given: special tokens
//! are dropped, every other fragment is appended verbatim and the buffer is
//! returned untouched when the stream ends. Recognizing a stop sequence is
//! recorded (see [`TokenStreamAccumulator::matched_stop`]) but never used to
//! truncate; removing the marker is left to the caller.

use std::io::Write;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{StreamError, TaskError};
use crate::token::{FinishReason, TokenEvent};

/// Final text of a stream along with the server's finish reason, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: Option<FinishReason>,
}

/// Receives every visible fragment as it is appended.
pub trait LineObserver: Send {
    /// Called after each non-special append with the text accumulated so far
    /// (`previous`) and the fragment just added. At stream end it is called
    /// once more with a terminal `"\n"` fragment.
    fn on_fragment(&mut self, previous: &str, fragment: &str);
}

/// [`LineObserver`] that only writes once a line boundary is known.
///
/// Fragments without a newline are held back. When a fragment carries a
/// newline, everything not yet written is flushed, up to the end of that
/// fragment. The terminal fragment sent at stream end flushes the rest.
///
/// ```
/// use genpool::{LineFlusher, LineObserver};
///
/// let mut flusher = LineFlusher::new(Vec::new());
/// flusher.on_fragment("", "ab");
/// assert!(flusher.get_ref().is_empty());
/// flusher.on_fragment("ab", "\nc");
/// assert_eq!(flusher.get_ref().as_slice(), b"ab\nc");
/// flusher.on_fragment("ab\nc", "d");
/// flusher.on_fragment("ab\ncd", "\n");
/// assert_eq!(flusher.get_ref().as_slice(), b"ab\ncd\n");
/// ```
pub struct LineFlusher<W> {
    out: W,
    printed: usize,
}

impl<W: Write> LineFlusher<W> {
    pub fn new(out: W) -> Self {
        Self { out, printed: 0 }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, pending: &str, fragment: &str) -> std::io::Result<()> {
        self.out.write_all(pending.as_bytes())?;
        self.out.write_all(fragment.as_bytes())?;
        self.out.flush()
    }
}

impl<W: Write + Send> LineObserver for LineFlusher<W> {
    fn on_fragment(&mut self, previous: &str, fragment: &str) {
        // a fresh stream starts from an empty buffer
        if previous.is_empty() {
            self.printed = 0;
        }
        if !fragment.contains('\n') {
            return;
        }
        let line_start = previous.rfind('\n').map_or(0, |i| i + 1);
        let start = self.printed.max(line_start).min(previous.len());
        if let Err(e) = self.write(&previous[start..], fragment) {
            warn!(error = %e, "line flush failed");
        }
        self.printed = previous.len() + fragment.len();
    }
}

/// Accumulates the visible text of one generation request.
pub struct TokenStreamAccumulator<'o> {
    buffer: String,
    stop_sequences: Vec<String>,
    matched_stop: Option<usize>,
    finish_reason: Option<FinishReason>,
    observer: Option<&'o mut dyn LineObserver>,
    tokens: usize,
    skipped: usize,
}

impl<'o> TokenStreamAccumulator<'o> {
    pub fn new<I, S>(stop_sequences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            buffer: String::new(),
            stop_sequences: stop_sequences.into_iter().map(Into::into).collect(),
            matched_stop: None,
            finish_reason: None,
            observer: None,
            tokens: 0,
            skipped: 0,
        }
    }

    /// Attach a line observer.
    pub fn observe(mut self, observer: &'o mut dyn LineObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Feed one event.
    pub fn push(&mut self, event: TokenEvent) {
        if let Some(reason) = event.finish {
            self.finish_reason = Some(reason);
            // final bookkeeping chunk with nothing to show
            if event.text.is_empty() {
                return;
            }
        }
        if event.special {
            trace!(token = %event.text, "skipping special token");
            self.skipped += 1;
            return;
        }
        trace!(token = %event.text, "llm token");
        let previous_len = self.buffer.len();
        self.buffer.push_str(&event.text);
        self.tokens += 1;
        if let Some(observer) = self.observer.as_deref_mut() {
            let (previous, fragment) = self.buffer.split_at(previous_len);
            observer.on_fragment(previous, fragment);
        }
        self.matched_stop = self
            .stop_sequences
            .iter()
            .position(|stop| !stop.is_empty() && self.buffer.ends_with(stop.as_str()));
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.buffer
    }

    /// Stop sequence the buffer currently ends with, if any.
    pub fn matched_stop(&self) -> Option<&str> {
        self.matched_stop
            .map(|i| self.stop_sequences[i].as_str())
    }

    /// Finish reason reported by the server, if it sent one.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Number of visible tokens appended.
    pub fn token_count(&self) -> usize {
        self.tokens
    }

    /// End the stream: flush the observer and hand back the buffer as is.
    pub fn finish(self) -> String {
        self.complete().text
    }

    /// Like [`finish`](Self::finish), keeping the server's finish reason.
    pub fn complete(mut self) -> Completion {
        if let Some(observer) = self.observer.as_deref_mut() {
            observer.on_fragment(&self.buffer, "\n");
        }
        debug!(
            tokens = self.tokens,
            skipped = self.skipped,
            stop = ?self.matched_stop(),
            finish = ?self.finish_reason,
            "stream finished"
        );
        Completion {
            text: self.buffer,
            finish_reason: self.finish_reason,
        }
    }

    async fn drain<S>(&mut self, stream: S) -> Result<(), StreamError>
    where
        S: Stream<Item = Result<TokenEvent, StreamError>>,
    {
        let mut stream = std::pin::pin!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.push(event),
                Err(e) => {
                    debug!(error = %e, partial = self.buffer.len(), "stream failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Drain `stream` to completion.
    ///
    /// A transport fault discards the partial buffer and is returned as is.
    pub async fn run<S>(mut self, stream: S) -> Result<String, StreamError>
    where
        S: Stream<Item = Result<TokenEvent, StreamError>>,
    {
        self.drain(stream).await?;
        Ok(self.finish())
    }

    /// Like [`run`](Self::run) but gives up as soon as `cancel` fires. The
    /// stream is dropped, which closes the underlying connection.
    pub async fn run_until_cancelled<S>(
        mut self,
        stream: S,
        cancel: &CancellationToken,
    ) -> Result<Completion, TaskError>
    where
        S: Stream<Item = Result<TokenEvent, StreamError>>,
    {
        let drained = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = self.drain(stream) => Some(res),
        };
        match drained {
            None => Err(TaskError::Cancelled),
            Some(res) => {
                res?;
                Ok(self.complete())
            }
        }
    }
}
