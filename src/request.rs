use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::token::FinishReason;

/// Token budget used when a request does not set one.
pub const DEFAULT_MAX_NEW_TOKENS: NonZeroU32 = match NonZeroU32::new(20) {
    Some(n) => n,
    None => unreachable!(),
};

/// Sampling configuration forwarded untouched to the transport.
///
/// Unset fields are left to the server's defaults and are not serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_sample: Option<bool>,
}

impl SamplingParams {
    /// Softmax temperature; lower is more deterministic.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Nucleus sampling cutoff.
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Sample only among the `top_k` most likely tokens.
    pub fn top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Penalty applied to tokens already generated.
    pub fn repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = Some(penalty);
        self
    }

    /// Seed for reproducible sampling.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sample instead of decoding greedily (TGI only).
    pub fn do_sample(mut self, do_sample: bool) -> Self {
        self.do_sample = Some(do_sample);
        self
    }
}

/// Immutable description of one generation call.
///
/// # Examples
/// ```
/// use std::num::NonZeroU32;
/// use genpool::{GenerationRequest, SamplingParams};
///
/// let req = GenerationRequest::new("Once upon a time")
///     .with_max_new_tokens(NonZeroU32::new(64).unwrap())
///     .with_stop_sequences(["\n\n"])
///     .with_sampling(SamplingParams::default().temperature(0.7));
/// assert_eq!(req.max_new_tokens().get(), 64);
/// assert_eq!(req.stop_sequences(), ["\n\n"]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    prompt: String,
    max_new_tokens: NonZeroU32,
    stop_sequences: Vec<String>,
    sampling: SamplingParams,
}

impl GenerationRequest {
    /// A request for `prompt` with the default budget, no stop sequences
    /// and server-default sampling.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            stop_sequences: Vec::new(),
            sampling: SamplingParams::default(),
        }
    }

    /// Cap the number of generated tokens.
    pub fn with_max_new_tokens(mut self, max_new_tokens: NonZeroU32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Sequences the server should stop at. They stay in the returned text.
    pub fn with_stop_sequences<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences = stops.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the sampling parameters.
    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Prompt text sent verbatim.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Token budget.
    pub fn max_new_tokens(&self) -> NonZeroU32 {
        self.max_new_tokens
    }

    /// Stop sequences in the order they are checked.
    pub fn stop_sequences(&self) -> &[String] {
        &self.stop_sequences
    }

    /// Sampling parameters forwarded to the transport.
    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }
}

/// Final text of one request, keyed by its position in the submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    pub index: usize,
    pub text: String,
    /// Why generation ended, for servers that report it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_sampling_fields_are_omitted() {
        let params = SamplingParams::default().temperature(0.5).seed(7);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json, serde_json::json!({"temperature": 0.5, "seed": 7}));
    }

    #[test]
    fn defaults_to_small_budget_and_no_stops() {
        let req = GenerationRequest::new("hi");
        assert_eq!(req.max_new_tokens(), DEFAULT_MAX_NEW_TOKENS);
        assert!(req.stop_sequences().is_empty());
        assert_eq!(req.sampling(), &SamplingParams::default());
    }
}
