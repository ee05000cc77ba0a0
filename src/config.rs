//! TOML configuration for the `genpool` binary.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! usable configuration pointing at a local server.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use ollama_rs::Ollama;
use serde::Deserialize;
use url::Url;

use crate::chat::{ChatSession, DEFAULT_STOP_SEQUENCES};
use crate::dispatcher::{BoundedDispatcher, FailurePolicy};
use crate::ollama::OllamaTransport;
use crate::request::{DEFAULT_MAX_NEW_TOKENS, GenerationRequest, SamplingParams};
use crate::retry::{RetryPolicy, RetryTransport};
use crate::round_robin::RoundRobinTransport;
use crate::tgi::TgiTransport;
use crate::transport::Transport;

/// Which wire protocol the servers speak.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// text-generation-inference `generate_stream` endpoint.
    #[default]
    Tgi,
    Ollama,
}

impl Backend {
    fn default_url(self) -> &'static str {
        match self {
            Backend::Tgi => "http://127.0.0.1:8080",
            Backend::Ollama => "http://127.0.0.1:11434",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub backend: Backend,
    /// One entry per server replica. Empty means the backend's local default.
    pub urls: Vec<String>,
    /// Model name, only used by the Ollama backend.
    pub model: String,
    /// Whole-request timeout; unset means streams may run indefinitely.
    pub timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            urls: Vec::new(),
            model: "llama3".into(),
            timeout_secs: None,
        }
    }
}

impl ServerConfig {
    /// Configured URLs, or the backend default when none are given.
    pub fn endpoints(&self) -> Vec<String> {
        if self.urls.is_empty() {
            vec![self.backend.default_url().to_string()]
        } else {
            self.urls.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_new_tokens: NonZeroU32,
    pub stop_sequences: Vec<String>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            stop_sequences: Vec::new(),
            sampling: SamplingParams::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_workers: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            failure_policy: FailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra attempts to open a stream. Zero disables retrying.
    pub max_retries: usize,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 500,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.delay_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// URL or path of the session preamble.
    pub preamble: Option<String>,
    pub stop_sequences: Vec<String>,
    pub max_new_tokens: NonZeroU32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            preamble: None,
            stop_sequences: DEFAULT_STOP_SEQUENCES.map(String::from).to_vec(),
            max_new_tokens: NonZeroU32::new(256).unwrap_or(DEFAULT_MAX_NEW_TOKENS),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub generation: GenerationConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub chat: ChatConfig,
}

impl Config {
    /// Load a [`Config`] from a TOML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use genpool::Config;
    /// # tokio_test::block_on(async {
    /// let cfg = Config::load("genpool.toml").await.unwrap();
    /// assert!(cfg.dispatch.max_workers > 0);
    /// # });
    /// ```
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Request for `prompt` using the `[generation]` defaults.
    pub fn build_request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest::new(prompt)
            .with_max_new_tokens(self.generation.max_new_tokens)
            .with_stop_sequences(self.generation.stop_sequences.iter().cloned())
            .with_sampling(self.generation.sampling.clone())
    }

    /// Transport stack: one transport per URL, round robin across them when
    /// there are several, retrying stream opens when `[retry]` asks for it.
    pub fn build_transport(&self) -> anyhow::Result<Arc<dyn Transport>> {
        let mut http = reqwest::Client::builder();
        if let Some(secs) = self.server.timeout_secs {
            http = http.timeout(Duration::from_secs(secs));
        }
        let http = http.build().context("building http client")?;

        let mut transports = Vec::new();
        for url in self.server.endpoints() {
            let transport: Arc<dyn Transport> = match self.server.backend {
                Backend::Tgi => Arc::new(TgiTransport::with_client(http.clone(), url)),
                Backend::Ollama => {
                    let parsed =
                        Url::parse(&url).with_context(|| format!("invalid server url {url}"))?;
                    let host = format!(
                        "{}://{}",
                        parsed.scheme(),
                        parsed.host_str().unwrap_or("127.0.0.1")
                    );
                    let port = parsed.port_or_known_default().unwrap_or(11434);
                    let client = Ollama::new_with_client(host, port, http.clone());
                    Arc::new(OllamaTransport::new(client, self.server.model.clone()))
                }
            };
            transports.push(transport);
        }

        let transport: Arc<dyn Transport> = if transports.len() == 1 {
            transports.remove(0)
        } else {
            Arc::new(RoundRobinTransport::new(transports))
        };
        if self.retry.max_retries > 0 {
            Ok(Arc::new(RetryTransport::new(transport, self.retry.policy())))
        } else {
            Ok(transport)
        }
    }

    /// Dispatcher over `transport` using the `[dispatch]` settings.
    pub fn dispatcher(&self, transport: Arc<dyn Transport>) -> anyhow::Result<BoundedDispatcher> {
        Ok(BoundedDispatcher::new(transport, self.dispatch.max_workers)?
            .with_policy(self.dispatch.failure_policy))
    }

    /// Fresh chat session seeded with `preamble`, using the `[chat]` settings
    /// and the `[generation]` sampling parameters.
    pub fn chat_session(&self, preamble: impl Into<String>) -> ChatSession {
        ChatSession::new(preamble)
            .with_stop_sequences(self.chat.stop_sequences.iter().cloned())
            .with_max_new_tokens(self.chat.max_new_tokens)
            .with_sampling(self.generation.sampling.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.server.backend, Backend::Tgi);
        assert_eq!(cfg.server.endpoints(), vec!["http://127.0.0.1:8080"]);
        assert_eq!(cfg.generation.max_new_tokens.get(), 20);
        assert_eq!(cfg.dispatch.max_workers, 4);
        assert_eq!(cfg.dispatch.failure_policy, FailurePolicy::ContinueOnError);
        assert_eq!(cfg.retry.max_retries, 0);
        assert_eq!(cfg.chat.stop_sequences, vec!["Human:", "-----"]);
    }

    #[test]
    fn sampling_fields_sit_in_generation_table() {
        let cfg = Config::from_toml_str(
            r#"
            [generation]
            max_new_tokens = 64
            stop_sequences = ["\n\n"]
            temperature = 0.7
            top_k = 40
            "#,
        )
        .unwrap();
        let req = cfg.build_request("hi");
        assert_eq!(req.max_new_tokens().get(), 64);
        assert_eq!(req.stop_sequences(), ["\n\n"]);
        assert_eq!(req.sampling().temperature, Some(0.7));
        assert_eq!(req.sampling().top_k, Some(40));
        assert_eq!(req.sampling().top_p, None);
    }

    #[test]
    fn zero_token_budget_is_rejected() {
        assert!(Config::from_toml_str("[generation]\nmax_new_tokens = 0").is_err());
    }

    #[test]
    fn zero_workers_fail_at_dispatcher_construction() {
        let cfg = Config::from_toml_str("[dispatch]\nmax_workers = 0").unwrap();
        let transport = cfg.build_transport().unwrap();
        assert!(cfg.dispatcher(transport).is_err());
    }

    #[test]
    fn ollama_backend_builds_transport() {
        let cfg = Config::from_toml_str(
            r#"
            [server]
            backend = "ollama"
            urls = ["http://a:11434", "http://b:11434"]
            model = "mistral"
            [retry]
            max_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.backend, Backend::Ollama);
        assert!(cfg.build_transport().is_ok());
    }

    #[test]
    fn invalid_ollama_url_is_an_error() {
        let cfg = Config::from_toml_str(
            r#"
            [server]
            backend = "ollama"
            urls = ["not a url"]
            "#,
        )
        .unwrap();
        assert!(cfg.build_transport().is_err());
    }

    #[tokio::test]
    async fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatch]\nmax_workers = 8\nfailure_policy = \"fail-fast\"").unwrap();
        let cfg = Config::load(file.path()).await.unwrap();
        assert_eq!(cfg.dispatch.max_workers, 8);
        assert_eq!(cfg.dispatch.failure_policy, FailurePolicy::FailFast);
    }

    #[tokio::test]
    async fn missing_file_names_the_path() {
        let err = Config::load("/no/such/genpool.toml").await.unwrap_err();
        assert!(format!("{err:#}").contains("/no/such/genpool.toml"));
    }
}
