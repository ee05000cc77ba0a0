use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use genpool::logger::{self, LogLevel};
use genpool::{
    Backend, BatchOutcome, Config, DispatchError, FailurePolicy, IndicatifProgress, LineFlusher,
    SlotOutcome, load_preamble, shutdown_signal,
};
use serde_json::json;
use tokio::fs::File;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, stdin, stdout,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "genpool",
    version,
    about = "Batch and chat client for streaming text-generation servers"
)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "GENPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Server base URL; repeat to spread requests over several replicas
    #[arg(long = "url", global = true)]
    urls: Vec<String>,

    /// Wire protocol spoken by the servers
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,

    /// Model name (Ollama only)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a completion for every line of a prompt file
    Batch {
        /// Prompt file, one prompt per line, or - for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// JSON lines output path; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum number of concurrently open streams
        #[arg(short, long)]
        workers: Option<usize>,

        /// Abort the batch at the first failed request
        #[arg(long)]
        fail_fast: bool,

        /// Token budget per request
        #[arg(long)]
        max_new_tokens: Option<NonZeroU32>,
    },
    /// Interactive chat on stdin/stdout
    Chat {
        /// Preamble URL or file path
        #[arg(short, long)]
        preamble: Option<String>,
    },
    /// Stream a single completion to stdout
    Generate {
        prompt: String,

        /// Token budget for the request
        #[arg(long)]
        max_new_tokens: Option<NonZeroU32>,
    },
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        if !self.urls.is_empty() {
            cfg.server.urls = self.urls.clone();
        }
        if let Some(backend) = self.backend {
            cfg.server.backend = backend;
        }
        if let Some(model) = &self.model {
            cfg.server.model = model.clone();
        }
        match &self.command {
            Command::Batch {
                workers,
                fail_fast,
                max_new_tokens,
                ..
            } => {
                if let Some(workers) = workers {
                    cfg.dispatch.max_workers = *workers;
                }
                if *fail_fast {
                    cfg.dispatch.failure_policy = FailurePolicy::FailFast;
                }
                if let Some(budget) = max_new_tokens {
                    cfg.generation.max_new_tokens = *budget;
                }
            }
            Command::Generate {
                max_new_tokens: Some(budget),
                ..
            } => cfg.generation.max_new_tokens = *budget,
            Command::Chat { preamble } => {
                if preamble.is_some() {
                    cfg.chat.preamble = preamble.clone();
                }
            }
            Command::Generate { .. } => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::try_init(cli.log_level).map_err(|e| anyhow::anyhow!(e))?;

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    cli.apply(&mut cfg);
    let transport = cfg.build_transport()?;
    let dispatcher = cfg.dispatcher(transport)?;

    match cli.command {
        Command::Batch { input, output, .. } => {
            let prompts = read_prompts(&input).await?;
            info!(
                count = prompts.len(),
                workers = dispatcher.max_workers(),
                "starting batch"
            );
            let requests = prompts.into_iter().map(|p| cfg.build_request(p)).collect();

            let cancel = CancellationToken::new();
            let watcher = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    shutdown_signal().await;
                    warn!("interrupted, cancelling batch");
                    cancel.cancel();
                })
            };
            let progress = IndicatifProgress::new();
            let result = dispatcher.dispatch_with(requests, &progress, cancel).await;
            watcher.abort();

            let (outcome, aborted) = match result {
                Ok(outcome) => (outcome, None),
                Err(DispatchError::Aborted {
                    first_index,
                    outcome,
                }) => (outcome, Some(first_index)),
                Err(e) => return Err(e.into()),
            };
            let mut out: Box<dyn AsyncWrite + Unpin + Send> = match &output {
                Some(path) => Box::new(File::create(path).await?),
                None => Box::new(stdout()),
            };
            write_outcome(&mut out, &outcome).await?;
            out.flush().await?;

            if let Some(index) = aborted {
                let reason = outcome
                    .get(index)
                    .and_then(SlotOutcome::error)
                    .map(ToString::to_string)
                    .unwrap_or_default();
                anyhow::bail!("batch aborted at request {index}: {reason}");
            }
            let incomplete = outcome.incomplete_indices();
            if !incomplete.is_empty() {
                warn!(
                    ?incomplete,
                    "{} of {} requests did not complete",
                    incomplete.len(),
                    outcome.len()
                );
            }
        }
        Command::Chat { .. } => {
            let preamble = match &cfg.chat.preamble {
                Some(location) => load_preamble(location).await?,
                None => String::new(),
            };
            let mut session = cfg.chat_session(preamble);
            let mut flusher = LineFlusher::new(std::io::stdout());
            let mut lines = BufReader::new(stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match session.send(&dispatcher, &line, Some(&mut flusher)).await {
                    Ok(reply) if reply.stopped_early => println!("[stopped early]"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "chat turn failed"),
                }
            }
        }
        Command::Generate { prompt, .. } => {
            let request = cfg.build_request(prompt);
            let mut flusher = LineFlusher::new(std::io::stdout());
            dispatcher.dispatch_one(&request, Some(&mut flusher)).await?;
        }
    }
    Ok(())
}

async fn read_prompts(input: &Path) -> anyhow::Result<Vec<String>> {
    let mut text = String::new();
    if input.as_os_str() == "-" {
        stdin().read_to_string(&mut text).await?;
    } else {
        text = tokio::fs::read_to_string(input).await?;
    }
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

async fn write_outcome<W>(out: &mut W, outcome: &BatchOutcome) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    for (index, slot) in outcome.slots().iter().enumerate() {
        let record = match slot {
            SlotOutcome::Completed(res) => serde_json::to_value(res)?,
            SlotOutcome::Failed(e) => json!({"index": index, "error": e.to_string()}),
            SlotOutcome::Cancelled => json!({"index": index, "status": "cancelled"}),
            SlotOutcome::NotStarted => json!({"index": index, "status": "not_started"}),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        out.write_all(line.as_bytes()).await?;
    }
    Ok(())
}
