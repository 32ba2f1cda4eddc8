use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use serde::Serialize;
use thiserror::Error;

use shardrepl::repl::ClientError;
use shardrepl::{ClusterName, ErrorCode, Limits, ReplicationClient, TaskId, config, telemetry};

/// Polls a shard replication server and prints tasks as JSON lines.
#[derive(Parser, Debug)]
#[command(name = "repl-poll", version, about)]
struct Cli {
    /// Server address (default: `replication.listen_addr` from config).
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,

    /// Name this poller identifies as.
    #[arg(long, value_name = "NAME", default_value = "repl-poll")]
    cluster: String,

    /// Last task id already applied.
    #[arg(long, value_name = "ID", default_value_t = 0)]
    cursor: u64,

    /// Server-side wait when nothing is pending.
    #[arg(long = "wait-ms", value_name = "MS")]
    wait_ms: Option<u64>,

    /// Keep polling from the returned cursor until interrupted.
    #[arg(long, default_value_t = false)]
    follow: bool,

    /// Config file (default: user config dir).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum PollError {
    #[error(transparent)]
    Repl(#[from] shardrepl::Error),
    #[error("task {index} after cursor {cursor} cannot be rendered as JSON: {source}")]
    Render {
        cursor: TaskId,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl PollError {
    fn code(&self) -> ErrorCode {
        match self {
            PollError::Repl(err) => err.code(),
            PollError::Render { .. } => ErrorCode::Internal,
        }
    }
}

impl From<ClientError> for PollError {
    fn from(err: ClientError) -> Self {
        PollError::Repl(err.into())
    }
}

fn main() {
    let cli = Cli::parse();

    let cfg = match config::load_with(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config load failed, using defaults: {err}");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    let _telemetry_guard = telemetry::init(telemetry::TelemetryConfig::new(
        cli.verbose,
        cfg.logging.clone(),
    ));

    if let Err(err) = run(&cli, &cfg) {
        tracing::error!(code = %err.code(), "error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli, cfg: &config::Config) -> Result<(), PollError> {
    let cluster = ClusterName::new(cli.cluster.as_str()).map_err(shardrepl::Error::from)?;
    let addr = cli
        .addr
        .clone()
        .unwrap_or_else(|| cfg.replication.listen_addr.clone());
    let wait = cli.wait_ms.map(Duration::from_millis);
    let mut cursor = TaskId::new(cli.cursor);
    let mut backoff = Backoff::new();
    let mut client = connect(&addr, &cfg.limits, cli.follow, &mut backoff)?;
    let stdout = std::io::stdout();

    loop {
        let messages = match client.get_messages(&cluster, cursor, wait) {
            Ok(messages) => messages,
            Err(err) if cli.follow && err.transience().is_retryable() => {
                tracing::warn!(%cursor, "poll failed, reconnecting: {err}");
                std::thread::sleep(backoff.next_delay());
                client = connect(&addr, &cfg.limits, true, &mut backoff)?;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        backoff.reset();

        let mut out = stdout.lock();
        match emit(&mut out, &messages.tasks, messages.last_retrieved_message_id, &mut cursor)? {
            Emitted::Written => {}
            Emitted::OutputClosed => return Ok(()),
        }
        drop(out);

        tracing::debug!(
            tasks = messages.len(),
            cursor = %cursor,
            has_more = messages.has_more,
            "poll complete"
        );
        if !cli.follow && !messages.has_more {
            return Ok(());
        }
    }
}

/// Connects once, or until success while following. Only retryable failures
/// are retried.
fn connect(
    addr: &str,
    limits: &Limits,
    follow: bool,
    backoff: &mut Backoff,
) -> Result<ReplicationClient, ClientError> {
    loop {
        match ReplicationClient::connect(addr, limits.clone()) {
            Ok(client) => return Ok(client),
            Err(err) if follow && err.transience().is_retryable() => {
                let delay = backoff.next_delay();
                tracing::warn!(addr, retry_in = ?delay, "connect failed: {err}");
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Emitted {
    Written,
    OutputClosed,
}

/// Writes one JSON line per item, then moves `cursor` to `next`. Every item is
/// rendered before anything is written, so a render failure leaves both the
/// output and the cursor untouched.
fn emit<W: Write, T: Serialize>(
    out: &mut W,
    items: &[T],
    next: TaskId,
    cursor: &mut TaskId,
) -> Result<Emitted, PollError> {
    let mut buf = String::new();
    for (index, item) in items.iter().enumerate() {
        let line = serde_json::to_string(item).map_err(|source| PollError::Render {
            cursor: *cursor,
            index,
            source,
        })?;
        buf.push_str(&line);
        buf.push('\n');
    }
    if out.write_all(buf.as_bytes()).and_then(|()| out.flush()).is_err() {
        return Ok(Emitted::OutputClosed);
    }
    *cursor = next;
    Ok(Emitted::Written)
}

/// Doubling delay between reconnect attempts, capped at `MAX_RETRY_BACKOFF`.
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: RETRY_BACKOFF,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_RETRY_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.next = RETRY_BACKOFF;
    }
}
