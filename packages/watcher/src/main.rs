use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

use txnscope_watcher::config::{
    parse_address, parse_selector, ConfigError, DrainPolicy, RejectionLog, WatcherConfig,
    DEFAULT_RESOLVE_TIMEOUT_MS,
};
use txnscope_watcher::driver::{Driver, DriverError, DriverStats};
use txnscope_watcher::feed::{TransactionFeed, TransactionResolver, DEFAULT_QUEUE_CAPACITY};
use txnscope_watcher::node::{self, Endpoint, NodeConfig, NodeError, CONNECTION_TIMEOUT_MS, DEFAULT_ENDPOINT};
use txnscope_watcher::observer::{
    LogObserver, Observer, ObserverSet, PublishError, RedisObserver, DEFAULT_CHANNEL,
};
use txnscope_watcher::signatures::{AbiSource, MULTICALL_DEADLINE_SELECTOR};

#[derive(Parser, Debug)]
#[command(name = "txnscope-watcher")]
#[command(about = "Watches pending router transactions and unwinds multicall batches")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Node endpoint: ws:// or wss:// URL, or an IPC socket path
    #[arg(short = 'a', long, default_value = DEFAULT_ENDPOINT)]
    api_url: String,

    /// Contract whose incoming calls are decoded
    #[arg(long, default_value = "0x68b3465833fb72A70ecDF485E0e4C7bD8665Fc45")]
    target: String,

    /// Additional JSON ABI file, registered after the built-in router ABI (repeatable)
    #[arg(long = "abi")]
    abi_files: Vec<PathBuf>,

    /// Do not register the built-in router ABI
    #[arg(long)]
    no_builtin_abi: bool,

    /// Accepted selector (repeatable) [default: 0x5ae401dc]
    #[arg(long = "selector")]
    selectors: Vec<String>,

    /// Accept every selector present in the signature table
    #[arg(long, conflicts_with = "selectors")]
    any_selector: bool,

    /// Selector decoded as a (deadline, bytes[]) batch (repeatable) [default: 0x5ae401dc]
    #[arg(long = "unwind-selector")]
    unwind_selectors: Vec<String>,

    /// Levels of inner calls to decode; 0 emits inner calls undecoded
    #[arg(long, default_value_t = 0)]
    nested_depth: usize,

    /// Capacity of the pending hash queue
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// What to do with queued hashes on shutdown (discard, drain)
    #[arg(long, default_value = "discard")]
    drain: DrainPolicy,

    /// Log level for rejected transactions (silent, trace, debug)
    #[arg(long, default_value = "debug")]
    rejections: RejectionLog,

    /// Timeout for each transaction lookup
    #[arg(long, default_value_t = DEFAULT_RESOLVE_TIMEOUT_MS)]
    resolve_timeout_ms: u64,

    /// Timeout for the node connection
    #[arg(long, default_value_t = CONNECTION_TIMEOUT_MS)]
    connect_timeout_ms: u64,

    /// Also publish events to this Redis server
    #[arg(long)]
    redis_url: Option<String>,

    /// Redis pub/sub channel for events
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    redis_channel: String,
}

#[derive(Error, Debug)]
enum AppError {
    #[error("Invalid log level: {0}")]
    LogLevel(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl Args {
    fn watcher_config(&self) -> Result<WatcherConfig, ConfigError> {
        let mut abi_sources = Vec::new();
        if !self.no_builtin_abi {
            abi_sources.push(AbiSource::Builtin);
        }
        abi_sources.extend(self.abi_files.iter().cloned().map(AbiSource::File));

        let expected_selectors = if self.any_selector {
            Vec::new()
        } else {
            selectors_or_default(&self.selectors)?
        };

        Ok(WatcherConfig {
            target: parse_address(&self.target)?,
            abi_sources,
            expected_selectors,
            unwind_selectors: selectors_or_default(&self.unwind_selectors)?,
            nested_depth: self.nested_depth,
            queue_capacity: self.queue_capacity,
            drain_policy: self.drain,
            rejection_log: self.rejections,
            resolve_timeout_ms: self.resolve_timeout_ms,
        })
    }
}

fn selectors_or_default(values: &[String]) -> Result<Vec<[u8; 4]>, ConfigError> {
    if values.is_empty() {
        return Ok(vec![MULTICALL_DEADLINE_SELECTOR]);
    }
    values.iter().map(|s| parse_selector(s)).collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match Level::from_str(&args.log_level) {
        Ok(level) => level,
        Err(_) => {
            eprintln!("{}", AppError::LogLevel(args.log_level));
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match run(args).await {
        Ok(stats) => {
            info!(
                received = stats.received,
                qualifying = stats.qualifying,
                unwound = stats.unwound,
                "watcher exited"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "watcher failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<DriverStats, AppError> {
    let config = args.watcher_config()?;
    let table = config.build_table()?;
    info!(
        contract = %config.target,
        functions = table.len(),
        nested_depth = config.nested_depth,
        "signature table loaded"
    );

    let node_config = NodeConfig {
        endpoint: Endpoint::parse(&args.api_url)?,
        connect_timeout_ms: args.connect_timeout_ms,
    };
    let (feed, resolver) = node::open(&node_config).await?;

    let mut observers = ObserverSet::new();
    observers.push(LogObserver);
    if let Some(url) = &args.redis_url {
        observers.push(RedisObserver::connect(url, args.redis_channel.clone()).await?);
        info!(channel = %args.redis_channel, "publishing events to redis");
    }

    let cancel = CancellationToken::new();
    let signals = cancel_on_signal(cancel.clone());
    let mut driver = Driver::from_config(&config, table, feed, resolver, observers);
    Ok(run_with_signals(&mut driver, cancel, signals).await?)
}

/// Run the driver while `signals` watches for shutdown; the watcher task is
/// aborted once the driver returns
async fn run_with_signals<F, R, O, S>(
    driver: &mut Driver<F, R, O>,
    cancel: CancellationToken,
    signals: S,
) -> Result<DriverStats, DriverError>
where
    F: TransactionFeed,
    R: TransactionResolver,
    O: Observer,
    S: Future<Output = ()> + Send + 'static,
{
    let watcher = tokio::spawn(signals);
    let result = driver.run(cancel).await;
    watcher.abort();
    result
}

/// Cancel on SIGINT, or SIGTERM on unix
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::pin!(terminate);

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("received interrupt, shutting down"),
            Err(e) => {
                error!(error = %e, "failed to listen for interrupt");
                (&mut terminate).await;
                info!("received terminate, shutting down");
            }
        },
        _ = &mut terminate => info!("received terminate, shutting down"),
    }
    cancel.cancel();
}
