//! cachelens - prompt-cache diagnostics for Claude chat traffic
//!
//! Replays captured request/response pairs through the cache interceptor and
//! explains every cache miss, or prices a single usage record.
//!
//! ## Usage
//!
//! ```bash
//! # Replay two captured exchanges six minutes apart
//! cachelens replay --request req1.json --response resp1.sse \
//!                  --request req2.json --response resp2.sse --interval-secs 360
//!
//! # Price one request
//! cachelens cost --model claude-sonnet-4-5 --input 1200 --output 300 --cache-read 18000
//!
//! # With verbose logging
//! cachelens -v replay ...
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::Bytes;
use cachelens_core::{CacheLensConfig, CacheLensError, LogGuard, RequestDescriptor, UsageRecord, init_logging};
use cachelens_cost::{CostBreakdown, PriceTable};
use cachelens_diagnosis::{DiagnosisResult, MissDiagnoser};
use cachelens_session::{
    CacheInterceptor, Clock, HistoryEntry, RequestExecutor, SessionAggregator, SessionConfig,
    SessionEvent, SessionStats,
};
use cachelens_stream::{ByteStream, MetadataClient, StreamError};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use futures_util::{StreamExt, stream};
use tokio::sync::Mutex;
use tracing::{error, info};

/// Read-size used when streaming captured responses from disk.
const REPLAY_CHUNK_BYTES: usize = 512;

/// cachelens prompt-cache diagnostics
#[derive(Parser, Debug)]
#[command(name = "cachelens")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.cachelens/logs/)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Config file (defaults to ~/.cachelens/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay captured request/response pairs and diagnose cache misses
    Replay {
        /// Request body (JSON); repeat once per exchange
        #[arg(long = "request", required = true)]
        requests: Vec<PathBuf>,

        /// Response body (SSE or JSON); one per --request, in the same order
        #[arg(long = "response", required = true)]
        responses: Vec<PathBuf>,

        /// Simulated seconds between consecutive requests
        #[arg(long, default_value_t = 30)]
        interval_secs: i64,

        /// URL recorded for the replayed requests
        #[arg(long, default_value = "https://api.anthropic.com/v1/messages")]
        url: String,

        /// Print each history entry as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Price a single usage record
    Cost {
        /// Model identifier
        #[arg(long)]
        model: String,

        #[arg(long, default_value_t = 0)]
        input: u64,

        #[arg(long, default_value_t = 0)]
        output: u64,

        #[arg(long, default_value_t = 0)]
        cache_read: u64,

        #[arg(long, default_value_t = 0)]
        cache_write: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            if let Some(hint) = e.guidance() {
                eprintln!("{}", hint);
            }
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("cachelens error: {:#}", e);
            eprintln!("Error: {:#}", e);
            if let Some(hint) = e.downcast_ref::<CacheLensError>().and_then(|e| e.guidance()) {
                eprintln!("{}", hint);
            }
            ExitCode::from(1)
        }
    }
}

/// Set up logging based on CLI arguments.
fn setup_logging(cli: &Cli) -> cachelens_core::Result<LogGuard> {
    init_logging(cli.log_dir.clone(), cli.verbose > 0)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CacheLensConfig> {
    let config = match path {
        Some(path) => CacheLensConfig::load_from(path),
        None => CacheLensConfig::load_default(),
    };
    config.context("failed to load configuration")
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let prices = PriceTable::with_overrides(&config.pricing.tiers)
        .map_err(|e| anyhow::anyhow!(e.friendly_message()))?;

    match cli.command {
        Command::Replay {
            requests,
            responses,
            interval_secs,
            url,
            json,
        } => {
            if requests.len() != responses.len() {
                bail!(
                    "got {} --request files but {} --response files",
                    requests.len(),
                    responses.len()
                );
            }
            let pairs: Vec<(PathBuf, PathBuf)> = requests.into_iter().zip(responses).collect();
            replay(&config, prices, &url, pairs, interval_secs, json).await
        }
        Command::Cost {
            model,
            input,
            output,
            cache_read,
            cache_write,
        } => {
            let usage = UsageRecord::new(model)
                .with_tokens(input, output)
                .with_cache(cache_read, cache_write);
            let breakdown = prices.cost(&usage);
            print_costs(&usage, &breakdown);
            Ok(())
        }
    }
}

// ============================================================================
// Replay
// ============================================================================

/// Serves each captured response file in order.
struct FileExecutor {
    responses: std::sync::Mutex<std::vec::IntoIter<PathBuf>>,
}

#[async_trait]
impl RequestExecutor for FileExecutor {
    async fn execute(&self, _request: &RequestDescriptor) -> cachelens_stream::Result<ByteStream> {
        let path = self
            .responses
            .lock()
            .map_err(|_| StreamError::Execution("response queue poisoned".into()))?
            .next()
            .ok_or_else(|| StreamError::Execution("no captured response left".into()))?;

        let body = tokio::fs::read(&path).await?;
        let chunks: Vec<cachelens_stream::Result<Bytes>> = body
            .chunks(REPLAY_CHUNK_BYTES)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// Clock that advances a fixed interval per dispatched request.
struct SteppedClock {
    start: DateTime<Utc>,
    step_secs: i64,
    calls: AtomicI64,
}

impl Clock for SteppedClock {
    fn now(&self) -> DateTime<Utc> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.start + Duration::seconds(self.step_secs.saturating_mul(n))
    }
}

async fn replay(
    config: &CacheLensConfig,
    prices: PriceTable,
    url: &str,
    pairs: Vec<(PathBuf, PathBuf)>,
    interval_secs: i64,
    json: bool,
) -> anyhow::Result<()> {
    let aggregator = Arc::new(Mutex::new(SessionAggregator::new(
        SessionConfig::from_config(config),
        prices,
        MissDiagnoser::default(),
    )));
    let mut events = aggregator.lock().await.subscribe();

    let executor = FileExecutor {
        responses: std::sync::Mutex::new(
            pairs.iter().map(|(_, resp)| resp.clone()).collect::<Vec<_>>().into_iter(),
        ),
    };
    let clock = Arc::new(SteppedClock {
        start: Utc::now(),
        step_secs: interval_secs,
        calls: AtomicI64::new(0),
    });

    let mut interceptor = CacheInterceptor::new(executor, Arc::clone(&aggregator)).with_clock(clock);
    match MetadataClient::from_config(&config.metadata) {
        Ok(client) => interceptor = interceptor.with_metadata(client),
        Err(e) => info!(error = %e, "metadata lookup disabled"),
    }

    info!(exchanges = pairs.len(), interval_secs, "starting replay");

    for (request_path, _) in &pairs {
        let body = tokio::fs::read_to_string(request_path)
            .await
            .with_context(|| format!("failed to read {}", request_path.display()))?;
        let request = RequestDescriptor::from_json(url, &body)
            .with_context(|| format!("invalid request body in {}", request_path.display()))?;
        if !request.has_messages() {
            return Err(CacheLensError::RequestWithoutMessages {
                url: request_path.display().to_string(),
            }
            .into());
        }

        let mut tapped = interceptor
            .execute(&request)
            .await
            .with_context(|| format!("failed to replay {}", request_path.display()))?;
        while let Some(chunk) = tapped.next().await {
            chunk.with_context(|| format!("response stream failed for {}", request_path.display()))?;
        }
        interceptor.settle().await;

        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::UsageProcessed { entry, .. } => print_entry(&entry, json)?,
                SessionEvent::WasteDetected {
                    consecutive_misses,
                    streak_write_cost,
                    ..
                } => println!(
                    "  ! {} consecutive cache writes without a read (${:.4} spent on writes)",
                    consecutive_misses, streak_write_cost
                ),
                _ => {}
            }
        }
    }

    let agg = aggregator.lock().await;
    print_summary(agg.stats());
    Ok(())
}

fn print_entry(entry: &HistoryEntry, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(entry)?);
        return Ok(());
    }

    println!(
        "#{} {} {} [{}] {} ms",
        entry.sequence,
        entry.outcome.indicator(),
        entry.outcome,
        entry.usage.model,
        entry.response_time_ms
    );
    print_costs(&entry.usage, &entry.costs);
    if let Some(diagnosis) = &entry.diagnosis {
        print_diagnosis(diagnosis);
    }
    Ok(())
}

fn print_costs(usage: &UsageRecord, costs: &CostBreakdown) {
    println!(
        "  tokens: input {} / output {} / cache read {} / cache write {}",
        usage.input_tokens,
        usage.output_tokens,
        usage.cache_read_input_tokens,
        usage.cache_creation_input_tokens
    );
    println!(
        "  cost ({}): ${:.6} (without cache ${:.6}, savings ${:.6})",
        costs.tier, costs.total_cost, costs.cost_without_cache, costs.savings
    );
    if costs.is_net_loss() {
        println!("  caching cost more than it saved on this request");
    }
}

fn print_diagnosis(diagnosis: &DiagnosisResult) {
    if let Some(primary) = &diagnosis.primary_diagnosis {
        println!("  diagnosis [{}]: {}", primary.severity, primary.short_message);
        if let Some(action) = &primary.action {
            println!("    -> {}", action);
        }
    }
    for reason in &diagnosis.reasons {
        println!("  - {}", reason);
    }
    if let Some(location) = &diagnosis.location_analysis {
        println!("  location: {} ({})", location.location, location.severity);
    }
}

fn print_summary(stats: &SessionStats) {
    println!();
    println!(
        "requests {} | hits {} | misses {} | hit rate {:.1}% | token hit rate {:.1}%",
        stats.total_requests,
        stats.cache_hits,
        stats.cache_misses,
        stats.request_hit_rate() * 100.0,
        stats.token_hit_rate() * 100.0
    );
    println!(
        "cost ${:.4} | without cache ${:.4} | savings ${:.4} | waste warnings {}",
        stats.total_cost, stats.total_cost_without_cache, stats.total_savings, stats.waste_warnings
    );
}
