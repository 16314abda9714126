use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use splitpub::{
    config::{
        parse_signed_duration, resolve_host, FileConfig, HecConfig, PublisherConfig, SplitConfig,
        TimeFormat, TransformerConfig, DEFAULT_BATCH_SIZE, DEFAULT_CONCURRENCY, DEFAULT_EXTENSION,
        DEFAULT_KEY_COLUMN, DEFAULT_RAW_FIELD, DEFAULT_RETRY_COUNT, DEFAULT_TIME_FIELD,
    },
    display::{self, Report, Reporter},
    progress::SplitStats,
    publish::{hec, DryRunSink, EventTransformer, HecClient, Publisher, Sink},
    split,
};
use std::{fs, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const REPORT_EVERY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "splitpub", version, about = "Split exports by sourcetype and publish them to an HTTP Event Collector")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split one CSV export into a table per sourcetype
    Split(SplitArgs),
    /// Publish split tables to an HTTP Event Collector
    Publish(PublishArgs),
    /// Send staged test events to an HTTP Event Collector
    HecTest(HecTestArgs),
}

#[derive(Args, Debug)]
struct SplitArgs {
    /// Input CSV file
    #[arg(short, long)]
    input: PathBuf,
    /// Output directory (defaults to the input's directory)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Column to partition by
    #[arg(short = 'c', long, default_value = DEFAULT_KEY_COLUMN)]
    column: String,
    /// Extension for output files
    #[arg(long, default_value = DEFAULT_EXTENSION)]
    extension: String,
}

#[derive(Args, Debug)]
struct CollectorArgs {
    /// Collector URL; a bare host gets /services/collector/event
    #[arg(short, long)]
    url: String,
    /// Collector token
    #[arg(short, long)]
    token: String,
    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,
    #[arg(long, default_value = "")]
    index: String,
    /// Host for events; empty or "auto" uses this machine's hostname
    #[arg(long, default_value = "")]
    host: String,
    #[arg(long, default_value = "")]
    source: String,
}

#[derive(Args, Debug)]
struct PublishArgs {
    /// Directory of split tables
    #[arg(short, long)]
    input: PathBuf,
    #[command(flatten)]
    collector: CollectorArgs,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// Request timeout, e.g. 30s
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    timeout: Duration,
    #[arg(long, default_value = DEFAULT_TIME_FIELD)]
    time_field: String,
    /// rfc3339, epoch, epoch_ms or a strftime pattern
    #[arg(long, default_value = "rfc3339")]
    time_format: TimeFormat,
    #[arg(long, default_value = DEFAULT_RAW_FIELD)]
    raw_field: String,
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
    #[arg(long, default_value_t = DEFAULT_RETRY_COUNT)]
    retry_count: usize,
    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    retry_wait: Duration,
    /// Transform and count events without sending them
    #[arg(long)]
    dry_run: bool,
    /// Skip the collector health check
    #[arg(long)]
    no_verify: bool,
    #[arg(long)]
    debug: bool,
    /// Shift every timestamp, e.g. -1h or +30m
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    time_offset: String,
    /// Fields to drop (replaces the default date_* list)
    #[arg(long, value_delimiter = ',')]
    exclude_fields: Option<Vec<String>>,
    /// Keep empty values
    #[arg(long)]
    preserve_nulls: bool,
    /// Only forward fields named in field_mappings
    #[arg(long)]
    strict_mapping: bool,
    /// Drop rows whose timestamp cannot be parsed
    #[arg(long)]
    discard_invalid: bool,
    /// RFC 3339 timestamp for rows without a usable one
    #[arg(long)]
    default_timestamp: Option<DateTime<Utc>>,
    /// YAML file with field_mappings, constant_fields, exclude_fields, headers
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_EXTENSION)]
    extension: String,
}

#[derive(Args, Debug)]
struct HecTestArgs {
    #[command(flatten)]
    collector: CollectorArgs,
    #[arg(long, default_value = hec::PROBE_SOURCETYPE)]
    sourcetype: String,
    /// Events in the batch stage
    #[arg(long, default_value_t = 5)]
    events: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ─── 1) init logging ─────────────────────────────────────────────
    let debug = matches!(&cli.command, Command::Publish(args) if args.debug);
    let default_filter = if debug { "info,splitpub=debug" } else { "info" };
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_target(false)
        .init();

    // ─── 2) dispatch ─────────────────────────────────────────────────
    let outcome = match cli.command {
        Command::Split(args) => run_split(args).await,
        Command::Publish(args) => run_publish(args).await,
        Command::HecTest(args) => run_hec_test(args).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run_split(args: SplitArgs) -> Result<()> {
    let config = SplitConfig::new(args.input, args.output)
        .with_key_column(args.column)
        .with_extension(args.extension);
    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;
    info!(
        input = %config.input.display(),
        output = %config.output_dir.display(),
        column = %config.key_column,
        "splitting"
    );

    let stats = Arc::new(SplitStats::new());
    let reporter = Reporter::spawn(REPORT_EVERY, {
        let stats = Arc::clone(&stats);
        move || stats.snapshot()
    });

    let result = split::process_csv(&config, Arc::clone(&stats)).await;
    reporter.stop().await;

    let snap = stats.snapshot();
    match result {
        Ok(summary) => {
            println!("{}", display::split_summary(&summary, &snap));
            Ok(())
        }
        Err(err) => {
            // partial counts still show how far the run got
            snap.report();
            Err(err)
        }
    }
}

async fn run_publish(args: PublishArgs) -> Result<()> {
    // ─── 1) assemble immutable configs ───────────────────────────────
    let host = resolve_host(&args.collector.host);
    let mut transformer_cfg = TransformerConfig {
        host: host.clone(),
        source: args.collector.source.clone(),
        index: args.collector.index.clone(),
        time_field: args.time_field,
        time_format: args.time_format,
        raw_field: args.raw_field,
        strict_mapping: args.strict_mapping,
        preserve_nulls: args.preserve_nulls,
        discard_invalid: args.discard_invalid,
        default_timestamp: args.default_timestamp,
        time_offset: parse_signed_duration(&args.time_offset)?,
        ..TransformerConfig::default()
    };
    if let Some(fields) = args.exclude_fields {
        transformer_cfg.exclude_fields = fields.into_iter().collect();
    }

    let mut hec_cfg = HecConfig::new(&args.collector.url, &args.collector.token);
    hec_cfg.insecure = args.collector.insecure;
    hec_cfg.timeout = args.timeout;
    hec_cfg.index = args.collector.index;
    hec_cfg.host = host;
    hec_cfg.source = args.collector.source;

    if let Some(path) = &args.config {
        FileConfig::load(path)?.apply(&mut transformer_cfg, &mut hec_cfg);
        info!(file = %path.display(), "loaded config file");
    }

    let publisher_cfg = PublisherConfig {
        concurrency: args.concurrency,
        batch_size: args.batch_size,
        retry_count: args.retry_count,
        retry_wait: args.retry_wait,
        dry_run: args.dry_run,
        extension: args.extension,
    };

    // ─── 2) sink + health check ──────────────────────────────────────
    let sink: Arc<dyn Sink> = if args.dry_run {
        warn!("dry run: events will not be sent");
        Arc::new(DryRunSink)
    } else {
        let client = HecClient::new(&hec_cfg)?;
        info!(endpoint = %client.endpoint(), "collector");
        Arc::new(client)
    };
    if !args.dry_run && !args.no_verify {
        sink.health_check()
            .await
            .context("collector health check failed (use --no-verify to skip)")?;
        info!("collector health check passed");
    }

    // ─── 3) publish ──────────────────────────────────────────────────
    let transformer = EventTransformer::new(Arc::new(transformer_cfg));
    let publisher = Publisher::new(publisher_cfg, transformer, sink);
    let progress = publisher.progress();
    let reporter = Reporter::spawn(REPORT_EVERY, {
        let progress = Arc::clone(&progress);
        move || progress.snapshot()
    });

    let result = publisher.publish_directory(&args.input).await;
    reporter.stop().await;

    // ─── 4) summary, then the run's result ───────────────────────────
    println!("{}", display::publish_summary(&progress.snapshot(), args.dry_run));
    result
}

/// Collector settings for `hec-test`. An empty source falls back to the probe tag.
fn hec_test_config(collector: CollectorArgs) -> HecConfig {
    let mut cfg = HecConfig::new(collector.url, collector.token);
    cfg.insecure = collector.insecure;
    cfg.index = collector.index;
    cfg.host = resolve_host(&collector.host);
    cfg.source = if collector.source.is_empty() {
        hec::PROBE_SOURCETYPE.to_string()
    } else {
        collector.source
    };
    cfg
}

async fn run_hec_test(args: HecTestArgs) -> Result<()> {
    let cfg = hec_test_config(args.collector);
    let client = HecClient::new(&cfg)?;

    println!("Collector test");
    println!("==============");
    println!("URL:        {}", client.endpoint());
    println!("Index:      {}", cfg.index);
    println!("Host:       {}", cfg.host);
    println!("Source:     {}", cfg.source);
    println!("Sourcetype: {}", args.sourcetype);
    println!();

    let outcomes = hec::diagnose(&client, &args.sourcetype, args.events).await;
    let mut failed = 0;
    for (n, outcome) in outcomes.iter().enumerate() {
        match &outcome.result {
            Ok(()) => println!("Stage {}: {} ... ok", n + 1, outcome.stage),
            Err(err) => {
                failed += 1;
                println!("Stage {}: {} ... FAILED: {}", n + 1, outcome.stage, err);
            }
        }
    }
    println!();
    println!("Search for the test events with: sourcetype=\"{}\"", args.sourcetype);

    match outcomes.first() {
        Some(first) if first.result.is_err() => {
            anyhow::bail!("collector is not reachable")
        }
        _ if failed > 0 => anyhow::bail!("{} of {} stages failed", failed, outcomes.len()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hec_test_args(extra: &[&str]) -> HecTestArgs {
        let mut argv = vec!["splitpub", "hec-test", "--url", "https://hec:8088", "--token", "t"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Command::HecTest(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn hec_test_tags_source_and_sourcetype() {
        let args = hec_test_args(&[]);
        assert_eq!(args.sourcetype, hec::PROBE_SOURCETYPE);
        let cfg = hec_test_config(args.collector);
        assert_eq!(cfg.source, hec::PROBE_SOURCETYPE);
        assert_eq!(cfg.url, "https://hec:8088");
    }

    #[test]
    fn hec_test_keeps_an_explicit_source() {
        let cfg = hec_test_config(hec_test_args(&["--source", "lab"]).collector);
        assert_eq!(cfg.source, "lab");
    }
}
