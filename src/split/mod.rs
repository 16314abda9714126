// src/split/mod.rs

pub mod analyze;
pub mod router;
pub mod sanitize;
pub mod writer;

use anyhow::{anyhow, bail, Context, Result};
use csv::StringRecord;
use futures::stream::{FuturesUnordered, StreamExt};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::runtime::Handle;
use tracing::{info, instrument, warn};

use crate::{config::SplitConfig, progress::SplitStats};
use analyze::analyze_rows;
use router::{PartitionRouter, SpawnedPartition};

pub use analyze::{PartitionSchema, SchemaAnalysis};
pub use sanitize::{sanitize_filename, UNKNOWN_KEY};

/// One output table produced by a split run.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionOutput {
    pub key: String,
    pub path: PathBuf,
    pub columns: Vec<String>,
    pub rows: u64,
}

/// Result of a split run that finished without error.
#[derive(Debug, Clone, Default)]
pub struct SplitSummary {
    pub outputs: Vec<PartitionOutput>,
    pub analyzed: u64,
    pub skipped: u64,
}

impl SplitSummary {
    pub fn total_rows(&self) -> u64 {
        self.outputs.iter().map(|o| o.rows).sum()
    }
}

fn open_reader(path: &Path) -> Result<csv::Reader<File>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file))
}

fn read_header(reader: &mut csv::Reader<File>) -> Result<Vec<String>> {
    let header = reader.headers().context("reading header")?;
    Ok(header.iter().map(str::to_string).collect())
}

/// Index of `column` in `header`.
pub fn find_column(header: &[String], column: &str) -> Result<usize> {
    header
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| anyhow!("partition column `{}` not found in header", column))
}

/// Split `config.input` into one table per distinct value of the key column.
///
/// The input is read twice: pass 1 learns which columns each partition uses,
/// pass 2 routes rows to per-partition writer tasks. Waits for every writer;
/// the first writer failure is returned once all of them have finished.
#[instrument(level = "info", skip(config, stats), fields(input = %config.input.display()))]
pub async fn process_csv(config: &SplitConfig, stats: Arc<SplitStats>) -> Result<SplitSummary> {
    let runtime = Handle::current();
    let cfg = config.clone();
    let pass_stats = Arc::clone(&stats);

    let (spawned, routing) =
        tokio::task::spawn_blocking(move || run_passes(&cfg, pass_stats, runtime))
            .await
            .context("split task panicked")??;

    let mut outputs = Vec::with_capacity(spawned.len());
    let mut first_error: Option<anyhow::Error> = None;

    let mut pending: FuturesUnordered<_> = spawned
        .into_iter()
        .map(|p| async move {
            let result = p.handle.await;
            (p.key, p.path, p.columns, result)
        })
        .collect();

    while let Some((key, path, columns, result)) = pending.next().await {
        match result {
            Ok(Ok(rows)) => outputs.push(PartitionOutput {
                key,
                path,
                columns,
                rows,
            }),
            Ok(Err(err)) => {
                warn!(key = %key, error = %err, "partition failed");
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                warn!(key = %key, error = %join_err, "partition writer panicked");
                first_error.get_or_insert_with(|| {
                    anyhow!("writer for partition `{}` panicked: {}", key, join_err)
                });
            }
        }
    }

    stats.set_phase("done");
    routing?;
    if let Some(err) = first_error {
        return Err(err);
    }

    outputs.sort_by(|a, b| a.key.cmp(&b.key));
    let snap = stats.snapshot();
    info!(
        partitions = outputs.len(),
        rows = outputs.iter().map(|o| o.rows).sum::<u64>(),
        "split complete"
    );
    Ok(SplitSummary {
        outputs,
        analyzed: snap.analyzed,
        skipped: snap.skipped,
    })
}

/// Both passes, on a blocking thread. The outer error aborts before any writer
/// exists; the inner one is a routing failure reported after writers finish.
fn run_passes(
    config: &SplitConfig,
    stats: Arc<SplitStats>,
    runtime: Handle,
) -> Result<(Vec<SpawnedPartition>, Result<()>)> {
    // ─── pass 1: column usage per partition ─────────────────────────
    let mut reader = open_reader(&config.input)?;
    let header = read_header(&mut reader)?;
    let key_idx = find_column(&header, &config.key_column)?;

    info!("pass 1: analyzing column usage by partition");
    stats.set_phase("analyzing");
    let analysis = analyze_rows(&mut reader, key_idx, &stats)?;
    let schemas = analysis.schemas(&header);
    info!(partitions = schemas.len(), rows = analysis.analyzed, "analysis done");

    // ─── pass 2: fan out to writers ─────────────────────────────────
    let mut reader = open_reader(&config.input)?;
    if read_header(&mut reader)? != header {
        bail!("header of {} changed between passes", config.input.display());
    }

    info!("pass 2: processing records");
    stats.set_phase("processing");
    let mut router = PartitionRouter::new(
        runtime,
        schemas,
        &config.output_dir,
        &config.extension,
        key_idx,
        Arc::clone(&stats),
    );
    let routing = route_all(&mut reader, &mut router);
    Ok((router.finish(), routing))
}

fn route_all(reader: &mut csv::Reader<File>, router: &mut PartitionRouter) -> Result<()> {
    let mut record = StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(false) => return Ok(()),
            Ok(true) => router.route(record.clone())?,
            Err(err) if err.is_io_error() => {
                return Err(err).context("reading input during processing");
            }
            Err(err) => warn!(error = %err, "skipping unreadable record"),
        }
    }
}
