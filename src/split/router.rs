// src/split/router.rs

use anyhow::{bail, Result};
use csv::StringRecord;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{
    analyze::PartitionSchema,
    sanitize::{partition_key, sanitize_filename},
    writer::PartitionWriter,
};
use crate::progress::SplitStats;

/// Per-partition queue depth. A full queue blocks the router.
pub const QUEUE_CAPACITY: usize = 1_000;

/// A writer task the router has started.
pub struct SpawnedPartition {
    pub key: String,
    pub path: PathBuf,
    pub columns: Vec<String>,
    pub handle: JoinHandle<Result<u64>>,
}

/// Pass 2: fans rows out to one writer task per partition.
///
/// The router is the only owner of the key → queue map; writers only ever see
/// the receiving end of their own queue. Runs on a blocking thread and spawns
/// writers onto `runtime`.
pub struct PartitionRouter {
    runtime: Handle,
    schemas: HashMap<String, Arc<PartitionSchema>>,
    queues: HashMap<String, mpsc::Sender<StringRecord>>,
    spawned: Vec<SpawnedPartition>,
    output_dir: PathBuf,
    extension: String,
    key_idx: usize,
    stats: Arc<SplitStats>,
}

impl PartitionRouter {
    pub fn new(
        runtime: Handle,
        schemas: HashMap<String, PartitionSchema>,
        output_dir: &Path,
        extension: &str,
        key_idx: usize,
        stats: Arc<SplitStats>,
    ) -> Self {
        Self {
            runtime,
            schemas: schemas
                .into_iter()
                .map(|(k, s)| (k, Arc::new(s)))
                .collect(),
            queues: HashMap::new(),
            spawned: Vec::new(),
            output_dir: output_dir.to_path_buf(),
            extension: extension.to_string(),
            key_idx,
            stats,
        }
    }

    /// Send one row to its partition, starting the partition's writer on first sight.
    /// Blocks while that partition's queue is full.
    pub fn route(&mut self, row: StringRecord) -> Result<()> {
        if row.len() <= self.key_idx {
            warn!(fields = row.len(), record = ?row, "record has insufficient fields, skipping");
            return Ok(());
        }
        let key = partition_key(&row[self.key_idx]).to_string();

        if !self.queues.contains_key(&key) {
            self.open_partition(&key)?;
        }
        if let Some(queue) = self.queues.get(&key) {
            if queue.blocking_send(row).is_err() {
                // only happens if the writer task died; its join result reports why
                warn!(key = %key, "partition writer is gone, record not queued");
            }
        }
        Ok(())
    }

    fn open_partition(&mut self, key: &str) -> Result<()> {
        let schema = match self.schemas.get(key) {
            Some(schema) => Arc::clone(schema),
            None => bail!(
                "partition `{}` was not seen during analysis; the input changed between passes",
                key
            ),
        };
        let path = self
            .output_dir
            .join(format!("{}.{}", sanitize_filename(key), self.extension));

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let writer = PartitionWriter::new(key, &path, Arc::clone(&schema), Arc::clone(&self.stats));
        let handle = self.runtime.spawn(writer.run(rx));

        info!(key = %key, file = %path.display(), columns = schema.len(), "new partition");
        self.queues.insert(key.to_string(), tx);
        self.spawned.push(SpawnedPartition {
            key: key.to_string(),
            path,
            columns: schema.names.clone(),
            handle,
        });
        Ok(())
    }

    pub fn partitions(&self) -> usize {
        self.spawned.len()
    }

    /// Close every queue and hand back the running writers.
    pub fn finish(self) -> Vec<SpawnedPartition> {
        debug!(partitions = self.spawned.len(), "closing partition queues");
        drop(self.queues);
        self.spawned
    }
}
