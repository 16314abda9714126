// src/publish/pool.rs

use anyhow::{anyhow, bail, Context, Result};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use super::{
    event::Event,
    sink::{Sink, SinkError},
    transform::{sourcetype_for, EventTransformer},
};
use crate::{
    config::PublisherConfig,
    progress::{Progress, ProgressSnapshot},
};

type WorkQueue = Arc<Mutex<mpsc::Receiver<PathBuf>>>;

/// Delivers every table in a directory to a sink through a fixed pool of workers.
pub struct Publisher {
    config: PublisherConfig,
    transformer: EventTransformer,
    sink: Arc<dyn Sink>,
    progress: Arc<Progress>,
    updates: Option<mpsc::Sender<ProgressSnapshot>>,
}

impl Publisher {
    pub fn new(config: PublisherConfig, transformer: EventTransformer, sink: Arc<dyn Sink>) -> Self {
        Self {
            config: config.normalized(),
            transformer,
            sink,
            progress: Arc::new(Progress::new()),
            updates: None,
        }
    }

    /// Push a snapshot after every batch. Snapshots are dropped when the channel is full.
    pub fn with_progress_channel(mut self, updates: mpsc::Sender<ProgressSnapshot>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Publish every `*.<extension>` file in `directory`.
    ///
    /// All queued files are attempted; the first file error is returned once
    /// every worker has finished.
    #[instrument(level = "info", skip(self), fields(dir = %directory.display()))]
    pub async fn publish_directory(&self, directory: &Path) -> Result<()> {
        let files = find_input_files(directory, &self.config.extension)?;
        if files.is_empty() {
            bail!(
                "no .{} files found in {}",
                self.config.extension,
                directory.display()
            );
        }
        info!(files = files.len(), workers = self.config.concurrency, "publishing");
        self.progress.set_total_files(files.len());
        self.progress.set_status("starting");

        // ─── fill the work queue, then close it ─────────────────────────
        let (tx, rx) = mpsc::channel(files.len());
        for file in files {
            tx.send(file)
                .await
                .map_err(|_| anyhow!("work queue closed early"))?;
        }
        drop(tx);
        let queue: WorkQueue = Arc::new(Mutex::new(rx));

        // ─── spawn workers ──────────────────────────────────────────────
        let mut handles = Vec::with_capacity(self.config.concurrency);
        for id in 0..self.config.concurrency {
            let worker = Worker {
                id,
                config: self.config.clone(),
                transformer: self.transformer.clone(),
                sink: Arc::clone(&self.sink),
                progress: Arc::clone(&self.progress),
                updates: self.updates.clone(),
            };
            handles.push(tokio::spawn(worker.run(Arc::clone(&queue))));
        }

        // ─── collect the first error ────────────────────────────────────
        let mut first_error: Option<anyhow::Error> = None;
        for handle in handles {
            match handle.await {
                Ok(Some(err)) => {
                    first_error.get_or_insert(err);
                }
                Ok(None) => {}
                Err(join_err) => {
                    first_error.get_or_insert_with(|| anyhow!("publish worker panicked: {}", join_err));
                }
            }
        }

        self.progress.set_status(if first_error.is_some() {
            "finished with errors"
        } else if self.config.dry_run {
            "dry run complete"
        } else {
            "complete"
        });
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Files directly under `directory` with the given extension, sorted.
pub fn find_input_files(directory: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let pattern = directory.join(format!("*.{}", extension));
    let pattern = pattern
        .to_str()
        .ok_or_else(|| anyhow!("non-UTF-8 path {}", directory.display()))?;
    let mut files = Vec::new();
    for entry in glob::glob(pattern).context("building file pattern")? {
        let path = entry.context("reading directory entry")?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

struct Worker {
    id: usize,
    config: PublisherConfig,
    transformer: EventTransformer,
    sink: Arc<dyn Sink>,
    progress: Arc<Progress>,
    updates: Option<mpsc::Sender<ProgressSnapshot>>,
}

impl Worker {
    /// Pull files until the queue is empty. Returns this worker's first error.
    async fn run(self, queue: WorkQueue) -> Option<anyhow::Error> {
        let mut first_error = None;
        loop {
            // lock only long enough to take one path
            let next = queue.lock().await.recv().await;
            let path = match next {
                Some(path) => path,
                None => break,
            };
            if let Err(err) = self.publish_file(&path).await {
                error!(worker = self.id, file = %path.display(), error = %format!("{:#}", err), "file failed");
                first_error.get_or_insert(err);
            }
        }
        debug!(worker = self.id, "worker done");
        first_error
    }

    async fn publish_file(&self, path: &Path) -> Result<()> {
        let name = file_label(path);
        let sourcetype = sourcetype_for(path);
        debug!(worker = self.id, file = %path.display(), sourcetype = %sourcetype, "processing");
        self.progress.set_status(format!("processing {}", name));

        // ─── 1) transform on the blocking pool ──────────────────────────
        let events = {
            let transformer = self.transformer.clone();
            let owned = path.to_path_buf();
            let sourcetype = sourcetype.clone();
            tokio::task::spawn_blocking(move || transformer.transform_file(&owned, &sourcetype))
                .await
                .context("transform task panicked")?
                .with_context(|| format!("transforming {}", path.display()))?
        };
        debug!(file = %name, events = events.len(), "transformed");
        self.progress.add_total_events(events.len(), &name);

        if self.config.dry_run {
            self.progress.record_published(events.len(), &name);
            self.progress.finish_file();
            self.notify();
            return Ok(());
        }

        // ─── 2) deliver batch by batch ──────────────────────────────────
        for (n, batch) in events.chunks(self.config.batch_size).enumerate() {
            match self.deliver(batch, &name).await {
                Ok(()) => self.progress.record_published(batch.len(), &name),
                Err(err) => {
                    self.progress.record_failed(batch.len(), &name);
                    self.notify();
                    return Err(anyhow!(err)).with_context(|| {
                        format!(
                            "batch {} of {} failed after {} attempts",
                            n + 1,
                            path.display(),
                            self.config.retry_count
                        )
                    });
                }
            }
            self.notify();
        }

        self.progress.finish_file();
        self.notify();
        info!(file = %name, events = events.len(), "published");
        Ok(())
    }

    /// Up to `retry_count` attempts with a fixed wait between them.
    async fn deliver(&self, batch: &[Event], file: &str) -> Result<(), SinkError> {
        let attempts = self.config.retry_count.max(1);
        let mut attempt = 1;
        loop {
            match self.sink.send_batch(batch).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    warn!(file, attempt, of = attempts, error = %err, "batch failed, retrying");
                    self.progress
                        .set_status(format!("retrying batch ({}/{})", attempt + 1, attempts));
                    tokio::time::sleep(self.config.retry_wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn notify(&self) {
        if let Some(tx) = &self.updates {
            // a full channel only costs the observer one refresh
            let _ = tx.try_send(self.progress.snapshot());
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
