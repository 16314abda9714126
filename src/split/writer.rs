// src/split/writer.rs

use anyhow::{anyhow, Context, Result};
use csv::StringRecord;
use std::{path::PathBuf, sync::Arc};
use tokio::{fs::File, io::AsyncWriteExt, sync::mpsc};
use tracing::{debug, error};

use super::analyze::PartitionSchema;
use crate::progress::SplitStats;

/// Rows written between flushes of the in-memory buffer to disk.
pub const FLUSH_EVERY: u64 = 1_000;

/// Drains one partition's queue into its output table.
pub struct PartitionWriter {
    key: String,
    path: PathBuf,
    schema: Arc<PartitionSchema>,
    stats: Arc<SplitStats>,
}

impl PartitionWriter {
    pub fn new(
        key: impl Into<String>,
        path: impl Into<PathBuf>,
        schema: Arc<PartitionSchema>,
        stats: Arc<SplitStats>,
    ) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            schema,
            stats,
        }
    }

    /// Write every row received until the queue closes. Returns the row count.
    ///
    /// On failure the queue is still drained to the end so the router never
    /// blocks on a dead partition.
    pub async fn run(self, mut rows: mpsc::Receiver<StringRecord>) -> Result<u64> {
        let result = self.write_all(&mut rows).await;
        if let Err(err) = &result {
            error!(key = %self.key, file = %self.path.display(), error = %err, "partition writer failed");
            let mut discarded = 0u64;
            while rows.recv().await.is_some() {
                discarded += 1;
            }
            debug!(key = %self.key, discarded, "drained failed partition");
        }
        result.with_context(|| format!("writing {}", self.path.display()))
    }

    async fn write_all(&self, rows: &mut mpsc::Receiver<StringRecord>) -> Result<u64> {
        // create (or truncate) the table and write its header
        let mut file = File::create(&self.path)
            .await
            .with_context(|| format!("creating {}", self.path.display()))?;
        let mut buf = RecordBuffer::new();
        buf.write(self.schema.names.iter().map(String::as_str))?;

        let mut written = 0u64;
        while let Some(row) = rows.recv().await {
            buf.write(self.schema.project(&row))?;
            written += 1;
            self.stats.increment_record(&self.key);

            if written % FLUSH_EVERY == 0 {
                file.write_all(&buf.take()?).await?;
                file.flush().await?;
            }
        }

        file.write_all(&buf.take()?).await?;
        file.flush().await?;
        file.sync_all().await?;

        debug!(key = %self.key, rows = written, file = %self.path.display(), "partition complete");
        Ok(written)
    }
}

/// CSV encoder over a growable byte buffer.
struct RecordBuffer {
    inner: csv::Writer<Vec<u8>>,
}

impl RecordBuffer {
    fn new() -> Self {
        Self {
            inner: Self::fresh(),
        }
    }

    fn fresh() -> csv::Writer<Vec<u8>> {
        csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::with_capacity(64 * 1024))
    }

    fn write<'a>(&mut self, fields: impl IntoIterator<Item = &'a str>) -> Result<()> {
        self.inner
            .write_record(fields)
            .context("encoding output record")
    }

    /// Hand back everything encoded so far and start a new buffer.
    fn take(&mut self) -> Result<Vec<u8>> {
        let full = std::mem::replace(&mut self.inner, Self::fresh());
        full.into_inner()
            .map_err(|err| anyhow!("flushing record buffer: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn schema(names: &[&str], indices: &[usize]) -> Arc<PartitionSchema> {
        Arc::new(PartitionSchema {
            names: names.iter().map(|s| s.to_string()).collect(),
            indices: indices.to_vec(),
        })
    }

    #[tokio::test]
    async fn writes_projected_rows_in_order() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("x.csv");
        let stats = Arc::new(SplitStats::new());
        let writer = PartitionWriter::new("x", &path, schema(&["t", "b"], &[0, 2]), stats.clone());

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(writer.run(rx));
        for (t, b) in [("1", "p"), ("2", "q"), ("3", "r")] {
            tx.send(StringRecord::from(vec![t, "x", b])).await?;
        }
        tx.send(StringRecord::from(vec!["4", "x"])).await?;
        drop(tx);

        assert_eq!(handle.await??, 4);
        let text = std::fs::read_to_string(&path)?;
        assert_eq!(text, "t,b\n1,p\n2,q\n3,r\n4,\n");
        assert_eq!(stats.snapshot().partitions, vec![("x".to_string(), 4)]);
        Ok(())
    }

    #[tokio::test]
    async fn flushes_across_the_cadence_boundary() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("big.csv");
        let writer = PartitionWriter::new(
            "big",
            &path,
            schema(&["n"], &[0]),
            Arc::new(SplitStats::new()),
        );

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(writer.run(rx));
        let total = FLUSH_EVERY * 2 + 7;
        for n in 0..total {
            tx.send(StringRecord::from(vec![n.to_string()])).await?;
        }
        drop(tx);

        assert_eq!(handle.await??, total);
        let text = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len() as u64, total + 1);
        assert_eq!(lines[1], "0");
        assert_eq!(lines.last().copied(), Some((total - 1).to_string().as_str()));
        Ok(())
    }

    #[tokio::test]
    async fn failed_writer_still_drains_its_queue() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("missing").join("x.csv");
        let writer = PartitionWriter::new(
            "x",
            &path,
            schema(&["a"], &[0]),
            Arc::new(SplitStats::new()),
        );

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(writer.run(rx));
        // more rows than the queue holds; must not block forever
        for n in 0..10 {
            tx.send(StringRecord::from(vec![n.to_string()])).await?;
        }
        drop(tx);

        assert!(handle.await?.is_err());
        Ok(())
    }
}
