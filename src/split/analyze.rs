// src/split/analyze.rs

use anyhow::{Context, Result};
use csv::StringRecord;
use std::{
    collections::{BTreeSet, HashMap},
    io::Read,
};
use tracing::{debug, warn};

use super::sanitize::partition_key;
use crate::progress::SplitStats;

/// Column indices observed non-empty for one partition.
pub type ColumnUsage = BTreeSet<usize>;

/// Output of the first pass.
#[derive(Debug, Default)]
pub struct SchemaAnalysis {
    pub usage: HashMap<String, ColumnUsage>,
    pub analyzed: u64,
    pub skipped: u64,
}

impl SchemaAnalysis {
    /// Mark every non-empty field of `row` against its partition.
    /// Returns false when the row is too short to carry a key.
    pub fn observe(&mut self, row: &StringRecord, key_idx: usize) -> bool {
        self.analyzed += 1;
        if row.len() <= key_idx {
            self.skipped += 1;
            return false;
        }
        let key = partition_key(&row[key_idx]);
        if !self.usage.contains_key(key) {
            self.usage.insert(key.to_string(), ColumnUsage::new());
        }
        if let Some(used) = self.usage.get_mut(key) {
            for (idx, value) in row.iter().enumerate() {
                if !value.is_empty() {
                    used.insert(idx);
                }
            }
        }
        true
    }

    /// Build the per-partition schema for every key seen.
    pub fn schemas(&self, header: &[String]) -> HashMap<String, PartitionSchema> {
        self.usage
            .iter()
            .map(|(key, used)| (key.clone(), PartitionSchema::from_usage(header, used)))
            .collect()
    }
}

/// The columns written for one partition, in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSchema {
    pub names: Vec<String>,
    pub indices: Vec<usize>,
}

impl PartitionSchema {
    pub fn from_usage(header: &[String], used: &ColumnUsage) -> Self {
        let (indices, names) = header
            .iter()
            .enumerate()
            .filter(|(idx, _)| used.contains(idx))
            .map(|(idx, name)| (idx, name.clone()))
            .unzip();
        Self { names, indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Pick this schema's columns out of `row`; missing trailing fields become empty.
    pub fn project<'a>(&self, row: &'a StringRecord) -> Vec<&'a str> {
        self.indices
            .iter()
            .map(|&idx| row.get(idx).unwrap_or(""))
            .collect()
    }
}

/// Pass 1: stream every row once and record which columns each partition uses.
///
/// Unparseable rows are logged and skipped; only I/O failures end the pass.
pub fn analyze_rows<R: Read>(
    reader: &mut csv::Reader<R>,
    key_idx: usize,
    stats: &SplitStats,
) -> Result<SchemaAnalysis> {
    let mut analysis = SchemaAnalysis::default();
    let mut record = StringRecord::new();

    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                stats.increment_analyzed();
                if !analysis.observe(&record, key_idx) {
                    stats.increment_skipped();
                }
            }
            Err(err) if err.is_io_error() => {
                return Err(err).context("reading input during analysis");
            }
            Err(err) => {
                warn!(error = %err, "skipping unreadable record during analysis");
            }
        }
    }

    debug!(
        partitions = analysis.usage.len(),
        analyzed = analysis.analyzed,
        skipped = analysis.skipped,
        "analysis complete"
    );
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(data: &str) -> csv::Reader<&[u8]> {
        csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(data.as_bytes())
    }

    fn header(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn collects_non_empty_columns_per_partition() -> Result<()> {
        let data = "time,sourcetype,a,b\n1,x,,1\n2,x,2,\n3,y,3,4\n";
        let stats = SplitStats::new();
        let analysis = analyze_rows(&mut reader(data), 1, &stats)?;

        assert_eq!(analysis.analyzed, 3);
        assert_eq!(analysis.usage["x"], BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(analysis.usage["y"], BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(stats.snapshot().analyzed, 3);
        Ok(())
    }

    #[test]
    fn column_empty_everywhere_is_dropped() -> Result<()> {
        let data = "time,sourcetype,a,b\n1,x,,1\n2,x,,\n";
        let analysis = analyze_rows(&mut reader(data), 1, &SplitStats::new())?;
        let schemas = analysis.schemas(&header(&["time", "sourcetype", "a", "b"]));

        assert_eq!(schemas["x"].names, vec!["time", "sourcetype", "b"]);
        assert_eq!(schemas["x"].indices, vec![0, 1, 3]);
        Ok(())
    }

    #[test]
    fn empty_key_and_short_rows() -> Result<()> {
        let data = "time,a,sourcetype\n1,z,\n2\n3,q,web\n";
        let stats = SplitStats::new();
        let analysis = analyze_rows(&mut reader(data), 2, &stats)?;

        assert!(analysis.usage.contains_key("unknown"));
        assert!(analysis.usage.contains_key("web"));
        assert_eq!(analysis.skipped, 1);
        assert_eq!(stats.snapshot().skipped, 1);
        Ok(())
    }

    #[test]
    fn usage_does_not_depend_on_row_order() -> Result<()> {
        let forward = "k,a,b\nx,1,\nx,,2\ny,3,\n";
        let backward = "k,a,b\ny,3,\nx,,2\nx,1,\n";
        let f = analyze_rows(&mut reader(forward), 0, &SplitStats::new())?;
        let b = analyze_rows(&mut reader(backward), 0, &SplitStats::new())?;
        assert_eq!(f.usage, b.usage);
        Ok(())
    }

    #[test]
    fn projection_pads_short_rows() {
        let schema = PartitionSchema {
            names: header(&["a", "c"]),
            indices: vec![0, 2],
        };
        let row = StringRecord::from(vec!["1", "2"]);
        assert_eq!(schema.project(&row), vec!["1", ""]);
        assert_eq!(schema.len(), 2);
    }
}
