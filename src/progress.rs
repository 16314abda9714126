// src/progress.rs

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // counters stay meaningful even if a holder panicked
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counters for a split run. Shared by the router and every partition writer.
pub struct SplitStats {
    inner: Mutex<SplitState>,
    started: Instant,
}

struct SplitState {
    records: HashMap<String, u64>,
    /// first-seen order of partitions, for display
    order: Vec<String>,
    analyzed: u64,
    skipped: u64,
    phase: String,
}

/// Point-in-time copy of [`SplitStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct SplitStatsSnapshot {
    /// `(partition, records written)` in first-seen order.
    pub partitions: Vec<(String, u64)>,
    pub analyzed: u64,
    pub skipped: u64,
    pub phase: String,
    pub elapsed: Duration,
}

impl SplitStatsSnapshot {
    pub fn total_records(&self) -> u64 {
        self.partitions.iter().map(|(_, n)| n).sum()
    }
}

impl SplitStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SplitState {
                records: HashMap::new(),
                order: Vec::new(),
                analyzed: 0,
                skipped: 0,
                phase: "initializing".to_string(),
            }),
            started: Instant::now(),
        }
    }

    pub fn increment_record(&self, partition: &str) {
        let mut s = lock(&self.inner);
        match s.records.get_mut(partition) {
            Some(n) => *n += 1,
            None => {
                s.order.push(partition.to_string());
                s.records.insert(partition.to_string(), 1);
            }
        }
    }

    pub fn increment_analyzed(&self) {
        lock(&self.inner).analyzed += 1;
    }

    pub fn increment_skipped(&self) {
        lock(&self.inner).skipped += 1;
    }

    pub fn set_phase(&self, phase: &str) {
        lock(&self.inner).phase = phase.to_string();
    }

    pub fn snapshot(&self) -> SplitStatsSnapshot {
        let s = lock(&self.inner);
        SplitStatsSnapshot {
            partitions: s
                .order
                .iter()
                .map(|k| (k.clone(), s.records.get(k).copied().unwrap_or(0)))
                .collect(),
            analyzed: s.analyzed,
            skipped: s.skipped,
            phase: s.phase.clone(),
            elapsed: self.started.elapsed(),
        }
    }
}

impl Default for SplitStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for a publish run. Every update takes the lock once, so a snapshot
/// never mixes values from two different updates.
pub struct Progress {
    inner: Mutex<ProgressState>,
    started: Instant,
}

#[derive(Default)]
struct ProgressState {
    total_files: usize,
    processed_files: usize,
    total_events: usize,
    published_events: usize,
    failed_events: usize,
    current_file: String,
    status: String,
}

/// Point-in-time copy of [`Progress`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub processed_files: usize,
    pub total_files: usize,
    pub published_events: usize,
    pub total_events: usize,
    pub failed_events: usize,
    pub current_file: String,
    pub status: String,
    pub elapsed: Duration,
    /// Remaining time at the current publish rate, once anything has been published.
    pub estimated_remaining: Option<Duration>,
}

impl ProgressSnapshot {
    /// Published events per second over the whole run.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.published_events as f64 / secs
        } else {
            0.0
        }
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ProgressState::default()),
            started: Instant::now(),
        }
    }

    pub fn set_total_files(&self, total: usize) {
        lock(&self.inner).total_files = total;
    }

    pub fn set_status(&self, status: impl Into<String>) {
        lock(&self.inner).status = status.into();
    }

    /// A file has been transformed and its events are now pending.
    pub fn add_total_events(&self, events: usize, file: &str) {
        let mut s = lock(&self.inner);
        s.total_events += events;
        s.current_file = file.to_string();
    }

    pub fn record_published(&self, events: usize, file: &str) {
        let mut s = lock(&self.inner);
        s.published_events += events;
        s.current_file = file.to_string();
    }

    pub fn record_failed(&self, events: usize, file: &str) {
        let mut s = lock(&self.inner);
        s.failed_events += events;
        s.current_file = file.to_string();
    }

    pub fn finish_file(&self) {
        let mut s = lock(&self.inner);
        s.processed_files += 1;
        s.current_file.clear();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let s = lock(&self.inner);
        let elapsed = self.started.elapsed();
        let estimated_remaining = if s.published_events > 0 && s.total_events > s.published_events
        {
            let rate = s.published_events as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
            let remaining = (s.total_events - s.published_events) as f64;
            Some(Duration::from_secs_f64(remaining / rate))
        } else {
            None
        };
        ProgressSnapshot {
            processed_files: s.processed_files,
            total_files: s.total_files,
            published_events: s.published_events,
            total_events: s.total_events,
            failed_events: s.failed_events,
            current_file: s.current_file.clone(),
            status: s.status.clone(),
            elapsed,
            estimated_remaining,
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}
