// src/display.rs

use std::{fmt::Write as _, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle, time};
use tracing::info;

use crate::{
    progress::{ProgressSnapshot, SplitStatsSnapshot},
    split::SplitSummary,
};

/// A snapshot that knows how to log itself as one progress line.
pub trait Report: Send + 'static {
    fn report(&self);
}

impl Report for SplitStatsSnapshot {
    fn report(&self) {
        info!(
            phase = %self.phase,
            analyzed = self.analyzed,
            written = self.total_records(),
            partitions = self.partitions.len(),
            elapsed = %format_elapsed(self.elapsed),
            "split progress"
        );
    }
}

impl Report for ProgressSnapshot {
    fn report(&self) {
        let eta = self
            .estimated_remaining
            .map(format_elapsed)
            .unwrap_or_else(|| "-".to_string());
        info!(
            status = %self.status,
            files = %format!("{}/{}", self.processed_files, self.total_files),
            events = %format!("{}/{}", self.published_events, self.total_events),
            failed = self.failed_events,
            current = %self.current_file,
            rate = %format!("{:.1}/s", self.rate()),
            eta = %eta,
            "publish progress"
        );
    }
}

/// Background task logging a fresh snapshot on a fixed interval.
pub struct Reporter {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Reporter {
    /// Start polling `snapshot` every `every`. The first report comes after one interval.
    pub fn spawn<S, F>(every: Duration, snapshot: F) -> Self
    where
        S: Report,
        F: Fn() -> S + Send + 'static,
    {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            // interval fires immediately once
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => snapshot().report(),
                }
            }
        });
        Self { stop, handle }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.await;
    }
}

/// `1h 2m 3s` with sub-second precision dropped.
pub fn format_elapsed(elapsed: Duration) -> String {
    humantime::format_duration(Duration::from_secs(elapsed.as_secs())).to_string()
}

pub fn split_summary(summary: &SplitSummary, stats: &SplitStatsSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Split summary");
    let _ = writeln!(out, "=============");
    for (key, rows) in &stats.partitions {
        let _ = writeln!(out, "  {:<40} {:>10}", key, rows);
    }
    let _ = writeln!(out, "  {:<40} {:>10}", "total", summary.total_rows());
    let _ = writeln!(out, "Partitions:     {}", summary.outputs.len());
    let _ = writeln!(out, "Rows analyzed:  {}", summary.analyzed);
    if summary.skipped > 0 {
        let _ = writeln!(out, "Rows skipped:   {}", summary.skipped);
    }
    let _ = write!(out, "Elapsed:        {}", format_elapsed(stats.elapsed));
    out
}

pub fn publish_summary(snap: &ProgressSnapshot, dry_run: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Publish summary");
    let _ = writeln!(out, "===============");
    let _ = writeln!(
        out,
        "Files:          {}/{}",
        snap.processed_files, snap.total_files
    );
    let _ = writeln!(
        out,
        "Events:         {}/{}",
        snap.published_events, snap.total_events
    );
    if snap.failed_events > 0 {
        let _ = writeln!(out, "Failed events:  {}", snap.failed_events);
    }
    let _ = writeln!(out, "Elapsed:        {}", format_elapsed(snap.elapsed));
    let _ = write!(out, "Average rate:   {:.1} events/s", snap.rate());
    if dry_run {
        let _ = write!(out, "\nDry run: no events were sent");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct Counted;

    impl Report for Counted {
        fn report(&self) {}
    }

    #[tokio::test]
    async fn reporter_polls_until_stopped() {
        let polls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&polls);
        let reporter = Reporter::spawn(Duration::from_millis(10), move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Counted
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        reporter.stop().await;

        let after_stop = polls.load(Ordering::SeqCst);
        assert!(after_stop >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(polls.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn publish_summary_mentions_failures_and_dry_run() {
        let snap = ProgressSnapshot {
            processed_files: 2,
            total_files: 3,
            published_events: 150,
            total_events: 200,
            failed_events: 50,
            current_file: String::new(),
            status: "finished with errors".into(),
            elapsed: Duration::from_secs(75),
            estimated_remaining: None,
        };
        let text = publish_summary(&snap, true);
        assert!(text.contains("Files:          2/3"));
        assert!(text.contains("Failed events:  50"));
        assert!(text.contains("1m 15s"));
        assert!(text.contains("Dry run"));
    }

    #[test]
    fn elapsed_drops_fractions() {
        assert_eq!(format_elapsed(Duration::from_millis(3_750)), "3s");
    }
}
