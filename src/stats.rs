//! Latency statistics: integer-microsecond histograms with optional
//! per-epoch rollups.
//!
//! The histogram is a `BTreeMap` from latency bucket to count, so percentile
//! scans walk buckets in order without sorting. When an epoch length is set,
//! a second histogram accumulates the current window and is snapshotted into
//! the epoch history whenever the clock passes the window boundary.

use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::Time;

/// Aggregate latency summary over a histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Completed operations per second.
    pub throughput: f64,
    pub average: f64,
    pub median: Time,
    pub p90: Time,
    pub p99: Time,
}

fn percentiles(latencies: &BTreeMap<Time, u64>, total_ops: u64) -> (f64, Time, Time, Time) {
    let mut count = 0u64;
    let mut total_latency = 0u64;
    let mut median = None;
    let mut p90 = None;
    let mut p99 = None;
    for (&latency, &n) in latencies {
        total_latency += latency * n;
        count += n;
        if median.is_none() && count >= total_ops / 2 {
            median = Some(latency);
        }
        if p90.is_none() && count as f64 >= total_ops as f64 * 0.9 {
            p90 = Some(latency);
        }
        if p99.is_none() && count as f64 >= total_ops as f64 * 0.99 {
            p99 = Some(latency);
        }
    }
    let average = total_latency as f64 / total_ops as f64;
    (
        average,
        median.unwrap_or(0),
        p90.unwrap_or(0),
        p99.unwrap_or(0),
    )
}

/// Collects operation latencies over a run.
#[derive(Debug, Default)]
pub struct Stats {
    latencies: BTreeMap<Time, u64>,
    total_ops: u64,
    end_time: Time,
    epoch_len: Time,
    last_epoch: Time,
    epoch_latencies: BTreeMap<Time, u64>,
    epoch_total_ops: u64,
    all_epoch_latencies: Vec<(u64, BTreeMap<Time, u64>)>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables per-epoch rollups with the given window, in microseconds.
    pub fn with_epoch_len(epoch_len: Time) -> Self {
        Self {
            epoch_len,
            ..Self::default()
        }
    }

    pub fn report_latency(&mut self, latency: Time) {
        *self.latencies.entry(latency).or_insert(0) += 1;
        self.total_ops += 1;
        if self.epoch_len > 0 {
            *self.epoch_latencies.entry(latency).or_insert(0) += 1;
            self.epoch_total_ops += 1;
        }
    }

    pub fn report_end_time(&mut self, end_time: Time) {
        self.end_time = end_time;
    }

    /// Rolls the epoch window when the clock passes its boundary.
    pub fn run(&mut self, time: Time) {
        if self.epoch_len > 0 && time - self.last_epoch > self.epoch_len {
            self.all_epoch_latencies
                .push((self.epoch_total_ops, std::mem::take(&mut self.epoch_latencies)));
            self.epoch_total_ops = 0;
            self.last_epoch = time;
        }
    }

    pub fn total_ops(&self) -> u64 {
        self.total_ops
    }

    pub fn end_time(&self) -> Time {
        self.end_time
    }

    pub fn latencies(&self) -> &BTreeMap<Time, u64> {
        &self.latencies
    }

    pub fn epochs(&self) -> &[(u64, BTreeMap<Time, u64>)] {
        &self.all_epoch_latencies
    }

    /// Whole-run summary; `None` until operations completed and an end time
    /// was reported.
    pub fn summary(&self) -> Option<Summary> {
        if self.total_ops == 0 || self.end_time == 0 {
            return None;
        }
        let (average, median, p90, p99) = percentiles(&self.latencies, self.total_ops);
        Some(Summary {
            throughput: self.total_ops as f64 / (self.end_time as f64 / 1_000_000.0),
            average,
            median,
            p90,
            p99,
        })
    }

    /// Writes the latency CDF, one `latency_us cumulative_fraction` pair per
    /// line.
    pub fn write_cdf<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut count = 0u64;
        for (&latency, &n) in &self.latencies {
            count += n;
            writeln!(w, "{} {}", latency, count as f64 / self.total_ops as f64)?;
        }
        Ok(())
    }

    /// Writes one `epoch_ms average median p90 p99` line per recorded epoch.
    /// `epoch_ms` is the epoch length in milliseconds, matching the window
    /// the rollups were collected over.
    pub fn write_epochs<W: Write>(&self, w: &mut W, epoch_ms: Time) -> io::Result<()> {
        let mut time = epoch_ms;
        for (total_ops, latencies) in &self.all_epoch_latencies {
            if *total_ops == 0 {
                time += epoch_ms;
                continue;
            }
            let (average, median, p90, p99) = percentiles(latencies, *total_ops);
            writeln!(w, "{time} {average} {median} {p90} {p99}")?;
            time += epoch_ms;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_percentiles() {
        let mut stats = Stats::new();
        for latency in 1..=100 {
            stats.report_latency(latency);
        }
        stats.report_end_time(1_000_000);

        let summary = stats.summary().expect("has data");
        assert_eq!(summary.throughput, 100.0);
        assert_eq!(summary.average, 50.5);
        assert_eq!(summary.median, 50);
        assert_eq!(summary.p90, 90);
        assert_eq!(summary.p99, 99);
    }

    #[test]
    fn summary_requires_data_and_end_time() {
        let mut stats = Stats::new();
        assert!(stats.summary().is_none());
        stats.report_latency(10);
        assert!(stats.summary().is_none());
        stats.report_end_time(500);
        assert!(stats.summary().is_some());
    }

    #[test]
    fn epoch_rollover_snapshots_window() {
        let mut stats = Stats::with_epoch_len(1000);
        stats.report_latency(10);
        stats.report_latency(20);
        stats.run(500); // still inside the first window
        assert!(stats.epochs().is_empty());

        stats.run(1500);
        assert_eq!(stats.epochs().len(), 1);
        assert_eq!(stats.epochs()[0].0, 2);

        stats.report_latency(30);
        stats.run(3000);
        assert_eq!(stats.epochs().len(), 2);
        assert_eq!(stats.epochs()[0].0, 2);
        assert_eq!(stats.epochs()[1].0, 1);
        // The cumulative histogram keeps everything.
        assert_eq!(stats.total_ops(), 3);
    }

    #[test]
    fn cdf_lines_are_cumulative() {
        let mut stats = Stats::new();
        stats.report_latency(10);
        stats.report_latency(10);
        stats.report_latency(40);
        stats.report_latency(90);

        let mut out = Vec::new();
        stats.write_cdf(&mut out).expect("write succeeds");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["10 0.5", "40 0.75", "90 1"]);
    }

    #[test]
    fn epoch_lines_report_percentiles() {
        let mut stats = Stats::with_epoch_len(10_000);
        for latency in [5, 10, 15] {
            stats.report_latency(latency);
        }
        stats.run(20_000);

        let mut out = Vec::new();
        stats.write_epochs(&mut out, 10).expect("write succeeds");
        let text = String::from_utf8(out).expect("utf8");
        // median uses the count >= total/2 rule, so 3 samples yield the first
        assert_eq!(text.lines().next(), Some("10 10 5 15 15"));
    }
}
