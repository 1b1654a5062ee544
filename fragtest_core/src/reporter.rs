// Data aggregation and preparing data for reports

use crate::config::RunConfig;
use crate::driver::{RunCounters, RunOutcome};
use crate::packet::TestSize;
use crate::state::{StreamActivity, TestRunState};
use crate::stats::{self, SizeStatistics};
use crate::verdict::{self, Verdict};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

/// Bucket width of the latency timeline.
pub const TIMELINE_BUCKET_MS: i64 = 1000;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LatencyTimeline {
    pub test_size: TestSize,
    /// `(seconds since run start, mean one-way delay in ms)` per bucket that has samples.
    pub points: Vec<(f64, f64)>,
}

#[derive(Serialize, Debug, Clone)]
pub struct RunReport {
    pub start_time_utc: String,
    pub end_time_utc: String,
    pub test_duration_actual_secs: f64,
    pub config: RunConfig,
    pub sizes: Vec<SizeStatistics>,
    pub latency_over_time: Vec<LatencyTimeline>,
    pub stream: StreamActivity,
    pub counters: RunCounters,
    pub verdict: Verdict,
}

fn format_utc(ms: u64) -> String {
    humantime::format_rfc3339_millis(UNIX_EPOCH + Duration::from_millis(ms)).to_string()
}

/// Averages the latency series of one size into fixed-width buckets of run time.
pub fn latency_timeline(state: &TestRunState, test_size: TestSize, bucket_ms: i64) -> LatencyTimeline {
    let mut points: Vec<(f64, f64)> = Vec::new();
    let mut current: Option<(i64, i64, u32)> = None; // (bucket, delay sum, count)

    let mut samples = state.recorder().series(test_size).to_vec();
    samples.sort_by_key(|s| s.elapsed_ms);

    for sample in samples {
        let bucket = sample.elapsed_ms.div_euclid(bucket_ms);
        match current {
            Some((b, sum, count)) if b == bucket => current = Some((b, sum + sample.delay_ms, count + 1)),
            _ => {
                if let Some(done) = current.take() {
                    points.push(timeline_point(done, bucket_ms));
                }
                current = Some((bucket, sample.delay_ms, 1));
            }
        }
    }
    if let Some(done) = current {
        points.push(timeline_point(done, bucket_ms));
    }

    LatencyTimeline { test_size, points }
}

// The point sits at the end of its bucket.
fn timeline_point((bucket, sum, count): (i64, i64, u32), bucket_ms: i64) -> (f64, f64) {
    (
        ((bucket + 1) * bucket_ms) as f64 / 1000.0,
        sum as f64 / count as f64,
    )
}

impl RunReport {
    pub fn build(config: &RunConfig, state: &TestRunState, outcome: &RunOutcome) -> Self {
        let sizes = stats::collect_all(state);
        let verdict = verdict::evaluate(&sizes, &config.thresholds);
        let latency_over_time = state
            .recorder()
            .sizes()
            .map(|size| latency_timeline(state, size, TIMELINE_BUCKET_MS))
            .collect();

        RunReport {
            start_time_utc: format_utc(outcome.started_at_ms),
            end_time_utc: format_utc(outcome.finished_at_ms),
            test_duration_actual_secs: outcome.finished_at_ms.saturating_sub(outcome.started_at_ms) as f64 / 1000.0,
            config: config.clone(),
            sizes,
            latency_over_time,
            stream: state.stream(),
            counters: outcome.counters,
            verdict,
        }
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = self.to_json_pretty().map_err(std::io::Error::from)?;
        std::fs::write(path, json)
    }
}

fn or_na(value: Option<f64>, unit: &str) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}{}", v, unit))
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run {} .. {} ({:.1}s), {} datagrams, {} stream chunks",
            self.start_time_utc,
            self.end_time_utc,
            self.test_duration_actual_secs,
            self.counters.datagrams_received,
            self.stream.chunks
        )?;
        for size in &self.sizes {
            writeln!(
                f,
                "Test: {:>3} fragments | observed {:>3}/{} | failed {:>3} ({:.1}%) | drop {} | latency {} | finish {}",
                size.test_size,
                size.observed_instances,
                size.population,
                size.failed_tests,
                size.failed_test_rate_percent,
                or_na(size.drop_rate_percent, "%"),
                or_na(size.average_latency_ms, " ms"),
                or_na(size.average_finish_latency_ms, " ms"),
            )?;
        }
        if self.verdict.passed() {
            write!(f, "Verdict: PASS")
        } else {
            writeln!(f, "Verdict: FAIL")?;
            for violation in &self.verdict.violations {
                writeln!(f, "  - {}", violation.description)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FragmentArrivalEvent;
    use crate::registry::BoundsPolicy;
    use crate::verdict::Thresholds;

    fn state_with(events: &[(u8, u8, u8, u64, u64)]) -> TestRunState {
        let mut state = TestRunState::new(100, BoundsPolicy::Reject);
        state.start_run(0, &[]);
        for &(size, index, fragment, sent, arrived) in events {
            state
                .record(&FragmentArrivalEvent {
                    test_size: size,
                    test_index: index,
                    fragment_index: fragment,
                    send_timestamp_ms: sent,
                    arrival_timestamp_ms: arrived,
                })
                .unwrap();
        }
        state
    }

    fn outcome() -> RunOutcome {
        RunOutcome {
            started_at_ms: 1_700_000_000_000,
            finished_at_ms: 1_700_000_005_500,
            counters: RunCounters { datagrams_received: 3, ..Default::default() },
        }
    }

    #[test]
    fn test_latency_timeline_buckets() {
        let state = state_with(&[
            (10, 0, 0, 100, 110),
            (10, 0, 1, 900, 930),
            (10, 1, 0, 1_500, 1_520),
            (10, 2, 0, 3_100, 3_105),
        ]);
        let timeline = latency_timeline(&state, 10, 1000);
        assert_eq!(timeline.points, vec![(1.0, 20.0), (2.0, 20.0), (4.0, 5.0)]);
        assert!(latency_timeline(&state, 25, 1000).points.is_empty());
    }

    #[test]
    fn test_build_report() {
        let state = state_with(&[(10, 0, 0, 100, 110), (10, 0, 1, 100, 120)]);
        let config = RunConfig {
            thresholds: Thresholds { max_drop_rate_percent: Some(50.0), ..Default::default() },
            ..Default::default()
        };
        let report = RunReport::build(&config, &state, &outcome());

        assert_eq!(report.start_time_utc, "2023-11-14T22:13:20.000Z");
        assert_eq!(report.test_duration_actual_secs, 5.5);
        assert_eq!(report.sizes.len(), 1);
        assert_eq!(report.sizes[0].failed_tests, 1);
        assert!(!report.verdict.passed()); // 80% dropped
        assert_eq!(report.counters.datagrams_received, 3);

        let text = report.to_string();
        assert!(text.contains("Test:  10 fragments"));
        assert!(text.contains("Verdict: FAIL"));

        let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["sizes"][0]["test_size"], 10);
        assert_eq!(json["verdict"]["violations"][0]["kind"], "drop_rate");
    }

    #[test]
    fn test_empty_run_passes() {
        let state = state_with(&[]);
        let report = RunReport::build(&RunConfig::default(), &state, &outcome());
        assert!(report.sizes.is_empty());
        assert!(report.verdict.passed());
        assert!(report.to_string().ends_with("Verdict: PASS"));
    }
}
