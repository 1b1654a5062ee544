// Pass/fail judgement of a run against configured thresholds

use crate::packet::TestSize;
use crate::stats::SizeStatistics;
use serde::{Deserialize, Serialize};

/// Limits a run must stay within. Unset limits are not checked.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub max_drop_rate_percent: Option<f64>,
    pub max_failed_test_rate_percent: Option<f64>,
    pub max_average_finish_latency_ms: Option<f64>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DropRate,
    FailedTests,
    FinishLatency,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Violation {
    pub test_size: TestSize,
    pub kind: ViolationKind,
    pub observed: f64,
    pub threshold: f64,
    pub description: String,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct Verdict {
    pub violations: Vec<Violation>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

pub fn evaluate(stats: &[SizeStatistics], thresholds: &Thresholds) -> Verdict {
    let mut violations = Vec::new();

    for size in stats {
        if let (Some(limit), Some(observed)) = (thresholds.max_drop_rate_percent, size.drop_rate_percent) {
            if observed > limit {
                violations.push(Violation {
                    test_size: size.test_size,
                    kind: ViolationKind::DropRate,
                    observed,
                    threshold: limit,
                    description: format!(
                        "{} fragments: drop rate {:.2}% (threshold: {}%)",
                        size.test_size, observed, limit
                    ),
                });
            }
        }

        if let Some(limit) = thresholds.max_failed_test_rate_percent {
            let observed = size.failed_test_rate_percent;
            if observed > limit {
                violations.push(Violation {
                    test_size: size.test_size,
                    kind: ViolationKind::FailedTests,
                    observed,
                    threshold: limit,
                    description: format!(
                        "{} fragments: {} failed tests, {:.2}% (threshold: {}%)",
                        size.test_size, size.failed_tests, observed, limit
                    ),
                });
            }
        }

        if let (Some(limit), Some(observed)) = (
            thresholds.max_average_finish_latency_ms,
            size.average_finish_latency_ms,
        ) {
            if observed > limit {
                violations.push(Violation {
                    test_size: size.test_size,
                    kind: ViolationKind::FinishLatency,
                    observed,
                    threshold: limit,
                    description: format!(
                        "{} fragments: average finish latency {:.2} ms (threshold: {} ms)",
                        size.test_size, observed, limit
                    ),
                });
            }
        }
    }

    Verdict { violations }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(size: u8, drop: Option<f64>, failed_rate: f64, finish: Option<f64>) -> SizeStatistics {
        SizeStatistics {
            test_size: size,
            population: 100,
            observed_instances: 100,
            complete_instances: 0,
            failed_tests: failed_rate as usize,
            failed_test_rate_percent: failed_rate,
            drop_rate_percent: drop,
            average_latency_ms: None,
            average_finish_latency_ms: finish,
            finish_latency_distribution: Vec::new(),
            finish_latency_box: None,
        }
    }

    #[test]
    fn test_no_thresholds_always_passes() {
        let verdict = evaluate(&[stats(10, Some(100.0), 100.0, Some(1e6))], &Thresholds::default());
        assert!(verdict.passed());
    }

    #[test]
    fn test_each_threshold_checked() {
        let thresholds = Thresholds {
            max_drop_rate_percent: Some(5.0),
            max_failed_test_rate_percent: Some(10.0),
            max_average_finish_latency_ms: Some(200.0),
        };
        let verdict = evaluate(
            &[
                stats(10, Some(1.0), 2.0, Some(50.0)),
                stats(200, Some(7.5), 40.0, Some(250.0)),
            ],
            &thresholds,
        );
        assert!(!verdict.passed());
        let kinds: Vec<_> = verdict.violations.iter().map(|v| (v.test_size, v.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (200, ViolationKind::DropRate),
                (200, ViolationKind::FailedTests),
                (200, ViolationKind::FinishLatency),
            ]
        );
        assert_eq!(verdict.violations[0].observed, 7.5);
        assert!(verdict.violations[1].description.contains("40 failed tests"));
    }

    #[test]
    fn test_undefined_values_do_not_violate() {
        let thresholds = Thresholds {
            max_drop_rate_percent: Some(0.0),
            max_average_finish_latency_ms: Some(0.0),
            ..Default::default()
        };
        assert!(evaluate(&[stats(10, None, 0.0, None)], &thresholds).passed());
    }
}
