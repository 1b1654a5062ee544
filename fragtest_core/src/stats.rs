// Derived statistics over a run snapshot (drop rate, failed tests, latency)
use crate::packet::TestSize;
use crate::state::TestRunState;
use serde::Serialize;

/// Mean fraction of fragments never observed, over the observed instances, in percent.
/// `None` when no instance of the size exists.
pub fn drop_rate(state: &TestRunState, test_size: TestSize) -> Option<f64> {
    let matrix = state.registry().matrix(test_size)?;
    let ratios: Vec<f64> = matrix
        .realized()
        .filter(|(_, instance)| instance.total() > 0)
        .map(|(_, instance)| instance.dropped() as f64 / instance.total() as f64)
        .collect();
    mean(&ratios).map(|ratio| ratio * 100.0)
}

/// Instances with at least one dropped fragment over the whole population, in percent.
pub fn failed_test_rate(state: &TestRunState, test_size: TestSize) -> f64 {
    let Some(matrix) = state.registry().matrix(test_size) else {
        return 0.0;
    };
    if matrix.population() == 0 {
        return 0.0;
    }
    let failed = failed_tests(state, test_size);
    failed as f64 / matrix.population() as f64 * 100.0
}

pub fn failed_tests(state: &TestRunState, test_size: TestSize) -> usize {
    state
        .registry()
        .matrix(test_size)
        .map_or(0, |matrix| matrix.realized().filter(|(_, i)| i.dropped() > 0).count())
}

/// Mean one-way delay over every sample of the size.
pub fn average_latency(state: &TestRunState, test_size: TestSize) -> Option<f64> {
    let delays: Vec<f64> = state
        .recorder()
        .series(test_size)
        .iter()
        .map(|sample| sample.delay_ms as f64)
        .collect();
    mean(&delays)
}

/// Mean finish latency over the instances that have a finish window.
pub fn average_finish_latency(state: &TestRunState, test_size: TestSize) -> Option<f64> {
    let latencies: Vec<f64> = distribution(state, test_size).into_iter().map(|l| l as f64).collect();
    mean(&latencies)
}

/// Finish latency of every timed instance, in test index order.
pub fn distribution(state: &TestRunState, test_size: TestSize) -> Vec<i64> {
    state
        .recorder()
        .windows(test_size)
        .map(|(_, window)| window.finish_latency_ms())
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Five-number summary, quartiles by linear interpolation between closest ranks.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct BoxPlot {
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
}

impl BoxPlot {
    pub fn from_samples(samples: &[i64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = samples.iter().map(|s| *s as f64).collect();
        sorted.sort_by(f64::total_cmp);
        Some(BoxPlot {
            min: sorted[0],
            q1: quantile(&sorted, 0.25),
            median: quantile(&sorted, 0.5),
            q3: quantile(&sorted, 0.75),
            max: sorted[sorted.len() - 1],
        })
    }
}

fn quantile(sorted: &[f64], p: f64) -> f64 {
    let position = p * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (position - lower as f64)
}

/// Everything reported for one test size.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SizeStatistics {
    pub test_size: TestSize,
    pub population: usize,
    pub observed_instances: usize,
    pub complete_instances: usize,
    pub failed_tests: usize,
    pub failed_test_rate_percent: f64,
    pub drop_rate_percent: Option<f64>,
    pub average_latency_ms: Option<f64>,
    pub average_finish_latency_ms: Option<f64>,
    pub finish_latency_distribution: Vec<i64>,
    pub finish_latency_box: Option<BoxPlot>,
}

impl SizeStatistics {
    pub fn collect(state: &TestRunState, test_size: TestSize) -> Self {
        let matrix = state.registry().matrix(test_size);
        let distribution = distribution(state, test_size);
        SizeStatistics {
            test_size,
            population: matrix.map_or(0, |m| m.population()),
            observed_instances: matrix.map_or(0, |m| m.realized().count()),
            complete_instances: matrix.map_or(0, |m| m.realized().filter(|(_, i)| i.is_complete()).count()),
            failed_tests: failed_tests(state, test_size),
            failed_test_rate_percent: failed_test_rate(state, test_size),
            drop_rate_percent: drop_rate(state, test_size),
            average_latency_ms: average_latency(state, test_size),
            average_finish_latency_ms: average_finish_latency(state, test_size),
            finish_latency_box: BoxPlot::from_samples(&distribution),
            finish_latency_distribution: distribution,
        }
    }
}

/// Statistics for every size the registry knows, in ascending size order.
pub fn collect_all(state: &TestRunState) -> Vec<SizeStatistics> {
    state
        .registry()
        .sizes()
        .map(|size| SizeStatistics::collect(state, size))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FragmentArrivalEvent;
    use crate::registry::BoundsPolicy;

    fn record(state: &mut TestRunState, size: u8, index: u8, fragment: u8, sent: u64, arrived: u64) {
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

    fn started(known: &[u8], population: u8) -> TestRunState {
        let mut state = TestRunState::new(population, BoundsPolicy::Reject);
        state.start_run(0, known);
        state
    }

    #[test]
    fn test_single_partial_instance_scenario() {
        let mut state = started(&[], 100);
        record(&mut state, 10, 0, 0, 100, 110);
        record(&mut state, 10, 0, 1, 101, 115);
        record(&mut state, 10, 0, 2, 102, 130);

        assert_eq!(state.summarize(10)[0].dropped, 7);
        let rate = drop_rate(&state, 10).unwrap();
        assert!((rate - 70.0).abs() < 1e-9);
        assert_eq!(failed_tests(&state, 10), 1);
        assert!((failed_test_rate(&state, 10) - 1.0).abs() < 1e-9);
        assert_eq!(distribution(&state, 10), vec![30]);
        assert_eq!(average_finish_latency(&state, 10), Some(30.0));
        assert_eq!(average_latency(&state, 10), Some((10.0 + 14.0 + 28.0) / 3.0));
    }

    #[test]
    fn test_all_complete_is_zero_drop() {
        let mut state = started(&[10], 3);
        for index in 0..3 {
            for fragment in 0..10 {
                record(&mut state, 10, index, fragment, 0, 1);
            }
        }
        assert_eq!(drop_rate(&state, 10), Some(0.0));
        assert_eq!(failed_test_rate(&state, 10), 0.0);
    }

    #[test]
    fn test_nothing_delivered_is_full_drop() {
        let state = started(&[25], 100);
        assert_eq!(drop_rate(&state, 25), Some(100.0));
        assert_eq!(failed_test_rate(&state, 25), 100.0);
        // no samples: undefined, not zero
        assert_eq!(average_latency(&state, 25), None);
        assert_eq!(average_finish_latency(&state, 25), None);
        assert!(distribution(&state, 25).is_empty());
    }

    #[test]
    fn test_unknown_size_has_no_statistics() {
        let state = started(&[], 100);
        assert_eq!(drop_rate(&state, 50), None);
        assert_eq!(failed_test_rate(&state, 50), 0.0);
        let stats = SizeStatistics::collect(&state, 50);
        assert_eq!(stats.observed_instances, 0);
        assert_eq!(stats.finish_latency_box, None);
    }

    #[test]
    fn test_box_plot_quartiles() {
        let plot = BoxPlot::from_samples(&[7, 1, 3, 5, 9]).unwrap();
        assert_eq!(plot, BoxPlot { min: 1.0, q1: 3.0, median: 5.0, q3: 7.0, max: 9.0 });

        let plot = BoxPlot::from_samples(&[10, 20, 30, 40]).unwrap();
        assert_eq!(plot.median, 25.0);
        assert_eq!(plot.q1, 17.5);
        assert_eq!(plot.q3, 32.5);

        let single = BoxPlot::from_samples(&[4]).unwrap();
        assert_eq!(single.min, 4.0);
        assert_eq!(single.max, 4.0);
        assert!(BoxPlot::from_samples(&[]).is_none());
    }

    #[test]
    fn test_collect_all_orders_sizes() {
        let mut state = started(&[], 10);
        record(&mut state, 50, 0, 0, 0, 5);
        record(&mut state, 10, 1, 0, 0, 8);
        for fragment in 0..10 {
            record(&mut state, 10, 2, fragment, 0, 3);
        }
        let all = collect_all(&state);
        assert_eq!(all.iter().map(|s| s.test_size).collect::<Vec<_>>(), vec![10, 50]);

        let ten = &all[0];
        assert_eq!(ten.population, 10);
        assert_eq!(ten.observed_instances, 2);
        assert_eq!(ten.complete_instances, 1);
        assert_eq!(ten.failed_tests, 1);
        assert_eq!(ten.finish_latency_distribution, vec![8, 3]);
        assert!((ten.drop_rate_percent.unwrap() - 45.0).abs() < 1e-9);
    }
}
