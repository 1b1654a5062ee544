// Latency series and per-instance finish windows
use crate::packet::{signed_diff_ms, FragmentArrivalEvent, TestIndex, TestSize};
use serde::Serialize;
use std::collections::BTreeMap;

/// `(elapsed since run start, one-way delay)`, both in milliseconds.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    pub elapsed_ms: i64,
    pub delay_ms: i64,
}

/// Earliest send and latest arrival seen for one test instance.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishWindow {
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

impl FinishWindow {
    pub fn finish_latency_ms(&self) -> i64 {
        signed_diff_ms(self.last_seen_ms, self.first_seen_ms)
    }

    fn widen(&mut self, event: &FragmentArrivalEvent) {
        self.first_seen_ms = self.first_seen_ms.min(event.send_timestamp_ms);
        self.last_seen_ms = self.last_seen_ms.max(event.arrival_timestamp_ms);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("latency recorded before the run clock was started")]
    RunNotStarted,
}

#[derive(Debug, Clone, Default)]
pub struct LatencyRecorder {
    start_time_ms: Option<u64>,
    series: BTreeMap<TestSize, Vec<LatencySample>>,
    windows: BTreeMap<(TestSize, TestIndex), FinishWindow>,
}

impl LatencyRecorder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Starts a new run clock and drops everything recorded under the previous one.
    pub fn start_run(&mut self, at_ms: u64) {
        self.start_time_ms = Some(at_ms);
        self.series.clear();
        self.windows.clear();
    }

    pub fn start_time_ms(&self) -> Option<u64> {
        self.start_time_ms
    }

    pub fn record(&mut self, event: &FragmentArrivalEvent) -> Result<(), RecordError> {
        let start = self.start_time_ms.ok_or(RecordError::RunNotStarted)?;

        self.series.entry(event.test_size).or_default().push(LatencySample {
            elapsed_ms: signed_diff_ms(event.arrival_timestamp_ms, start),
            delay_ms: event.one_way_delay_ms(),
        });

        self.windows
            .entry((event.test_size, event.test_index))
            .and_modify(|window| window.widen(event))
            .or_insert(FinishWindow {
                first_seen_ms: event.send_timestamp_ms,
                last_seen_ms: event.arrival_timestamp_ms,
            });
        Ok(())
    }

    /// Latest arrival minus earliest send, once the instance has been seen.
    pub fn finish_latency(&self, test_size: TestSize, test_index: TestIndex) -> Option<i64> {
        self.windows
            .get(&(test_size, test_index))
            .map(FinishWindow::finish_latency_ms)
    }

    /// Samples in arrival order. Empty for a size never seen.
    pub fn series(&self, test_size: TestSize) -> &[LatencySample] {
        self.series.get(&test_size).map(Vec::as_slice).unwrap_or_default()
    }

    /// Finish windows of `test_size`, ordered by test index.
    pub fn windows(&self, test_size: TestSize) -> impl Iterator<Item = (TestIndex, &FinishWindow)> + '_ {
        self.windows
            .range((test_size, TestIndex::MIN)..=(test_size, TestIndex::MAX))
            .map(|((_, index), window)| (*index, window))
    }

    pub fn sizes(&self) -> impl Iterator<Item = TestSize> + '_ {
        self.series.keys().copied()
    }
}
