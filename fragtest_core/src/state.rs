// Per-run measurement state shared between the read loops and readers

use crate::config::RunConfig;
use crate::latency::LatencyRecorder;
pub use crate::latency::RecordError;
use crate::packet::{self, FragmentArrivalEvent, TestSize};
use crate::registry::{BoundsPolicy, InstanceSummary, RecordOutcome, TestRunRegistry};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Arrival bookkeeping for the secondary stream. Payload bytes are only counted.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamActivity {
    pub chunks: u64,
    pub bytes: u64,
    pub last_arrival_ms: Option<u64>,
}

/// Everything one run measures: delivery matrices, latency series and stream activity.
#[derive(Debug, Clone)]
pub struct TestRunState {
    registry: TestRunRegistry,
    recorder: LatencyRecorder,
    stream: StreamActivity,
}

impl TestRunState {
    pub fn new(population: u8, policy: BoundsPolicy) -> Self {
        TestRunState {
            registry: TestRunRegistry::new(population, policy),
            recorder: LatencyRecorder::new(),
            stream: StreamActivity::default(),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.population, config.bounds_policy)
    }

    /// Resets all state and starts the run clock.
    pub fn start_run(&mut self, at_ms: u64, known_sizes: &[TestSize]) {
        self.registry.reset(known_sizes);
        self.recorder.start_run(at_ms);
        self.stream = StreamActivity::default();
    }

    pub fn record(&mut self, event: &FragmentArrivalEvent) -> Result<RecordOutcome, RecordError> {
        if self.recorder.start_time_ms().is_none() {
            return Err(RecordError::RunNotStarted);
        }
        let outcome = self.registry.record(event);
        if let RecordOutcome::Recorded { .. } = outcome {
            self.recorder.record(event)?;
        }
        Ok(outcome)
    }

    /// Decodes and records one raw datagram. `Ok(None)` means the datagram was not a fragment.
    pub fn record_datagram(
        &mut self,
        raw: &[u8],
        arrival_ms: u64,
    ) -> Result<Option<(FragmentArrivalEvent, RecordOutcome)>, RecordError> {
        match packet::decode_at(raw, arrival_ms) {
            Some(event) => Ok(Some((event, self.record(&event)?))),
            None => Ok(None),
        }
    }

    pub fn record_stream_chunk(&mut self, len: usize, arrival_ms: u64) {
        self.stream.chunks += 1;
        self.stream.bytes += len as u64;
        self.stream.last_arrival_ms = Some(arrival_ms);
    }

    pub fn summarize(&self, test_size: TestSize) -> Vec<InstanceSummary> {
        self.registry.summarize(test_size)
    }

    pub fn registry(&self) -> &TestRunRegistry {
        &self.registry
    }

    pub fn recorder(&self) -> &LatencyRecorder {
        &self.recorder
    }

    pub fn stream(&self) -> StreamActivity {
        self.stream
    }

    pub(crate) fn registry_mut(&mut self) -> &mut TestRunRegistry {
        &mut self.registry
    }
}

/// Handle to a [`TestRunState`] shared between the datagram loop and snapshot readers.
#[derive(Debug, Clone)]
pub struct SharedRunState(Arc<Mutex<TestRunState>>);

impl SharedRunState {
    pub fn new(state: TestRunState) -> Self {
        SharedRunState(Arc::new(Mutex::new(state)))
    }

    // A panic elsewhere must not hide the data collected so far.
    fn lock(&self) -> MutexGuard<'_, TestRunState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut TestRunState) -> R) -> R {
        f(&mut self.lock())
    }

    /// Point-in-time copy taken under a single lock acquisition.
    pub fn snapshot(&self) -> TestRunState {
        self.lock().clone()
    }
}
