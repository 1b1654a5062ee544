// Per test-size delivery matrices

use crate::packet::{FragmentArrivalEvent, FragmentIndex, TestIndex, TestSize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to do with events whose test or fragment index falls outside the configured bounds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoundsPolicy {
    /// Drop the event. Keeps every matrix at `population x test_size`.
    #[default]
    Reject,
    /// Accept the event and extend the matrix to fit it.
    Grow,
}

/// Delivery record of one test instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestInstance {
    delivered: Vec<bool>,
}

impl TestInstance {
    pub fn new(test_size: TestSize) -> Self {
        TestInstance {
            delivered: vec![false; test_size as usize],
        }
    }

    pub fn fragments(&self) -> &[bool] {
        &self.delivered
    }

    pub fn is_delivered(&self, fragment: FragmentIndex) -> bool {
        self.delivered.get(fragment as usize).copied().unwrap_or(false)
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.iter().filter(|d| **d).count()
    }

    /// Fragment budget of the instance. Equals the test size unless the matrix grew.
    pub fn total(&self) -> usize {
        self.delivered.len()
    }

    pub fn dropped(&self) -> usize {
        self.total() - self.delivered_count()
    }

    pub fn is_complete(&self) -> bool {
        self.dropped() == 0
    }

    /// Some but not all fragments arrived.
    pub fn is_partial(&self) -> bool {
        let delivered = self.delivered_count();
        delivered > 0 && delivered < self.total()
    }

    /// Returns true when the fragment was not delivered before.
    fn mark(&mut self, fragment: FragmentIndex) -> bool {
        let slot = fragment as usize;
        if slot >= self.delivered.len() {
            self.delivered.resize(slot + 1, false);
        }
        !std::mem::replace(&mut self.delivered[slot], true)
    }

    fn set(&mut self, fragment: FragmentIndex, received: bool) {
        let slot = fragment as usize;
        if slot >= self.delivered.len() {
            self.delivered.resize(slot + 1, false);
        }
        self.delivered[slot] = received;
    }
}

/// All test instances of one test size. Slots stay `None` until the instance is observed.
#[derive(Debug, Clone)]
pub struct SizeMatrix {
    test_size: TestSize,
    instances: Vec<Option<TestInstance>>,
    started: bool,
}

impl SizeMatrix {
    fn lazy(test_size: TestSize, population: u8) -> Self {
        SizeMatrix {
            test_size,
            instances: vec![None; population as usize],
            started: false,
        }
    }

    fn preallocated(test_size: TestSize, population: u8) -> Self {
        SizeMatrix {
            test_size,
            instances: vec![Some(TestInstance::new(test_size)); population as usize],
            started: false,
        }
    }

    pub fn test_size(&self) -> TestSize {
        self.test_size
    }

    /// Number of instance slots, observed or not.
    pub fn population(&self) -> usize {
        self.instances.len()
    }

    pub fn instance(&self, index: TestIndex) -> Option<&TestInstance> {
        self.instances.get(index as usize).and_then(Option::as_ref)
    }

    /// Instances that exist, in index order.
    pub fn realized(&self) -> impl Iterator<Item = (TestIndex, &TestInstance)> + '_ {
        self.instances
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|instance| (i as TestIndex, instance)))
    }

    fn realize(&mut self, index: TestIndex) -> &mut TestInstance {
        let slot = index as usize;
        if slot >= self.instances.len() {
            self.instances.resize(slot + 1, None);
        }
        let test_size = self.test_size;
        self.instances[slot].get_or_insert_with(|| TestInstance::new(test_size))
    }
}

/// Result of feeding one event into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded {
        /// Set on the first event ever recorded for this test size.
        started: Option<TestSize>,
        /// False when the fragment was already marked.
        newly_delivered: bool,
    },
    /// Dropped under [`BoundsPolicy::Reject`].
    OutOfRange,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSummary {
    pub test_index: TestIndex,
    pub dropped: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct TestRunRegistry {
    population: u8,
    policy: BoundsPolicy,
    sizes: BTreeMap<TestSize, SizeMatrix>,
}

impl TestRunRegistry {
    pub fn new(population: u8, policy: BoundsPolicy) -> Self {
        TestRunRegistry {
            population,
            policy,
            sizes: BTreeMap::new(),
        }
    }

    pub fn population(&self) -> u8 {
        self.population
    }

    pub fn policy(&self) -> BoundsPolicy {
        self.policy
    }

    /// Clears all state. Known sizes get every instance realised up front; with none,
    /// sizes and instances appear as fragments arrive.
    pub fn reset(&mut self, known_sizes: &[TestSize]) {
        self.sizes.clear();
        for &size in known_sizes {
            self.sizes
                .insert(size, SizeMatrix::preallocated(size, self.population));
        }
    }

    /// Matrix for `test_size`, created empty on first use.
    pub fn get_or_create(&mut self, test_size: TestSize) -> &mut SizeMatrix {
        let population = self.population;
        self.sizes
            .entry(test_size)
            .or_insert_with(|| SizeMatrix::lazy(test_size, population))
    }

    pub fn record(&mut self, event: &FragmentArrivalEvent) -> RecordOutcome {
        if self.policy == BoundsPolicy::Reject && !self.in_bounds(event) {
            return RecordOutcome::OutOfRange;
        }

        let matrix = self.get_or_create(event.test_size);
        let started = if matrix.started {
            None
        } else {
            matrix.started = true;
            Some(event.test_size)
        };
        let newly_delivered = matrix.realize(event.test_index).mark(event.fragment_index);

        RecordOutcome::Recorded { started, newly_delivered }
    }

    fn in_bounds(&self, event: &FragmentArrivalEvent) -> bool {
        let population = self
            .sizes
            .get(&event.test_size)
            .map_or(self.population as usize, SizeMatrix::population);
        (event.test_index as usize) < population && event.fragment_index < event.test_size
    }

    /// Dropped/total per observed instance of `test_size`, in index order.
    pub fn summarize(&self, test_size: TestSize) -> Vec<InstanceSummary> {
        self.sizes
            .get(&test_size)
            .map(|matrix| {
                matrix
                    .realized()
                    .map(|(test_index, instance)| InstanceSummary {
                        test_index,
                        dropped: instance.dropped(),
                        total: instance.total(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn sizes(&self) -> impl Iterator<Item = TestSize> + '_ {
        self.sizes.keys().copied()
    }

    pub fn matrix(&self, test_size: TestSize) -> Option<&SizeMatrix> {
        self.sizes.get(&test_size)
    }

    /// Sets one delivery flag directly, realising the instance. Used when importing exports.
    pub(crate) fn restore(
        &mut self,
        test_size: TestSize,
        test_index: TestIndex,
        fragment: FragmentIndex,
        received: bool,
    ) {
        let matrix = self.get_or_create(test_size);
        matrix.started |= received;
        matrix.realize(test_index).set(fragment, received);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(size: u8, index: u8, fragment: u8) -> FragmentArrivalEvent {
        FragmentArrivalEvent {
            test_size: size,
            test_index: index,
            fragment_index: fragment,
            send_timestamp_ms: 1_000,
            arrival_timestamp_ms: 1_010,
        }
    }

    #[test]
    fn test_lazy_size_creation_starts_once() {
        let mut registry = TestRunRegistry::new(100, BoundsPolicy::Reject);
        registry.reset(&[]);
        assert_eq!(registry.sizes().count(), 0);

        let first = registry.record(&event(25, 0, 0));
        assert_eq!(first, RecordOutcome::Recorded { started: Some(25), newly_delivered: true });
        let second = registry.record(&event(25, 1, 3));
        assert_eq!(second, RecordOutcome::Recorded { started: None, newly_delivered: true });

        let matrix = registry.matrix(25).unwrap();
        assert_eq!(matrix.population(), 100);
        assert_eq!(matrix.realized().count(), 2);
        assert!(matrix.instance(2).is_none());
    }

    #[test]
    fn test_get_or_create_keeps_existing_matrix() {
        let mut registry = TestRunRegistry::new(4, BoundsPolicy::Reject);
        assert_eq!(registry.get_or_create(10).realized().count(), 0);
        registry.record(&event(10, 2, 0));
        assert_eq!(registry.get_or_create(10).realized().count(), 1);
        assert_eq!(registry.sizes().collect::<Vec<_>>(), vec![10]);

        // creating a matrix is not a start; the first recorded fragment is
        let outcome = registry.record(&event(10, 3, 0));
        assert_eq!(outcome, RecordOutcome::Recorded { started: None, newly_delivered: true });
        registry.get_or_create(25);
        assert_eq!(
            registry.record(&event(25, 0, 0)),
            RecordOutcome::Recorded { started: Some(25), newly_delivered: true }
        );
    }

    #[test]
    fn test_record_is_idempotent() {
        let mut registry = TestRunRegistry::new(100, BoundsPolicy::Reject);
        registry.record(&event(10, 4, 2));
        let before = registry.matrix(10).unwrap().instance(4).unwrap().clone();

        let again = registry.record(&event(10, 4, 2));
        assert_eq!(again, RecordOutcome::Recorded { started: None, newly_delivered: false });
        assert_eq!(registry.matrix(10).unwrap().instance(4).unwrap(), &before);
        assert_eq!(before.delivered_count(), 1);
    }

    #[test]
    fn test_summarize_partial_instance() {
        let mut registry = TestRunRegistry::new(100, BoundsPolicy::Reject);
        for fragment in 0..3 {
            registry.record(&event(10, 0, fragment));
        }
        let summary = registry.summarize(10);
        assert_eq!(summary, vec![InstanceSummary { test_index: 0, dropped: 7, total: 10 }]);

        let instance = registry.matrix(10).unwrap().instance(0).unwrap();
        assert!(instance.is_partial());
        assert!(!instance.is_complete());
        assert!(instance.is_delivered(2));
        assert!(!instance.is_delivered(3));
    }

    #[test]
    fn test_preallocated_sizes() {
        let mut registry = TestRunRegistry::new(4, BoundsPolicy::Reject);
        registry.reset(&[10, 50]);
        assert_eq!(registry.sizes().collect::<Vec<_>>(), vec![10, 50]);

        let summary = registry.summarize(50);
        assert_eq!(summary.len(), 4);
        assert!(summary.iter().all(|s| s.dropped == 50 && s.total == 50));

        // first event on a declared size still reports the start
        let outcome = registry.record(&event(10, 0, 0));
        assert_eq!(outcome, RecordOutcome::Recorded { started: Some(10), newly_delivered: true });
    }

    #[test]
    fn test_reset_clears_previous_run() {
        let mut registry = TestRunRegistry::new(100, BoundsPolicy::Reject);
        registry.record(&event(10, 0, 0));
        registry.reset(&[]);
        assert!(registry.matrix(10).is_none());
        assert!(registry.summarize(10).is_empty());
        let outcome = registry.record(&event(10, 0, 0));
        assert_eq!(outcome, RecordOutcome::Recorded { started: Some(10), newly_delivered: true });
    }

    #[test]
    fn test_reject_out_of_range() {
        let mut registry = TestRunRegistry::new(100, BoundsPolicy::Reject);
        assert_eq!(registry.record(&event(10, 100, 0)), RecordOutcome::OutOfRange);
        assert_eq!(registry.record(&event(10, 0, 10)), RecordOutcome::OutOfRange);
        assert!(registry.matrix(10).is_none());
        assert_eq!(registry.record(&event(10, 99, 9)), RecordOutcome::Recorded { started: Some(10), newly_delivered: true });
    }

    #[test]
    fn test_grow_accepts_out_of_range() {
        let mut registry = TestRunRegistry::new(2, BoundsPolicy::Grow);
        registry.record(&event(10, 5, 12));
        let matrix = registry.matrix(10).unwrap();
        assert_eq!(matrix.population(), 6);
        let instance = matrix.instance(5).unwrap();
        assert_eq!(instance.total(), 13);
        assert_eq!(instance.dropped(), 12);
    }

    #[test]
    fn test_complete_instance() {
        let mut registry = TestRunRegistry::new(1, BoundsPolicy::Reject);
        for fragment in 0..10 {
            registry.record(&event(10, 0, fragment));
        }
        let instance = registry.matrix(10).unwrap().instance(0).unwrap();
        assert!(instance.is_complete());
        assert!(!instance.is_partial());
        assert_eq!(registry.summarize(10)[0].dropped, 0);
    }
}
