use std::collections::HashMap;

use serde::Serialize;

use super::filter::{FilterContext, FilterCounts, ProcessFilter, filter_flat, filter_forest};
use super::process::{ProcessForest, ProcessRecord, build_process_forest};

/// Everything one refresh cycle produced. Published whole; never mutated after.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemSnapshot {
    /// 0 for the placeholder published before the first cycle completes.
    pub sequence: u64,
    #[serde(skip)]
    pub context: FilterContext,
    /// Flat records sorted by pid, kept for flat view and counting.
    pub processes: Vec<ProcessRecord>,
    pub forest: ProcessForest,
    pub connection_counts: HashMap<u32, usize>,
    pub counts: FilterCounts,
}

impl SystemSnapshot {
    /// Attach connection counts, build the forest and tally the filter classes.
    ///
    /// A pid missing from `connection_counts` keeps `connection_count: None`.
    pub fn assemble(
        sequence: u64,
        context: FilterContext,
        mut processes: Vec<ProcessRecord>,
        connection_counts: HashMap<u32, usize>,
    ) -> Self {
        for record in &mut processes {
            record.connection_count = connection_counts.get(&record.pid).copied();
        }
        let forest = build_process_forest(&processes);
        let counts = FilterCounts::from_records(&processes, &context);
        SystemSnapshot {
            sequence,
            context,
            processes,
            forest,
            connection_counts,
            counts,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.sequence == 0
    }

    pub fn current_user(&self) -> &str {
        &self.context.current_user
    }

    pub fn tree_view(&self, filter: &ProcessFilter) -> ProcessForest {
        filter_forest(&self.forest, filter.predicate(&self.context))
    }

    pub fn flat_view(&self, filter: &ProcessFilter) -> Vec<ProcessRecord> {
        filter_flat(&self.processes, filter.predicate(&self.context))
    }

    pub fn process(&self, pid: u32) -> Option<&ProcessRecord> {
        self.processes
            .binary_search_by_key(&pid, |r| r.pid)
            .ok()
            .map(|i| &self.processes[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::filter::FilterClass;
    use crate::system::process::test_record;

    fn context() -> FilterContext {
        FilterContext {
            current_user: "tester".into(),
            application_marker: "/Applications/".into(),
        }
    }

    fn assembled() -> SystemSnapshot {
        let mut daemon = test_record(5, 1, "sshd");
        daemon.owner = "root".into();
        SystemSnapshot::assemble(
            3,
            context(),
            vec![test_record(1, 0, "init"), daemon, test_record(9, 5, "bash")],
            HashMap::from([(5, 2)]),
        )
    }

    #[test]
    fn connection_counts_are_attached_by_pid() {
        let snapshot = assembled();
        assert_eq!(snapshot.process(5).and_then(|r| r.connection_count), Some(2));
        assert_eq!(snapshot.process(9).and_then(|r| r.connection_count), None);
        assert_eq!(snapshot.forest.find(5).and_then(|r| r.connection_count), Some(2));
    }

    #[test]
    fn counts_partition_all() {
        let snapshot = assembled();
        assert_eq!(snapshot.counts.all, 3);
        assert_eq!(snapshot.counts.mine, 2);
        assert_eq!(snapshot.counts.others, 1);
        assert_eq!(snapshot.counts.service_accounts, 1);
    }

    #[test]
    fn views_apply_filter_with_snapshot_context() {
        let snapshot = assembled();
        let tree = snapshot.tree_view(&ProcessFilter::new(FilterClass::Mine, "bash"));
        assert_eq!(tree.pids(), vec![1, 5, 9]);

        let flat = snapshot.flat_view(&ProcessFilter::new(FilterClass::Others, ""));
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].name, "sshd");
    }

    #[test]
    fn default_is_placeholder() {
        let snapshot = SystemSnapshot::default();
        assert!(snapshot.is_placeholder());
        assert!(snapshot.forest.is_empty());
        assert_eq!(snapshot.process(1), None);
    }
}
