use std::collections::{HashMap, HashSet};

use serde::Serialize;

pub const INIT_PID: u32 = 1;
pub const UNKNOWN_OWNER: &str = "unknown";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent_pid: u32,
    pub owner: String,
    pub cpu_percent: f32,
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub threads: u32,
    pub priority: i32,
    pub nice: i32,
    pub name: String,
    pub command_path: String,
    pub connection_count: Option<usize>,
    pub children: Vec<ProcessRecord>,
}

impl ProcessRecord {
    /// Copy of this record without its subtree.
    pub fn detached(&self) -> ProcessRecord {
        ProcessRecord {
            pid: self.pid,
            parent_pid: self.parent_pid,
            owner: self.owner.clone(),
            cpu_percent: self.cpu_percent,
            resident_bytes: self.resident_bytes,
            virtual_bytes: self.virtual_bytes,
            threads: self.threads,
            priority: self.priority,
            nice: self.nice,
            name: self.name.clone(),
            command_path: self.command_path.clone(),
            connection_count: self.connection_count,
            children: Vec::new(),
        }
    }

    /// Number of records in this subtree, including `self`.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(ProcessRecord::subtree_len).sum::<usize>()
    }
}

/// Ordered roots, each owning its descendants. Children and roots are sorted by pid.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProcessForest {
    pub roots: Vec<ProcessRecord>,
}

impl ProcessForest {
    pub fn len(&self) -> usize {
        self.roots.iter().map(ProcessRecord::subtree_len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Pre-order walk yielding `(depth, record)`.
    pub fn iter(&self) -> ForestIter<'_> {
        ForestIter {
            stack: self.roots.iter().rev().map(|r| (0, r)).collect(),
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.iter().map(|(_, r)| r.pid).collect()
    }

    pub fn find(&self, pid: u32) -> Option<&ProcessRecord> {
        self.iter().map(|(_, r)| r).find(|r| r.pid == pid)
    }
}

pub struct ForestIter<'a> {
    stack: Vec<(usize, &'a ProcessRecord)>,
}

impl<'a> Iterator for ForestIter<'a> {
    type Item = (usize, &'a ProcessRecord);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, node) = self.stack.pop()?;
        self.stack
            .extend(node.children.iter().rev().map(|c| (depth + 1, c)));
        Some((depth, node))
    }
}

/// Build a forest from a flat snapshot without touching the input.
///
/// A record is a root when its parent is pid 0 or absent from the snapshot.
/// When init (pid 1) is present it is always a root and adopts every record
/// whose parent is 1. Records only reachable through a parent cycle are
/// promoted to roots (lowest pid first) so every pid appears exactly once.
pub fn build_process_forest(records: &[ProcessRecord]) -> ProcessForest {
    let _span = tracing::debug_span!("hierarchy.build", records = records.len()).entered();

    let by_pid: HashMap<u32, &ProcessRecord> = records.iter().map(|r| (r.pid, r)).collect();

    let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
    for record in by_pid.values() {
        children_of
            .entry(record.parent_pid)
            .or_default()
            .push(record.pid);
    }
    for children in children_of.values_mut() {
        children.sort_unstable();
    }

    let init_present = by_pid.contains_key(&INIT_PID);
    let mut root_pids: Vec<u32> = by_pid
        .values()
        .filter(|r| {
            r.pid == INIT_PID
                || r.parent_pid == 0
                || (r.parent_pid == INIT_PID && !init_present)
                || !by_pid.contains_key(&r.parent_pid)
        })
        .map(|r| r.pid)
        .collect();
    root_pids.sort_unstable();

    let mut builder = ForestBuilder {
        by_pid: &by_pid,
        children_of: &children_of,
        placed: HashSet::with_capacity(by_pid.len()),
        ancestors: Vec::new(),
    };

    let mut roots: Vec<ProcessRecord> = root_pids
        .into_iter()
        .filter_map(|pid| builder.expand(pid))
        .collect();

    if builder.placed.len() < by_pid.len() {
        let mut stranded: Vec<u32> = by_pid
            .keys()
            .copied()
            .filter(|pid| !builder.placed.contains(pid))
            .collect();
        stranded.sort_unstable();
        tracing::debug!(count = stranded.len(), "parent cycle detected in process table");
        for pid in stranded {
            if let Some(node) = builder.expand(pid) {
                roots.push(node);
            }
        }
    }

    roots.sort_by_key(|r| r.pid);
    ProcessForest { roots }
}

struct ForestBuilder<'a> {
    by_pid: &'a HashMap<u32, &'a ProcessRecord>,
    children_of: &'a HashMap<u32, Vec<u32>>,
    placed: HashSet<u32>,
    ancestors: Vec<u32>,
}

impl ForestBuilder<'_> {
    fn expand(&mut self, pid: u32) -> Option<ProcessRecord> {
        if self.ancestors.contains(&pid) {
            tracing::trace!(pid, "process is its own ancestor; not descending");
            return None;
        }
        if !self.placed.insert(pid) {
            return None;
        }
        let mut node = self.by_pid.get(&pid)?.detached();

        self.ancestors.push(pid);
        if let Some(children) = self.children_of.get(&pid) {
            node.children = children
                .iter()
                .filter_map(|&child| self.expand(child))
                .collect();
        }
        self.ancestors.pop();

        Some(node)
    }
}

#[cfg(test)]
pub(crate) fn test_record(pid: u32, parent_pid: u32, name: &str) -> ProcessRecord {
    ProcessRecord {
        pid,
        parent_pid,
        owner: "tester".into(),
        cpu_percent: 0.0,
        resident_bytes: 0,
        virtual_bytes: 0,
        threads: 1,
        priority: 31,
        nice: 0,
        name: name.into(),
        command_path: format!("/usr/bin/{name}"),
        connection_count: None,
        children: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child_pids(node: &ProcessRecord) -> Vec<u32> {
        node.children.iter().map(|c| c.pid).collect()
    }

    #[test]
    fn init_adopts_its_children_and_stays_single_root() {
        let records = vec![
            test_record(3, 1, "c"),
            test_record(1, 0, "init"),
            test_record(2, 1, "b"),
            test_record(4, 2, "d"),
        ];
        let forest = build_process_forest(&records);
        assert_eq!(forest.roots.len(), 1);
        assert_eq!(forest.roots[0].pid, 1);
        assert_eq!(child_pids(&forest.roots[0]), vec![2, 3]);
        assert_eq!(child_pids(&forest.roots[0].children[0]), vec![4]);
    }

    #[test]
    fn children_of_missing_init_become_roots() {
        let records = vec![test_record(7, 1, "a"), test_record(5, 1, "b")];
        let forest = build_process_forest(&records);
        assert_eq!(forest.pids(), vec![5, 7]);
        assert!(forest.roots.iter().all(|r| r.children.is_empty()));
    }

    #[test]
    fn orphan_is_root() {
        let records = vec![
            test_record(1, 0, "init"),
            test_record(40, 4040, "orphan"),
            test_record(41, 40, "orphan_child"),
        ];
        let forest = build_process_forest(&records);
        let roots: Vec<u32> = forest.roots.iter().map(|r| r.pid).collect();
        assert_eq!(roots, vec![1, 40]);
        assert_eq!(child_pids(&forest.roots[1]), vec![41]);
    }

    #[test]
    fn two_node_cycle_terminates_with_each_pid_once() {
        let records = vec![test_record(5, 9, "five"), test_record(9, 5, "nine")];
        let forest = build_process_forest(&records);
        let mut pids = forest.pids();
        pids.sort_unstable();
        assert_eq!(pids, vec![5, 9]);
        assert_eq!(forest.roots[0].pid, 5);
        assert_eq!(child_pids(&forest.roots[0]), vec![9]);
    }

    #[test]
    fn self_parent_is_a_leaf_root() {
        let records = vec![test_record(1, 0, "init"), test_record(6, 6, "selfish")];
        let forest = build_process_forest(&records);
        assert_eq!(forest.len(), 2);
        let selfish = forest.find(6).expect("pid 6 missing");
        assert!(selfish.children.is_empty());
    }

    #[test]
    fn init_with_corrupt_parent_appears_once() {
        let records = vec![test_record(1, 7, "init"), test_record(7, 1, "weird")];
        let forest = build_process_forest(&records);
        assert_eq!(forest.pids(), vec![1, 7]);
        assert_eq!(forest.roots.len(), 1);
    }

    #[test]
    fn input_children_are_ignored_and_input_untouched() {
        let mut parent = test_record(10, 0, "parent");
        parent.children.push(test_record(99, 10, "stale"));
        let records = vec![parent.clone(), test_record(11, 10, "child")];
        let forest = build_process_forest(&records);
        assert_eq!(child_pids(&forest.roots[0]), vec![11]);
        assert_eq!(records[0], parent);
    }

    #[test]
    fn iter_reports_depths_in_preorder() {
        let records = vec![
            test_record(1, 0, "init"),
            test_record(2, 1, "a"),
            test_record(3, 2, "b"),
            test_record(4, 1, "c"),
        ];
        let forest = build_process_forest(&records);
        let walked: Vec<(usize, u32)> = forest.iter().map(|(d, r)| (d, r.pid)).collect();
        assert_eq!(walked, vec![(0, 1), (1, 2), (2, 3), (1, 4)]);
    }

    #[test]
    fn empty_input_yields_empty_forest() {
        let forest = build_process_forest(&[]);
        assert!(forest.is_empty());
        assert_eq!(forest.len(), 0);
    }
}
