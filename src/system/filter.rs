use serde::Serialize;

use super::process::{ProcessForest, ProcessRecord};

/// Keep every record matching `predicate` plus the ancestor chain of any
/// matching descendant. Retained nodes keep only their retained children.
pub fn filter_forest<P>(forest: &ProcessForest, predicate: P) -> ProcessForest
where
    P: Fn(&ProcessRecord) -> bool,
{
    ProcessForest {
        roots: forest
            .roots
            .iter()
            .filter_map(|root| retain_subtree(root, &predicate))
            .collect(),
    }
}

fn retain_subtree<P>(node: &ProcessRecord, predicate: &P) -> Option<ProcessRecord>
where
    P: Fn(&ProcessRecord) -> bool,
{
    let children: Vec<ProcessRecord> = node
        .children
        .iter()
        .filter_map(|child| retain_subtree(child, predicate))
        .collect();

    if children.is_empty() && !predicate(node) {
        return None;
    }
    let mut kept = node.detached();
    kept.children = children;
    Some(kept)
}

/// Directly matching records only, without children, ordered by name
/// (case-insensitive) then pid.
pub fn filter_flat<P>(records: &[ProcessRecord], predicate: P) -> Vec<ProcessRecord>
where
    P: Fn(&ProcessRecord) -> bool,
{
    let mut out: Vec<ProcessRecord> = records
        .iter()
        .filter(|r| predicate(r))
        .map(ProcessRecord::detached)
        .collect();
    out.sort_by_cached_key(|r| (r.name.to_lowercase(), r.pid));
    out
}

pub fn owned_by(user: &str) -> impl Fn(&ProcessRecord) -> bool + '_ {
    move |r: &ProcessRecord| r.owner == user
}

pub fn not_owned_by(user: &str) -> impl Fn(&ProcessRecord) -> bool + '_ {
    move |r: &ProcessRecord| r.owner != user
}

pub fn command_contains(needle: &str) -> impl Fn(&ProcessRecord) -> bool + '_ {
    move |r: &ProcessRecord| !needle.is_empty() && r.command_path.contains(needle)
}

/// Root or an underscore-prefixed daemon account.
pub fn is_service_account(r: &ProcessRecord) -> bool {
    r.owner == "root" || r.owner.starts_with('_')
}

/// Case-insensitive substring search over name, command path and pid.
/// An empty query matches everything.
pub fn matches_search(query: &str) -> impl Fn(&ProcessRecord) -> bool + use<> {
    let needle = query.trim().to_lowercase();
    move |r: &ProcessRecord| {
        needle.is_empty()
            || r.name.to_lowercase().contains(&needle)
            || r.command_path.to_lowercase().contains(&needle)
            || r.pid.to_string().contains(&needle)
    }
}

pub fn both<A, B>(a: A, b: B) -> impl Fn(&ProcessRecord) -> bool
where
    A: Fn(&ProcessRecord) -> bool,
    B: Fn(&ProcessRecord) -> bool,
{
    move |r: &ProcessRecord| a(r) && b(r)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FilterClass {
    #[default]
    All,
    Mine,
    /// Exact complement of `Mine`.
    Others,
    Applications,
    ServiceAccounts,
}

impl FilterClass {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "mine" | "my" => FilterClass::Mine,
            "others" | "other" | "system" => FilterClass::Others,
            "apps" | "applications" => FilterClass::Applications,
            "services" | "service_accounts" => FilterClass::ServiceAccounts,
            _ => FilterClass::All,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FilterClass::All => "all",
            FilterClass::Mine => "mine",
            FilterClass::Others => "others",
            FilterClass::Applications => "apps",
            FilterClass::ServiceAccounts => "services",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    #[default]
    Tree,
    Flat,
}

impl ViewMode {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "flat" | "list" => ViewMode::Flat,
            _ => ViewMode::Tree,
        }
    }
}

/// Who "mine" refers to and what marks an application path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterContext {
    pub current_user: String,
    pub application_marker: String,
}

/// A filter class ANDed with a free-text search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessFilter {
    pub class: FilterClass,
    pub search: String,
}

impl ProcessFilter {
    pub fn new(class: FilterClass, search: impl Into<String>) -> Self {
        Self {
            class,
            search: search.into(),
        }
    }

    pub fn predicate<'a>(
        &self,
        ctx: &'a FilterContext,
    ) -> impl Fn(&ProcessRecord) -> bool + use<'a> {
        both(class_predicate(self.class, ctx), matches_search(&self.search))
    }
}

fn class_predicate(
    class: FilterClass,
    ctx: &FilterContext,
) -> impl Fn(&ProcessRecord) -> bool + '_ {
    let mine = owned_by(&ctx.current_user);
    let others = not_owned_by(&ctx.current_user);
    let app = command_contains(&ctx.application_marker);
    move |r: &ProcessRecord| match class {
        FilterClass::All => true,
        FilterClass::Mine => mine(r),
        FilterClass::Others => others(r),
        FilterClass::Applications => app(r),
        FilterClass::ServiceAccounts => is_service_account(r),
    }
}

/// Per-class totals, always taken from the ungrouped flat list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterCounts {
    pub all: usize,
    pub mine: usize,
    pub others: usize,
    pub applications: usize,
    pub service_accounts: usize,
}

impl FilterCounts {
    pub fn from_records(records: &[ProcessRecord], ctx: &FilterContext) -> Self {
        let count = |class| {
            let filter = ProcessFilter::new(class, "");
            filter_flat(records, filter.predicate(ctx)).len()
        };
        FilterCounts {
            all: count(FilterClass::All),
            mine: count(FilterClass::Mine),
            others: count(FilterClass::Others),
            applications: count(FilterClass::Applications),
            service_accounts: count(FilterClass::ServiceAccounts),
        }
    }

    pub fn get(&self, class: FilterClass) -> usize {
        match class {
            FilterClass::All => self.all,
            FilterClass::Mine => self.mine,
            FilterClass::Others => self.others,
            FilterClass::Applications => self.applications,
            FilterClass::ServiceAccounts => self.service_accounts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::process::{build_process_forest, test_record};

    fn owned(pid: u32, ppid: u32, name: &str, owner: &str) -> ProcessRecord {
        let mut r = test_record(pid, ppid, name);
        r.owner = owner.into();
        r
    }

    fn sample_forest() -> ProcessForest {
        build_process_forest(&[
            owned(1, 0, "launchd", "root"),
            owned(10, 1, "loginwindow", "alice"),
            owned(11, 10, "Finder", "alice"),
            owned(12, 10, "Dock", "alice"),
            owned(13, 12, "curl", "alice"),
            owned(20, 1, "syslogd", "root"),
        ])
    }

    #[test]
    fn deep_match_keeps_ancestor_chain_only() {
        let forest = sample_forest();
        let filtered = filter_forest(&forest, matches_search("curl"));
        assert_eq!(filtered.pids(), vec![1, 10, 12, 13]);
        let login = &filtered.roots[0].children[0];
        assert_eq!(login.children.len(), 1);
    }

    #[test]
    fn direct_match_drops_non_matching_children() {
        let forest = sample_forest();
        let filtered = filter_forest(&forest, matches_search("loginwindow"));
        assert_eq!(filtered.pids(), vec![1, 10]);
    }

    #[test]
    fn no_match_yields_empty_forest() {
        let filtered = filter_forest(&sample_forest(), matches_search("nothing-here"));
        assert!(filtered.is_empty());
    }

    #[test]
    fn search_is_case_insensitive_and_covers_pid() {
        let forest = sample_forest();
        assert_eq!(filter_flat(&forest.roots, matches_search("LAUNCHD")).len(), 1);
        let flat: Vec<ProcessRecord> = forest.iter().map(|(_, r)| r.detached()).collect();
        let by_pid = filter_flat(&flat, matches_search("13"));
        assert_eq!(by_pid.iter().map(|r| r.pid).collect::<Vec<_>>(), vec![13]);
    }

    #[test]
    fn flat_is_sorted_by_name_and_stripped() {
        let forest = sample_forest();
        let flat = filter_flat(&forest.roots, |_| true);
        assert!(flat[0].children.is_empty());

        let records: Vec<ProcessRecord> = forest.iter().map(|(_, r)| r.detached()).collect();
        let names: Vec<String> = filter_flat(&records, owned_by("alice"))
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["curl", "Dock", "Finder", "loginwindow"]);
    }

    #[test]
    fn class_and_search_are_anded() {
        let ctx = FilterContext {
            current_user: "alice".into(),
            application_marker: "/Applications/".into(),
        };
        let forest = sample_forest();
        let filter = ProcessFilter::new(FilterClass::Others, "log");
        let filtered = filter_forest(&forest, filter.predicate(&ctx));
        // syslogd matches; loginwindow is alice's
        assert_eq!(filtered.pids(), vec![1, 20]);
    }

    #[test]
    fn mine_and_others_partition_exactly() {
        let ctx = FilterContext {
            current_user: "alice".into(),
            application_marker: "/Applications/".into(),
        };
        let records: Vec<ProcessRecord> =
            sample_forest().iter().map(|(_, r)| r.detached()).collect();
        let counts = FilterCounts::from_records(&records, &ctx);
        assert_eq!(counts.all, 6);
        assert_eq!(counts.mine + counts.others, counts.all);
        assert_eq!(counts.service_accounts, 2);
    }

    #[test]
    fn applications_match_command_path_marker() {
        let mut app = owned(30, 1, "Safari", "alice");
        app.command_path = "/Applications/Safari.app/Contents/MacOS/Safari".into();
        let records = vec![app, owned(31, 1, "bash", "alice")];
        let ctx = FilterContext {
            current_user: "alice".into(),
            application_marker: "/Applications/".into(),
        };
        let counts = FilterCounts::from_records(&records, &ctx);
        assert_eq!(counts.applications, 1);
        assert_eq!(counts.get(FilterClass::Applications), 1);
    }

    #[test]
    fn empty_marker_matches_no_application() {
        let records = vec![owned(31, 1, "bash", "alice")];
        assert!(filter_flat(&records, command_contains("")).is_empty());
    }

    #[test]
    fn class_names_parse_with_fallback() {
        assert_eq!(FilterClass::from_str_config("Mine"), FilterClass::Mine);
        assert_eq!(FilterClass::from_str_config("system"), FilterClass::Others);
        assert_eq!(FilterClass::from_str_config("apps"), FilterClass::Applications);
        assert_eq!(FilterClass::from_str_config("bogus"), FilterClass::All);
        assert_eq!(ViewMode::from_str_config("FLAT"), ViewMode::Flat);
        assert_eq!(ViewMode::from_str_config(""), ViewMode::Tree);
    }
}
