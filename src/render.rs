//! Plain-text views of snapshots for the command-line front end.

use std::fmt::Write as _;

use crate::format::{format_bytes, pad_unicode, truncate_unicode};
use crate::system::filter::{FilterClass, FilterCounts};
use crate::system::network::{AddressFamily, NetworkConnectionRecord};
use crate::system::process::{ProcessForest, ProcessRecord};

const USER_WIDTH: usize = 10;
const NAME_WIDTH: usize = 48;
const ENDPOINT_WIDTH: usize = 46;

/// `pid name` per line, two spaces of indent per tree level.
pub fn outline(forest: &ProcessForest) -> String {
    let mut out = String::new();
    for (depth, record) in forest.iter() {
        let _ = writeln!(out, "{}{} {}", "  ".repeat(depth), record.pid, record.name);
    }
    out
}

pub fn render_tree(forest: &ProcessForest) -> String {
    let mut out = header();
    for (depth, record) in forest.iter() {
        let indent = "  ".repeat(depth);
        let name = truncate_unicode(&record.name, NAME_WIDTH.saturating_sub(indent.len()).max(8));
        push_row(&mut out, record, &format!("{indent}{name}"));
    }
    out
}

pub fn render_flat(records: &[ProcessRecord]) -> String {
    let mut out = header();
    for record in records {
        push_row(&mut out, record, &truncate_unicode(&record.name, NAME_WIDTH));
    }
    out
}

fn header() -> String {
    format!(
        "{:>7} {} {:>6} {:>9} {:>4} {:>5}  NAME\n",
        "PID",
        pad_unicode("USER", USER_WIDTH),
        "CPU%",
        "RSS",
        "THR",
        "CONN"
    )
}

fn push_row(out: &mut String, record: &ProcessRecord, name: &str) {
    let connections = record
        .connection_count
        .map_or_else(|| "-".to_string(), |n| n.to_string());
    let _ = writeln!(
        out,
        "{:>7} {} {:>6.1} {:>9} {:>4} {:>5}  {}",
        record.pid,
        pad_unicode(&record.owner, USER_WIDTH),
        record.cpu_percent,
        format_bytes(record.resident_bytes),
        record.threads,
        connections,
        name
    );
}

/// `all 312 | mine 40 | ...` with the active class bracketed.
pub fn render_counts(counts: &FilterCounts, active: FilterClass) -> String {
    [
        FilterClass::All,
        FilterClass::Mine,
        FilterClass::Others,
        FilterClass::Applications,
        FilterClass::ServiceAccounts,
    ]
    .into_iter()
    .map(|class| {
        let cell = format!("{} {}", class.label(), counts.get(class));
        if class == active {
            format!("[{cell}]")
        } else {
            cell
        }
    })
    .collect::<Vec<_>>()
    .join(" | ")
}

pub fn render_connections(pid: u32, records: &[NetworkConnectionRecord]) -> String {
    if records.is_empty() {
        return format!("no network connections for pid {pid}\n");
    }
    let mut out = format!(
        "{:<5} {:<5} {} {} STATE\n",
        "PROTO",
        "FAM",
        pad_unicode("LOCAL", ENDPOINT_WIDTH),
        pad_unicode("REMOTE", ENDPOINT_WIDTH)
    );
    for record in records {
        let local = endpoint(record.family, &record.local_address, record.local_port);
        let remote = endpoint(record.family, &record.remote_address, record.remote_port);
        let _ = writeln!(
            out,
            "{:<5} {:<5} {} {} {}",
            record.protocol.label(),
            record.family.label(),
            pad_unicode(&local, ENDPOINT_WIDTH),
            pad_unicode(&remote, ENDPOINT_WIDTH),
            record.state
        );
    }
    out
}

fn endpoint(family: AddressFamily, address: &str, port: u16) -> String {
    match family {
        AddressFamily::Ipv6 if address.contains(':') => format!("[{address}]:{port}"),
        _ => format!("{address}:{port}"),
    }
}
