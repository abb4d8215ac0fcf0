use std::collections::HashMap;
use std::path::Path;

use super::process::{ProcessRecord, UNKNOWN_OWNER};
use super::source::{ProcessSource, RawProcess, ResourceUsage};

/// Previous observation of one process, in the source's monotonic nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuSample {
    pub cpu_time_ns: u64,
    pub observed_at_ns: u64,
}

pub type CpuSamples = HashMap<u32, CpuSample>;

/// Owns a process source and the CPU baseline carried between refreshes.
pub struct Sampler<S> {
    source: S,
    cores: usize,
    samples: CpuSamples,
}

impl<S: ProcessSource> Sampler<S> {
    pub fn new(source: S) -> Self {
        let cores = source.logical_cores().max(1);
        Self {
            source,
            cores,
            samples: CpuSamples::new(),
        }
    }

    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn samples(&self) -> &CpuSamples {
        &self.samples
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Take one snapshot and replace the baseline with the samples it produced.
    pub fn refresh(&mut self) -> Vec<ProcessRecord> {
        let (records, updated) = sample(&mut self.source, self.cores, &self.samples);
        self.samples = updated;
        records
    }
}

/// One pass over the source.
///
/// Returns the flat record list (sorted by pid, pid 0 excluded) and a sample map
/// holding only the pids whose usage block was read in this pass. A failed
/// enumeration yields two empty collections.
pub fn sample<S: ProcessSource + ?Sized>(
    source: &mut S,
    cores: usize,
    previous: &CpuSamples,
) -> (Vec<ProcessRecord>, CpuSamples) {
    let _span = tracing::debug_span!("sampler.sample", previous = previous.len()).entered();

    let raw = match source.processes() {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(error = %err, "process enumeration failed; skipping this cycle");
            return (Vec::new(), CpuSamples::new());
        }
    };

    let mut records = Vec::with_capacity(raw.len());
    let mut updated = CpuSamples::with_capacity(raw.len());

    for process in raw.into_iter().filter(|p| p.pid != 0) {
        let owner = process
            .uid
            .and_then(|uid| source.user_name(uid))
            .unwrap_or_else(|| UNKNOWN_OWNER.to_string());

        let (usage, cpu_percent) = match source.resource_usage(process.pid) {
            Ok(usage) => {
                let current = CpuSample {
                    cpu_time_ns: usage.cpu_time_ns,
                    observed_at_ns: usage.observed_at_ns,
                };
                let cpu = cpu_percent(previous.get(&process.pid), &current, cores);
                updated.insert(process.pid, current);
                (usage, cpu)
            }
            Err(err) => {
                tracing::trace!(pid = process.pid, error = %err, "resource usage unavailable");
                (ResourceUsage::default(), 0.0)
            }
        };

        records.push(make_record(process, owner, usage, cpu_percent));
    }

    records.sort_by_key(|r| r.pid);
    (records, updated)
}

/// CPU share since `previous`, clamped to `[0, cores * 100]`.
///
/// No baseline, a backwards CPU counter (pid reuse) or a zero interval all
/// report 0.0.
pub fn cpu_percent(previous: Option<&CpuSample>, current: &CpuSample, cores: usize) -> f32 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let Some(cpu_delta) = current.cpu_time_ns.checked_sub(previous.cpu_time_ns) else {
        return 0.0;
    };
    let wall_delta = current
        .observed_at_ns
        .saturating_sub(previous.observed_at_ns);
    if wall_delta == 0 {
        return 0.0;
    }

    let ceiling = cores.max(1) as f64 * 100.0;
    let percent = cpu_delta as f64 / wall_delta as f64 * 100.0;
    percent.clamp(0.0, ceiling) as f32
}

fn make_record(
    process: RawProcess,
    owner: String,
    usage: ResourceUsage,
    cpu_percent: f32,
) -> ProcessRecord {
    let exe_name = process
        .exe
        .as_deref()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned());
    let name = if process.name.is_empty() {
        exe_name.unwrap_or_default()
    } else {
        process.name
    };
    let command_path = process
        .exe
        .as_deref()
        .filter(|p| p.is_absolute())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());

    ProcessRecord {
        pid: process.pid,
        parent_pid: process.parent_pid,
        owner,
        cpu_percent,
        resident_bytes: usage.resident_bytes,
        virtual_bytes: usage.virtual_bytes,
        threads: usage.threads,
        priority: usage.priority,
        nice: usage.nice,
        name,
        command_path,
        connection_count: None,
        children: Vec::new(),
    }
}
