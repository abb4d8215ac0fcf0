use std::time::Instant;

use sysinfo::{
    Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users,
    IS_SUPPORTED_SYSTEM,
};

use super::platform::{self, SchedInfo};
use super::source::{
    Descriptor, ProcessSource, RawProcess, ResourceUsage, SocketInfo, SocketSource, SourceError,
};

/// [`ProcessSource`] backed by `sysinfo`, with scheduling fields from the
/// platform layer.
pub struct HostSource {
    sys: System,
    users: Users,
    users_refreshed: bool,
    origin: Instant,
    observed_at_ns: u64,
    cores: usize,
}

impl Default for HostSource {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSource {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        let cores = match sys.cpus().len() {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };
        HostSource {
            sys,
            users: Users::new_with_refreshed_list(),
            users_refreshed: false,
            origin: Instant::now(),
            observed_at_ns: 0,
            cores,
        }
    }

    /// Name of the user running the inspector, used for the "mine" class.
    pub fn current_user(&mut self) -> String {
        platform::current_uid()
            .and_then(|uid| self.user_name(uid))
            .unwrap_or_else(|| super::process::UNKNOWN_OWNER.to_string())
    }

    fn elapsed_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl ProcessSource for HostSource {
    fn processes(&mut self) -> Result<Vec<RawProcess>, SourceError> {
        if !IS_SUPPORTED_SYSTEM {
            return Err(SourceError::Unsupported);
        }
        let _span = tracing::trace_span!("collector.refresh").entered();

        self.users_refreshed = false;
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .without_tasks()
                .with_memory()
                .with_cpu()
                .with_user(UpdateKind::OnlyIfNotSet)
                .with_exe(UpdateKind::OnlyIfNotSet),
        );
        // CPU counters were all read by the refresh above; stamp them together.
        self.observed_at_ns = self.elapsed_ns();

        let processes: Vec<RawProcess> = self
            .sys
            .processes()
            .iter()
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| RawProcess {
                pid: pid.as_u32(),
                parent_pid: process.parent().map(|p| p.as_u32()).unwrap_or(0),
                uid: process.user_id().and_then(platform::numeric_uid),
                name: process.name().to_string_lossy().into_owned(),
                exe: process.exe().map(|p| p.to_path_buf()),
            })
            .collect();

        if processes.is_empty() {
            return Err(SourceError::Kernel("process table is empty".into()));
        }
        Ok(processes)
    }

    fn resource_usage(&mut self, pid: u32) -> Result<ResourceUsage, SourceError> {
        let process = self
            .sys
            .process(Pid::from_u32(pid))
            .ok_or(SourceError::Gone(pid))?;
        let cpu_time_ns = process.accumulated_cpu_time().saturating_mul(1_000_000);
        let resident_bytes = process.memory();
        let virtual_bytes = process.virtual_memory();

        let sched = match platform::process_sched(pid) {
            Ok(sched) => sched,
            Err(SourceError::Gone(pid)) => return Err(SourceError::Gone(pid)),
            Err(err) => {
                tracing::trace!(pid, error = %err, "scheduling info unavailable");
                SchedInfo::default()
            }
        };

        Ok(ResourceUsage {
            cpu_time_ns,
            observed_at_ns: self.observed_at_ns,
            resident_bytes,
            virtual_bytes,
            threads: sched.threads,
            priority: sched.priority,
            nice: sched.nice,
        })
    }

    fn user_name(&mut self, uid: u32) -> Option<String> {
        if let Some(name) = lookup_user(&self.users, uid) {
            return Some(name);
        }
        // New accounts are rare; re-read the user list at most once per pass.
        if !self.users_refreshed {
            self.users.refresh();
            self.users_refreshed = true;
        }
        lookup_user(&self.users, uid)
    }

    fn logical_cores(&self) -> usize {
        self.cores
    }
}

fn lookup_user(users: &Users, uid: u32) -> Option<String> {
    users
        .list()
        .iter()
        .find(|user| platform::numeric_uid(user.id()) == Some(uid))
        .map(|user| user.name().to_string())
}

/// [`SocketSource`] over the host's descriptor tables.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostSockets;

impl SocketSource for HostSockets {
    fn descriptors(&self, pid: u32) -> Result<Vec<Descriptor>, SourceError> {
        platform::descriptors(pid)
    }

    fn socket_info(&self, pid: u32, descriptor: &Descriptor) -> Result<SocketInfo, SourceError> {
        platform::socket_info(pid, descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_source_sees_this_process() {
        if !IS_SUPPORTED_SYSTEM {
            return;
        }
        let mut source = HostSource::new();
        let pid = std::process::id();
        let processes = source.processes().expect("enumeration");
        assert!(processes.iter().any(|p| p.pid == pid));

        let usage = source.resource_usage(pid).expect("own usage");
        assert!(usage.resident_bytes > 0);
        assert!(source.logical_cores() >= 1);
    }

    #[test]
    fn observation_clock_is_monotonic() {
        if !IS_SUPPORTED_SYSTEM {
            return;
        }
        let mut source = HostSource::new();
        let pid = std::process::id();
        source.processes().expect("enumeration");
        let first = source.resource_usage(pid).expect("first read");
        source.processes().expect("enumeration");
        let second = source.resource_usage(pid).expect("second read");
        assert!(second.observed_at_ns >= first.observed_at_ns);
        assert!(second.cpu_time_ns >= first.cpu_time_ns);
    }

    #[test]
    fn one_observation_time_per_pass() {
        if !IS_SUPPORTED_SYSTEM {
            return;
        }
        let mut source = HostSource::new();
        let processes = source.processes().expect("enumeration");
        let stamps: Vec<u64> = processes
            .iter()
            .filter_map(|p| source.resource_usage(p.pid).ok())
            .map(|usage| usage.observed_at_ns)
            .collect();
        assert!(!stamps.is_empty());
        assert!(stamps.iter().all(|&at| at == stamps[0]));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn threads_are_not_listed_as_processes() {
        use std::sync::{Arc, Barrier, mpsc};

        let release = Arc::new(Barrier::new(2));
        let (tid_tx, tid_rx) = mpsc::channel();
        let worker = {
            let release = Arc::clone(&release);
            std::thread::spawn(move || {
                // SAFETY: gettid has no preconditions.
                tid_tx.send(unsafe { libc::gettid() } as u32).unwrap();
                release.wait();
            })
        };
        let tid = tid_rx.recv().unwrap();

        let processes = HostSource::new().processes().expect("enumeration");
        release.wait();
        worker.join().unwrap();

        let pid = std::process::id();
        assert_ne!(tid, pid);
        assert!(processes.iter().any(|p| p.pid == pid));
        assert!(
            processes.iter().all(|p| p.pid != tid),
            "thread {tid} listed as a process"
        );
    }

    #[test]
    fn unknown_pid_is_gone() {
        let mut source = HostSource::new();
        assert!(matches!(
            source.resource_usage(u32::MAX - 1),
            Err(SourceError::Gone(_))
        ));
    }
}
