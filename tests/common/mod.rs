#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use proctree::system::process::ProcessRecord;
use proctree::system::source::{
    AF_INET, Descriptor, DescriptorKind, InetEndpoint, ProcessSource, RawProcess, ResourceUsage,
    SOCK_STREAM, SocketInfo, SocketSource, SourceError,
};

pub fn record(pid: u32, parent_pid: u32, name: &str) -> ProcessRecord {
    ProcessRecord {
        pid,
        parent_pid,
        owner: "tester".to_string(),
        cpu_percent: 0.0,
        resident_bytes: 4096,
        virtual_bytes: 8192,
        threads: 1,
        priority: 31,
        nice: 0,
        name: name.to_string(),
        command_path: format!("/usr/bin/{name}"),
        connection_count: None,
        children: Vec::new(),
    }
}

/// A process table that advances every process by `cpu_step_ns` of CPU time
/// and `wall_step_ns` of clock per enumeration.
pub struct ScriptedSource {
    pub table: Vec<(u32, u32, u32, &'static str)>,
    pub cpu_step_ns: u64,
    pub wall_step_ns: u64,
    pub delay: Duration,
    pub passes: Arc<AtomicUsize>,
    pub panic_on_pass: Option<u64>,
    pass: u64,
}

impl ScriptedSource {
    pub fn new(table: Vec<(u32, u32, u32, &'static str)>) -> Self {
        ScriptedSource {
            table,
            cpu_step_ns: 500,
            wall_step_ns: 1000,
            delay: Duration::ZERO,
            passes: Arc::new(AtomicUsize::new(0)),
            panic_on_pass: None,
            pass: 0,
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Panic inside the given enumeration, counting from 1.
    pub fn panicking_on(mut self, pass: u64) -> Self {
        self.panic_on_pass = Some(pass);
        self
    }
}

impl ProcessSource for ScriptedSource {
    fn processes(&mut self) -> Result<Vec<RawProcess>, SourceError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.pass += 1;
        self.passes.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_pass == Some(self.pass) {
            panic!("process table read blew up on pass {}", self.pass);
        }
        Ok(self
            .table
            .iter()
            .map(|&(pid, parent_pid, uid, name)| RawProcess {
                pid,
                parent_pid,
                uid: Some(uid),
                name: name.to_string(),
                exe: Some(PathBuf::from(format!("/usr/bin/{name}"))),
            })
            .collect())
    }

    fn resource_usage(&mut self, pid: u32) -> Result<ResourceUsage, SourceError> {
        if !self.table.iter().any(|p| p.0 == pid) {
            return Err(SourceError::Gone(pid));
        }
        Ok(ResourceUsage {
            cpu_time_ns: self.pass * self.cpu_step_ns,
            observed_at_ns: self.pass * self.wall_step_ns,
            resident_bytes: 1024 * u64::from(pid),
            virtual_bytes: 4096 * u64::from(pid),
            threads: 1,
            priority: 31,
            nice: 0,
        })
    }

    fn user_name(&mut self, uid: u32) -> Option<String> {
        match uid {
            0 => Some("root".to_string()),
            501 => Some("alice".to_string()),
            _ => None,
        }
    }

    fn logical_cores(&self) -> usize {
        2
    }
}

/// Every pid in `listeners` owns that many TCP listeners on 127.0.0.1.
#[derive(Default)]
pub struct ScriptedSockets {
    pub listeners: Mutex<HashMap<u32, usize>>,
}

impl ScriptedSockets {
    pub fn with(listeners: &[(u32, usize)]) -> Self {
        ScriptedSockets {
            listeners: Mutex::new(listeners.iter().copied().collect()),
        }
    }
}

impl SocketSource for ScriptedSockets {
    fn descriptors(&self, pid: u32) -> Result<Vec<Descriptor>, SourceError> {
        let count = self.listeners.lock().get(&pid).copied().unwrap_or(0);
        Ok((0..count)
            .map(|i| Descriptor {
                fd: 3 + i as i32,
                kind: DescriptorKind::Socket { handle: i as u64 },
            })
            .collect())
    }

    fn socket_info(&self, _pid: u32, descriptor: &Descriptor) -> Result<SocketInfo, SourceError> {
        Ok(SocketInfo {
            family: AF_INET,
            socket_type: SOCK_STREAM,
            local: InetEndpoint::v4([127, 0, 0, 1], 8000 + descriptor.fd as u16),
            remote: InetEndpoint::v4([0; 4], 0),
            tcp_state: Some(1),
        })
    }
}
