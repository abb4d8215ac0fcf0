//! The seam between the inspector core and the operating system.
//!
//! Everything the core knows about the host arrives through [`ProcessSource`]
//! (process enumeration and per-process counters) and [`SocketSource`]
//! (descriptor tables and socket info blocks). The host implementations live in
//! `system::collector`; tests drive the core with scripted sources instead.

use std::path::PathBuf;

use thiserror::Error;

pub use libc::{AF_INET, AF_INET6, SOCK_DGRAM, SOCK_STREAM};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("process {0} no longer exists")]
    Gone(u32),
    #[error("permission denied for process {0}")]
    PermissionDenied(u32),
    #[error("descriptor {fd} of process {pid} is not an internet socket")]
    NotInet { pid: u32, fd: i32 },
    #[error("not supported on this platform")]
    Unsupported,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("kernel query failed: {0}")]
    Kernel(String),
}

/// Identity fields of one process as returned by bulk enumeration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawProcess {
    pub pid: u32,
    pub parent_pid: u32,
    pub uid: Option<u32>,
    pub name: String,
    pub exe: Option<PathBuf>,
}

/// Per-process resource-usage counter block.
///
/// `cpu_time_ns` is cumulative since process start; `observed_at_ns` comes from
/// a monotonic clock in the same unit. Everything else is a point-in-time value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_time_ns: u64,
    pub observed_at_ns: u64,
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub threads: u32,
    pub priority: i32,
    pub nice: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorKind {
    /// `handle` is whatever the platform needs to find the socket again
    /// (the socket inode on Linux, unused on macOS).
    Socket { handle: u64 },
    File,
    Pipe,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub fd: i32,
    pub kind: DescriptorKind,
}

/// An internet endpoint in kernel layout: IPv4 addresses occupy the last four
/// bytes of `addr`, the port is kept in network byte order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InetEndpoint {
    pub addr: [u8; 16],
    pub port_be: u16,
}

impl InetEndpoint {
    pub fn v4(octets: [u8; 4], port: u16) -> Self {
        let mut addr = [0u8; 16];
        addr[12..].copy_from_slice(&octets);
        Self {
            addr,
            port_be: port.to_be(),
        }
    }

    pub fn v6(octets: [u8; 16], port: u16) -> Self {
        Self {
            addr: octets,
            port_be: port.to_be(),
        }
    }
}

/// Protocol info block of one socket descriptor.
///
/// `family` and `socket_type` carry the host's `AF_*` / `SOCK_*` codes.
/// `tcp_state` uses BSD `tcp_fsm.h` numbering and is only set for TCP sockets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketInfo {
    pub family: i32,
    pub socket_type: i32,
    pub local: InetEndpoint,
    pub remote: InetEndpoint,
    pub tcp_state: Option<i32>,
}

pub trait ProcessSource {
    /// Bulk enumeration of every process the kernel knows about right now.
    fn processes(&mut self) -> Result<Vec<RawProcess>, SourceError>;

    /// Fails with [`SourceError::Gone`] when the process exited after enumeration.
    fn resource_usage(&mut self, pid: u32) -> Result<ResourceUsage, SourceError>;

    fn user_name(&mut self, uid: u32) -> Option<String>;

    fn logical_cores(&self) -> usize;
}

pub trait SocketSource: Send + Sync {
    fn descriptors(&self, pid: u32) -> Result<Vec<Descriptor>, SourceError>;

    fn socket_info(&self, pid: u32, descriptor: &Descriptor) -> Result<SocketInfo, SourceError>;
}

impl<T: SocketSource + ?Sized> SocketSource for std::sync::Arc<T> {
    fn descriptors(&self, pid: u32) -> Result<Vec<Descriptor>, SourceError> {
        (**self).descriptors(pid)
    }

    fn socket_info(&self, pid: u32, descriptor: &Descriptor) -> Result<SocketInfo, SourceError> {
        (**self).socket_info(pid, descriptor)
    }
}
