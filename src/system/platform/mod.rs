use super::source::{Descriptor, SocketInfo, SourceError};

/// Scheduling fields sysinfo does not expose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedInfo {
    pub priority: i32,
    pub nice: i32,
    pub threads: u32,
}

pub trait PlatformExtensions {
    fn process_sched(pid: u32) -> Result<SchedInfo, SourceError>;
    fn descriptors(pid: u32) -> Result<Vec<Descriptor>, SourceError>;
    fn socket_info(pid: u32, descriptor: &Descriptor) -> Result<SocketInfo, SourceError>;
    fn current_uid() -> Option<u32>;
    fn numeric_uid(uid: &sysinfo::Uid) -> Option<u32>;
}

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod unsupported;

#[cfg(target_os = "linux")]
use linux as platform_impl;
#[cfg(target_os = "macos")]
use macos as platform_impl;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
use unsupported as platform_impl;

pub fn process_sched(pid: u32) -> Result<SchedInfo, SourceError> {
    platform_impl::Platform::process_sched(pid)
}

pub fn descriptors(pid: u32) -> Result<Vec<Descriptor>, SourceError> {
    platform_impl::Platform::descriptors(pid)
}

pub fn socket_info(pid: u32, descriptor: &Descriptor) -> Result<SocketInfo, SourceError> {
    platform_impl::Platform::socket_info(pid, descriptor)
}

pub fn current_uid() -> Option<u32> {
    platform_impl::Platform::current_uid()
}

pub fn numeric_uid(uid: &sysinfo::Uid) -> Option<u32> {
    platform_impl::Platform::numeric_uid(uid)
}
