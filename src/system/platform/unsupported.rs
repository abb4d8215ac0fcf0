use super::super::source::{Descriptor, SocketInfo, SourceError};
use super::{PlatformExtensions, SchedInfo};

pub struct Platform;

impl PlatformExtensions for Platform {
    fn process_sched(_pid: u32) -> Result<SchedInfo, SourceError> {
        Err(SourceError::Unsupported)
    }

    fn descriptors(_pid: u32) -> Result<Vec<Descriptor>, SourceError> {
        Err(SourceError::Unsupported)
    }

    fn socket_info(_pid: u32, _descriptor: &Descriptor) -> Result<SocketInfo, SourceError> {
        Err(SourceError::Unsupported)
    }

    fn current_uid() -> Option<u32> {
        None
    }

    fn numeric_uid(_uid: &sysinfo::Uid) -> Option<u32> {
        None
    }
}
