use libproc::libproc::bsd_info::BSDInfo;
use libproc::libproc::file_info::{ListFDs, ProcFDType, pidfdinfo};
use libproc::libproc::net_info::{InSockInfo, SocketFDInfo, SocketInfoKind};
use libproc::libproc::proc_pid::{listpidinfo, pidinfo};
use libproc::libproc::task_info::TaskAllInfo;

use super::super::source::{
    Descriptor, DescriptorKind, InetEndpoint, SOCK_STREAM, SocketInfo, SourceError,
};
use super::{PlatformExtensions, SchedInfo};

pub struct Platform;

impl PlatformExtensions for Platform {
    fn process_sched(pid: u32) -> Result<SchedInfo, SourceError> {
        let info = pidinfo::<TaskAllInfo>(pid as i32, 0).map_err(|e| libproc_error(pid, e))?;
        Ok(SchedInfo {
            priority: info.ptinfo.pti_priority,
            nice: nice_value(pid).unwrap_or(info.pbsd.pbi_nice),
            threads: info.ptinfo.pti_threadnum.max(0) as u32,
        })
    }

    fn descriptors(pid: u32) -> Result<Vec<Descriptor>, SourceError> {
        let bsd = pidinfo::<BSDInfo>(pid as i32, 0).map_err(|e| libproc_error(pid, e))?;
        let fds = listpidinfo::<ListFDs>(pid as i32, bsd.pbi_nfiles as usize)
            .map_err(|e| libproc_error(pid, e))?;
        Ok(fds
            .into_iter()
            .map(|fd| Descriptor {
                fd: fd.proc_fd,
                kind: match ProcFDType::from(fd.proc_fdtype) {
                    ProcFDType::Socket => DescriptorKind::Socket { handle: 0 },
                    ProcFDType::VNode => DescriptorKind::File,
                    ProcFDType::Pipe => DescriptorKind::Pipe,
                    _ => DescriptorKind::Other,
                },
            })
            .collect())
    }

    fn socket_info(pid: u32, descriptor: &Descriptor) -> Result<SocketInfo, SourceError> {
        let not_inet = SourceError::NotInet {
            pid,
            fd: descriptor.fd,
        };
        let socket = pidfdinfo::<SocketFDInfo>(pid as i32, descriptor.fd)
            .map_err(|e| libproc_error(pid, e))?;
        let psi = socket.psi;

        // SAFETY: soi_kind says which union member the kernel filled in.
        let (inet, tcp_state) = match SocketInfoKind::from(psi.soi_kind) {
            SocketInfoKind::Tcp => unsafe {
                let tcp = psi.soi_proto.pri_tcp;
                (tcp.tcpsi_ini, Some(tcp.tcpsi_state))
            },
            SocketInfoKind::In => unsafe { (psi.soi_proto.pri_in, None) },
            _ => return Err(not_inet),
        };
        let tcp_state = if psi.soi_type == SOCK_STREAM {
            tcp_state
        } else {
            None
        };

        Ok(SocketInfo {
            family: psi.soi_family,
            socket_type: psi.soi_type,
            local: local_endpoint(&inet),
            remote: remote_endpoint(&inet),
            tcp_state,
        })
    }

    fn current_uid() -> Option<u32> {
        // SAFETY: getuid has no preconditions and cannot fail.
        Some(unsafe { libc::getuid() })
    }

    fn numeric_uid(uid: &sysinfo::Uid) -> Option<u32> {
        Some(**uid)
    }
}

/// The kernel already stores ports in network order inside an int.
fn local_endpoint(inet: &InSockInfo) -> InetEndpoint {
    InetEndpoint {
        // SAFETY: both union members are plain 16-byte address layouts.
        addr: unsafe { inet.insi_laddr.ina_6.s6_addr },
        port_be: inet.insi_lport as u16,
    }
}

fn remote_endpoint(inet: &InSockInfo) -> InetEndpoint {
    InetEndpoint {
        // SAFETY: as above.
        addr: unsafe { inet.insi_faddr.ina_6.s6_addr },
        port_be: inet.insi_fport as u16,
    }
}

fn nice_value(pid: u32) -> Option<i32> {
    // getpriority returns -1 on error, but -1 is also a valid nice value;
    // errno tells them apart.
    unsafe { *libc::__error() = 0 };
    let prio = unsafe { libc::getpriority(libc::PRIO_PROCESS, pid as libc::id_t) };
    let errno = unsafe { *libc::__error() };
    if prio == -1 && errno != 0 {
        None
    } else {
        Some(prio)
    }
}

fn libproc_error(pid: u32, message: String) -> SourceError {
    let lower = message.to_lowercase();
    if lower.contains("no such process") {
        SourceError::Gone(pid)
    } else if lower.contains("not permitted") || lower.contains("permission") {
        SourceError::PermissionDenied(pid)
    } else {
        SourceError::Kernel(message)
    }
}
