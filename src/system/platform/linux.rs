use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use procfs::ProcError;
use procfs::net::TcpState;
use procfs::process::{FDTarget, Process};

use super::super::source::{
    AF_INET, AF_INET6, Descriptor, DescriptorKind, InetEndpoint, SOCK_DGRAM, SOCK_STREAM,
    SocketInfo, SourceError,
};
use super::{PlatformExtensions, SchedInfo};

/// Socket tables are per network namespace; every process in the namespace
/// sees the same ones, so one read serves the whole refresh fan-out.
const TABLE_TTL: Duration = Duration::from_secs(1);

type SocketTable = HashMap<u64, SocketInfo>;

struct CachedTable {
    read_at: Instant,
    sockets: Arc<SocketTable>,
}

static TABLES: LazyLock<Mutex<HashMap<u64, CachedTable>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub struct Platform;

impl PlatformExtensions for Platform {
    fn process_sched(pid: u32) -> Result<SchedInfo, SourceError> {
        let stat = open(pid)?.stat().map_err(|e| proc_error(pid, e))?;
        Ok(SchedInfo {
            priority: stat.priority as i32,
            nice: stat.nice as i32,
            threads: stat.num_threads.max(0) as u32,
        })
    }

    fn descriptors(pid: u32) -> Result<Vec<Descriptor>, SourceError> {
        let fds = open(pid)?.fd().map_err(|e| proc_error(pid, e))?;
        // An fd closed mid-walk is just missing from the table.
        Ok(fds
            .filter_map(Result::ok)
            .map(|info| Descriptor {
                fd: info.fd,
                kind: match info.target {
                    FDTarget::Socket(inode) => DescriptorKind::Socket { handle: inode },
                    FDTarget::Path(_) => DescriptorKind::File,
                    FDTarget::Pipe(_) => DescriptorKind::Pipe,
                    _ => DescriptorKind::Other,
                },
            })
            .collect())
    }

    fn socket_info(pid: u32, descriptor: &Descriptor) -> Result<SocketInfo, SourceError> {
        let DescriptorKind::Socket { handle: inode } = descriptor.kind else {
            return Err(SourceError::NotInet {
                pid,
                fd: descriptor.fd,
            });
        };
        let table = socket_table(pid)?;
        table.get(&inode).copied().ok_or(SourceError::NotInet {
            pid,
            fd: descriptor.fd,
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

fn open(pid: u32) -> Result<Process, SourceError> {
    Process::new(pid as i32).map_err(|e| proc_error(pid, e))
}

fn proc_error(pid: u32, err: ProcError) -> SourceError {
    match err {
        ProcError::NotFound(_) => SourceError::Gone(pid),
        ProcError::PermissionDenied(_) => SourceError::PermissionDenied(pid),
        ProcError::Io(io, _) => SourceError::Io(io),
        other => SourceError::Kernel(other.to_string()),
    }
}

/// Namespace identity from the `net:[<inode>]` link. Processes we cannot
/// inspect share key 0 and fall back to their own view of the tables.
fn net_namespace(pid: u32) -> u64 {
    std::fs::read_link(format!("/proc/{pid}/ns/net"))
        .ok()
        .and_then(|link| {
            let link = link.to_string_lossy().into_owned();
            link.strip_prefix("net:[")?
                .strip_suffix(']')?
                .parse()
                .ok()
        })
        .unwrap_or(0)
}

fn socket_table(pid: u32) -> Result<Arc<SocketTable>, SourceError> {
    let namespace = net_namespace(pid);
    if let Some(cached) = TABLES.lock().get(&namespace)
        && cached.read_at.elapsed() < TABLE_TTL
    {
        return Ok(Arc::clone(&cached.sockets));
    }

    let sockets = Arc::new(read_socket_table(pid)?);
    tracing::trace!(pid, namespace, sockets = sockets.len(), "socket tables read");
    store_table(&mut TABLES.lock(), namespace, Arc::clone(&sockets), Instant::now());
    Ok(sockets)
}

/// Insert a fresh table and evict expired ones, so namespaces of exited
/// containers do not accumulate.
fn store_table(
    tables: &mut HashMap<u64, CachedTable>,
    namespace: u64,
    sockets: Arc<SocketTable>,
    now: Instant,
) {
    tables.retain(|_, cached| now.duration_since(cached.read_at) < TABLE_TTL);
    tables.insert(
        namespace,
        CachedTable {
            read_at: now,
            sockets,
        },
    );
}

fn read_socket_table(pid: u32) -> Result<SocketTable, SourceError> {
    let process = open(pid)?;
    let mut table = SocketTable::new();

    let tcp4 = process.tcp().map_err(|e| proc_error(pid, e))?;
    // Kernels built without IPv6 have no tcp6/udp6 tables.
    let tcp6 = process.tcp6().unwrap_or_default();
    for (family, entry) in tcp4
        .into_iter()
        .map(|e| (AF_INET, e))
        .chain(tcp6.into_iter().map(|e| (AF_INET6, e)))
    {
        table.insert(
            entry.inode,
            SocketInfo {
                family,
                socket_type: SOCK_STREAM,
                local: endpoint(entry.local_address),
                remote: endpoint(entry.remote_address),
                tcp_state: Some(bsd_state(&entry.state)),
            },
        );
    }

    let udp4 = process.udp().unwrap_or_default();
    let udp6 = process.udp6().unwrap_or_default();
    for (family, entry) in udp4
        .into_iter()
        .map(|e| (AF_INET, e))
        .chain(udp6.into_iter().map(|e| (AF_INET6, e)))
    {
        table.insert(
            entry.inode,
            SocketInfo {
                family,
                socket_type: SOCK_DGRAM,
                local: endpoint(entry.local_address),
                remote: endpoint(entry.remote_address),
                tcp_state: None,
            },
        );
    }

    Ok(table)
}

fn endpoint(addr: SocketAddr) -> InetEndpoint {
    match addr {
        SocketAddr::V4(v4) => InetEndpoint::v4(v4.ip().octets(), v4.port()),
        SocketAddr::V6(v6) => InetEndpoint::v6(v6.ip().octets(), v6.port()),
    }
}

/// Linux numbers its TCP states differently from `tcp_fsm.h`.
fn bsd_state(state: &TcpState) -> i32 {
    #[allow(unreachable_patterns)]
    match state {
        TcpState::Close => 0,
        TcpState::Listen => 1,
        TcpState::SynSent => 2,
        TcpState::SynRecv | TcpState::NewSynRecv => 3,
        TcpState::Established => 4,
        TcpState::CloseWait => 5,
        TcpState::FinWait1 => 6,
        TcpState::Closing => 7,
        TcpState::LastAck => 8,
        TcpState::FinWait2 => 9,
        TcpState::TimeWait => 10,
        _ => -1,
    }
}
