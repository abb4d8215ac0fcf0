use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use super::source::{
    AF_INET, AF_INET6, Descriptor, DescriptorKind, InetEndpoint, SOCK_DGRAM, SOCK_STREAM,
    SocketInfo, SocketSource,
};

/// Rendered in place of a peer address when a socket has no specific peer.
pub const WILDCARD_ADDRESS: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn label(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn label(self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "IPv4",
            AddressFamily::Ipv6 => "IPv6",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    FinWait1,
    Closing,
    LastAck,
    FinWait2,
    TimeWait,
    Unknown,
    /// UDP has no state machine.
    Udp,
}

impl ConnectionState {
    /// Map a BSD `tcp_fsm.h` state code. Unrecognised codes become `Unknown`.
    pub fn from_tcp_code(code: i32) -> Self {
        match code {
            0 => ConnectionState::Closed,
            1 => ConnectionState::Listen,
            2 => ConnectionState::SynSent,
            3 => ConnectionState::SynReceived,
            4 => ConnectionState::Established,
            5 => ConnectionState::CloseWait,
            6 => ConnectionState::FinWait1,
            7 => ConnectionState::Closing,
            8 => ConnectionState::LastAck,
            9 => ConnectionState::FinWait2,
            10 => ConnectionState::TimeWait,
            _ => ConnectionState::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listen => "LISTEN",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynReceived => "SYN_RCVD",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::FinWait1 => "FIN_WAIT_1",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::LastAck => "LAST_ACK",
            ConnectionState::FinWait2 => "FIN_WAIT_2",
            ConnectionState::TimeWait => "TIME_WAIT",
            ConnectionState::Unknown => "UNKNOWN",
            ConnectionState::Udp => "UDP",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkConnectionRecord {
    pub protocol: Protocol,
    pub family: AddressFamily,
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    pub state: ConnectionState,
}

/// Decode one socket info block.
///
/// Returns `None` for anything that is not an IPv4/IPv6 stream or datagram
/// socket, and for sockets whose local and remote endpoints are both the
/// unspecified address with port 0.
pub fn decode_socket(info: &SocketInfo) -> Option<NetworkConnectionRecord> {
    let family = match info.family {
        AF_INET => AddressFamily::Ipv4,
        AF_INET6 => AddressFamily::Ipv6,
        _ => return None,
    };
    let (protocol, state) = match info.socket_type {
        SOCK_STREAM => (
            Protocol::Tcp,
            info.tcp_state
                .map_or(ConnectionState::Unknown, ConnectionState::from_tcp_code),
        ),
        SOCK_DGRAM => (Protocol::Udp, ConnectionState::Udp),
        _ => return None,
    };

    let local_unbound = is_unbound(family, &info.local);
    let remote_unbound = is_unbound(family, &info.remote);
    if local_unbound && remote_unbound {
        return None;
    }

    let remote_address = if remote_unbound {
        WILDCARD_ADDRESS.to_string()
    } else {
        render_address(family, &info.remote)
    };

    Some(NetworkConnectionRecord {
        protocol,
        family,
        local_address: render_address(family, &info.local),
        local_port: u16::from_be(info.local.port_be),
        remote_address,
        remote_port: u16::from_be(info.remote.port_be),
        state,
    })
}

fn is_unbound(family: AddressFamily, endpoint: &InetEndpoint) -> bool {
    endpoint.port_be == 0
        && match family {
            AddressFamily::Ipv4 => v4_octets(endpoint) == [0; 4],
            AddressFamily::Ipv6 => endpoint.addr == [0; 16],
        }
}

fn v4_octets(endpoint: &InetEndpoint) -> [u8; 4] {
    let [.., a, b, c, d] = endpoint.addr;
    [a, b, c, d]
}

fn render_address(family: AddressFamily, endpoint: &InetEndpoint) -> String {
    match family {
        AddressFamily::Ipv4 => Ipv4Addr::from(v4_octets(endpoint)).to_string(),
        AddressFamily::Ipv6 => Ipv6Addr::from(endpoint.addr).to_string(),
    }
}

/// Every decodable connection of `pid`. Unreadable tables or descriptors are
/// skipped; the result is whatever subset could be decoded.
pub fn fetch_connections<S: SocketSource + ?Sized>(
    source: &S,
    pid: u32,
) -> Vec<NetworkConnectionRecord> {
    let _span = tracing::debug_span!("network.fetch_connections", pid).entered();

    let descriptors = match source.descriptors(pid) {
        Ok(descriptors) => descriptors,
        Err(err) => {
            tracing::debug!(pid, error = %err, "descriptor table unavailable");
            return Vec::new();
        }
    };

    descriptors
        .iter()
        .filter(|d| matches!(d.kind, DescriptorKind::Socket { .. }))
        .filter_map(|d| decode_descriptor(source, pid, d))
        .collect()
}

fn decode_descriptor<S: SocketSource + ?Sized>(
    source: &S,
    pid: u32,
    descriptor: &Descriptor,
) -> Option<NetworkConnectionRecord> {
    match source.socket_info(pid, descriptor) {
        Ok(info) => decode_socket(&info),
        Err(err) => {
            tracing::trace!(pid, fd = descriptor.fd, error = %err, "skipping socket");
            None
        }
    }
}

/// Number of connections `fetch_connections` would return for `pid`.
pub fn connection_count<S: SocketSource + ?Sized>(source: &S, pid: u32) -> usize {
    fetch_connections(source, pid).len()
}

/// Count connections for every pid with at most `workers` blocking reads in
/// flight. The map is returned only once every pid has been visited; a pid
/// whose worker panicked is simply absent.
pub async fn count_connections(
    source: Arc<dyn SocketSource>,
    pids: Vec<u32>,
    workers: usize,
) -> HashMap<u32, usize> {
    let total = pids.len();
    let counts: HashMap<u32, usize> = stream::iter(pids)
        .map(|pid| {
            let source = Arc::clone(&source);
            tokio::task::spawn_blocking(move || (pid, connection_count(&*source, pid)))
        })
        .buffer_unordered(workers.max(1))
        .filter_map(|joined| async move {
            match joined {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::debug!(error = %err, "connection count worker failed");
                    None
                }
            }
        })
        .collect()
        .await;
    tracing::debug!(pids = total, counted = counts.len(), "connection counts merged");
    counts
}
