use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::types::{AuditError, SocketPair, SocketProtocol};

/// Source of the process's connected sockets.
pub trait ConnectionTable: Send {
    fn snapshot(&mut self) -> Result<Vec<SocketPair>, AuditError>;
}

const TABLES: [(&str, SocketProtocol); 4] = [
    ("/proc/net/tcp", SocketProtocol::Tcp),
    ("/proc/net/tcp6", SocketProtocol::Tcp),
    ("/proc/net/udp", SocketProtocol::Udp),
    ("/proc/net/udp6", SocketProtocol::Udp),
];

/// TCP listening state in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

/// Linux connection table: socket inodes from `/proc/self/fd` matched against
/// `/proc/net/{tcp,udp}{,6}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcNetTable;

impl ConnectionTable for ProcNetTable {
    #[cfg(target_os = "linux")]
    fn snapshot(&mut self) -> Result<Vec<SocketPair>, AuditError> {
        let inodes = socket_inodes()?;
        if inodes.is_empty() {
            return Ok(Vec::new());
        }
        let mut pairs = Vec::new();
        for (path, protocol) in TABLES {
            match std::fs::read_to_string(path) {
                Ok(contents) => pairs.extend(parse_proc_net(&contents, protocol, &inodes)),
                // IPv6 disabled
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(AuditError::io(path, err)),
            }
        }
        pairs.sort();
        pairs.dedup();
        Ok(pairs)
    }

    #[cfg(not(target_os = "linux"))]
    fn snapshot(&mut self) -> Result<Vec<SocketPair>, AuditError> {
        let _ = TABLES;
        Err(AuditError::Unsupported(std::env::consts::OS.to_string()))
    }
}

#[cfg(target_os = "linux")]
fn socket_inodes() -> Result<BTreeSet<u64>, AuditError> {
    const FD_DIR: &str = "/proc/self/fd";
    let entries = std::fs::read_dir(FD_DIR).map_err(|err| AuditError::io(FD_DIR, err))?;
    let mut inodes = BTreeSet::new();
    for entry in entries.flatten() {
        // fds close between read_dir and read_link all the time
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        let target = target.to_string_lossy();
        if let Some(inode) = target
            .strip_prefix("socket:[")
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|inode| inode.parse().ok())
        {
            inodes.insert(inode);
        }
    }
    Ok(inodes)
}

/// Connected sockets listed in one `/proc/net/*` table whose inode is in
/// `inodes`. Listening and unconnected sockets are skipped.
pub fn parse_proc_net(
    contents: &str,
    protocol: SocketProtocol,
    inodes: &BTreeSet<u64>,
) -> Vec<SocketPair> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let inode: u64 = fields[9].parse().ok()?;
            if !inodes.contains(&inode) {
                return None;
            }
            if protocol == SocketProtocol::Tcp && fields[3] == TCP_LISTEN {
                return None;
            }
            let local = parse_endpoint(fields[1])?;
            let remote = parse_endpoint(fields[2])?;
            if remote.port() == 0 || remote.ip().is_unspecified() {
                return None;
            }
            Some(SocketPair {
                protocol,
                local,
                remote,
            })
        })
        .collect()
}

/// `0100007F:0019` or the 32-digit IPv6 form. Addresses are printed as
/// native-endian 32-bit words; the port is already in host order.
fn parse_endpoint(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(word(addr)?.to_ne_bytes())),
        32 => {
            let mut octets = [0u8; 16];
            for (index, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let start = index * 8;
                chunk.copy_from_slice(&word(addr.get(start..start + 8)?)?.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn word(hex: &str) -> Option<u32> {
    u32::from_str_radix(hex, 16).ok()
}
