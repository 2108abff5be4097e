use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use std::net::{SocketAddrV4, SocketAddrV6};

use crate::proxy::Network;

/// 根据本地 socket 地址查询发起连接的进程名
pub trait ProcessDumper: Send + Sync {
    fn lookup_process(&self, network: Network, local_addr: &SocketAddr) -> Option<String>;
}

/// 缓存上限，超过后整体清空
const CACHE_LIMIT: usize = 10000;

/// `/proc` 进程查询（仅 Linux，其余平台始终返回 None）
pub struct ProcessDetector {
    cache: Mutex<HashMap<(Network, SocketAddr), String>>,
}

impl Default for ProcessDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessDetector {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    #[cfg(target_os = "linux")]
    fn detect_process(&self, network: Network, local_addr: &SocketAddr) -> Option<String> {
        let inode = find_socket_inode(network, local_addr)?;
        let pid = find_pid_by_inode(inode)?;
        let path = fs::read_link(format!("/proc/{}/exe", pid)).ok()?;
        Some(extract_process_name(&path.to_string_lossy()))
    }

    #[cfg(not(target_os = "linux"))]
    fn detect_process(&self, _network: Network, _local_addr: &SocketAddr) -> Option<String> {
        None
    }
}

impl ProcessDumper for ProcessDetector {
    fn lookup_process(&self, network: Network, local_addr: &SocketAddr) -> Option<String> {
        let key = (network, *local_addr);

        if let Ok(cache) = self.cache.lock() {
            if let Some(name) = cache.get(&key) {
                return Some(name.clone());
            }
        }

        let name = self.detect_process(network, local_addr)?;

        if let Ok(mut cache) = self.cache.lock() {
            if cache.len() > CACHE_LIMIT {
                cache.clear();
            }
            cache.insert(key, name.clone());
        }

        Some(name)
    }
}

pub fn extract_process_name(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

#[cfg(target_os = "linux")]
fn find_socket_inode(network: Network, local_addr: &SocketAddr) -> Option<u64> {
    let proto = match network {
        Network::Tcp => "tcp",
        Network::Udp => "udp",
    };
    match local_addr {
        SocketAddr::V4(addr) => {
            find_inode_in_table(&format!("/proc/net/{}", proto), &format_proc_v4(addr))
        }
        SocketAddr::V6(addr) => {
            find_inode_in_table(&format!("/proc/net/{}6", proto), &format_proc_v6(addr))
        }
    }
}

#[cfg(target_os = "linux")]
fn format_proc_v4(addr: &SocketAddrV4) -> String {
    let ip = u32::from_le_bytes(addr.ip().octets());
    format!("{:08X}:{:04X}", ip, addr.port())
}

#[cfg(target_os = "linux")]
fn format_proc_v6(addr: &SocketAddrV6) -> String {
    let octets = addr.ip().octets();
    let mut ip = String::with_capacity(32);
    for chunk in octets.chunks_exact(4) {
        ip.push_str(&format!(
            "{:08X}",
            u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
        ));
    }
    format!("{}:{:04X}", ip, addr.port())
}

/// `/proc/net/{tcp,udp}[6]` 第 2 列为本地端点，第 10 列为 inode
#[cfg(target_os = "linux")]
fn find_inode_in_table(table_path: &str, endpoint: &str) -> Option<u64> {
    let content = fs::read_to_string(table_path).ok()?;
    content.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || !fields[1].eq_ignore_ascii_case(endpoint) {
            return None;
        }
        fields[9].parse::<u64>().ok().filter(|inode| *inode != 0)
    })
}

#[cfg(target_os = "linux")]
fn find_pid_by_inode(inode: u64) -> Option<u32> {
    let needle = format!("socket:[{}]", inode);

    for proc_entry in fs::read_dir("/proc").ok()?.flatten() {
        let Ok(pid) = proc_entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(fd_entries) = fs::read_dir(proc_entry.path().join("fd")) else {
            continue;
        };
        let owns_socket = fd_entries
            .flatten()
            .filter_map(|fd| fs::read_link(fd.path()).ok())
            .any(|link| link.to_string_lossy() == needle);
        if owns_socket {
            return Some(pid);
        }
    }

    None
}
