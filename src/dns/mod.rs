pub mod resolver;

use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;

pub use resolver::{HostsResolver, SystemResolver};

/// DNS 解析器 trait
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// 将域名解析为 IP 地址列表
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}
