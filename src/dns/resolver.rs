use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::DnsResolver;

/// 系统 DNS 解析器（使用 tokio::net::lookup_host）
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await?
            .map(|a| a.ip())
            .collect();
        if addrs.is_empty() {
            anyhow::bail!("DNS resolution failed: no addresses for {}", host);
        }
        debug!(host = host, count = addrs.len(), "system DNS resolved");
        Ok(addrs)
    }
}

/// 静态 hosts 表解析器：命中表项直接返回，否则交给下游解析器
pub struct HostsResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
    upstream: Arc<dyn DnsResolver>,
}

impl HostsResolver {
    pub fn new(hosts: HashMap<String, Vec<IpAddr>>, upstream: Arc<dyn DnsResolver>) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self { hosts, upstream }
    }
}

#[async_trait]
impl DnsResolver for HostsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(ips) = self.hosts.get(&host.to_lowercase()) {
            debug!(host = host, count = ips.len(), "hosts table hit");
            return Ok(ips.clone());
        }
        self.upstream.resolve(host).await
    }
}
