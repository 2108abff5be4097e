//! Socket-level dialer.
//!
//! Applies the configured socket options before/after connecting:
//!
//! - Bind to a specific source address
//! - Routing mark (fwmark / SO_MARK, Linux only)
//! - Connect timeout
//! - Keep-alive settings
//!
//! Domain targets are resolved through the configured [`DnsResolver`] (or
//! the system resolver) and every returned address is tried in order.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::Address;
use crate::dns::DnsResolver;

/// Dialer configuration, global `dialer:` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Bind to a specific source IP address.
    #[serde(rename = "bind-address")]
    pub bind_address: Option<String>,

    /// Routing mark (Linux SO_MARK / fwmark).
    #[serde(rename = "routing-mark")]
    pub routing_mark: Option<u32>,

    /// Connect timeout in milliseconds. Default: 5000.
    #[serde(rename = "connect-timeout")]
    pub connect_timeout_ms: Option<u64>,

    /// TCP keep-alive interval in seconds. 0 = disabled.
    #[serde(rename = "tcp-keep-alive")]
    pub tcp_keep_alive_secs: Option<u64>,
}

impl DialerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(5000))
    }
}

/// Dialer that applies socket options and connects.
#[derive(Clone)]
pub struct Dialer {
    config: DialerConfig,
    resolver: Option<Arc<dyn DnsResolver>>,
}

impl Dialer {
    pub fn new(config: DialerConfig) -> Self {
        Self {
            config,
            resolver: None,
        }
    }

    pub fn with_resolver(config: DialerConfig, resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            config,
            resolver: Some(resolver),
        }
    }

    pub fn default_dialer() -> Self {
        Self::new(DialerConfig::default())
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Connect to the given address, applying all configured socket options.
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let timeout = self.config.connect_timeout();

        let stream = tokio::time::timeout(timeout, self.connect_inner(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timeout after {:?} to {}", timeout, addr),
                )
            })??;

        self.apply_post_connect(&stream)?;

        debug!(addr = %addr, "dialer connected");
        Ok(stream)
    }

    /// Resolve (if needed) and connect, trying every resolved address in order.
    pub async fn connect_addr(&self, target: &Address) -> Result<TcpStream> {
        let addrs = match target {
            Address::Ip(addr) => vec![*addr],
            Address::Domain(host, port) => self.resolve_host(host, *port).await?,
        };

        let mut last_err = None;
        for addr in addrs {
            match self.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "dial attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no address to dial for {}", target)))
    }

    async fn resolve_host(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = if let Some(resolver) = &self.resolver {
            resolver
                .resolve(host)
                .await?
                .into_iter()
                .map(|ip| SocketAddr::new(ip, port))
                .collect()
        } else {
            tokio::net::lookup_host((host, port)).await?.collect()
        };
        if addrs.is_empty() {
            anyhow::bail!("DNS resolution failed for {}:{}", host, port);
        }
        Ok(addrs)
    }

    async fn connect_inner(&self, addr: SocketAddr) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };

        if let Some(ref bind_addr) = self.config.bind_address {
            let ip: IpAddr = bind_addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", bind_addr, e))?;
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        #[cfg(target_os = "linux")]
        if let Some(mark) = self.config.routing_mark {
            socket2::SockRef::from(&socket).set_mark(mark)?;
        }

        let stream = socket.connect(addr).await?;
        Ok(stream)
    }

    fn apply_post_connect(&self, stream: &TcpStream) -> Result<()> {
        if let Some(interval) = self.config.tcp_keep_alive_secs {
            if interval > 0 {
                let sock_ref = socket2::SockRef::from(stream);
                let keepalive =
                    socket2::TcpKeepalive::new().with_time(Duration::from_secs(interval));
                sock_ref.set_tcp_keepalive(&keepalive)?;
            }
        }

        // TCP_NODELAY — always enable for proxy traffic
        stream.set_nodelay(true)?;

        Ok(())
    }
}
