pub mod chain;
pub mod group;
pub mod outbound;
pub mod registry;

use std::fmt;
use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::common::{Address, BoxUdpTransport, ProxyError, ProxyStream};
use crate::router::Mode;

pub use chain::build_chain;
pub use registry::{ProtocolRegistry, Transform};

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// 单次拨号的上下文：整体截止时间 + 已进入的 Set 标记
#[derive(Debug, Clone, Default)]
pub struct DialContext {
    pub deadline: Option<Instant>,
    sets: Vec<Uuid>,
}

impl DialContext {
    pub fn contains_set(&self, marker: &Uuid) -> bool {
        self.sets.contains(marker)
    }

    pub fn depth(&self) -> usize {
        self.sets.len()
    }
}

/// 连接会话元数据
#[derive(Debug, Clone)]
pub struct Session {
    pub target: Address,
    pub source: Option<SocketAddr>,
    pub inbound_tag: String,
    pub network: Network,
    /// 显式指定的路由 tag，优先于分流结果
    pub routing_tag: Option<String>,
    /// 强制模式，跳过分流规则
    pub force_mode: Option<Mode>,
    pub dial: DialContext,
}

impl Session {
    pub fn new(target: Address, network: Network) -> Self {
        Self {
            target,
            source: None,
            inbound_tag: String::new(),
            network,
            routing_tag: None,
            force_mode: None,
            dial: DialContext::default(),
        }
    }

    pub fn tcp(target: Address) -> Self {
        Self::new(target, Network::Tcp)
    }

    pub fn udp(target: Address) -> Self {
        Self::new(target, Network::Udp)
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_inbound_tag(mut self, tag: impl Into<String>) -> Self {
        self.inbound_tag = tag.into();
        self
    }

    pub fn with_routing_tag(mut self, tag: impl Into<String>) -> Self {
        self.routing_tag = Some(tag.into());
        self
    }

    pub fn with_force_mode(mut self, mode: Mode) -> Self {
        self.force_mode = Some(mode);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.dial.deadline = Some(deadline);
        self
    }

    /// 进入一个 Set：标记已存在说明 Set 经由 tag 嵌套了自己
    pub fn enter_set(&self, marker: Uuid) -> Result<Session, ProxyError> {
        if self.dial.contains_set(&marker) {
            return Err(ProxyError::NestedLoopNotSupported);
        }
        let mut next = self.clone();
        next.dial.sets.push(marker);
        Ok(next)
    }
}

/// 出站处理器 trait
#[async_trait]
pub trait OutboundHandler: Send + Sync + 'static {
    fn tag(&self) -> &str;
    async fn connect(&self, session: &Session) -> Result<ProxyStream>;
    async fn connect_udp(&self, _session: &Session) -> Result<BoxUdpTransport> {
        anyhow::bail!("UDP not supported by outbound '{}'", self.tag())
    }
    /// 释放底层资源；之后的拨号结果由实现决定
    fn close(&self) {}
    /// 用于 downcasting 到具体类型
    fn as_any(&self) -> &dyn std::any::Any;
}
