use anyhow::Result;
use async_trait::async_trait;

use crate::common::{BoxUdpTransport, ProxyError, ProxyStream};
use crate::proxy::{OutboundHandler, Session};

/// 已被淘汰的节点：任何拨号都返回 `ClosedProxy`
pub struct ClosedOutbound {
    tag: String,
}

impl ClosedOutbound {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[async_trait]
impl OutboundHandler for ClosedOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, _session: &Session) -> Result<ProxyStream> {
        Err(ProxyError::ClosedProxy.into())
    }

    async fn connect_udp(&self, _session: &Session) -> Result<BoxUdpTransport> {
        Err(ProxyError::ClosedProxy.into())
    }
}
