use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::{Address, BoxUdpTransport, ProxyError, ProxyStream};
use crate::proxy::{OutboundHandler, Session};

/// 固定服务器拨号：不管会话目标是什么，都经下层拨向同一个 host:port。
/// 之后的协议层（tls / http / socks5 / trojan）再在这条流上与服务器握手。
pub struct SimpleOutbound {
    tag: String,
    base: Arc<dyn OutboundHandler>,
    server: Address,
    timeout: Option<Duration>,
}

impl SimpleOutbound {
    pub fn new(
        tag: impl Into<String>,
        base: Arc<dyn OutboundHandler>,
        server: Address,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            tag: tag.into(),
            base,
            server,
            timeout,
        }
    }

    pub fn server(&self) -> &Address {
        &self.server
    }

    fn hop_session(&self, session: &Session) -> Session {
        let mut hop = session.clone();
        hop.target = self.server.clone();
        hop
    }
}

#[async_trait]
impl OutboundHandler for SimpleOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        let hop = self.hop_session(session);
        debug!(server = %self.server, target = %session.target, "simple connect");
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.base.connect(&hop))
                .await
                .map_err(|_| {
                    ProxyError::ConnectionTimeout(format!(
                        "{} after {}ms",
                        self.server,
                        timeout.as_millis()
                    ))
                })?,
            None => self.base.connect(&hop).await,
        }
    }

    async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        self.base.connect_udp(&self.hop_session(session)).await
    }

    fn close(&self) {
        self.base.close();
    }
}
