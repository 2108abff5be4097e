pub mod protocol;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::ProxyStream;
use crate::proxy::{OutboundHandler, Session};

/// Trojan 客户端。TLS 由链上前一层负责，这里只写请求头。
pub struct TrojanOutbound {
    tag: String,
    base: Arc<dyn OutboundHandler>,
    password_hash: String,
}

impl TrojanOutbound {
    pub fn new(tag: impl Into<String>, base: Arc<dyn OutboundHandler>, password: &str) -> Result<Self> {
        if password.is_empty() {
            anyhow::bail!("trojan: password is required");
        }
        Ok(Self {
            tag: tag.into(),
            base,
            password_hash: protocol::password_hash(password),
        })
    }
}

#[async_trait]
impl OutboundHandler for TrojanOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        let mut stream = self.base.connect(session).await?;
        protocol::write_request(
            &mut stream,
            &self.password_hash,
            &session.target,
            protocol::CMD_CONNECT,
        )
        .await?;
        debug!(target = %session.target, "trojan request sent");
        Ok(stream)
    }

    fn close(&self) {
        self.base.close();
    }
}
