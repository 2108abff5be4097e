use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::tls::build_tls_config;
use crate::common::ProxyStream;
use crate::proxy::{OutboundHandler, Session};

/// 在下层流上做 TLS 客户端握手
pub struct TlsOutbound {
    tag: String,
    base: Arc<dyn OutboundHandler>,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsOutbound {
    /// SNI 取 `server_names[0]`，缺失时构建失败
    pub fn new(
        tag: impl Into<String>,
        base: Arc<dyn OutboundHandler>,
        server_names: &[String],
        alpn: &[String],
        insecure_skip_verify: bool,
    ) -> Result<Self> {
        let sni = server_names
            .first()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("TLS server name is required"))?;
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|e| anyhow::anyhow!("invalid TLS server name '{}': {}", sni, e))?;
        let config = build_tls_config(insecure_skip_verify, alpn)?;

        Ok(Self {
            tag: tag.into(),
            base,
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

#[async_trait]
impl OutboundHandler for TlsOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        let stream = self.base.connect(session).await?;
        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await?;
        debug!(sni = ?self.server_name, target = %session.target, "tls handshake done");
        Ok(Box::new(tls_stream))
    }

    fn close(&self) {
        self.base.close();
    }
}
