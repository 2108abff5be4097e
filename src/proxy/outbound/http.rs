use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::proxy::{OutboundHandler, Session};

/// 响应头上限
const MAX_HEADER: usize = 16 * 1024;

/// HTTP CONNECT 客户端：在下层流上请求隧道到会话目标
pub struct HttpOutbound {
    tag: String,
    base: Arc<dyn OutboundHandler>,
    /// 预先编码好的 `Proxy-Authorization` 值
    authorization: Option<String>,
}

impl HttpOutbound {
    pub fn new(
        tag: impl Into<String>,
        base: Arc<dyn OutboundHandler>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let authorization = user.map(|user| {
            let cred = format!("{}:{}", user, password.unwrap_or_default());
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(cred)
            )
        });
        Self {
            tag: tag.into(),
            base,
            authorization,
        }
    }
}

/// 发送 CONNECT 并读取响应头，状态码非 200 时失败
pub async fn http_connect_over_stream(
    mut stream: ProxyStream,
    target: &Address,
    authorization: Option<&str>,
) -> Result<ProxyStream> {
    let target_str = target.to_string();
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
        target_str, target_str
    );
    if let Some(auth) = authorization {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // 逐字节读取，避免把隧道数据吞进缓冲区
    let mut header = Vec::with_capacity(512);
    let mut buf = [0u8; 1];
    while header.len() < MAX_HEADER {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("http CONNECT failed: unexpected EOF");
        }
        header.push(buf[0]);
        if header.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    if !header.ends_with(b"\r\n\r\n") {
        anyhow::bail!("http CONNECT failed: response header too large");
    }

    let header_text = String::from_utf8_lossy(&header);
    let status_line = header_text.lines().next().unwrap_or_default();
    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("http CONNECT failed: invalid response '{}'", status_line))?;

    if status_code != 200 {
        anyhow::bail!("http CONNECT failed: {}", status_line);
    }
    Ok(stream)
}

#[async_trait]
impl OutboundHandler for HttpOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        let stream = self.base.connect(session).await?;
        let stream =
            http_connect_over_stream(stream, &session.target, self.authorization.as_deref())
                .await?;
        debug!(target = %session.target, "http CONNECT established");
        Ok(stream)
    }

    fn close(&self) {
        self.base.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_connect(response: &'static [u8]) -> (Result<ProxyStream>, String) {
        let (client, mut server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            let mut req = Vec::new();
            let mut buf = [0u8; 1];
            while !req.ends_with(b"\r\n\r\n") {
                server.read_exact(&mut buf).await.unwrap();
                req.push(buf[0]);
            }
            server.write_all(response).await.unwrap();
            String::from_utf8(req).unwrap()
        });
        let target = Address::Domain("example.com".into(), 443);
        let result = http_connect_over_stream(Box::new(client), &target, Some("Basic dTpw")).await;
        (result, handle.await.unwrap())
    }

    #[tokio::test]
    async fn connect_success_sends_auth() {
        let (result, request) = run_connect(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        assert!(result.is_ok());
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[tokio::test]
    async fn connect_rejected_status() {
        let (result, _) = run_connect(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("407"));
    }

    #[test]
    fn basic_auth_encoding() {
        let http = HttpOutbound::new(
            "http",
            Arc::new(crate::proxy::outbound::DirectOutbound::new("direct")),
            Some("u"),
            Some("p"),
        );
        assert_eq!(http.authorization.as_deref(), Some("Basic dTpw"));
    }
}
