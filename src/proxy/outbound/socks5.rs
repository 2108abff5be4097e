use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::common::{Address, ProxyError, ProxyStream};
use crate::proxy::{OutboundHandler, Session};

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 客户端（RFC 1928 / RFC 1929），在下层流上 CONNECT 到会话目标
pub struct Socks5Outbound {
    tag: String,
    base: Arc<dyn OutboundHandler>,
    auth: Option<(String, String)>,
}

impl Socks5Outbound {
    pub fn new(
        tag: impl Into<String>,
        base: Arc<dyn OutboundHandler>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let auth = user.map(|u| (u.to_string(), password.unwrap_or_default().to_string()));
        Self {
            tag: tag.into(),
            base,
            auth,
        }
    }
}

/// 方法协商 + 可选的用户名密码认证
pub async fn handshake(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    auth: Option<(&str, &str)>,
) -> Result<()> {
    // RFC 1929：用户名和密码各占一个长度字节
    if let Some((user, pass)) = auth {
        if user.is_empty() || user.len() > 255 || pass.len() > 255 {
            return Err(ProxyError::Protocol(format!(
                "socks5: credentials out of range (user {} bytes, password {} bytes)",
                user.len(),
                pass.len()
            ))
            .into());
        }
    }

    if auth.is_some() {
        stream.write_all(&[SOCKS_VERSION, 0x02, 0x00, 0x02]).await?;
    } else {
        stream.write_all(&[SOCKS_VERSION, 0x01, 0x00]).await?;
    }

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await?;
    if resp[0] != SOCKS_VERSION {
        anyhow::bail!("socks5: server returned unsupported version: 0x{:02x}", resp[0]);
    }

    match (resp[1], auth) {
        (0x00, _) => Ok(()),
        (0x02, Some((user, pass))) => {
            let mut req = Vec::with_capacity(3 + user.len() + pass.len());
            req.push(0x01);
            req.push(user.len() as u8);
            req.extend_from_slice(user.as_bytes());
            req.push(pass.len() as u8);
            req.extend_from_slice(pass.as_bytes());
            stream.write_all(&req).await?;

            let mut auth_resp = [0u8; 2];
            stream.read_exact(&mut auth_resp).await?;
            if auth_resp[1] != 0x00 {
                anyhow::bail!("socks5: authentication failed (status: 0x{:02x})", auth_resp[1]);
            }
            Ok(())
        }
        (0xFF, _) => anyhow::bail!("socks5: server rejected all authentication methods"),
        (method, _) => anyhow::bail!("socks5: unsupported auth method selected: 0x{:02x}", method),
    }
}

/// 发送 CONNECT 请求，返回服务器的 BND 地址
pub async fn connect_request(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    target: &Address,
) -> Result<Address> {
    let mut req = BytesMut::with_capacity(64);
    req.put_u8(SOCKS_VERSION);
    req.put_u8(CMD_CONNECT);
    req.put_u8(0x00);
    target.encode_socks5(&mut req)?;
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        anyhow::bail!("socks5: invalid reply version: 0x{:02x}", head[0]);
    }
    if head[1] != 0x00 {
        let reason = match head[1] {
            0x01 => "general failure",
            0x02 => "connection not allowed",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "TTL expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "unknown error",
        };
        anyhow::bail!("socks5: request failed: {} (0x{:02x})", reason, head[1]);
    }

    let bind = match head[3] {
        0x01 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = IpAddr::V4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
            Address::Ip(SocketAddr::new(ip, u16::from_be_bytes([buf[4], buf[5]])))
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
            let port_at = buf.len() - 2;
            let port = u16::from_be_bytes([buf[port_at], buf[port_at + 1]]);
            Address::Domain(String::from_utf8_lossy(&buf[..port_at]).to_string(), port)
        }
        0x04 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = IpAddr::V6(octets.into());
            Address::Ip(SocketAddr::new(ip, u16::from_be_bytes([buf[16], buf[17]])))
        }
        atyp => anyhow::bail!("socks5: unknown address type in reply: 0x{:02x}", atyp),
    };
    Ok(bind)
}

#[async_trait]
impl OutboundHandler for Socks5Outbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        let mut stream = self.base.connect(session).await?;
        let auth = self.auth.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
        handshake(&mut stream, auth).await?;
        let bind = connect_request(&mut stream, &session.target).await?;
        debug!(target = %session.target, bind = %bind, "socks5 CONNECT established");
        Ok(stream)
    }

    fn close(&self) {
        self.base.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_auth_connect() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let srv = tokio::spawn(async move {
            let mut greet = [0u8; 3];
            server.read_exact(&mut greet).await.unwrap();
            assert_eq!(greet, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..head[4] as usize], b"example.com");

            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
                .await
                .unwrap();
        });

        handshake(&mut client, None).await.unwrap();
        let bind = connect_request(&mut client, &Address::Domain("example.com".into(), 443))
            .await
            .unwrap();
        assert_eq!(bind, Address::Ip("127.0.0.1:8080".parse().unwrap()));
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn user_password_auth() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let srv = tokio::spawn(async move {
            let mut greet = [0u8; 4];
            server.read_exact(&mut greet).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 7];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, &[0x01, 2, b'u', b'1', 2, b'p', b'1']);
            server.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let err = handshake(&mut client, Some(("u1", "p1"))).await.unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn connect_refused_reply() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut req = [0u8; 10];
            server.read_exact(&mut req).await.unwrap();
            server.write_all(&[0x05, 0x05, 0x00, 0x01]).await.unwrap();
        });
        let err = connect_request(&mut client, &Address::Ip("1.2.3.4:80".parse().unwrap()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn oversized_credentials_rejected_before_greeting() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let user = "u".repeat(256);
        let err = handshake(&mut client, Some((&user, "p"))).await.unwrap_err();
        assert_eq!(
            crate::common::ProxyError::classify(&err),
            crate::common::ProxyErrorKind::Protocol
        );

        drop(client);
        let mut sent = Vec::new();
        server.read_to_end(&mut sent).await.unwrap();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn oversized_target_domain_rejected() {
        let (mut client, _server) = tokio::io::duplex(1024);
        let target = Address::Domain("d".repeat(256), 443);
        let err = connect_request(&mut client, &target).await.unwrap_err();
        assert!(err.to_string().contains("domain too long"));
    }
}
