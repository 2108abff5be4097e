use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::common::{Address, BoxUdpTransport, Dialer, ProxyStream, UdpPacket, UdpTransport};
use crate::proxy::{OutboundHandler, Session};

/// 直连拨号器，所有协议链的起点
pub struct DirectOutbound {
    tag: String,
    dialer: Dialer,
}

impl DirectOutbound {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            dialer: Dialer::default_dialer(),
        }
    }

    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }
}

#[async_trait]
impl OutboundHandler for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        debug!(target = %session.target, "direct connect");
        let stream = self.dialer.connect_addr(&session.target).await?;
        Ok(Box::new(stream))
    }

    async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        let bind = match session.target.ip() {
            Some(ip) if ip.is_ipv6() => "[::]:0",
            _ => "0.0.0.0:0",
        };
        let socket = UdpSocket::bind(bind).await?;
        debug!(local = %socket.local_addr()?, "direct UDP socket bound");
        Ok(Box::new(DirectUdpTransport {
            socket: Arc::new(socket),
        }))
    }
}

struct DirectUdpTransport {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl UdpTransport for DirectUdpTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        let addr = packet.addr.resolve().await?;
        self.socket.send_to(&packet.data, addr).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        let mut buf = vec![0u8; 65535];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(UdpPacket {
            addr: Address::Ip(from),
            data: Bytes::from(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn direct_connect_reaches_target() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"hi").await.unwrap();
        });

        let direct = DirectOutbound::new("direct");
        let mut stream = direct.connect(&Session::tcp(Address::Ip(addr))).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn direct_udp_roundtrip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let direct = DirectOutbound::new("direct");
        let transport = direct
            .connect_udp(&Session::udp(Address::Ip(echo_addr)))
            .await
            .unwrap();
        transport
            .send(UdpPacket {
                addr: Address::Ip(echo_addr),
                data: Bytes::from_static(b"ping"),
            })
            .await
            .unwrap();
        let reply = transport.recv().await.unwrap();
        assert_eq!(&reply.data[..], b"ping");
    }
}
