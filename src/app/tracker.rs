use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::common::{CountedStream, ProxyStream, TrafficCounter};
use crate::proxy::{Network, Session};
use crate::router::Decision;

/// 连接信息
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub target: String,
    pub network: Network,
    pub inbound_tag: String,
    pub source: Option<SocketAddr>,
    pub mode: String,
    pub matched: String,
    /// 实际使用的出站标签（节点名或 direct / reject）
    pub node: String,
    pub start_time: Instant,
    pub upload: u64,
    pub download: u64,
}

/// 流量快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub total_up: u64,
    pub total_down: u64,
    pub active_count: usize,
}

struct TrackedConnection {
    info: ConnectionInfo,
    counter: Arc<TrafficCounter>,
}

/// 连接跟踪器
#[derive(Default)]
pub struct ConnectionTracker {
    connections: RwLock<HashMap<u64, TrackedConnection>>,
    total: Arc<TrafficCounter>,
    next_id: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始跟踪一个连接。返回的守卫 Drop 时移除记录。
    pub fn track(self: &Arc<Self>, session: &Session, decision: &Decision, node: &str) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let counter = Arc::new(TrafficCounter::new());

        let info = ConnectionInfo {
            id,
            target: session.target.to_string(),
            network: session.network,
            inbound_tag: session.inbound_tag.clone(),
            source: session.source,
            mode: decision.mode.to_string(),
            matched: decision.matched.to_string(),
            node: node.to_string(),
            start_time: Instant::now(),
            upload: 0,
            download: 0,
        };

        self.connections
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                id,
                TrackedConnection {
                    info,
                    counter: counter.clone(),
                },
            );
        debug!(id = id, target = %session.target, mode = %decision.mode, node = node, "connection tracked");

        ConnectionGuard {
            id,
            counter,
            tracker: self.clone(),
        }
    }

    /// 包装流：读写同时计入连接计数器和全局计数器，流释放时移除记录
    pub fn wrap(&self, stream: ProxyStream, guard: ConnectionGuard) -> TrackedStream {
        let counted = CountedStream::new(stream, vec![guard.counter.clone(), self.total.clone()]);
        TrackedStream {
            inner: counted,
            _guard: guard,
        }
    }

    /// 列出所有活跃连接
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let conns = self.connections.read().unwrap_or_else(|p| p.into_inner());
        let mut list: Vec<ConnectionInfo> = conns
            .values()
            .map(|tc| {
                let mut info = tc.info.clone();
                info.upload = tc.counter.upload();
                info.download = tc.counter.download();
                info
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        let active_count = self.connections.read().map(|c| c.len()).unwrap_or(0);
        TrafficSnapshot {
            total_up: self.total.upload(),
            total_down: self.total.download(),
            active_count,
        }
    }

    /// 从跟踪中移除指定连接
    pub fn close(&self, id: u64) -> bool {
        self.connections
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .is_some()
    }

    pub fn close_all(&self) -> usize {
        let mut conns = self.connections.write().unwrap_or_else(|p| p.into_inner());
        let count = conns.len();
        conns.clear();
        count
    }
}

/// 连接守卫，Drop 时自动从 tracker 移除
pub struct ConnectionGuard {
    id: u64,
    counter: Arc<TrafficCounter>,
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn counter(&self) -> &Arc<TrafficCounter> {
        &self.counter
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.close(self.id) {
            debug!(
                id = self.id,
                up = self.counter.upload(),
                down = self.counter.download(),
                "connection closed"
            );
        }
    }
}

/// 带跟踪的连接流
pub struct TrackedStream {
    inner: CountedStream,
    _guard: ConnectionGuard,
}

impl TrackedStream {
    pub fn id(&self) -> u64 {
        self._guard.id()
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
