use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::common::{BoxUdpTransport, ProxyError, ProxyStream};
use crate::proxy::{Network, OutboundHandler, Session};

/// 历史表上限，超过后淘汰最久未出现的记录
const HISTORY_LIMIT: usize = 1024;

/// 拒绝延迟配置，`outbound.reject-delay`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RejectDelayConfig {
    /// 首次重复拒绝的延迟，0 表示关闭延迟
    #[serde(rename = "base-ms")]
    pub base_ms: u64,
    #[serde(rename = "max-ms")]
    pub max_ms: u64,
    /// 超过该时间未再出现的目标重新计数
    #[serde(rename = "window-ms")]
    pub window_ms: u64,
}

impl Default for RejectDelayConfig {
    fn default() -> Self {
        Self {
            base_ms: 0,
            max_ms: 5000,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectRecord {
    pub network: Network,
    pub destination: String,
    pub count: u32,
    pub last_seen: Instant,
}

/// 被拒绝目标的历史。同一目标在窗口内重复被拒时，
/// 第 n 次重复等待 `min(base * 2^(n-1), max)`。
pub struct RejectHistory {
    config: RejectDelayConfig,
    records: Mutex<HashMap<(Network, String), RejectRecord>>,
}

impl RejectHistory {
    pub fn new(config: RejectDelayConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// 记录一次拒绝并返回本次应等待的时间
    pub fn push(&self, network: Network, destination: &str) -> Duration {
        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());

        if records.len() >= HISTORY_LIMIT && !records.contains_key(&(network, destination.to_string())) {
            if let Some(oldest) = records
                .iter()
                .min_by_key(|(_, r)| r.last_seen)
                .map(|(k, _)| k.clone())
            {
                records.remove(&oldest);
            }
        }

        let record = records
            .entry((network, destination.to_string()))
            .or_insert_with(|| RejectRecord {
                network,
                destination: destination.to_string(),
                count: 0,
                last_seen: now,
            });

        if record.count > 0 && now.duration_since(record.last_seen) > window {
            record.count = 0;
        }
        record.count = record.count.saturating_add(1);
        record.last_seen = now;

        self.delay_for(record.count)
    }

    /// 第 `count` 次拒绝对应的延迟，首次为 0
    pub fn delay_for(&self, count: u32) -> Duration {
        if self.config.base_ms == 0 || count <= 1 {
            return Duration::ZERO;
        }
        let shift = (count - 2).min(31);
        let delay = self.config.base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.config.max_ms))
    }

    /// 按最近出现时间倒序列出历史
    pub fn list(&self) -> Vec<RejectRecord> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let mut list: Vec<RejectRecord> = records.values().cloned().collect();
        list.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        list
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

/// 拒绝所有连接的出站
pub struct RejectOutbound {
    tag: String,
    history: Option<Arc<RejectHistory>>,
}

impl RejectOutbound {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            history: None,
        }
    }

    pub fn with_history(mut self, history: Arc<RejectHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn history(&self) -> Option<&Arc<RejectHistory>> {
        self.history.as_ref()
    }

    async fn reject(&self, session: &Session) -> ProxyError {
        let destination = session.target.to_string();
        if let Some(history) = &self.history {
            let delay = history.push(session.network, &destination);
            if !delay.is_zero() {
                debug!(target = %session.target, delay_ms = delay.as_millis() as u64, "reject delayed");
                tokio::time::sleep(delay).await;
            }
        }
        debug!(target = %session.target, network = %session.network, "connection blocked");
        ProxyError::Blocked(destination)
    }
}

#[async_trait]
impl OutboundHandler for RejectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        Err(self.reject(session).await.into())
    }

    async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        Err(self.reject(session).await.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, ProxyErrorKind};

    fn history(base_ms: u64, max_ms: u64) -> RejectHistory {
        RejectHistory::new(RejectDelayConfig {
            base_ms,
            max_ms,
            window_ms: 60_000,
        })
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let h = history(100, 1000);
        assert_eq!(h.push(Network::Tcp, "a:80"), Duration::ZERO);
        assert_eq!(h.push(Network::Tcp, "a:80"), Duration::from_millis(100));
        assert_eq!(h.push(Network::Tcp, "a:80"), Duration::from_millis(200));
        assert_eq!(h.push(Network::Tcp, "a:80"), Duration::from_millis(400));
        assert_eq!(h.push(Network::Tcp, "a:80"), Duration::from_millis(800));
        assert_eq!(h.push(Network::Tcp, "a:80"), Duration::from_millis(1000));
        // 不同网络、不同目标独立计数
        assert_eq!(h.push(Network::Udp, "a:80"), Duration::ZERO);
        assert_eq!(h.push(Network::Tcp, "b:80"), Duration::ZERO);
    }

    #[test]
    fn zero_base_disables_delay() {
        let h = history(0, 1000);
        for _ in 0..5 {
            assert_eq!(h.push(Network::Tcp, "a:80"), Duration::ZERO);
        }
        assert_eq!(h.list()[0].count, 5);
    }

    #[test]
    fn huge_count_does_not_overflow() {
        let h = history(u64::MAX / 2, u64::MAX);
        assert_eq!(h.delay_for(u32::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn list_is_most_recent_first() {
        let h = history(0, 0);
        h.push(Network::Tcp, "a:80");
        std::thread::sleep(Duration::from_millis(2));
        h.push(Network::Tcp, "b:80");
        let list = h.list();
        assert_eq!(list[0].destination, "b:80");
        assert_eq!(list[1].destination, "a:80");
        h.clear();
        assert!(h.list().is_empty());
    }

    #[tokio::test]
    async fn reject_returns_blocked() {
        let outbound = RejectOutbound::new("block").with_history(Arc::new(history(0, 0)));
        let session = Session::tcp(Address::Domain("ads.example".into(), 443));
        let err = outbound.connect(&session).await.err().unwrap();
        assert_eq!(ProxyError::classify(&err), ProxyErrorKind::Blocked);
        assert!(outbound.connect_udp(&Session::udp(session.target.clone())).await.is_err());
        assert_eq!(outbound.history().unwrap().list().len(), 2);
    }

    #[tokio::test]
    async fn repeated_reject_sleeps() {
        let outbound = RejectOutbound::new("block").with_history(Arc::new(history(50, 5000)));
        let session = Session::tcp(Address::Domain("ads.example".into(), 443));
        let _ = outbound.connect(&session).await;
        let start = Instant::now();
        let _ = outbound.connect(&session).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
