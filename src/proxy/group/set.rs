use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::common::{BoxUdpTransport, JoinedErrors, ProxyError, ProxyStream};
use crate::node::SetStrategy;
use crate::proxy::{Network, OutboundHandler, Session};

/// 未指定截止时间时的默认整体超时
pub const DEFAULT_SET_TIMEOUT: Duration = Duration::from_secs(10);

/// 把节点 hash 或 tag 名解析成拨号器
#[async_trait]
pub trait NodeResolver: Send + Sync {
    async fn resolve_node(&self, network: Network, name: &str) -> Result<Arc<dyn OutboundHandler>>;
}

/// 多节点组：按策略依次尝试候选节点，第一个成功的返回。
///
/// 每个实例带一个随机标记；拨号时标记已在会话上下文里，说明这个 Set
/// 经由 tag 间接嵌套了自己，直接失败。嵌套失败的候选和其它失败一样记入
/// 错误列表，继续尝试下一个。
pub struct SetOutbound {
    tag: String,
    nodes: Vec<String>,
    strategy: SetStrategy,
    marker: Uuid,
    resolver: Weak<dyn NodeResolver>,
    timeout: Duration,
}

impl SetOutbound {
    pub fn new(
        tag: impl Into<String>,
        nodes: Vec<String>,
        strategy: SetStrategy,
        resolver: Weak<dyn NodeResolver>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut nodes = nodes;
        nodes.dedup();
        if nodes.is_empty() {
            anyhow::bail!("set: node list is empty");
        }
        Ok(Self {
            tag: tag.into(),
            nodes,
            strategy,
            marker: Uuid::new_v4(),
            resolver,
            timeout,
        })
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn strategy(&self) -> SetStrategy {
        self.strategy
    }

    pub fn marker(&self) -> Uuid {
        self.marker
    }

    /// 本次拨号的候选顺序（下标）
    fn candidate_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        if self.strategy == SetStrategy::Random {
            order.shuffle(&mut rand::thread_rng());
        }
        order
    }

    async fn dial_each<T, F, Fut>(&self, session: &Session, dial: F) -> Result<T>
    where
        F: Fn(Arc<dyn OutboundHandler>, Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = session.enter_set(self.marker)?;
        let deadline = session
            .dial
            .deadline
            .unwrap_or_else(|| Instant::now() + self.timeout);
        let session = session.with_deadline(deadline);

        let resolver = self
            .resolver
            .upgrade()
            .ok_or(ProxyError::ClosedProxy)?;

        let mut errors = JoinedErrors::default();
        for index in self.candidate_order() {
            let name = &self.nodes[index];
            let attempt = async {
                let handler = resolver.resolve_node(session.network, name).await?;
                dial(handler, session.clone()).await
            };
            let result = match tokio::time::timeout_at(deadline, attempt).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::ConnectionTimeout(format!("set candidate '{name}'")).into()),
            };
            match result {
                Ok(value) => {
                    debug!(set = self.tag, node = name, index = index, "set candidate connected");
                    return Ok(value);
                }
                Err(e) => {
                    let kind = ProxyError::classify(&e);
                    debug!(
                        set = self.tag,
                        node = name,
                        index = index,
                        kind = kind.as_str(),
                        error = %e,
                        "set candidate failed"
                    );
                    errors.push(index, name, e);
                }
            }
        }
        Err(ProxyError::AllCandidatesFailed(errors).into())
    }
}

#[async_trait]
impl OutboundHandler for SetOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        self.dial_each(session, |handler, session| async move {
            handler.connect(&session).await
        })
        .await
    }

    async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        self.dial_each(session, |handler, session| async move {
            handler.connect_udp(&session).await
        })
        .await
    }
}
