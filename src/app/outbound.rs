use std::collections::HashSet;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::app::store::{OutboundStore, ProxyHandle, RefreshOutcome};
use crate::common::ProxyError;
use crate::config::OutboundConfig;
use crate::node::{NodeSource, Point, Protocol, TagKind};
use crate::proxy::group::{NodeResolver, SetOutbound};
use crate::proxy::outbound::{RejectHistory, RejectOutbound};
use crate::proxy::{build_chain, Network, OutboundHandler, ProtocolRegistry};
use crate::router::Mode;

/// 出站路由：把分流结果和路由 tag 变成一个具体的拨号器。
///
/// `Direct` / `Block` 使用内置拨号器；其余情况经 tag 间接寻址到节点 hash，
/// 再从 [`OutboundStore`] 取出或构建该节点的拨号器。
pub struct Outbound {
    registry: Arc<ProtocolRegistry>,
    store: OutboundStore,
    source: Arc<dyn NodeSource>,
    config: RwLock<OutboundConfig>,
    reject: Arc<RejectOutbound>,
}

impl Outbound {
    /// 创建路由并向注册表登记 `set` 构造函数
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        source: Arc<dyn NodeSource>,
        config: OutboundConfig,
    ) -> Arc<Self> {
        let history = Arc::new(RejectHistory::new(config.reject_delay.clone()));
        let set_timeout = Duration::from_millis(config.set_timeout_ms);

        Arc::new_cyclic(|weak: &Weak<Outbound>| {
            let resolver: Weak<dyn NodeResolver> = weak.clone();
            registry.register("set", move |protocol, _base| match protocol {
                Protocol::Set { nodes, strategy } => Ok(Arc::new(SetOutbound::new(
                    "set",
                    nodes.clone(),
                    *strategy,
                    resolver.clone(),
                    set_timeout,
                )?) as Arc<dyn OutboundHandler>),
                other => anyhow::bail!("transform 'set' received '{}' descriptor", other.tag()),
            });

            Self {
                registry: registry.clone(),
                store: OutboundStore::new(),
                source,
                config: RwLock::new(config),
                reject: Arc::new(RejectOutbound::new("reject").with_history(history)),
            }
        })
    }

    pub fn store(&self) -> &OutboundStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    pub fn reject_history(&self) -> Option<&Arc<RejectHistory>> {
        self.reject.history()
    }

    pub fn config(&self) -> OutboundConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// 替换默认节点等配置；拒绝延迟和 Set 超时只在创建时读取
    pub fn set_config(&self, config: OutboundConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// 按模式和路由 tag 选出拨号器
    pub async fn get(
        &self,
        network: Network,
        mode: &Mode,
        routing_tag: Option<&str>,
    ) -> Result<Arc<dyn OutboundHandler>> {
        match mode {
            Mode::Direct => return Ok(self.registry.direct()),
            Mode::Block => return Ok(self.reject.clone()),
            _ => {}
        }

        if let Some(tag) = routing_tag.or_else(|| mode.custom_tag()) {
            let hash = self.resolve_tag(tag)?;
            return Ok(self.load(&hash).await?);
        }

        let default = match network {
            Network::Tcp => self.config().tcp,
            Network::Udp => self.config().udp,
        };
        let name = default
            .ok_or_else(|| ProxyError::Config(format!("no default {network} node configured")))?;
        self.resolve_node(network, &name).await
    }

    /// 沿 tag 链解析到节点 hash。节点 tag 随机挑一个 hash，
    /// 镜像 tag 跳到下一个 tag，链上重复出现的 tag 视为环。
    pub fn resolve_tag(&self, name: &str) -> Result<String, ProxyError> {
        let mut visited: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut current = name.to_string();

        loop {
            if !seen.insert(current.clone()) {
                visited.push(current);
                return Err(ProxyError::TagLoop(visited.join(" -> ")));
            }
            let record = self
                .source
                .tag(&current)
                .ok_or_else(|| ProxyError::TagNotFound(current.clone()))?;
            visited.push(current);

            match record.kind {
                TagKind::Node => {
                    let hash = record
                        .targets
                        .choose(&mut rand::thread_rng())
                        .ok_or_else(|| ProxyError::TagNotFound(record.name.clone()))?;
                    debug!(tag = name, hash = hash.as_str(), "tag resolved");
                    return Ok(hash.clone());
                }
                TagKind::Mirror => {
                    current = record
                        .targets
                        .first()
                        .cloned()
                        .ok_or_else(|| ProxyError::TagNotFound(record.name.clone()))?;
                }
            }
        }
    }

    /// 取出或构建节点拨号器；未知 hash 返回 `NodeNotFound`
    pub async fn load(&self, hash: &str) -> Result<Arc<ProxyHandle>> {
        self.store
            .load_or_create(hash, || async {
                let point = self
                    .source
                    .point(hash)
                    .ok_or_else(|| ProxyError::NodeNotFound(hash.to_string()))?;
                let handler = build_chain(&self.registry, &point)?;
                Ok::<_, anyhow::Error>((point, handler))
            })
            .await
    }

    /// 节点配置变化后调用，配置不同则淘汰旧拨号器
    pub async fn refresh_node(&self, point: &Point) -> RefreshOutcome {
        self.store.refresh_node(point).await
    }

    pub async fn remove_node(&self, hash: &str) -> bool {
        self.store.delete(hash).await
    }

    pub fn close_all(&self) -> usize {
        self.store.close_all()
    }
}

#[async_trait]
impl NodeResolver for Outbound {
    /// 先按节点 hash 查找，找不到再当作 tag 名解析
    async fn resolve_node(&self, _network: Network, name: &str) -> Result<Arc<dyn OutboundHandler>> {
        let hash = if self.store.get(name).is_some() || self.source.point(name).is_some() {
            name.to_string()
        } else if self.source.tag(name).is_some() {
            self.resolve_tag(name)?
        } else {
            return Err(ProxyError::NodeNotFound(name.to_string()).into());
        };
        Ok(self.load(&hash).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Dialer, ProxyErrorKind};
    use crate::node::{MemoryNodes, SetStrategy, TagRecord};
    use crate::proxy::outbound::DirectOutbound;
    use crate::proxy::Session;

    fn outbound(points: Vec<Point>, tags: Vec<TagRecord>, config: OutboundConfig) -> Arc<Outbound> {
        let registry = Arc::new(ProtocolRegistry::with_builtin(Dialer::default_dialer()));
        let source = Arc::new(MemoryNodes::from_parts(points, tags));
        Outbound::new(registry, source, config)
    }

    fn simple(name: &str) -> Point {
        Point::new(name, "", vec![Protocol::simple("127.0.0.1", 1)]).with_hash(name)
    }

    #[tokio::test]
    async fn direct_and_block_skip_tags() {
        let ob = outbound(vec![], vec![], OutboundConfig::default());
        let d = ob.get(Network::Tcp, &Mode::Direct, Some("anything")).await.unwrap();
        assert!(d.as_any().is::<DirectOutbound>());
        let b = ob.get(Network::Tcp, &Mode::Block, None).await.unwrap();
        assert!(b.as_any().is::<RejectOutbound>());

        let err = b
            .connect(&Session::tcp(Address::Domain("ads.example".into(), 80)))
            .await
            .err()
            .unwrap();
        assert_eq!(ProxyError::classify(&err), ProxyErrorKind::Blocked);
        assert_eq!(ob.reject_history().unwrap().list().len(), 1);
    }

    #[tokio::test]
    async fn custom_mode_follows_mirror_to_node() {
        let ob = outbound(
            vec![simple("n1")],
            vec![TagRecord::node("jp", vec!["n1".into()]), TagRecord::mirror("hk", "jp")],
            OutboundConfig::default(),
        );
        let handler = ob
            .get(Network::Tcp, &Mode::Custom("hk".into()), None)
            .await
            .unwrap();
        let handle = handler.as_any().downcast_ref::<ProxyHandle>().unwrap();
        assert_eq!(handle.hash(), "n1");
        assert_eq!(ob.store().len(), 1);
    }

    #[tokio::test]
    async fn routing_tag_overrides_custom_mode() {
        let ob = outbound(
            vec![simple("n1"), simple("n2")],
            vec![
                TagRecord::node("a", vec!["n1".into()]),
                TagRecord::node("b", vec!["n2".into()]),
            ],
            OutboundConfig::default(),
        );
        let handler = ob
            .get(Network::Tcp, &Mode::Custom("a".into()), Some("b"))
            .await
            .unwrap();
        assert_eq!(
            handler.as_any().downcast_ref::<ProxyHandle>().unwrap().hash(),
            "n2"
        );
    }

    #[test]
    fn tag_loop_and_missing_tag() {
        let ob = outbound(
            vec![],
            vec![TagRecord::mirror("a", "b"), TagRecord::mirror("b", "a")],
            OutboundConfig::default(),
        );
        match ob.resolve_tag("a") {
            Err(ProxyError::TagLoop(chain)) => assert_eq!(chain, "a -> b -> a"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(ob.resolve_tag("zzz"), Err(ProxyError::TagNotFound(_))));
    }

    #[test]
    fn node_tag_picks_from_its_hashes() {
        let ob = outbound(
            vec![simple("n1"), simple("n2")],
            vec![TagRecord::node("pool", vec!["n1".into(), "n2".into()])],
            OutboundConfig::default(),
        );
        let mut seen = HashSet::new();
        for _ in 0..64 {
            seen.insert(ob.resolve_tag("pool").unwrap());
        }
        assert!(seen.iter().all(|h| h == "n1" || h == "n2"));
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn default_node_and_missing_node() {
        let ob = outbound(
            vec![simple("n1")],
            vec![],
            OutboundConfig {
                tcp: Some("n1".into()),
                udp: Some("gone".into()),
                ..Default::default()
            },
        );
        let handler = ob.get(Network::Tcp, &Mode::Proxy, None).await.unwrap();
        assert_eq!(handler.tag(), "n1");

        let err = ob.get(Network::Udp, &Mode::Proxy, None).await.err().unwrap();
        assert_eq!(ProxyError::classify(&err), ProxyErrorKind::NodeNotFound);

        let err = ob.load("gone").await.err().unwrap();
        assert_eq!(ProxyError::classify(&err), ProxyErrorKind::NodeNotFound);
        assert_eq!(ob.store().len(), 1);
    }

    #[tokio::test]
    async fn no_default_configured() {
        let ob = outbound(vec![], vec![], OutboundConfig::default());
        let err = ob.get(Network::Tcp, &Mode::Proxy, None).await.err().unwrap();
        assert_eq!(ProxyError::classify(&err), ProxyErrorKind::Config);
    }

    #[tokio::test]
    async fn set_nested_through_mirror_does_not_recurse() {
        let set = Point::new(
            "loop",
            "",
            vec![Protocol::set(vec!["self".into()], SetStrategy::RoundRobin)],
        )
        .with_hash("s");
        let ob = outbound(
            vec![set],
            vec![TagRecord::node("inner", vec!["s".into()]), TagRecord::mirror("self", "inner")],
            OutboundConfig::default(),
        );

        let handle = ob.load("s").await.unwrap();
        let err = handle
            .connect(&Session::tcp(Address::Domain("example.com".into(), 443)))
            .await
            .err()
            .unwrap();
        match err.downcast_ref::<ProxyError>() {
            Some(ProxyError::AllCandidatesFailed(joined)) => {
                assert_eq!(joined.len(), 1);
                let only = joined.iter().next().unwrap();
                assert_eq!(
                    ProxyError::classify(&only.error),
                    ProxyErrorKind::NestedLoopNotSupported
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_and_remove_delegate_to_store() {
        let ob = outbound(vec![simple("n1")], vec![], OutboundConfig::default());
        let old = ob.load("n1").await.unwrap();
        assert_eq!(ob.refresh_node(&simple("n1")).await, RefreshOutcome::Unchanged);

        let changed = Point::new("n1", "g", vec![Protocol::simple("127.0.0.1", 2)]).with_hash("n1");
        assert_eq!(ob.refresh_node(&changed).await, RefreshOutcome::Evicted);
        assert!(old.is_closed());

        ob.load("n1").await.unwrap();
        assert!(ob.remove_node("n1").await);
        assert_eq!(ob.close_all(), 0);
    }
}
