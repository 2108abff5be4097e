pub mod outbound;
pub mod store;
pub mod tracker;
#[cfg(feature = "cli")]
pub mod watch;

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::common::{BoxUdpTransport, Dialer, ProxyError};
use crate::config::Config;
use crate::dns::{DnsResolver, HostsResolver, SystemResolver};
use crate::node::{MemoryNodes, Point};
use crate::proxy::{OutboundHandler, ProtocolRegistry, Session};
use crate::router::{BypassEngine, Decision, ProcessDetector};

use outbound::Outbound;
use store::{ProxyHandle, RefreshOutcome};
use tracker::{ConnectionGuard, ConnectionTracker, TrackedStream};

/// 一次路由的结果：分流决策 + 选中的拨号器
pub struct Route {
    pub decision: Decision,
    pub handler: Arc<dyn OutboundHandler>,
}

impl Route {
    /// 节点出站返回节点 hash，内置出站返回其标签
    pub fn node(&self) -> &str {
        match self.handler.as_any().downcast_ref::<ProxyHandle>() {
            Some(handle) => handle.hash(),
            None => self.handler.tag(),
        }
    }
}

/// 内核入口：分流引擎、出站路由、节点表和连接跟踪
pub struct App {
    bypass: Arc<BypassEngine>,
    outbound: Arc<Outbound>,
    nodes: Arc<MemoryNodes>,
    tracker: Arc<ConnectionTracker>,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let resolver: Arc<dyn DnsResolver> = if config.hosts.is_empty() {
            Arc::new(SystemResolver)
        } else {
            Arc::new(HostsResolver::new(config.hosts.clone(), Arc::new(SystemResolver)))
        };

        let dialer = Dialer::with_resolver(config.dialer.clone(), resolver.clone());
        let registry = Arc::new(ProtocolRegistry::with_builtin(dialer));
        let nodes = Arc::new(MemoryNodes::from_parts(config.nodes, config.tags));
        let outbound = Outbound::new(registry, nodes.clone(), config.outbound);

        let bypass = BypassEngine::new(config.bypass)
            .with_resolver(resolver)
            .with_process_dumper(Arc::new(ProcessDetector::new()));
        let bypass = Arc::new(bypass);
        // 规则文件读取失败不影响启动，所有流量走默认模式
        if let Err(e) = bypass.refresh_mapping() {
            warn!(error = %e, "starting without bypass rules");
        }

        info!(nodes = nodes.len(), "openshunt kernel ready");
        Ok(Self::from_parts(bypass, outbound, nodes))
    }

    pub fn from_parts(bypass: Arc<BypassEngine>, outbound: Arc<Outbound>, nodes: Arc<MemoryNodes>) -> Self {
        Self {
            bypass,
            outbound,
            nodes,
            tracker: Arc::new(ConnectionTracker::new()),
        }
    }

    pub fn bypass(&self) -> &Arc<BypassEngine> {
        &self.bypass
    }

    pub fn outbound(&self) -> &Arc<Outbound> {
        &self.outbound
    }

    pub fn nodes(&self) -> &Arc<MemoryNodes> {
        &self.nodes
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub async fn decide(&self, session: &Session) -> Decision {
        self.bypass.decide(session).await
    }

    /// 分流后选出拨号器，不发起连接
    pub async fn route(&self, session: &Session) -> Result<Route> {
        let decision = self.decide(session).await;
        let handler = self
            .outbound
            .get(session.network, &decision.mode, session.routing_tag.as_deref())
            .await?;
        debug!(
            target = %session.target,
            mode = %decision.mode,
            matched = %decision.matched,
            outbound = handler.tag(),
            "routed"
        );
        Ok(Route { decision, handler })
    }

    /// 路由并建立 TCP 连接，返回带流量统计的流
    pub async fn dial(&self, session: &Session) -> Result<TrackedStream> {
        let route = self.route(session).await?;
        let stream = route.handler.connect(session).await?;
        let guard = self.tracker.track(session, &route.decision, route.node());
        Ok(self.tracker.wrap(stream, guard))
    }

    /// 路由并建立 UDP 传输；守卫释放时移除跟踪记录
    pub async fn dial_udp(&self, session: &Session) -> Result<(BoxUdpTransport, ConnectionGuard)> {
        let route = self.route(session).await?;
        let transport = route.handler.connect_udp(session).await?;
        let guard = self.tracker.track(session, &route.decision, route.node());
        Ok((transport, guard))
    }

    /// 写入节点新配置；已缓存的拨号器在配置变化时被淘汰
    pub async fn update_node(&self, point: Point) -> RefreshOutcome {
        let mut point = point;
        point.ensure_hash();
        self.nodes.upsert_point(point.clone());
        self.outbound.refresh_node(&point).await
    }

    pub async fn remove_node(&self, hash: &str) -> bool {
        let existed = self.nodes.remove_point(hash).is_some();
        let cached = self.outbound.remove_node(hash).await;
        existed || cached
    }

    pub fn reload_rules(&self) -> Result<usize, ProxyError> {
        self.bypass.refresh_mapping()
    }

    /// 关闭所有节点拨号器并清空连接表
    pub fn shutdown(&self) {
        let closed = self.outbound.close_all();
        let tracked = self.tracker.close_all();
        info!(outbounds = closed, connections = tracked, "openshunt kernel stopped");
    }
}
