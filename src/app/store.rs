use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::common::{BoxUdpTransport, ProxyError, ProxyStream};
use crate::node::Point;
use crate::proxy::outbound::ClosedOutbound;
use crate::proxy::{OutboundHandler, Session};

/// 对外发放的节点句柄。节点被淘汰时内部拨号器换成 [`ClosedOutbound`]，
/// 仍持有句柄的调用方之后拨号得到 `ClosedProxy`。
pub struct ProxyHandle {
    hash: String,
    name: String,
    inner: RwLock<Arc<dyn OutboundHandler>>,
}

impl ProxyHandle {
    fn new(point: &Point, handler: Arc<dyn OutboundHandler>) -> Self {
        Self {
            hash: point.hash.clone(),
            name: point.name.clone(),
            inner: RwLock::new(handler),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前生效的拨号器
    pub fn current(&self) -> Arc<dyn OutboundHandler> {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.current().as_any().is::<ClosedOutbound>()
    }

    /// 关闭旧拨号器并换成已关闭占位
    fn poison(&self) {
        let closed: Arc<dyn OutboundHandler> = Arc::new(ClosedOutbound::new(self.name.clone()));
        let old = {
            let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *inner, closed)
        };
        old.close();
    }
}

#[async_trait]
impl OutboundHandler for ProxyHandle {
    fn tag(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn connect(&self, session: &Session) -> Result<ProxyStream> {
        let handler = self.current();
        handler.connect(session).await
    }

    async fn connect_udp(&self, session: &Session) -> Result<BoxUdpTransport> {
        let handler = self.current();
        handler.connect_udp(session).await
    }

    fn close(&self) {
        self.poison();
    }
}

struct ProxyEntry {
    config: Point,
    handle: Arc<ProxyHandle>,
}

/// `refresh_node` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// 未缓存，无事发生
    Absent,
    /// 配置相同，句柄保持不变
    Unchanged,
    /// 配置变化，旧句柄已关闭并移出缓存
    Evicted,
}

/// 一次构建的结果，失败以共享错误的形式分给每个等待者
type BuildOutcome = std::result::Result<Arc<ProxyHandle>, Arc<anyhow::Error>>;

/// 进行中的构建，同一 hash 的并发请求加入同一个
type Flight = Arc<tokio::sync::OnceCell<BuildOutcome>>;

/// 节点拨号器缓存：每个节点 hash 至多一个存活的拨号器。
///
/// 同一个 hash 的并发请求加入同一次构建，全部得到同一个句柄或同一个错误；
/// 构建结束即撤下，失败不缓存，之后的请求重新构建。
/// 构建与 `refresh_node` / `delete` 在每键异步锁下互斥。
#[derive(Default)]
pub struct OutboundStore {
    entries: RwLock<HashMap<String, ProxyEntry>>,
    flights: Mutex<HashMap<String, Flight>>,
    building: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl OutboundStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &str) -> Option<Arc<ProxyHandle>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.get(hash).map(|e| e.handle.clone())
    }

    pub fn config(&self, hash: &str) -> Option<Point> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.get(hash).map(|e| e.config.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hashes(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.keys().cloned().collect()
    }

    /// 命中缓存直接返回；否则加入该 hash 进行中的构建，没有则发起一次。
    /// 只有实际执行构建的调用方会运行自己的 `constructor`。
    pub async fn load_or_create<F, Fut>(&self, hash: &str, constructor: F) -> Result<Arc<ProxyHandle>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Point, Arc<dyn OutboundHandler>)>>,
    {
        if let Some(handle) = self.get(hash) {
            return Ok(handle);
        }

        let flight = self.join_flight(hash);
        let outcome = flight
            .get_or_init(|| self.build_exclusive(hash, constructor))
            .await
            .clone();
        self.land_flight(hash, &flight);
        outcome.map_err(|e| ProxyError::Shared(e).into())
    }

    async fn build_exclusive<F, Fut>(&self, hash: &str, constructor: F) -> BuildOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Point, Arc<dyn OutboundHandler>)>>,
    {
        let key_lock = self.key_lock(hash);
        let result = {
            let _guard = key_lock.lock().await;
            match self.get(hash) {
                Some(handle) => Ok(handle),
                None => self.construct(hash, constructor).await.map_err(Arc::new),
            }
        };
        self.release_key_lock(hash, key_lock);
        result
    }

    async fn construct<F, Fut>(&self, hash: &str, constructor: F) -> Result<Arc<ProxyHandle>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Point, Arc<dyn OutboundHandler>)>>,
    {
        let (config, handler) = constructor().await.map_err(|e| {
            debug!(hash = hash, error = %e, "outbound construction failed");
            e
        })?;
        let handle = Arc::new(ProxyHandle::new(&config, handler));
        info!(hash = hash, name = config.name, "outbound created");

        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            hash.to_string(),
            ProxyEntry {
                config,
                handle: handle.clone(),
            },
        );
        Ok(handle)
    }

    /// 配置相同则什么都不做；变化则关闭旧句柄并移出缓存，下次请求按新配置重建。
    pub async fn refresh_node(&self, point: &Point) -> RefreshOutcome {
        let key_lock = self.key_lock(&point.hash);
        let outcome = {
            let _guard = key_lock.lock().await;
            let evicted = {
                let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
                match entries.get(&point.hash).map(|e| e.config == *point) {
                    None => None,
                    Some(true) => {
                        debug!(hash = point.hash, "outbound config unchanged");
                        Some(None)
                    }
                    Some(false) => Some(entries.remove(&point.hash)),
                }
            };
            match evicted {
                None => RefreshOutcome::Absent,
                Some(None) => RefreshOutcome::Unchanged,
                Some(Some(entry)) => {
                    entry.handle.poison();
                    info!(hash = point.hash, name = point.name, "outbound evicted on config change");
                    RefreshOutcome::Evicted
                }
            }
        };
        self.release_key_lock(&point.hash, key_lock);
        outcome
    }

    /// 无条件关闭并移除
    pub async fn delete(&self, hash: &str) -> bool {
        let key_lock = self.key_lock(hash);
        let removed = {
            let _guard = key_lock.lock().await;
            let entry = self
                .entries
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .remove(hash);
            match entry {
                Some(entry) => {
                    entry.handle.poison();
                    info!(hash = hash, "outbound deleted");
                    true
                }
                None => false,
            }
        };
        self.release_key_lock(hash, key_lock);
        removed
    }

    /// 关闭所有缓存的拨号器，返回关闭数量
    pub fn close_all(&self) -> usize {
        let drained: Vec<ProxyEntry> = {
            let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
            entries.drain().map(|(_, e)| e).collect()
        };
        for entry in &drained {
            entry.handle.poison();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "all outbounds closed");
        }
        drained.len()
    }

    fn join_flight(&self, hash: &str) -> Flight {
        let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
        flights.entry(hash.to_string()).or_default().clone()
    }

    /// 构建结束后撤下；表里已换成新的构建时不动
    fn land_flight(&self, hash: &str, flight: &Flight) {
        let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
        if flights.get(hash).is_some_and(|f| Arc::ptr_eq(f, flight)) {
            flights.remove(hash);
        }
    }

    fn key_lock(&self, hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut building = self.building.lock().unwrap_or_else(|p| p.into_inner());
        building
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 没有其他等待者时回收该键的锁
    fn release_key_lock(&self, hash: &str, key_lock: Arc<tokio::sync::Mutex<()>>) {
        let mut building = self.building.lock().unwrap_or_else(|p| p.into_inner());
        // 表里一份 + 手上一份
        if Arc::strong_count(&key_lock) <= 2 {
            building.remove(hash);
        }
    }
}
