use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::common::{Address, Dialer};
use crate::node::Protocol;
use crate::proxy::outbound::{
    DirectOutbound, HttpOutbound, RejectOutbound, SimpleOutbound, Socks5Outbound, TlsOutbound,
    TrojanOutbound,
};
use crate::proxy::OutboundHandler;

/// 协议构造函数：接收描述符和下层拨号器，返回包装后的拨号器
pub type Transform = Arc<
    dyn Fn(&Protocol, Arc<dyn OutboundHandler>) -> Result<Arc<dyn OutboundHandler>> + Send + Sync,
>;

/// 协议标签到构造函数的注册表。同一标签后注册的覆盖先注册的。
pub struct ProtocolRegistry {
    transforms: RwLock<HashMap<String, Transform>>,
    direct: Arc<DirectOutbound>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new(Dialer::default_dialer())
    }
}

impl ProtocolRegistry {
    /// 空注册表；`dialer` 用于链起点的直连拨号器
    pub fn new(dialer: Dialer) -> Self {
        Self {
            transforms: RwLock::new(HashMap::new()),
            direct: Arc::new(DirectOutbound::new("direct").with_dialer(dialer)),
        }
    }

    /// 注册内置协议：none / direct / simple / tls / http / socks5 / trojan / reject
    pub fn with_builtin(dialer: Dialer) -> Self {
        let registry = Self::new(dialer);
        registry.register_builtin();
        registry
    }

    pub fn register<F>(&self, tag: &str, transform: F)
    where
        F: Fn(&Protocol, Arc<dyn OutboundHandler>) -> Result<Arc<dyn OutboundHandler>>
            + Send
            + Sync
            + 'static,
    {
        let mut transforms = self.transforms.write().unwrap_or_else(|p| p.into_inner());
        if transforms.insert(tag.to_string(), Arc::new(transform)).is_some() {
            debug!(protocol = tag, "protocol transform replaced");
        }
    }

    pub fn unregister(&self, tag: &str) -> bool {
        let mut transforms = self.transforms.write().unwrap_or_else(|p| p.into_inner());
        transforms.remove(tag).is_some()
    }

    pub fn get(&self, tag: &str) -> Option<Transform> {
        let transforms = self.transforms.read().unwrap_or_else(|p| p.into_inner());
        transforms.get(tag).cloned()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.get(tag).is_some()
    }

    pub fn tags(&self) -> Vec<String> {
        let transforms = self.transforms.read().unwrap_or_else(|p| p.into_inner());
        let mut tags: Vec<String> = transforms.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// 链起点
    pub fn direct(&self) -> Arc<dyn OutboundHandler> {
        self.direct.clone()
    }

    fn register_builtin(&self) {
        self.register("none", |_, base| Ok(base));

        let direct = self.direct.clone();
        self.register("direct", move |_, _| Ok(direct.clone() as Arc<dyn OutboundHandler>));

        self.register("reject", |_, _| {
            Ok(Arc::new(RejectOutbound::new("reject")) as Arc<dyn OutboundHandler>)
        });

        self.register("simple", |p, base| match p {
            Protocol::Simple {
                host,
                port,
                timeout_ms,
            } => {
                if host.is_empty() || *port == 0 {
                    anyhow::bail!("simple: host and port are required");
                }
                let server = Address::from_host(host, *port);
                let timeout = timeout_ms.filter(|t| *t > 0).map(Duration::from_millis);
                Ok(Arc::new(SimpleOutbound::new("simple", base, server, timeout))
                    as Arc<dyn OutboundHandler>)
            }
            other => mismatch("simple", other),
        });

        self.register("tls", |p, base| match p {
            Protocol::Tls {
                server_names,
                alpn,
                insecure_skip_verify,
            } => Ok(Arc::new(TlsOutbound::new(
                "tls",
                base,
                server_names,
                alpn,
                *insecure_skip_verify,
            )?) as Arc<dyn OutboundHandler>),
            other => mismatch("tls", other),
        });

        self.register("http", |p, base| match p {
            Protocol::Http { user, password } => Ok(Arc::new(HttpOutbound::new(
                "http",
                base,
                user.as_deref(),
                password.as_deref(),
            )) as Arc<dyn OutboundHandler>),
            other => mismatch("http", other),
        });

        self.register("socks5", |p, base| match p {
            Protocol::Socks5 { user, password } => Ok(Arc::new(Socks5Outbound::new(
                "socks5",
                base,
                user.as_deref(),
                password.as_deref(),
            )) as Arc<dyn OutboundHandler>),
            other => mismatch("socks5", other),
        });

        self.register("trojan", |p, base| match p {
            Protocol::Trojan { password } => {
                Ok(Arc::new(TrojanOutbound::new("trojan", base, password)?)
                    as Arc<dyn OutboundHandler>)
            }
            other => mismatch("trojan", other),
        });
    }
}

fn mismatch(expected: &str, got: &Protocol) -> Result<Arc<dyn OutboundHandler>> {
    anyhow::bail!(
        "transform '{}' received '{}' descriptor",
        expected,
        got.tag()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tags() {
        let registry = ProtocolRegistry::with_builtin(Dialer::default_dialer());
        assert_eq!(
            registry.tags(),
            vec!["direct", "http", "none", "reject", "simple", "socks5", "tls", "trojan"]
        );
        assert!(!registry.contains("set"));
        assert!(!registry.contains("vmess"));
    }

    #[test]
    fn last_registration_wins() {
        let registry = ProtocolRegistry::default();
        registry.register("vmess", |_, _| anyhow::bail!("first"));
        registry.register("vmess", |_, base| Ok(base));

        let transform = registry.get("vmess").unwrap();
        let base = registry.direct();
        let built = transform(
            &Protocol::Vmess {
                uuid: "u".into(),
                alter_id: 0,
                security: "auto".into(),
            },
            base.clone(),
        )
        .unwrap();
        assert!(Arc::ptr_eq(&built, &base));

        assert!(registry.unregister("vmess"));
        assert!(!registry.contains("vmess"));
    }

    #[test]
    fn simple_requires_host() {
        let registry = ProtocolRegistry::with_builtin(Dialer::default_dialer());
        let transform = registry.get("simple").unwrap();
        assert!(transform(&Protocol::simple("", 443), registry.direct()).is_err());
        assert!(transform(&Protocol::simple("1.2.3.4", 443), registry.direct()).is_ok());
        assert!(transform(&Protocol::Reject, registry.direct()).is_err());
    }
}
