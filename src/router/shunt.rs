use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, error, info, warn};

use super::matcher::{RuleMatcher, SharedMatcher};
use super::process::ProcessDumper;
use super::rules::{self, Mode, RuleEntry};
use crate::common::{Address, ProxyError};
use crate::config::types::{BypassConfig, NetworkMode};
use crate::dns::DnsResolver;
use crate::proxy::{Network, Session};

/// 规则文件不存在时写出的内置规则
pub const DEFAULT_RULES: &str = include_str!("default_rules.conf");

/// 决策命中的来源，仅用于日志与统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Forced,
    Network,
    Disabled,
    Domain,
    Ip,
    Process,
    Resolved,
    Default,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Forced => "forced",
            MatchKind::Network => "network",
            MatchKind::Disabled => "disabled",
            MatchKind::Domain => "domain",
            MatchKind::Ip => "ip-cidr",
            MatchKind::Process => "process",
            MatchKind::Resolved => "resolved-ip",
            MatchKind::Default => "default",
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub mode: Mode,
    pub matched: MatchKind,
}

impl Decision {
    fn new(mode: Mode, matched: MatchKind) -> Self {
        Self { mode, matched }
    }
}

/// 分流引擎：持有当前规则文件路径与已发布的匹配器
pub struct BypassEngine {
    config: RwLock<BypassConfig>,
    matcher: SharedMatcher,
    /// 串行化重载，避免旧文件内容覆盖新文件
    reload_lock: Mutex<()>,
    resolver: Option<Arc<dyn DnsResolver>>,
    process: Option<Arc<dyn ProcessDumper>>,
}

impl BypassEngine {
    /// 创建引擎但不读取规则文件，调用方需要再执行 `refresh_mapping`
    pub fn new(config: BypassConfig) -> Self {
        Self {
            config: RwLock::new(config),
            matcher: SharedMatcher::default(),
            reload_lock: Mutex::new(()),
            resolver: None,
            process: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_process_dumper(mut self, dumper: Arc<dyn ProcessDumper>) -> Self {
        self.process = Some(dumper);
        self
    }

    pub fn config(&self) -> BypassConfig {
        match self.config.read() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn file(&self) -> PathBuf {
        self.config().file
    }

    pub fn matcher(&self) -> Arc<RuleMatcher> {
        self.matcher.load()
    }

    /// 路径变化时记录新路径并重载；相同路径不做任何事
    pub fn set_file(&self, path: impl Into<PathBuf>) -> Result<(), ProxyError> {
        let path = path.into();
        let changed = {
            let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
            if config.file == path {
                false
            } else {
                config.file = path;
                true
            }
        };
        if changed {
            self.refresh_mapping()?;
        }
        Ok(())
    }

    /// 整体替换配置；规则文件或自定义规则变化时重载
    pub fn update(&self, next: BypassConfig) -> Result<(), ProxyError> {
        let need_reload = {
            let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
            let reload = config.file != next.file || config.custom_rules != next.custom_rules;
            *config = next;
            reload
        };
        if need_reload {
            self.refresh_mapping()?;
        }
        Ok(())
    }

    /// 读取规则文件，构建新的匹配器并整体发布。
    ///
    /// 文件不存在时先写出内置规则。任何 I/O 失败都会中止本次重载，
    /// 之前发布的匹配器保持生效。返回新匹配器中的规则数。
    pub fn refresh_mapping(&self) -> Result<usize, ProxyError> {
        let _guard = self.reload_lock.lock().unwrap_or_else(|p| p.into_inner());
        let config = self.config();

        let content = match read_rule_file(&config.file) {
            Ok(content) => content,
            Err(e) => {
                error!(path = %config.file.display(), error = %e, "bypass rule reload failed");
                return Err(e);
            }
        };

        let (file_rules, skipped) = rules::parse_rules(&content);
        let mut matcher = RuleMatcher::from_rules(&file_rules);

        // 自定义规则最后插入，覆盖文件中的同名模式
        let mut custom = 0;
        for rule in &config.custom_rules {
            match RuleEntry::new(&rule.pattern, rule.mode.clone()) {
                Some(entry) => {
                    matcher.insert_entry(&entry);
                    custom += 1;
                }
                None => warn!(pattern = rule.pattern, "invalid custom bypass rule ignored"),
            }
        }

        let total = matcher.len();
        self.matcher.store(matcher);
        info!(
            path = %config.file.display(),
            rules = file_rules.len(),
            custom = custom,
            skipped = skipped,
            "bypass rules loaded"
        );
        Ok(total)
    }

    /// 对会话做分流决策
    pub async fn decide(&self, session: &Session) -> Decision {
        self.decide_target(
            &session.target,
            session.network,
            session.source,
            session.force_mode.as_ref(),
        )
        .await
    }

    pub async fn decide_target(
        &self,
        target: &Address,
        network: Network,
        source: Option<SocketAddr>,
        force: Option<&Mode>,
    ) -> Decision {
        let decision = self.decide_inner(target, network, source, force).await;
        debug!(
            dest = %target,
            network = %network,
            mode = %decision.mode,
            matched = %decision.matched,
            "bypass decision"
        );
        decision
    }

    async fn decide_inner(
        &self,
        target: &Address,
        network: Network,
        source: Option<SocketAddr>,
        force: Option<&Mode>,
    ) -> Decision {
        if let Some(mode) = force {
            return Decision::new(mode.clone(), MatchKind::Forced);
        }

        let config = self.config();
        let network_mode = match network {
            Network::Tcp => &config.tcp,
            Network::Udp => &config.udp,
        };
        if let NetworkMode::Force(mode) = network_mode {
            return Decision::new(mode.clone(), MatchKind::Network);
        }

        if !config.enabled {
            return Decision::new(Mode::Proxy, MatchKind::Disabled);
        }

        let matcher = self.matcher.load();

        match target {
            Address::Domain(host, _) => {
                if let Some(mode) = matcher.search(host) {
                    return Decision::new(mode.clone(), MatchKind::Domain);
                }
            }
            Address::Ip(addr) => {
                if let Some(mode) = matcher.search_ip(addr.ip()) {
                    return Decision::new(mode.clone(), MatchKind::Ip);
                }
            }
        }

        if let (Some(dumper), Some(source)) = (&self.process, source) {
            if matcher.has_process_rules() {
                if let Some(name) = lookup_process(dumper.clone(), network, source).await {
                    if let Some(mode) = matcher.search_process(&name) {
                        debug!(process = name, "process rule matched");
                        return Decision::new(mode.clone(), MatchKind::Process);
                    }
                }
            }
        }

        if config.resolve_domain {
            if let (Address::Domain(host, _), Some(resolver)) = (target, &self.resolver) {
                match resolver.resolve(host).await {
                    Ok(ips) => {
                        if let Some(mode) = search_ips(&matcher, &ips) {
                            return Decision::new(mode.clone(), MatchKind::Resolved);
                        }
                    }
                    Err(e) => debug!(host = host, error = %e, "bypass resolve failed"),
                }
            }
        }

        Decision::new(config.default_mode.clone(), MatchKind::Default)
    }
}

fn search_ips<'a>(matcher: &'a RuleMatcher, ips: &[IpAddr]) -> Option<&'a Mode> {
    ips.iter().find_map(|ip| matcher.search_ip(*ip))
}

async fn lookup_process(
    dumper: Arc<dyn ProcessDumper>,
    network: Network,
    source: SocketAddr,
) -> Option<String> {
    tokio::task::spawn_blocking(move || dumper.lookup_process(network, &source))
        .await
        .ok()
        .flatten()
}

/// 读取规则文件，不存在时先写出内置规则（含父目录）
fn read_rule_file(path: &Path) -> Result<String, ProxyError> {
    let io_err = |source| ProxyError::RuleFileIo {
        path: path.display().to_string(),
        source,
    };

    if !path.exists() {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, DEFAULT_RULES).map_err(io_err)?;
        info!(path = %path.display(), "default bypass rules written");
    }

    std::fs::read_to_string(path).map_err(io_err)
}
