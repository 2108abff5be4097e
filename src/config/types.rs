use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Deserializer};

use crate::common::DialerConfig;
use crate::node::{Point, TagKind, TagRecord};
use crate::proxy::outbound::RejectDelayConfig;
use crate::router::Mode;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub bypass: BypassConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub dialer: DialerConfig,
    #[serde(default)]
    pub nodes: Vec<Point>,
    #[serde(default)]
    pub tags: Vec<TagRecord>,
    /// 静态 hosts，优先于系统解析器
    #[serde(default)]
    pub hosts: HashMap<String, Vec<IpAddr>>,
}

impl Config {
    /// 补齐缺失的节点 hash
    pub fn normalize(&mut self) {
        for node in &mut self.nodes {
            node.ensure_hash();
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut hashes = HashSet::new();
        for node in &self.nodes {
            if node.hash.is_empty() {
                anyhow::bail!("node '{}' has no hash", node.name);
            }
            if !hashes.insert(node.hash.as_str()) {
                anyhow::bail!("duplicate node hash '{}'", node.hash);
            }
        }

        let mut tag_names = HashSet::new();
        for tag in &self.tags {
            if tag.name.is_empty() {
                anyhow::bail!("tag name must not be empty");
            }
            if !tag_names.insert(tag.name.as_str()) {
                anyhow::bail!("duplicate tag '{}'", tag.name);
            }
        }

        for tag in &self.tags {
            match tag.kind {
                TagKind::Node => {
                    if tag.targets.is_empty() {
                        anyhow::bail!("node tag '{}' has no targets", tag.name);
                    }
                    for target in &tag.targets {
                        if !hashes.contains(target.as_str()) {
                            anyhow::bail!(
                                "node tag '{}' references unknown node '{}'",
                                tag.name,
                                target
                            );
                        }
                    }
                }
                TagKind::Mirror => {
                    if tag.targets.len() != 1 {
                        anyhow::bail!("mirror tag '{}' must have exactly one target", tag.name);
                    }
                    if !tag_names.contains(tag.targets[0].as_str()) {
                        anyhow::bail!(
                            "mirror tag '{}' references unknown tag '{}'",
                            tag.name,
                            tag.targets[0]
                        );
                    }
                }
            }
        }

        for (network, default) in [("tcp", &self.outbound.tcp), ("udp", &self.outbound.udp)] {
            if let Some(name) = default {
                if !hashes.contains(name.as_str()) && !tag_names.contains(name.as_str()) {
                    anyhow::bail!(
                        "outbound {} default '{}' does not match any node or tag",
                        network,
                        name
                    );
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 按网络类型的分流方式：`bypass` 走规则，其余值强制为该模式
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NetworkMode {
    #[default]
    Bypass,
    Force(Mode),
}

impl<'de> Deserialize<'de> for NetworkMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.trim().eq_ignore_ascii_case("bypass") {
            return Ok(NetworkMode::Bypass);
        }
        Mode::parse(&s)
            .map(NetworkMode::Force)
            .ok_or_else(|| serde::de::Error::custom("empty network mode"))
    }
}

/// 配置里的附加规则，加载时插在规则文件之后
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CustomRule {
    pub pattern: String,
    pub mode: Mode,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BypassConfig {
    pub enabled: bool,
    pub tcp: NetworkMode,
    pub udp: NetworkMode,
    pub file: PathBuf,
    pub default_mode: Mode,
    pub custom_rules: Vec<CustomRule>,
    /// 规则未命中时解析域名再按 IP 匹配
    pub resolve_domain: bool,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tcp: NetworkMode::Bypass,
            udp: NetworkMode::Bypass,
            file: PathBuf::from("bypass.conf"),
            default_mode: Mode::Proxy,
            custom_rules: Vec::new(),
            resolve_domain: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OutboundConfig {
    /// TCP 默认节点（hash 或 tag 名）
    pub tcp: Option<String>,
    pub udp: Option<String>,
    pub set_timeout_ms: u64,
    pub reject_delay: RejectDelayConfig,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            tcp: None,
            udp: None,
            set_timeout_ms: 10_000,
            reject_delay: RejectDelayConfig::default(),
        }
    }
}
