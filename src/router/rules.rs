use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;

use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Deserializer};

/// 规则行格式：`PATTERN MODE`，字段之间一个或多个空格
static RULE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^ ]+) +([^ ]+) *$").expect("rule line regex is valid")
});

/// 进程名规则前缀
pub const PROCESS_PREFIX: &str = "process:";

/// 路由模式
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mode {
    Direct,
    Proxy,
    Block,
    /// 自定义出站 tag，经 Tag 间接寻址到具体节点
    Custom(String),
}

impl Mode {
    /// 内置模式大小写不敏感，其余单词视为自定义 tag
    pub fn parse(s: &str) -> Option<Mode> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        Some(match s.to_ascii_lowercase().as_str() {
            "direct" => Mode::Direct,
            "proxy" => Mode::Proxy,
            "block" => Mode::Block,
            _ => Mode::Custom(s.to_string()),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Mode::Direct => "direct",
            Mode::Proxy => "proxy",
            Mode::Block => "block",
            Mode::Custom(tag) => tag,
        }
    }

    pub fn custom_tag(&self) -> Option<&str> {
        match self {
            Mode::Custom(tag) => Some(tag),
            _ => None,
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Proxy
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Mode::parse(&s).ok_or_else(|| serde::de::Error::custom("empty mode"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    DomainSuffix,
    Cidr,
    Process,
}

/// 已分类的规则条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    DomainSuffix(String),
    Cidr(IpNet),
    Process(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub pattern: Pattern,
    pub mode: Mode,
}

impl Pattern {
    /// 分类规则模式：`process:` 前缀、CIDR、裸 IP（全长掩码）、域名后缀。
    /// 非法输入返回 None。
    pub fn classify(raw: &str) -> Option<Pattern> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Some(name) = raw.strip_prefix(PROCESS_PREFIX) {
            return (!name.is_empty()).then(|| Pattern::Process(name.to_string()));
        }

        if raw.contains('/') {
            return raw.parse::<IpNet>().ok().map(|n| Pattern::Cidr(n.trunc()));
        }

        if let Ok(ip) = raw.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Some(Pattern::Cidr(IpNet::from(ip)));
        }

        let domain = raw.trim_matches('.').to_ascii_lowercase();
        if domain.is_empty() || domain.contains("..") || domain.contains(char::is_whitespace) {
            return None;
        }
        Some(Pattern::DomainSuffix(domain))
    }

    pub fn kind(&self) -> PatternKind {
        match self {
            Pattern::DomainSuffix(_) => PatternKind::DomainSuffix,
            Pattern::Cidr(_) => PatternKind::Cidr,
            Pattern::Process(_) => PatternKind::Process,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::DomainSuffix(d) => write!(f, "domain-suffix({})", d),
            Pattern::Cidr(n) => write!(f, "ip-cidr({})", n),
            Pattern::Process(p) => write!(f, "process({})", p),
        }
    }
}

impl RuleEntry {
    pub fn new(pattern: &str, mode: Mode) -> Option<Self> {
        Pattern::classify(pattern).map(|pattern| Self { pattern, mode })
    }

    pub fn kind(&self) -> PatternKind {
        self.pattern.kind()
    }
}

/// 解析单行规则；空行、注释、不足 4 字节及格式错误的行返回 None
pub fn parse_rule_line(line: &str) -> Option<RuleEntry> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() < 4 || line.starts_with('#') {
        return None;
    }
    let caps = RULE_LINE.captures(line)?;
    let mode = Mode::parse(&caps[2])?;
    RuleEntry::new(&caps[1], mode)
}

/// 解析整份规则文件，坏行被跳过，返回 (规则, 跳过的非空行数)
pub fn parse_rules(content: &str) -> (Vec<RuleEntry>, usize) {
    let mut rules = Vec::new();
    let mut skipped = 0;
    for line in content.lines() {
        match parse_rule_line(line) {
            Some(rule) => rules.push(rule),
            None => {
                let trimmed = line.trim();
                if !trimmed.is_empty() && !trimmed.starts_with('#') {
                    skipped += 1;
                }
            }
        }
    }
    (rules, skipped)
}
