use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use ipnet::IpNet;

use super::rules::{Mode, Pattern, RuleEntry};
use super::trie::{DomainTrie, IpPrefixTrie};

/// 规则匹配器：域名后缀 trie + CIDR 前缀 trie + 进程名表。
///
/// 每次重载都构建新的实例，通过 [`SharedMatcher`] 整体替换发布，
/// 已发布的实例不再修改。
#[derive(Default)]
pub struct RuleMatcher {
    domains: DomainTrie<Mode>,
    cidrs: IpPrefixTrie<Mode>,
    processes: HashMap<String, Mode>,
}

impl RuleMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a RuleEntry>) -> Self {
        let mut matcher = Self::new();
        for rule in rules {
            matcher.insert_entry(rule);
        }
        matcher
    }

    /// 插入一条规则，模式非法时静默忽略。返回是否插入。
    pub fn insert(&mut self, pattern: &str, mode: Mode) -> bool {
        match Pattern::classify(pattern) {
            Some(pattern) => {
                self.insert_pattern(pattern, mode);
                true
            }
            None => false,
        }
    }

    pub fn insert_entry(&mut self, rule: &RuleEntry) {
        self.insert_pattern(rule.pattern.clone(), rule.mode.clone());
    }

    pub fn insert_process(&mut self, name: &str, mode: Mode) {
        if !name.is_empty() {
            self.processes.insert(name.to_string(), mode);
        }
    }

    fn insert_pattern(&mut self, pattern: Pattern, mode: Mode) {
        match pattern {
            Pattern::DomainSuffix(domain) => self.domains.insert(&domain, mode),
            Pattern::Cidr(net) => self.cidrs.insert(&net, mode),
            Pattern::Process(name) => self.insert_process(&name, mode),
        }
    }

    /// IP 字面量走 CIDR 前缀匹配，其余按域名后缀匹配
    pub fn search(&self, key: &str) -> Option<&Mode> {
        let key = key.trim_start_matches('[').trim_end_matches(']');
        match key.parse::<IpAddr>() {
            Ok(ip) => self.search_ip(ip),
            Err(_) => self.domains.find(key),
        }
    }

    pub fn search_ip(&self, ip: IpAddr) -> Option<&Mode> {
        self.cidrs.longest_prefix_match(ip)
    }

    pub fn search_cidr(&self, net: &IpNet) -> Option<&Mode> {
        self.cidrs.longest_prefix_match(net.network())
    }

    pub fn search_process(&self, name: &str) -> Option<&Mode> {
        self.processes.get(name)
    }

    pub fn has_process_rules(&self) -> bool {
        !self.processes.is_empty()
    }

    /// 规则总数（重复模式只计一次）
    pub fn len(&self) -> usize {
        self.domains.len() + self.cidrs.len() + self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.domains.clear();
        self.cidrs.clear();
        self.processes.clear();
    }
}

/// 可原子替换的匹配器指针
pub struct SharedMatcher {
    inner: RwLock<Arc<RuleMatcher>>,
}

impl Default for SharedMatcher {
    fn default() -> Self {
        Self::new(RuleMatcher::new())
    }
}

impl SharedMatcher {
    pub fn new(matcher: RuleMatcher) -> Self {
        Self {
            inner: RwLock::new(Arc::new(matcher)),
        }
    }

    /// 读锁只持有到 Arc 克隆完成
    pub fn load(&self) -> Arc<RuleMatcher> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn store(&self, matcher: RuleMatcher) {
        let matcher = Arc::new(matcher);
        match self.inner.write() {
            Ok(mut guard) => *guard = matcher,
            Err(poisoned) => *poisoned.into_inner() = matcher,
        }
    }
}
