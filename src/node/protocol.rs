use serde::{Deserialize, Serialize};

/// Set 的候选节点遍历策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetStrategy {
    #[default]
    RoundRobin,
    Random,
}

/// 协议描述符。链上每一项按 `type` 标签找到注册的构造函数，
/// 在前一项生成的拨号器之上再包一层。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Protocol {
    /// 透传，不改变下层拨号器
    None,
    /// 固定服务器：忽略会话目标，直接拨向 host:port
    Simple {
        host: String,
        port: u16,
        #[serde(default, rename = "timeout-ms", skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Tls {
        #[serde(default, rename = "server-names")]
        server_names: Vec<String>,
        #[serde(default)]
        alpn: Vec<String>,
        #[serde(default, rename = "insecure-skip-verify")]
        insecure_skip_verify: bool,
    },
    /// HTTP CONNECT 客户端
    Http {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Socks5 {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Trojan {
        password: String,
    },
    Websocket {
        #[serde(default)]
        host: String,
        #[serde(default = "default_ws_path")]
        path: String,
    },
    Shadowsocks {
        method: String,
        password: String,
    },
    Vmess {
        uuid: String,
        #[serde(default, rename = "alter-id")]
        alter_id: u16,
        #[serde(default = "default_vmess_security")]
        security: String,
    },
    Direct,
    Reject,
    Set {
        nodes: Vec<String>,
        #[serde(default)]
        strategy: SetStrategy,
    },
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_vmess_security() -> String {
    "auto".to_string()
}

impl Protocol {
    /// 注册表键
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::None => "none",
            Protocol::Simple { .. } => "simple",
            Protocol::Tls { .. } => "tls",
            Protocol::Http { .. } => "http",
            Protocol::Socks5 { .. } => "socks5",
            Protocol::Trojan { .. } => "trojan",
            Protocol::Websocket { .. } => "websocket",
            Protocol::Shadowsocks { .. } => "shadowsocks",
            Protocol::Vmess { .. } => "vmess",
            Protocol::Direct => "direct",
            Protocol::Reject => "reject",
            Protocol::Set { .. } => "set",
        }
    }

    pub fn simple(host: impl Into<String>, port: u16) -> Self {
        Protocol::Simple {
            host: host.into(),
            port,
            timeout_ms: None,
        }
    }

    pub fn set(nodes: Vec<String>, strategy: SetStrategy) -> Self {
        Protocol::Set { nodes, strategy }
    }
}
