use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// 单个候选节点的失败记录
#[derive(Debug)]
pub struct CandidateError {
    pub index: usize,
    pub node: String,
    pub error: anyhow::Error,
}

impl fmt::Display for CandidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {:#}", self.index, self.node, self.error)
    }
}

/// 多个候选节点失败后的聚合错误
#[derive(Debug, Default)]
pub struct JoinedErrors(pub Vec<CandidateError>);

impl JoinedErrors {
    pub fn push(&mut self, index: usize, node: &str, error: anyhow::Error) {
        self.0.push(CandidateError {
            index,
            node: node.to_string(),
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateError> {
        self.0.iter()
    }
}

impl fmt::Display for JoinedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("protocol '{0}' is not supported")]
    UnsupportedProtocol(String),

    #[error("build protocol '{tag}' at index {index} failed: {source:#}")]
    ProtocolBuildFailed {
        tag: String,
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("tag '{0}' not found")]
    TagNotFound(String),

    #[error("tag loop detected: {0}")]
    TagLoop(String),

    #[error("nested set loop is not supported")]
    NestedLoopNotSupported,

    #[error("all candidates failed: {0}")]
    AllCandidatesFailed(JoinedErrors),

    #[error("rule file '{path}' io failed: {source}")]
    RuleFileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy is closed")]
    ClosedProxy,

    #[error("blocked: {0}")]
    Blocked(String),

    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// 同一次构建的失败，分给所有等待这次构建的调用方
    #[error("{0:#}")]
    Shared(Arc<anyhow::Error>),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    /// 从 anyhow::Error 中提取分类，IO 错误按 kind 归类
    pub fn classify(err: &anyhow::Error) -> ProxyErrorKind {
        if let Some(pe) = err.downcast_ref::<ProxyError>() {
            return pe.kind();
        }
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return match io_err.kind() {
                std::io::ErrorKind::TimedOut => ProxyErrorKind::ConnectionTimeout,
                _ => ProxyErrorKind::Io,
            };
        }
        ProxyErrorKind::Other
    }

    pub fn kind(&self) -> ProxyErrorKind {
        match self {
            ProxyError::Io(_) => ProxyErrorKind::Io,
            ProxyError::Protocol(_) => ProxyErrorKind::Protocol,
            ProxyError::Config(_) => ProxyErrorKind::Config,
            ProxyError::UnsupportedProtocol(_) => ProxyErrorKind::UnsupportedProtocol,
            ProxyError::ProtocolBuildFailed { .. } => ProxyErrorKind::ProtocolBuildFailed,
            ProxyError::NodeNotFound(_) => ProxyErrorKind::NodeNotFound,
            ProxyError::TagNotFound(_) => ProxyErrorKind::TagNotFound,
            ProxyError::TagLoop(_) => ProxyErrorKind::TagLoop,
            ProxyError::NestedLoopNotSupported => ProxyErrorKind::NestedLoopNotSupported,
            ProxyError::AllCandidatesFailed(_) => ProxyErrorKind::AllCandidatesFailed,
            ProxyError::RuleFileIo { .. } => ProxyErrorKind::RuleFileIo,
            ProxyError::ClosedProxy => ProxyErrorKind::ClosedProxy,
            ProxyError::Blocked(_) => ProxyErrorKind::Blocked,
            ProxyError::ConnectionTimeout(_) => ProxyErrorKind::ConnectionTimeout,
            ProxyError::Unsupported(_) => ProxyErrorKind::Unsupported,
            ProxyError::Shared(inner) => ProxyError::classify(inner),
            ProxyError::Other(_) => ProxyErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    Io,
    Protocol,
    Config,
    UnsupportedProtocol,
    ProtocolBuildFailed,
    NodeNotFound,
    TagNotFound,
    TagLoop,
    NestedLoopNotSupported,
    AllCandidatesFailed,
    RuleFileIo,
    ClosedProxy,
    Blocked,
    ConnectionTimeout,
    Unsupported,
    Other,
}

impl ProxyErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyErrorKind::Io => "IO",
            ProxyErrorKind::Protocol => "PROTOCOL",
            ProxyErrorKind::Config => "CONFIG",
            ProxyErrorKind::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ProxyErrorKind::ProtocolBuildFailed => "BUILD_FAILED",
            ProxyErrorKind::NodeNotFound => "NODE_NOT_FOUND",
            ProxyErrorKind::TagNotFound => "TAG_NOT_FOUND",
            ProxyErrorKind::TagLoop => "TAG_LOOP",
            ProxyErrorKind::NestedLoopNotSupported => "NESTED_LOOP",
            ProxyErrorKind::AllCandidatesFailed => "ALL_FAILED",
            ProxyErrorKind::RuleFileIo => "RULE_FILE_IO",
            ProxyErrorKind::ClosedProxy => "CLOSED",
            ProxyErrorKind::Blocked => "BLOCKED",
            ProxyErrorKind::ConnectionTimeout => "CONN_TIMEOUT",
            ProxyErrorKind::Unsupported => "UNSUPPORTED",
            ProxyErrorKind::Other => "OTHER",
        }
    }
}

impl From<ProxyError> for std::io::Error {
    fn from(e: ProxyError) -> Self {
        std::io::Error::other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_downcasts_proxy_error() {
        let err: anyhow::Error = ProxyError::NestedLoopNotSupported.into();
        assert_eq!(
            ProxyError::classify(&err),
            ProxyErrorKind::NestedLoopNotSupported
        );
    }

    #[test]
    fn classify_io_timeout() {
        let err: anyhow::Error = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert_eq!(ProxyError::classify(&err), ProxyErrorKind::ConnectionTimeout);
    }

    #[test]
    fn build_failed_message_carries_tag_and_index() {
        let err = ProxyError::ProtocolBuildFailed {
            tag: "tls".to_string(),
            index: 2,
            source: anyhow::anyhow!("missing server name"),
        };
        let msg = err.to_string();
        assert!(msg.contains("tls"));
        assert!(msg.contains("index 2"));
        assert!(msg.contains("missing server name"));
    }

    #[test]
    fn joined_errors_display() {
        let mut joined = JoinedErrors::default();
        joined.push(0, "a", anyhow::anyhow!("refused"));
        joined.push(1, "b", anyhow::anyhow!("timeout"));
        let err = ProxyError::AllCandidatesFailed(joined);
        let msg = err.to_string();
        assert!(msg.starts_with("all candidates failed"));
        assert!(msg.contains("[0] a: refused"));
        assert!(msg.contains("[1] b: timeout"));
    }

    #[test]
    fn shared_error_keeps_inner_kind() {
        let inner = Arc::new(anyhow::Error::from(ProxyError::NodeNotFound("a".into())));
        let err: anyhow::Error = ProxyError::Shared(inner.clone()).into();
        assert_eq!(ProxyError::classify(&err), ProxyErrorKind::NodeNotFound);
        assert_eq!(err.to_string(), "node 'a' not found");
        assert_eq!(Arc::strong_count(&inner), 2);
    }
}
