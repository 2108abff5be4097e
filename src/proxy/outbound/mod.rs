pub mod closed;
pub mod direct;
pub mod http;
pub mod reject;
pub mod simple;
pub mod socks5;
pub mod tls;
pub mod trojan;

pub use closed::ClosedOutbound;
pub use direct::DirectOutbound;
pub use http::HttpOutbound;
pub use reject::{RejectDelayConfig, RejectHistory, RejectOutbound};
pub use simple::SimpleOutbound;
pub use socks5::Socks5Outbound;
pub use tls::TlsOutbound;
pub use trojan::TrojanOutbound;
