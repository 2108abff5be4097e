pub mod addr;
pub mod dialer;
pub mod error;
pub mod stream;
pub mod tls;
pub mod udp;

pub use addr::Address;
pub use dialer::{Dialer, DialerConfig};
pub use error::{JoinedErrors, ProxyError, ProxyErrorKind};
pub use stream::{CountedStream, ProxyStream, TrafficCounter};
pub use udp::{BoxUdpTransport, UdpPacket, UdpTransport};
