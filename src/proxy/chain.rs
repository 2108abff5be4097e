use std::sync::Arc;

use tracing::debug;

use crate::common::ProxyError;
use crate::node::Point;
use crate::proxy::{OutboundHandler, ProtocolRegistry};

/// 从直连拨号器开始，按顺序用注册的构造函数逐层包装节点的协议链。
///
/// 未注册的协议返回 `UnsupportedProtocol`，构造失败返回带下标的
/// `ProtocolBuildFailed`。
pub fn build_chain(
    registry: &ProtocolRegistry,
    point: &Point,
) -> Result<Arc<dyn OutboundHandler>, ProxyError> {
    point
        .protocols
        .iter()
        .enumerate()
        .try_fold(registry.direct(), |base, (index, protocol)| {
            let tag = protocol.tag();
            let transform = registry
                .get(tag)
                .ok_or_else(|| ProxyError::UnsupportedProtocol(tag.to_string()))?;
            transform(protocol, base).map_err(|source| ProxyError::ProtocolBuildFailed {
                tag: tag.to_string(),
                index,
                source,
            })
        })
        .inspect(|_| {
            debug!(
                node = point.name,
                hash = point.hash,
                layers = point.protocols.len(),
                "protocol chain built"
            )
        })
}
