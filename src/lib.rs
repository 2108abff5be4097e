//! openshunt：分流决策、协议链组装和节点拨号器缓存的代理内核。

#![allow(clippy::new_without_default, clippy::type_complexity)]

pub mod app;
pub mod common;
pub mod config;
pub mod dns;
pub mod node;
pub mod proxy;
pub mod router;
