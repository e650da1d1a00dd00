//! 单线程、事件驱动的 SOCKS5 代理服务器
//!
//! 所有套接字都是非阻塞的，由一个 `mio` 事件循环统一调度。
//! 只支持无认证的 CONNECT 命令，目标可以是 IPv4 地址或域名。

pub mod config;
pub mod error;
pub mod iface;
pub mod mailbox;
pub mod protocol;
pub mod reactor;
pub mod resolver;
pub mod server;
pub mod session;
pub mod signal;
pub mod socket;

pub use config::Config;
pub use server::{Server, ServerHandle};
