use anyhow::{anyhow, Result};
use log::warn;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::iface;

pub const DEFAULT_PORT: u16 = 1080;
pub const DEFAULT_BACKLOG: i32 = 128;
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_INTERFACE: &str = "en0";

/// 握手报文最长 262 字节，转发缓冲区不能比它小
pub const MIN_BUFFER_SIZE: usize = 512;

/// 服务器运行配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// 监听地址
    pub bind: Ipv4Addr,
    /// 监听端口
    pub port: u16,
    /// listen(2) 的等待队列长度
    pub backlog: i32,
    /// 单次读取以及每个方向待发送缓冲区的上限
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: Ipv4Addr::LOCALHOST,
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backlog <= 0 {
            return Err(anyhow!("backlog 必须大于0: {}", self.backlog));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(anyhow!(
                "缓冲区太小: {} (至少 {} 字节)",
                self.buffer_size,
                MIN_BUFFER_SIZE
            ));
        }
        Ok(())
    }
}

/// 确定监听地址：显式指定的地址优先，否则取网卡的第一个非回环 IPv4 地址，
/// 都失败时退回 127.0.0.1
pub fn resolve_bind(explicit: Option<Ipv4Addr>, interface: &str) -> Ipv4Addr {
    if let Some(addr) = explicit {
        return addr;
    }
    match iface::interface_ipv4(interface) {
        Ok(addr) => addr,
        Err(e) => {
            warn!("获取网卡 {} 地址失败: {}; 使用 {}", interface, e, Ipv4Addr::LOCALHOST);
            Ipv4Addr::LOCALHOST
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:1080");
    }

    #[test]
    fn rejects_tiny_buffer_and_backlog() {
        let config = Config {
            buffer_size: 16,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            backlog: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_bind_wins() {
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(resolve_bind(Some(addr), "no-such-iface0"), addr);
    }

    #[test]
    fn missing_interface_falls_back_to_localhost() {
        assert_eq!(resolve_bind(None, "no-such-iface0"), Ipv4Addr::LOCALHOST);
    }
}
