use log::debug;
use mio::Token;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::runtime::Handle;

use crate::mailbox::{LoopMessage, Mailbox};

/// 标识一次解析请求属于哪个会话
///
/// 结果送回时，只有会话表里 `token` 对应的会话 id 仍然相同才会被使用。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub token: Token,
    pub session: u64,
}

/// 在 tokio 运行时上做域名解析，不阻塞事件循环
pub struct Resolver {
    handle: Handle,
    mailbox: Mailbox,
}

impl Resolver {
    pub fn new(handle: Handle, mailbox: Mailbox) -> Self {
        Self { handle, mailbox }
    }

    pub fn resolve(&self, ticket: Ticket, domain: String, port: u16) {
        let mailbox = self.mailbox.clone();
        self.handle.spawn(async move {
            let result = lookup_ipv4(&domain, port).await;
            debug!("域名 {} 解析结果: {:?}", domain, result);
            if !mailbox.post(LoopMessage::Resolved { ticket, result }) {
                debug!("事件循环已退出，丢弃 {} 的解析结果", domain);
            }
        });
    }
}

/// 解析域名，返回第一个 IPv4 地址
pub async fn lookup_ipv4(domain: &str, port: u16) -> io::Result<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((domain, port)).await?;
    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("无法解析域名: {}", domain),
            )
        })
}
