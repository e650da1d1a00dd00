use std::fmt;
use std::io;

use thiserror::Error;

use crate::protocol::Reply;

/// 解析 SOCKS5 握手报文时出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// 报文不完整
    #[error("SOCKS5 报文不完整")]
    Truncated,

    /// 客户端声明的版本号不是 5
    #[error("不支持的SOCKS版本: {0}")]
    BadVersion(u8),

    /// 问候报文中没有任何认证方法
    #[error("客户端没有提供认证方法")]
    NoMethods,

    /// 只支持 CONNECT
    #[error("不支持的命令: {0}")]
    UnsupportedCommand(u8),

    /// 保留字段必须为 0
    #[error("保留字段不为0: {0}")]
    BadReserved(u8),

    /// 只支持 IPv4 与域名
    #[error("不支持的地址类型: {0}")]
    UnsupportedAddressType(u8),

    /// 域名为空或者不是 ASCII
    #[error("无效的域名")]
    BadDomain,
}

/// 会话结束的原因
#[derive(Debug)]
pub enum CloseReason {
    /// 对端正常关闭 (read 返回 0)
    PeerClosed,
    /// 对端重置连接
    Reset,
    /// 其它不可恢复的 I/O 错误
    Io(io::Error),
    /// 握手阶段协议错误，不发送应答
    Protocol(ParseError),
    /// 域名解析失败
    Dns(io::Error),
    /// 出站连接失败
    Connect(io::Error),
    /// 服务器关闭
    Shutdown,
}

impl CloseReason {
    /// 根据 I/O 错误分类：ECONNRESET 单独处理，其余视为致命错误
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => CloseReason::Reset,
            io::ErrorKind::BrokenPipe => CloseReason::PeerClosed,
            _ => CloseReason::Io(err),
        }
    }

    /// 关闭前需要发送给客户端的失败应答
    pub fn reply(&self) -> Option<Reply> {
        match self {
            CloseReason::Dns(_) => Some(Reply::HostUnreachable),
            CloseReason::Connect(err) => Some(Reply::from_io_error(err)),
            _ => None,
        }
    }

    /// 是否属于正常的连接结束
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            CloseReason::PeerClosed | CloseReason::Reset | CloseReason::Shutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "对端关闭连接"),
            CloseReason::Reset => write!(f, "连接被重置"),
            CloseReason::Io(e) => write!(f, "I/O 错误: {}", e),
            CloseReason::Protocol(e) => write!(f, "协议错误: {}", e),
            CloseReason::Dns(e) => write!(f, "域名解析失败: {}", e),
            CloseReason::Connect(e) => write!(f, "连接目标失败: {}", e),
            CloseReason::Shutdown => write!(f, "服务器关闭"),
        }
    }
}

impl From<ParseError> for CloseReason {
    fn from(e: ParseError) -> Self {
        CloseReason::Protocol(e)
    }
}
