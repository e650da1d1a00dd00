use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::ParseError;

// SOCKS5 协议常量
pub const SOCKS_VERSION: u8 = 0x05;
pub const NO_AUTHENTICATION: u8 = 0x00;
pub const CONNECT_COMMAND: u8 = 0x01;
pub const IPV4_ADDRESS: u8 = 0x01;
pub const DOMAIN_NAME: u8 = 0x03;
pub const IPV6_ADDRESS: u8 = 0x04;

const RESERVED: u8 = 0x00;

/// VER CMD RSV ATYP 加上最短的地址与端口
pub const MIN_REQUEST_LEN: usize = 7;
const IPV4_REQUEST_LEN: usize = 10;
const DOMAIN_START: usize = 5;
const PORT_LEN: usize = 2;

/// 问候应答，总是选择无认证
pub const GREETING_REPLY: [u8; 2] = [SOCKS_VERSION, NO_AUTHENTICATION];

/// 请求应答长度 (ATYP=IPv4)
pub const REPLY_LEN: usize = 10;

/// 协议状态码 (REP)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// 把出站连接错误映射为状态码
    pub fn from_io_error(err: &io::Error) -> Reply {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::HostUnreachable => Reply::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
            io::ErrorKind::TimedOut => Reply::TtlExpired,
            io::ErrorKind::PermissionDenied => Reply::ConnectionNotAllowed,
            _ => Reply::GeneralFailure,
        }
    }

    /// 编码应答报文，绑定地址与端口全部填 0
    pub fn encode(self, dst: &mut BytesMut) {
        dst.reserve(REPLY_LEN);
        dst.put_u8(SOCKS_VERSION); // 版本
        dst.put_u8(self as u8); // 状态码
        dst.put_u8(RESERVED); // 保留字段
        dst.put_u8(IPV4_ADDRESS); // 地址类型 (IPv4)
        dst.put_slice(&Ipv4Addr::UNSPECIFIED.octets()); // IP地址 (0.0.0.0)
        dst.put_u16(0); // 端口 (0)
    }

    pub fn to_bytes(self) -> [u8; REPLY_LEN] {
        let mut buf = BytesMut::with_capacity(REPLY_LEN);
        self.encode(&mut buf);
        let mut out = [0u8; REPLY_LEN];
        out.copy_from_slice(&buf);
        out
    }
}

/// 客户端请求的目标地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Ipv4(SocketAddrV4),
    Domain(String, u16),
}

impl Target {
    pub fn port(&self) -> u16 {
        match self {
            Target::Ipv4(addr) => addr.port(),
            Target::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Ipv4(addr) => write!(f, "{}", addr),
            Target::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// 解析问候报文 `VER NMETHODS METHODS...`
///
/// 成功时返回报文占用的字节数。认证方法列表不做检查，服务器总是回复无认证。
pub fn parse_greeting(buf: &[u8]) -> Result<usize, ParseError> {
    let version = *buf.first().ok_or(ParseError::Truncated)?;
    if version != SOCKS_VERSION {
        return Err(ParseError::BadVersion(version));
    }

    let nmethods = *buf.get(1).ok_or(ParseError::Truncated)? as usize;
    if nmethods == 0 {
        return Err(ParseError::NoMethods);
    }

    let len = 2 + nmethods;
    if buf.len() < len {
        return Err(ParseError::Truncated);
    }
    Ok(len)
}

/// 解析请求报文 `VER CMD RSV ATYP DST.ADDR DST.PORT`
///
/// 成功时返回目标地址以及报文占用的字节数，多余的字节属于后续的负载数据。
pub fn parse_request(buf: &[u8]) -> Result<(Target, usize), ParseError> {
    if buf.len() < MIN_REQUEST_LEN {
        return Err(ParseError::Truncated);
    }

    let version = buf[0];
    let command = buf[1];
    let reserved = buf[2];
    let address_type = buf[3];

    if version != SOCKS_VERSION {
        return Err(ParseError::BadVersion(version));
    }
    if command != CONNECT_COMMAND {
        return Err(ParseError::UnsupportedCommand(command));
    }
    if reserved != RESERVED {
        return Err(ParseError::BadReserved(reserved));
    }

    match address_type {
        IPV4_ADDRESS => {
            if buf.len() < IPV4_REQUEST_LEN {
                return Err(ParseError::Truncated);
            }
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            Ok((Target::Ipv4(SocketAddrV4::new(ip, port)), IPV4_REQUEST_LEN))
        }
        DOMAIN_NAME => {
            let domain_len = buf[4] as usize;
            let end = DOMAIN_START + domain_len;
            let len = end + PORT_LEN;
            if buf.len() < len {
                return Err(ParseError::Truncated);
            }
            if domain_len == 0 || !buf[DOMAIN_START..end].is_ascii() {
                return Err(ParseError::BadDomain);
            }
            let domain = String::from_utf8(buf[DOMAIN_START..end].to_vec())
                .map_err(|_| ParseError::BadDomain)?;
            let port = u16::from_be_bytes([buf[end], buf[end + 1]]);
            Ok((Target::Domain(domain, port), len))
        }
        other => Err(ParseError::UnsupportedAddressType(other)),
    }
}
