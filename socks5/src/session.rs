//! 每个客户端连接一个会话：SOCKS5 握手状态机加上双向转发

use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use mio::Token;
use mio::net::TcpStream;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::CloseReason;
use crate::protocol::{self, GREETING_REPLY, Reply, Target};
use crate::reactor::{Mode, Reactor};
use crate::socket::{self, ConnectStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Hello,
    Request,
    Connecting,
    Proxy,
    Closed,
}

/// 事件来自哪一侧的描述符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Remote,
}

/// 会话处理完一次事件后需要服务器做的事
#[derive(Debug)]
pub enum Outcome {
    Continue,
    /// 出站套接字已经创建并登记，需要加入会话表
    RemoteOpened(Token),
    /// 需要解析域名
    Resolve { domain: String, port: u16 },
    Close(CloseReason),
}

pub struct Session {
    id: u64,
    peer: SocketAddr,
    client: TcpStream,
    client_token: Token,
    remote: Option<TcpStream>,
    remote_token: Option<Token>,
    state: State,
    host: Option<Ipv4Addr>,
    domain: Option<String>,
    port: u16,
    resolving: bool,
    // 尚未解析完的握手数据
    inbound: BytesMut,
    // 对端暂时写不进去的数据
    to_client: BytesMut,
    to_remote: BytesMut,
    // 一侧已关闭，写完剩余数据后结束
    draining: bool,
    // 客户端还有未读完的数据，需要重新登记以再次收到边沿通知
    rearm_client: bool,
    limit: usize,
    bytes_up: u64,
    bytes_down: u64,
}

impl Session {
    pub fn new(id: u64, client: TcpStream, client_token: Token, peer: SocketAddr, limit: usize) -> Self {
        Self {
            id,
            peer,
            client,
            client_token,
            remote: None,
            remote_token: None,
            state: State::Hello,
            host: None,
            domain: None,
            port: 0,
            resolving: false,
            inbound: BytesMut::new(),
            to_client: BytesMut::new(),
            to_remote: BytesMut::new(),
            draining: false,
            rearm_client: false,
            limit,
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn client_token(&self) -> Token {
        self.client_token
    }

    pub fn remote_token(&self) -> Option<Token> {
        self.remote_token
    }

    /// (客户端 → 目标, 目标 → 客户端) 的转发字节数
    pub fn transferred(&self) -> (u64, u64) {
        (self.bytes_up, self.bytes_down)
    }

    fn destination(&self) -> String {
        match (&self.domain, self.host) {
            (Some(domain), Some(ip)) => format!("{}:{} ({})", domain, self.port, ip),
            (Some(domain), None) => format!("{}:{}", domain, self.port),
            (None, Some(ip)) => SocketAddrV4::new(ip, self.port).to_string(),
            (None, None) => "-".to_string(),
        }
    }

    pub fn on_readable(&mut self, side: Side, reactor: &mut Reactor, scratch: &mut [u8]) -> Outcome {
        let outcome = match (self.state, side) {
            (State::Request, Side::Client) if self.resolving => self.read_early_data(scratch),
            (State::Hello | State::Request, Side::Client) => self.read_handshake(reactor, scratch),
            (State::Connecting, Side::Client) => self.read_early_data(scratch),
            // 连接失败时 epoll 同时报告挂断
            (State::Connecting, Side::Remote) => self.finish_connect(),
            (State::Proxy, from) => self.relay(from, scratch),
            _ => Outcome::Continue,
        };
        self.settle(outcome, reactor)
    }

    pub fn on_writable(&mut self, side: Side, reactor: &mut Reactor) -> Outcome {
        let outcome = match (self.state, side) {
            (State::Connecting, Side::Remote) => self.finish_connect(),
            (State::Closed, _) => Outcome::Continue,
            (_, to) => self.flush(to),
        };
        self.settle(outcome, reactor)
    }

    /// 域名解析结果回到事件循环
    pub fn on_resolved(&mut self, result: io::Result<Ipv4Addr>, reactor: &mut Reactor) -> Outcome {
        self.resolving = false;
        if self.state != State::Request || self.remote.is_some() {
            return Outcome::Continue;
        }
        let outcome = match result {
            Ok(ip) => {
                debug!("[{}] 域名 {:?} 解析为 {}", self.peer, self.domain, ip);
                self.host = Some(ip);
                self.connect(reactor)
            }
            Err(e) => Outcome::Close(CloseReason::Dns(e)),
        };
        self.settle(outcome, reactor)
    }

    /// 注销两个描述符；套接字本身随会话一起释放
    pub fn deregister(&mut self, reactor: &mut Reactor) {
        self.state = State::Closed;
        if let Err(e) = reactor.remove(&mut self.client, self.client_token) {
            debug!("[{}] 注销客户端描述符失败: {}", self.peer, e);
        }
        if let (Some(remote), Some(token)) = (self.remote.as_mut(), self.remote_token) {
            if let Err(e) = reactor.remove(remote, token) {
                debug!("[{}] 注销目标描述符失败: {}", self.peer, e);
            }
        }
    }

    /// 尽力发送失败应答，只在客户端还在等待请求应答时发送
    pub fn reply_failure(&mut self, reply: Reply) {
        if !matches!(self.state, State::Request | State::Connecting) || !self.to_client.is_empty() {
            return;
        }
        if let Err(e) = socket::write_full(&mut self.client, &reply.to_bytes()) {
            debug!("[{}] 发送失败应答出错: {}", self.peer, e);
        }
    }

    /// 根据状态和缓冲区计算两侧应当登记的事件
    pub fn desired_modes(&self) -> (Option<Mode>, Option<Mode>) {
        let client_read = match self.state {
            State::Hello => true,
            State::Request | State::Connecting => self.to_remote.len() < self.limit,
            State::Proxy => !self.draining && self.to_remote.is_empty(),
            State::Closed => false,
        };
        let client_write = self.state != State::Closed && !self.to_client.is_empty();

        let (remote_read, remote_write) = match self.state {
            State::Connecting => (false, true),
            State::Proxy => (
                !self.draining && self.to_client.is_empty(),
                !self.to_remote.is_empty(),
            ),
            _ => (false, false),
        };

        (
            Mode::from_flags(client_read, client_write),
            Mode::from_flags(remote_read, remote_write),
        )
    }

    fn settle(&mut self, outcome: Outcome, reactor: &mut Reactor) -> Outcome {
        if let Outcome::Close(_) = outcome {
            return outcome;
        }
        match self.sync_interest(reactor) {
            Ok(()) => outcome,
            Err(e) => Outcome::Close(CloseReason::Io(e)),
        }
    }

    fn sync_interest(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        let (client, remote) = self.desired_modes();
        if std::mem::take(&mut self.rearm_client) {
            if let Some(mode) = client {
                reactor.modify(&mut self.client, self.client_token, mode)?;
            }
        }
        reactor.sync(&mut self.client, self.client_token, client)?;
        if let (Some(stream), Some(token)) = (self.remote.as_mut(), self.remote_token) {
            reactor.sync(stream, token, remote)?;
        }
        Ok(())
    }

    fn read_handshake(&mut self, reactor: &mut Reactor, scratch: &mut [u8]) -> Outcome {
        // 边沿触发，读到 WouldBlock 为止
        let mut blocked = false;
        while self.inbound.len() < self.limit {
            let room = (self.limit - self.inbound.len()).min(scratch.len());
            match socket::read(&mut self.client, &mut scratch[..room]) {
                Ok(0) => return Outcome::Close(CloseReason::PeerClosed),
                Ok(n) => self.inbound.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    blocked = true;
                    break;
                }
                Err(e) => return Outcome::Close(CloseReason::from_io(e)),
            }
        }
        self.rearm_client |= !blocked;
        self.advance_handshake(reactor)
    }

    fn advance_handshake(&mut self, reactor: &mut Reactor) -> Outcome {
        while !self.inbound.is_empty() {
            match self.state {
                State::Hello => {
                    let len = match protocol::parse_greeting(&self.inbound) {
                        Ok(len) => len,
                        Err(e) => return Outcome::Close(e.into()),
                    };
                    self.inbound.advance(len);
                    if let Err(reason) = self.send_to_client(&GREETING_REPLY) {
                        return Outcome::Close(reason);
                    }
                    self.state = State::Request;
                    debug!("[{}] 握手成功", self.peer);
                }
                State::Request => {
                    let (target, len) = match protocol::parse_request(&self.inbound) {
                        Ok(parsed) => parsed,
                        Err(e) => return Outcome::Close(e.into()),
                    };
                    self.inbound.advance(len);
                    // 请求之后的字节是负载，连接建立后转发给目标
                    let early = self.inbound.split();
                    self.bytes_up += early.len() as u64;
                    self.to_remote.unsplit(early);
                    info!("[{}] 目标地址: {}", self.peer, target);
                    return self.start_connect(target, reactor);
                }
                _ => break,
            }
        }
        Outcome::Continue
    }

    fn start_connect(&mut self, target: Target, reactor: &mut Reactor) -> Outcome {
        self.port = target.port();
        match target {
            Target::Ipv4(addr) => {
                self.host = Some(*addr.ip());
                self.connect(reactor)
            }
            Target::Domain(domain, _) => {
                self.domain = Some(domain);
                self.request_resolve()
            }
        }
    }

    fn request_resolve(&mut self) -> Outcome {
        if self.resolving {
            return Outcome::Continue;
        }
        match &self.domain {
            Some(domain) => {
                self.resolving = true;
                Outcome::Resolve {
                    domain: domain.clone(),
                    port: self.port,
                }
            }
            None => Outcome::Continue,
        }
    }

    fn connect(&mut self, reactor: &mut Reactor) -> Outcome {
        let Some(ip) = self.host else {
            return Outcome::Continue;
        };
        if self.remote.is_some() {
            return Outcome::Continue;
        }

        let mut remote = match socket::connect_nb(SocketAddrV4::new(ip, self.port)) {
            Ok(stream) => stream,
            Err(e) => return Outcome::Close(CloseReason::Connect(e)),
        };
        let token = socket::token_of(&remote);
        if let Err(e) = reactor.add(&mut remote, token, Mode::Write) {
            return Outcome::Close(CloseReason::Io(e));
        }

        self.remote = Some(remote);
        self.remote_token = Some(token);
        self.state = State::Connecting;
        debug!("[{}] 正在连接 {}", self.peer, self.destination());
        Outcome::RemoteOpened(token)
    }

    fn finish_connect(&mut self) -> Outcome {
        let Some(remote) = self.remote.as_ref() else {
            return Outcome::Continue;
        };
        match socket::connect_status(remote) {
            ConnectStatus::Pending => Outcome::Continue,
            ConnectStatus::Failed(e) => Outcome::Close(CloseReason::Connect(e)),
            ConnectStatus::Established => {
                if let Err(reason) = self.send_to_client(&Reply::Succeeded.to_bytes()) {
                    return Outcome::Close(reason);
                }
                self.state = State::Proxy;
                self.rearm_client = true;
                info!("[{}] 成功连接到目标服务器: {}", self.peer, self.destination());
                self.flush(Side::Remote)
            }
        }
    }

    /// 握手未完成时客户端提前发来的数据先缓存起来
    fn read_early_data(&mut self, scratch: &mut [u8]) -> Outcome {
        let mut blocked = false;
        while self.to_remote.len() < self.limit {
            let room = (self.limit - self.to_remote.len()).min(scratch.len());
            match socket::read(&mut self.client, &mut scratch[..room]) {
                Ok(0) => return Outcome::Close(CloseReason::PeerClosed),
                Ok(n) => {
                    self.bytes_up += n as u64;
                    self.to_remote.extend_from_slice(&scratch[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    blocked = true;
                    break;
                }
                Err(e) => return Outcome::Close(CloseReason::from_io(e)),
            }
        }
        self.rearm_client |= !blocked;
        Outcome::Continue
    }

    fn relay(&mut self, from: Side, scratch: &mut [u8]) -> Outcome {
        if self.draining {
            return Outcome::Continue;
        }
        let Some(remote) = self.remote.as_mut() else {
            return Outcome::Continue;
        };
        let (src, dst, pending, counter) = match from {
            Side::Client => (&mut self.client, remote, &mut self.to_remote, &mut self.bytes_up),
            Side::Remote => (remote, &mut self.client, &mut self.to_client, &mut self.bytes_down),
        };

        // 对端缓冲区没写完之前不再读取
        while pending.is_empty() {
            let n = match socket::read(src, scratch) {
                Ok(0) => return self.begin_drain(from),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Outcome::Close(CloseReason::from_io(e)),
            };
            *counter += n as u64;
            match socket::write_full(dst, &scratch[..n]) {
                Ok(written) if written < n => pending.extend_from_slice(&scratch[written..n]),
                Ok(_) => {}
                Err(e) => return Outcome::Close(CloseReason::from_io(e)),
            }
        }
        Outcome::Continue
    }

    /// 一侧读到 EOF：另一侧还有没写完的数据时先写完再关闭
    fn begin_drain(&mut self, from: Side) -> Outcome {
        debug!("[{}] {:?} 端关闭连接", self.peer, from);
        if self.to_client.is_empty() && self.to_remote.is_empty() {
            return Outcome::Close(CloseReason::PeerClosed);
        }
        self.draining = true;
        Outcome::Continue
    }

    fn flush(&mut self, to: Side) -> Outcome {
        let (sink, pending) = match to {
            Side::Client => (&mut self.client, &mut self.to_client),
            Side::Remote => match self.remote.as_mut() {
                Some(remote) => (remote, &mut self.to_remote),
                None => return Outcome::Continue,
            },
        };
        if !pending.is_empty() {
            match socket::write_full(sink, &pending[..]) {
                Ok(n) => pending.advance(n),
                Err(e) => return Outcome::Close(CloseReason::from_io(e)),
            }
        }
        if self.draining && self.to_client.is_empty() && self.to_remote.is_empty() {
            return Outcome::Close(CloseReason::PeerClosed);
        }
        Outcome::Continue
    }

    fn send_to_client(&mut self, bytes: &[u8]) -> Result<(), CloseReason> {
        if !self.to_client.is_empty() {
            self.to_client.extend_from_slice(bytes);
            return Ok(());
        }
        let written = socket::write_full(&mut self.client, bytes).map_err(CloseReason::from_io)?;
        if written < bytes.len() {
            warn!("[{}] 应答没有一次写完，剩余 {} 字节", self.peer, bytes.len() - written);
            self.to_client.extend_from_slice(&bytes[written..]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdStream;
    use std::time::Duration;

    /// 建立一对已连接的套接字，返回 (会话, 客户端那一头)
    fn session(limit: usize) -> (Session, StdStream) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        // 小报文不能被 Nagle 攒在客户端
        client.set_nodelay(true).unwrap();
        let (stream, peer) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept: {}", e),
            }
        };
        let token = socket::token_of(&stream);
        (Session::new(1, stream, token, peer, limit), client)
    }

    fn feed(session: &mut Session, reactor: &mut Reactor, client: &mut StdStream, bytes: &[u8]) -> Outcome {
        client.write_all(bytes).unwrap();
        // 给内核一点时间把数据送到
        std::thread::sleep(Duration::from_millis(20));
        let mut scratch = vec![0u8; 4096];
        session.on_readable(Side::Client, reactor, &mut scratch)
    }

    #[test]
    fn hello_state_only_reads_client() {
        let (session, _client) = session(4096);
        assert_eq!(session.state(), State::Hello);
        assert_eq!(session.desired_modes(), (Some(Mode::Read), None));
    }

    #[test]
    fn greeting_is_answered_with_two_bytes() {
        let mut reactor = Reactor::new(16).unwrap();
        let (mut session, mut client) = session(4096);

        let outcome = feed(&mut session, &mut reactor, &mut client, &[0x05, 0x02, 0x00, 0x02]);
        assert!(matches!(outcome, Outcome::Continue));
        assert_eq!(session.state(), State::Request);
        assert_eq!(reactor.mode_of(session.client_token()), Some(Mode::Read));

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, GREETING_REPLY);
    }

    #[test]
    fn bad_greeting_closes_without_reply() {
        let mut reactor = Reactor::new(16).unwrap();
        let (mut session, mut client) = session(4096);

        let outcome = feed(&mut session, &mut reactor, &mut client, &[0x04, 0x01, 0x00]);
        assert!(matches!(outcome, Outcome::Close(CloseReason::Protocol(_))));
        assert_eq!(session.state(), State::Hello);
    }

    #[test]
    fn short_ipv4_request_is_rejected() {
        let mut reactor = Reactor::new(16).unwrap();
        let (mut session, mut client) = session(4096);
        feed(&mut session, &mut reactor, &mut client, &[0x05, 0x01, 0x00]);

        let outcome = feed(
            &mut session,
            &mut reactor,
            &mut client,
            &[0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00],
        );
        assert!(matches!(outcome, Outcome::Close(CloseReason::Protocol(_))));
        assert!(session.remote_token().is_none());
    }

    #[test]
    fn domain_request_asks_for_one_resolution() {
        let mut reactor = Reactor::new(16).unwrap();
        let (mut session, mut client) = session(4096);
        feed(&mut session, &mut reactor, &mut client, &[0x05, 0x01, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x09];
        request.extend_from_slice(b"localhost");
        request.extend_from_slice(&[0x00, 0x50]);
        request.extend_from_slice(b"early");
        let outcome = feed(&mut session, &mut reactor, &mut client, &request);
        match outcome {
            Outcome::Resolve { domain, port } => {
                assert_eq!(domain, "localhost");
                assert_eq!(port, 80);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(session.resolving);
        assert_eq!(session.state(), State::Request);
        assert_eq!(session.domain.as_deref(), Some("localhost"));

        // 解析期间不会再发起第二次查询
        assert!(matches!(session.request_resolve(), Outcome::Continue));

        // 解析期间的数据按负载处理
        let outcome = feed(&mut session, &mut reactor, &mut client, b" data");
        assert!(matches!(outcome, Outcome::Continue));
        assert_eq!(&session.to_remote[..], b"early data");
    }

    #[test]
    fn dns_failure_closes_with_reply() {
        let mut reactor = Reactor::new(16).unwrap();
        let (mut session, mut client) = session(4096);
        feed(&mut session, &mut reactor, &mut client, &[0x05, 0x01, 0x00]);
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x07];
        request.extend_from_slice(b"invalid");
        request.extend_from_slice(&[0x00, 0x50]);
        feed(&mut session, &mut reactor, &mut client, &request);

        let outcome = session.on_resolved(
            Err(io::Error::from(io::ErrorKind::NotFound)),
            &mut reactor,
        );
        assert!(!session.resolving);
        match outcome {
            Outcome::Close(reason) => assert_eq!(reason.reply(), Some(Reply::HostUnreachable)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn ipv4_request_opens_remote_for_write() {
        let target = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = target.local_addr().unwrap().port();

        let mut reactor = Reactor::new(16).unwrap();
        let (mut session, mut client) = session(4096);
        feed(&mut session, &mut reactor, &mut client, &[0x05, 0x01, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01];
        request.extend_from_slice(&port.to_be_bytes());
        let outcome = feed(&mut session, &mut reactor, &mut client, &request);
        let token = match outcome {
            Outcome::RemoteOpened(token) => token,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(session.state(), State::Connecting);
        assert_eq!(session.remote_token(), Some(token));
        assert_eq!(session.host, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(reactor.mode_of(token), Some(Mode::Write));
        assert_eq!(reactor.mode_of(session.client_token()), Some(Mode::Read));
    }

    #[test]
    fn backpressure_disables_source_reads() {
        let (mut session, _client) = session(8);
        session.state = State::Proxy;
        session.remote_token = Some(Token(99));
        // 两侧缓冲区都为空时两侧都只读
        assert_eq!(session.desired_modes(), (Some(Mode::Read), Some(Mode::Read)));

        session.to_remote.extend_from_slice(b"tail");
        assert_eq!(session.desired_modes(), (None, Some(Mode::ReadWrite)));

        session.to_client.extend_from_slice(b"tail");
        session.to_remote.clear();
        assert_eq!(session.desired_modes(), (Some(Mode::ReadWrite), None));

        session.draining = true;
        assert_eq!(session.desired_modes(), (Some(Mode::Write), None));
    }

    #[test]
    fn connecting_stops_buffering_at_limit() {
        let (mut session, _client) = session(8);
        session.state = State::Connecting;
        session.to_remote.extend_from_slice(&[0u8; 8]);
        assert_eq!(session.desired_modes().0, None);
        assert_eq!(session.desired_modes().1, Some(Mode::Write));
    }
}
