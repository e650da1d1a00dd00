use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use mio::Token;
use mio::net::TcpListener;
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

use crate::config::Config;
use crate::error::CloseReason;
use crate::mailbox::{self, LoopMessage, Mailbox};
use crate::reactor::{Direction, Mode, Reactor};
use crate::resolver::{Resolver, Ticket};
use crate::session::{Outcome, Session, Side};
use crate::signal;
use crate::socket;

/// 描述符不会取到这个值
const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 128;

/// 用于从其它线程停止服务器
#[derive(Clone)]
pub struct ServerHandle {
    mailbox: Mailbox,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.mailbox.post(LoopMessage::Shutdown);
    }
}

/// 单线程事件循环：监听套接字、会话表以及主循环
pub struct Server {
    config: Config,
    reactor: Reactor,
    listener: TcpListener,
    listener_token: Token,
    local_addr: SocketAddr,
    // 会话存放在 slab 中，会话表把描述符映射到 slab 下标
    sessions: Slab<Session>,
    table: HashMap<Token, usize>,
    next_id: u64,
    scratch: Vec<u8>,
    ready: Vec<(Token, Direction)>,
    mailbox: Mailbox,
    inbox: UnboundedReceiver<LoopMessage>,
    resolver: Resolver,
    // 域名解析和信号监听在这里运行，结果通过 mailbox 送回
    runtime: Runtime,
}

impl Server {
    pub fn bind(config: Config) -> Result<Self> {
        config.validate()?;

        let mut reactor = Reactor::new(EVENTS_CAPACITY).context("创建事件循环失败")?;
        let addr = config.listen_addr();
        let mut listener = socket::listen(addr, config.backlog)
            .with_context(|| format!("监听 {} 失败", addr))?;
        let listener_token = socket::token_of(&listener);
        reactor
            .add(&mut listener, listener_token, Mode::Read)
            .context("登记监听套接字失败")?;
        let local_addr = listener.local_addr()?;

        let waker = reactor.waker(WAKER_TOKEN).context("创建唤醒句柄失败")?;
        let (mailbox, inbox) = mailbox::channel(waker);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("socks5-resolver")
            .enable_all()
            .build()
            .context("创建 tokio 运行时失败")?;
        let resolver = Resolver::new(runtime.handle().clone(), mailbox.clone());

        Ok(Self {
            scratch: vec![0u8; config.buffer_size],
            config,
            reactor,
            listener,
            listener_token,
            local_addr,
            sessions: Slab::new(),
            table: HashMap::new(),
            next_id: 0,
            ready: Vec::with_capacity(EVENTS_CAPACITY),
            mailbox,
            inbox,
            resolver,
            runtime,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            mailbox: self.mailbox.clone(),
        }
    }

    /// SIGINT / SIGTERM 时退出主循环
    pub fn watch_signals(&self) {
        signal::watch(self.runtime.handle(), self.mailbox.clone());
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn run(mut self) -> Result<()> {
        info!("SOCKS5 代理服务器启动在 {}", self.local_addr);
        while self.turn(None)? {}
        self.shutdown();
        // 不等待还在阻塞中的 getaddrinfo
        self.runtime.shutdown_background();
        Ok(())
    }

    /// 执行一轮事件循环；收到退出消息时返回 false
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let mut ready = std::mem::take(&mut self.ready);
        let count = self
            .reactor
            .wait(&mut ready, timeout)
            .context("等待事件失败")?;

        let mut running = true;
        for &(token, direction) in ready.iter().take(count) {
            if token == self.listener_token {
                if direction == Direction::Read {
                    self.accept_clients();
                }
            } else if token == WAKER_TOKEN {
                running &= self.drain_inbox();
            } else {
                self.dispatch(token, direction);
            }
        }

        self.ready = ready;
        Ok(running)
    }

    fn accept_clients(&mut self) {
        loop {
            let (mut stream, peer) = match socket::accept(&self.listener) {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(e) => {
                    // EMFILE 之类的错误；积压队列里的连接不会再产生边沿，重新登记
                    error!("接受连接时出错: {}", e);
                    self.rearm_listener();
                    break;
                }
            };

            let token = socket::token_of(&stream);
            if let Err(e) = self.reactor.add(&mut stream, token, Mode::Read) {
                error!("登记客户端 {} 失败: {}", peer, e);
                continue;
            }

            let id = self.next_id;
            self.next_id += 1;
            let key = self
                .sessions
                .insert(Session::new(id, stream, token, peer, self.config.buffer_size));
            self.table.insert(token, key);
            info!("新连接来自: {}", peer);
        }
    }

    fn rearm_listener(&mut self) {
        if let Err(e) = self
            .reactor
            .modify(&mut self.listener, self.listener_token, Mode::Read)
        {
            error!("重新登记监听套接字失败: {}", e);
        }
    }

    fn dispatch(&mut self, token: Token, direction: Direction) {
        let Some(&key) = self.table.get(&token) else {
            // 所属会话在本轮中已经关闭
            debug!("忽略未知描述符 {:?} 的事件", token);
            return;
        };
        let Some(session) = self.sessions.get_mut(key) else {
            self.table.remove(&token);
            return;
        };

        let side = if session.client_token() == token {
            Side::Client
        } else {
            Side::Remote
        };
        let outcome = match direction {
            Direction::Read => session.on_readable(side, &mut self.reactor, &mut self.scratch),
            Direction::Write => session.on_writable(side, &mut self.reactor),
        };
        self.apply(key, outcome);
    }

    fn apply(&mut self, key: usize, outcome: Outcome) {
        match outcome {
            Outcome::Continue => {}
            Outcome::RemoteOpened(token) => {
                self.table.insert(token, key);
            }
            Outcome::Resolve { domain, port } => {
                let session = &self.sessions[key];
                let ticket = Ticket {
                    token: session.client_token(),
                    session: session.id(),
                };
                info!("[{}] 解析域名: {}:{}", session.peer(), domain, port);
                self.resolver.resolve(ticket, domain, port);
            }
            Outcome::Close(reason) => self.close_session(key, reason),
        }
    }

    fn drain_inbox(&mut self) -> bool {
        loop {
            match self.inbox.try_recv() {
                Ok(LoopMessage::Resolved { ticket, result }) => self.deliver_resolution(ticket, result),
                Ok(LoopMessage::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                // 服务器自己持有一个发送端，不会走到这里
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn deliver_resolution(&mut self, ticket: Ticket, result: io::Result<Ipv4Addr>) {
        let key = match self.table.get(&ticket.token) {
            Some(&key) if self.sessions.get(key).map(Session::id) == Some(ticket.session) => key,
            _ => {
                debug!("会话 {} 已关闭，丢弃解析结果", ticket.session);
                return;
            }
        };
        let outcome = self.sessions[key].on_resolved(result, &mut self.reactor);
        self.apply(key, outcome);
    }

    /// 关闭会话：从会话表移除两个描述符并关闭套接字，只会发生一次
    fn close_session(&mut self, key: usize, reason: CloseReason) {
        let Some(mut session) = self.sessions.try_remove(key) else {
            return;
        };
        self.table.remove(&session.client_token());
        if let Some(token) = session.remote_token() {
            self.table.remove(&token);
        }

        if let Some(reply) = reason.reply() {
            session.reply_failure(reply);
        }
        session.deregister(&mut self.reactor);

        let (up, down) = session.transferred();
        if reason.is_graceful() {
            info!(
                "[{}] 连接结束 ({}), 转发 {}/{} 字节",
                session.peer(),
                reason,
                up,
                down
            );
        } else {
            warn!(
                "[{}] 关闭会话: {}, 转发 {}/{} 字节",
                session.peer(),
                reason,
                up,
                down
            );
        }
        // session 在这里被释放，两个套接字随之关闭
    }

    fn shutdown(&mut self) {
        info!("正在关闭服务器, 剩余 {} 个会话", self.sessions.len());
        if let Err(e) = self.reactor.remove(&mut self.listener, self.listener_token) {
            debug!("注销监听套接字失败: {}", e);
        }
        let keys: Vec<usize> = self.sessions.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_session(key, CloseReason::Shutdown);
        }
    }
}
