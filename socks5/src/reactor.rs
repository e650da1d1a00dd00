//! 基于 `mio` 的就绪通知封装
//!
//! `mio` 在 epoll/kqueue 上都是边沿触发：会话必须读到 `WouldBlock` 为止，
//! 写入遇到 `WouldBlock` 时要登记写事件，等下一次可写通知再继续。

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// 描述符关注的事件集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    ReadWrite,
}

impl Mode {
    /// 两个标志都为 false 时返回 `None`，表示不应再登记
    pub fn from_flags(read: bool, write: bool) -> Option<Mode> {
        match (read, write) {
            (true, true) => Some(Mode::ReadWrite),
            (true, false) => Some(Mode::Read),
            (false, true) => Some(Mode::Write),
            (false, false) => None,
        }
    }

    fn interest(self) -> Interest {
        match self {
            Mode::Read => Interest::READABLE,
            Mode::Write => Interest::WRITABLE,
            Mode::ReadWrite => Interest::READABLE | Interest::WRITABLE,
        }
    }
}

/// 一次就绪通知的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    modes: HashMap<Token, Mode>,
}

impl Reactor {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            modes: HashMap::new(),
        })
    }

    /// 创建唤醒句柄，其它线程通过它打断 `wait`
    pub fn waker(&self, token: Token) -> io::Result<Arc<Waker>> {
        Ok(Arc::new(Waker::new(self.poll.registry(), token)?))
    }

    /// 登记描述符；同一个 (token, mode) 重复登记不做任何事
    pub fn add<S>(&mut self, source: &mut S, token: Token, mode: Mode) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        match self.modes.get(&token) {
            Some(current) if *current == mode => Ok(()),
            Some(_) => self.modify(source, token, mode),
            None => {
                self.poll
                    .registry()
                    .register(source, token, mode.interest())?;
                self.modes.insert(token, mode);
                Ok(())
            }
        }
    }

    /// 修改已登记描述符的事件集合，重新登记会再次报告当前的就绪状态
    pub fn modify<S>(&mut self, source: &mut S, token: Token, mode: Mode) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        if !self.modes.contains_key(&token) {
            return self.add(source, token, mode);
        }
        self.poll
            .registry()
            .reregister(source, token, mode.interest())?;
        self.modes.insert(token, mode);
        Ok(())
    }

    pub fn remove<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        if self.modes.remove(&token).is_some() {
            self.poll.registry().deregister(source)?;
        }
        Ok(())
    }

    /// 把描述符的登记状态调整为 `desired`
    pub fn sync<S>(&mut self, source: &mut S, token: Token, desired: Option<Mode>) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        match (self.mode_of(token), desired) {
            (current, Some(mode)) if current == Some(mode) => Ok(()),
            (None, Some(mode)) => self.add(source, token, mode),
            (Some(_), Some(mode)) => self.modify(source, token, mode),
            (Some(_), None) => self.remove(source, token),
            (None, None) => Ok(()),
        }
    }

    pub fn mode_of(&self, token: Token) -> Option<Mode> {
        self.modes.get(&token).copied()
    }

    /// 等待至少一个描述符就绪，把 (token, 方向) 写入 `out`
    ///
    /// 被信号打断时返回 0，调用方重新进入即可。
    pub fn wait(
        &mut self,
        out: &mut Vec<(Token, Direction)>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        out.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let token = event.token();
            // 错误和挂断也要交给会话处理，它们会在 read/write 时暴露出来
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                out.push((token, Direction::Read));
            }
            if event.is_writable() || event.is_write_closed() {
                out.push((token, Direction::Write));
            }
        }
        Ok(out.len())
    }
}
