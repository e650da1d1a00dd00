//! 事件循环之外的任务（域名解析、信号）把结果投递回循环线程的通道

use log::warn;
use mio::Waker;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::resolver::Ticket;

#[derive(Debug)]
pub enum LoopMessage {
    Resolved {
        ticket: Ticket,
        result: io::Result<Ipv4Addr>,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct Mailbox {
    tx: UnboundedSender<LoopMessage>,
    waker: Arc<Waker>,
}

impl Mailbox {
    /// 投递消息并唤醒事件循环；循环已经退出时返回 false
    pub fn post(&self, message: LoopMessage) -> bool {
        if self.tx.send(message).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!("唤醒事件循环失败: {}", e);
        }
        true
    }
}

pub fn channel(waker: Arc<Waker>) -> (Mailbox, UnboundedReceiver<LoopMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Mailbox { tx, waker }, rx)
}
