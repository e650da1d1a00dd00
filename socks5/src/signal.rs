use log::{info, warn};
use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};

use crate::mailbox::{LoopMessage, Mailbox};

/// 收到 SIGINT 或 SIGTERM 时通知事件循环退出
pub fn watch(handle: &Handle, mailbox: Mailbox) {
    handle.spawn(async move {
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("无法监听 SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    mailbox.post(LoopMessage::Shutdown);
                }
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("收到 SIGINT，正在关闭服务器"),
            _ = terminate.recv() => info!("收到 SIGTERM，正在关闭服务器"),
        }
        mailbox.post(LoopMessage::Shutdown);
    });
}
