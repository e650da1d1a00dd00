use mio::net::{TcpListener, TcpStream};
use mio::Token;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;

/// 非阻塞 connect 完成后的状态
#[derive(Debug)]
pub enum ConnectStatus {
    Established,
    /// 还没有完成，可能是一次多余的唤醒
    Pending,
    Failed(io::Error),
}

/// 会话表以描述符为键
pub fn token_of<S: AsRawFd>(source: &S) -> Token {
    Token(source.as_raw_fd() as usize)
}

/// 创建非阻塞的监听套接字，设置 SO_REUSEADDR
pub fn listen(addr: SocketAddrV4, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// 接受一个连接；没有待处理的连接时返回 `None`
pub fn accept(listener: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                // Nagle 对转发没有好处，失败也无所谓
                let _ = stream.set_nodelay(true);
                return Ok(Some((stream, peer)));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// 发起非阻塞连接，EINPROGRESS 视为成功，完成情况通过可写事件观察
pub fn connect_nb(addr: SocketAddrV4) -> io::Result<TcpStream> {
    TcpStream::connect(SocketAddr::V4(addr))
}

/// 读取数据，0 表示对端正常关闭；EINTR 自动重试
pub fn read<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

pub fn write<W: Write + ?Sized>(sink: &mut W, buf: &[u8]) -> io::Result<usize> {
    loop {
        match sink.write(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// 只要还有进展就一直写
///
/// 遇到 `WouldBlock` 时停止并返回已写入的字节数（可能小于 `buf.len()`），
/// 调用方负责缓存剩余部分并登记写事件。其它错误直接返回。
pub fn write_full<W: Write + ?Sized>(sink: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match write(sink, &buf[written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// 读取并清除 SO_ERROR
pub fn so_error(stream: &TcpStream) -> io::Result<Option<io::Error>> {
    stream.take_error()
}

pub fn connect_status(stream: &TcpStream) -> ConnectStatus {
    match so_error(stream) {
        Ok(Some(e)) | Err(e) => return ConnectStatus::Failed(e),
        Ok(None) => {}
    }
    match stream.peer_addr() {
        Ok(_) => ConnectStatus::Established,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectStatus::Pending,
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => ConnectStatus::Pending,
        Err(e) => ConnectStatus::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// 每次最多接收 `chunk` 字节，总容量用完后返回 WouldBlock
    struct Throttled {
        data: Vec<u8>,
        capacity: usize,
        chunk: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.capacity - self.data.len();
            if room == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(room).min(self.chunk);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_full_loops_over_short_writes() {
        let mut sink = Throttled {
            data: Vec::new(),
            capacity: 1024,
            chunk: 3,
        };
        assert_eq!(write_full(&mut sink, b"hello world").unwrap(), 11);
        assert_eq!(sink.data, b"hello world");
    }

    #[test]
    fn write_full_stops_at_would_block() {
        let mut sink = Throttled {
            data: Vec::new(),
            capacity: 4,
            chunk: 16,
        };
        assert_eq!(write_full(&mut sink, b"abcdefgh").unwrap(), 4);
        assert_eq!(sink.data, b"abcd");
    }

    #[test]
    fn write_full_reports_write_zero() {
        struct Zero;
        impl Write for Zero {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let err = write_full(&mut Zero, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn listen_and_accept() {
        let listener = listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(accept(&listener).unwrap().is_none());

        let _client = std::net::TcpStream::connect(addr).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(pair) = accept(&listener).unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let (stream, _) = accepted.expect("连接没有到达");
        assert_ne!(token_of(&stream), token_of(&listener));
    }
}
