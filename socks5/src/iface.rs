use std::io;
use std::net::{IpAddr, Ipv4Addr};

/// 返回网卡的第一个非回环 IPv4 地址
pub fn interface_ipv4(name: &str) -> io::Result<Ipv4Addr> {
    if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|iface| iface.name == name && !iface.is_loopback())
        .find_map(|iface| match iface.ip() {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("网卡 {} 不存在或没有 IPv4 地址", name),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_is_not_found() {
        let err = interface_ipv4("no-such-iface0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn loopback_only_interface_is_skipped() {
        #[cfg(target_os = "linux")]
        let name = "lo";
        #[cfg(not(target_os = "linux"))]
        let name = "lo0";
        assert!(interface_ipv4(name).is_err());
    }
}
