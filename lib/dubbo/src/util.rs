use lazy_static::lazy_static;
use std::net::UdpSocket;

lazy_static! {
    static ref LOCAL_IP: String = detect_local_ip();
}

/// The address this process is reachable on, as seen by the routing table.
/// Resolved once per process; falls back to loopback when detection fails.
pub fn local_ip() -> &'static str {
    &LOCAL_IP
}

/// Opens a UDP socket towards a public address to learn which local
/// interface would carry the traffic. No packet is actually sent.
fn detect_local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub fn pid() -> u32 {
    std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ip_is_stable() {
        let first = local_ip();
        assert!(!first.is_empty());
        assert_eq!(local_ip(), first);
    }
}
