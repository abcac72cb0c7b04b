use crate::traits::DatagramSink;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Sends each datagram from a fresh, broadcast-enabled socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransport;

impl UdpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DatagramSink for UdpTransport {
    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        socket.send_to(payload, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_a_local_listener() {
        let listener = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let target = listener.local_addr().unwrap();

        let sent = UdpTransport::new().send_to(b"ping", target).await.unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let (len, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
    }
}
