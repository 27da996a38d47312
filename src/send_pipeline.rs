use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Abstraction over sending a finished packet buffer on a UDP socket, introduced so the
///  I/O part can be mocked away in tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("sending {} byte packet to {:?}", packet_buf.len(), to);

        // send errors are logged rather than propagated: UDP gives no delivery guarantee
        //  anyway, and the reliability layer handles the packet's loss like any other
        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// The outgoing half of one connection: a shared socket plus the pinned peer address.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    peer_addr: SocketAddr,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, peer_addr: SocketAddr) -> SendPipeline {
        SendPipeline { socket, peer_addr }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send_packet(&self, packet_buf: &[u8]) {
        self.socket.do_send_packet(self.peer_addr, packet_buf).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipeline_routes_to_the_pinned_peer() {
        let local: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let mut socket = MockSendSocket::new();
        socket.expect_local_addr().return_const(local);
        socket
            .expect_do_send_packet()
            .withf(move |to, packet_buf| *to == peer && packet_buf == b"abc")
            .times(1)
            .returning(|_, _| ());

        let pipeline = SendPipeline::new(Arc::new(socket), peer);
        assert_eq!(pipeline.local_addr(), local);
        assert_eq!(pipeline.peer_addr(), peer);
        pipeline.send_packet(b"abc").await;
    }
}
