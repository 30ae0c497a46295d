//! CoAP gateway server — the UDP socket devices talk to.
//!
//! One receive loop; every datagram is handled on its own task so a slow
//! platform call never stalls other devices. Each task sends at most one
//! reply for its request.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use coap_lite::{MessageClass, Packet};
use fogbridge_core::wire;

use crate::dispatch::Router;

pub struct GatewayServer {
    socket: Arc<UdpSocket>,
    router: Arc<Router>,
    recv_buffer: usize,
    shutdown: broadcast::Receiver<()>,
}

impl GatewayServer {
    /// Bind the listening socket. Must be called from within a tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        router: Arc<Router>,
        recv_buffer: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let socket = make_server_socket(addr)
            .with_context(|| format!("failed to bind CoAP socket on {addr}"))?;
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;
        Ok(Self {
            socket: Arc::new(socket),
            router,
            recv_buffer,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until shutdown is signalled (Ok) or the socket fails for good (Err).
    /// In-flight handlers are left to finish on their own.
    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; self.recv_buffer];

        tracing::info!(addr = %self.local_addr()?, "CoAP gateway serving");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("CoAP gateway shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(r) => r,
                        Err(e) if is_transient(&e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                        Err(e) => return Err(e).context("CoAP socket failed"),
                    };

                    let datagram = buf[..len].to_vec();
                    let socket = self.socket.clone();
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        handle_datagram(&socket, &router, peer, &datagram).await;
                    });
                }
            }
        }
    }
}

async fn handle_datagram(socket: &UdpSocket, router: &Router, peer: SocketAddr, datagram: &[u8]) {
    let packet = match wire::parse_packet(datagram) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "dropping undecodable datagram");
            return;
        }
    };

    let response = if wire::is_request(&packet) {
        router.route(peer, &packet).await
    } else if wire::is_confirmable(&packet) && packet.header.code == MessageClass::Empty {
        tracing::trace!(%peer, "answering CoAP ping");
        Some(wire::reset_for(packet.header.message_id))
    } else {
        tracing::debug!(%peer, "ignoring non-request message");
        None
    };

    if let Some(response) = response {
        send_response(socket, peer, &response).await;
    }
}

async fn send_response(socket: &UdpSocket, peer: SocketAddr, response: &Packet) {
    let bytes = match wire::encode_packet(response) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "failed to encode response");
            return;
        }
    };
    if let Err(e) = socket.send_to(&bytes, peer).await {
        tracing::warn!(%peer, error = %e, "failed to send response");
    }
}

/// ICMP-triggered errors on a UDP socket concern one peer, not the socket.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Create the non-blocking listening socket. IPv6 sockets accept v4-mapped
/// peers too where the OS allows it.
fn make_server_socket(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if addr.is_ipv6() {
        if let Err(e) = socket.set_only_v6(false) {
            tracing::debug!(error = %e, "dual-stack socket unavailable, IPv6 only");
        }
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).context("bind()")?;

    Ok(socket.into())
}
