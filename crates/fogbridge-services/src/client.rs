//! Outbound CoAP client — one confirmable request, one reply.
//!
//! Used by the key-push path and by the operator's `send` command.
//! Retransmits with exponential backoff until the reply arrives or the
//! retransmission budget runs out; never waits longer than that budget.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use coap_lite::{MessageClass, MessageType, Packet};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use fogbridge_core::config::CoapConfig;
use fogbridge_core::crypto::{generate_message_id, generate_token};
use fogbridge_core::wire::{self, WireError};

/// Ceiling on the wait between two transmissions.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Retransmission parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ack_timeout: Duration,
    pub max_retransmit: u32,
    pub recv_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&CoapConfig::default())
    }
}

impl From<&CoapConfig> for ClientConfig {
    fn from(c: &CoapConfig) -> Self {
        Self {
            ack_timeout: c.ack_timeout(),
            max_retransmit: c.max_retransmit,
            recv_buffer: c.recv_buffer,
        }
    }
}

/// What came back for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: MessageClass,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("no reply after {0} transmissions")]
    Timeout(u32),

    #[error("peer reset the exchange")]
    Reset,
}

#[derive(Debug, Clone)]
pub struct CoapClient {
    config: ClientConfig,
}

enum Incoming {
    /// Response carried in the ACK, or a separate response.
    Response(Reply),
    /// Empty ACK: the peer will answer separately.
    EmptyAck,
    Reset,
    Unrelated,
}

impl CoapClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Send a confirmable request to `destination` and wait for its reply.
    pub async fn send(
        &self,
        code: MessageClass,
        destination: SocketAddr,
        path: &str,
        payload: &[u8],
    ) -> Result<Reply, ClientError> {
        let unspecified = if destination.is_ipv6() {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
        socket.connect(destination).await?;

        let message_id = generate_message_id();
        let token = generate_token();
        let request = wire::confirmable_request(code, path, payload, message_id, &token);
        let bytes = wire::encode_packet(&request)?;

        tracing::debug!(%destination, path, message_id, "sending confirmable request");

        let mut buf = vec![0u8; self.config.recv_buffer];
        let mut wait = self.config.ack_timeout.min(MAX_BACKOFF);
        let mut acked = false;
        let mut transmissions = 0u32;

        for _ in 0..=self.config.max_retransmit {
            if !acked {
                socket.send(&bytes).await?;
                transmissions += 1;
            }
            let deadline = Instant::now() + wait;

            loop {
                let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                    Err(_) => break,
                    Ok(r) => r?,
                };
                let packet = match wire::parse_packet(&buf[..len]) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring undecodable reply");
                        continue;
                    }
                };

                match classify(&packet, message_id, &token) {
                    Incoming::Response(reply) => {
                        if packet.header.get_type() == MessageType::Confirmable {
                            let ack = wire::encode_packet(&wire::empty_ack(packet.header.message_id))?;
                            socket.send(&ack).await?;
                        }
                        if !reply.payload.is_empty() {
                            tracing::info!(
                                %destination,
                                payload = %String::from_utf8_lossy(&reply.payload),
                                "response payload"
                            );
                        }
                        return Ok(reply);
                    }
                    Incoming::EmptyAck => {
                        tracing::debug!(%destination, "request acknowledged, awaiting separate response");
                        acked = true;
                    }
                    Incoming::Reset => return Err(ClientError::Reset),
                    Incoming::Unrelated => {}
                }
            }

            wait = next_backoff(wait);
        }

        Err(ClientError::Timeout(transmissions))
    }
}

/// Doubles `wait`, saturating at [`MAX_BACKOFF`].
fn next_backoff(wait: Duration) -> Duration {
    wait.saturating_mul(2).min(MAX_BACKOFF)
}

fn classify(packet: &Packet, message_id: u16, token: &[u8]) -> Incoming {
    let same_id = packet.header.message_id == message_id;
    match packet.header.get_type() {
        MessageType::Reset if same_id => Incoming::Reset,
        MessageType::Acknowledgement if same_id => match &packet.header.code {
            MessageClass::Empty => Incoming::EmptyAck,
            code => Incoming::Response(Reply {
                code: code.clone(),
                payload: packet.payload.clone(),
            }),
        },
        MessageType::Confirmable | MessageType::NonConfirmable
            if packet.get_token() == token
                && matches!(packet.header.code, MessageClass::Response(_)) =>
        {
            Incoming::Response(Reply {
                code: packet.header.code.clone(),
                payload: packet.payload.clone(),
            })
        }
        _ => Incoming::Unrelated,
    }
}
