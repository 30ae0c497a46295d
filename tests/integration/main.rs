//! fogbridge integration test harness.
//!
//! Every test runs a full gateway in-process on loopback: the UDP CoAP
//! server, the real `FogClient` talking to a scripted fog platform over
//! TCP, and plain UDP sockets standing in for devices.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use coap_lite::{MessageClass, MessageType, Packet, RequestType};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc};

use fogbridge_core::config::{CoapConfig, PlatformConfig};
use fogbridge_core::wire;
use fogbridge_services::{
    ClientConfig, CoapClient, FogClient, GatewayServer, HelloHandler, KeyPusher,
    LinkRequestHandler, NodeRegistry, PushSettings, Router,
};

mod hello;
mod keypush;
mod link;

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(3);

/// Contract the scripted platform attaches to every granted link.
pub const LINK_CONTRACT: &str = "c0ffee";

// ── Scripted fog platform ─────────────────────────────────────────────────────

/// A fog platform endpoint that answers every call and records every frame.
/// It speaks plaintext; the TLS channel is covered by the services crate.
pub struct FakeFog {
    pub config: PlatformConfig,
    frames: mpsc::UnboundedReceiver<Value>,
    push: mpsc::UnboundedSender<Value>,
}

impl FakeFog {
    /// Listen on loopback. Calls whose `op` is in `reject` are answered with
    /// `ok: false`.
    pub async fn start(reject: &[&'static str]) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let config = PlatformConfig {
            address: listener.local_addr()?.to_string(),
            advertise_address: "gw.test:2001".into(),
            request_timeout_ms: 1000,
            key_push_timeout_ms: 2000,
            ..PlatformConfig::default()
        };

        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (push, mut push_rx) = mpsc::unbounded_channel::<Value>();
        let reject: Vec<&'static str> = reject.to_vec();

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else { return };
                        let Ok(frame) = serde_json::from_str::<Value>(&line) else { continue };
                        let op = frame["op"].as_str().unwrap_or_default().to_string();
                        let id = frame["id"].as_u64();
                        // Record first; the reply unblocks the gateway.
                        let _ = frames_tx.send(frame);
                        if let Some(id) = id {
                            let reply = if reject.contains(&op.as_str()) {
                                json!({ "op": "reply", "id": id, "ok": false, "error": "rejected" })
                            } else if op == "request_link" {
                                json!({ "op": "reply", "id": id, "ok": true, "contract": LINK_CONTRACT })
                            } else {
                                json!({ "op": "reply", "id": id, "ok": true })
                            };
                            if write_line(&mut write, &reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(frame) = push_rx.recv() => {
                        if write_line(&mut write, &frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Self { config, frames, push })
    }

    /// Ask the gateway to deliver `key` to the device `identity`.
    pub fn push_key(&self, identity: &str, key: &str) {
        let _ = self
            .push
            .send(json!({ "op": "push_key", "identity": identity, "key": key }));
    }

    /// Next frame the gateway sent, if one arrives within `WAIT`.
    pub async fn next_frame(&mut self) -> Option<Value> {
        tokio::time::timeout(WAIT, self.frames.recv()).await.ok().flatten()
    }

    /// Wait for the next frame with the given `op`, skipping others.
    pub async fn expect_op(&mut self, op: &str) -> Result<Value> {
        loop {
            let frame = self
                .next_frame()
                .await
                .with_context(|| format!("no {op} frame from gateway"))?;
            if frame["op"] == op {
                return Ok(frame);
            }
        }
    }

    /// Frames already received, without waiting.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            out.push(frame);
        }
        out
    }
}

async fn write_line(write: &mut tokio::net::tcp::OwnedWriteHalf, frame: &Value) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    write.write_all(&line).await
}

// ── Gateway under test ────────────────────────────────────────────────────────

/// A running gateway. Dropping it stops the server.
pub struct Gateway {
    pub addr: SocketAddr,
    pub registry: NodeRegistry,
    pub fog: FakeFog,
    shutdown: broadcast::Sender<()>,
}

impl Gateway {
    pub async fn start() -> Result<Self> {
        Self::start_with(FakeFog::start(&[]).await?, false, "[::1]:0").await
    }

    pub async fn start_with(mut fog: FakeFog, explicit_errors: bool, listen: &str) -> Result<Self> {
        let coap = CoapConfig {
            ack_timeout_ms: 100,
            max_retransmit: 2,
            explicit_errors,
            ..CoapConfig::default()
        };

        let registry = NodeRegistry::new();
        let client = CoapClient::new(ClientConfig::from(&coap));
        let pusher = Arc::new(KeyPusher::new(
            registry.clone(),
            client,
            PushSettings::from_config(&coap, &fog.config),
        ));

        let platform = FogClient::connect(&fog.config, None, pusher).await?;
        platform.register_platform().await?;
        fog.expect_op("register_platform").await?;

        let mut router = Router::new();
        router.register(wire::PATH_HELLO, Arc::new(HelloHandler));
        router.register(
            wire::PATH_REQ,
            Arc::new(LinkRequestHandler::new(
                registry.clone(),
                platform,
                fog.config.advertised().to_string(),
                coap.explicit_errors,
            )),
        );

        let (shutdown, rx) = broadcast::channel(1);
        let server = GatewayServer::bind(listen.parse()?, Arc::new(router), coap.recv_buffer, rx)?;
        let addr = server.local_addr()?;
        tokio::spawn(server.run());

        Ok(Self {
            addr,
            registry,
            fog,
            shutdown,
        })
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

// ── Devices ───────────────────────────────────────────────────────────────────

/// A UDP socket playing a 6LoWPAN device.
pub struct Device {
    pub socket: UdpSocket,
}

impl Device {
    pub async fn bind() -> Result<Self> {
        Self::bind_on("[::1]:0").await
    }

    /// Devices derive their identity from their IP, so distinct devices
    /// need distinct addresses. Any 127.0.0.0/8 address works on Linux.
    pub async fn bind_on(addr: &str) -> Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr).await?,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("bound socket has an address")
    }

    pub async fn send(&self, to: SocketAddr, packet: &Packet) -> Result<()> {
        self.socket.send_to(&wire::encode_packet(packet)?, to).await?;
        Ok(())
    }

    /// Next packet within `wait`, or `None` on silence.
    pub async fn recv(&self, wait: Duration) -> Option<(Packet, SocketAddr)> {
        let mut buf = [0u8; 1152];
        match tokio::time::timeout(wait, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => wire::parse_packet(&buf[..len]).ok().map(|p| (p, from)),
            _ => None,
        }
    }
}

/// A request to `path`, confirmable unless `kind` says otherwise.
pub fn request(kind: MessageType, method: RequestType, path: &str, payload: &[u8], message_id: u16) -> Packet {
    let mut p = wire::confirmable_request(
        MessageClass::Request(method),
        path,
        payload,
        message_id,
        &[0x10, 0x20],
    );
    p.header.set_type(kind);
    p
}
