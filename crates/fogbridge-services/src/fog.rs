//! Fog platform client — the concrete [`Platform`] the daemon runs with.
//!
//! One TCP connection, wrapped in TLS when the platform channel is
//! configured for it, carrying newline-delimited JSON frames in both
//! directions. Requests carry an `id` and are answered by a `reply` frame
//! with the same id. The platform may send `push_key` at any time; each
//! push is handed to the [`KeyReceiver`] on its own task and its outcome is
//! reported back with a `push_key_result` frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};

use fogbridge_core::config::PlatformConfig;
use fogbridge_core::{DeviceId, InfType, LinkContract, NetworkKind, SessionKey};

use crate::platform::{DeviceRegistration, KeyReceiver, Platform, PlatformError};
use crate::tls::PlatformTls;

// ── Frames ────────────────────────────────────────────────────────────────────

/// Frames the gateway sends.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Outbound {
    RegisterPlatform {
        id: u64,
        address: String,
        kind: NetworkKind,
    },
    RegisterDevice {
        id: u64,
        identity: String,
        inf_type: u64,
        is_provider: bool,
        address: String,
        kind: NetworkKind,
    },
    RequestLink {
        id: u64,
        identity: String,
        inf_type: u64,
    },
    PushKeyResult {
        identity: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Frames the platform sends.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Inbound {
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
        /// Hex link contract, on replies to `request_link`.
        #[serde(default)]
        contract: Option<String>,
    },
    PushKey {
        identity: String,
        key: String,
    },
}

type CallResult = Result<Option<LinkContract>, PlatformError>;
type Pending = Arc<DashMap<u64, oneshot::Sender<CallResult>>>;

/// Byte stream under the frame codec: plain TCP or TLS over TCP.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type Writer = Arc<Mutex<WriteHalf<Box<dyn Transport>>>>;

// ── Client ────────────────────────────────────────────────────────────────────

pub struct FogClient {
    writer: Writer,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
    advertise_address: String,
    closed: watch::Receiver<bool>,
}

impl FogClient {
    /// Connect to the platform and start serving its frames.
    ///
    /// With `tls` the TLS handshake is part of the connect and shares its
    /// timeout. Pushed keys go to `receiver` for as long as the connection
    /// lives.
    pub async fn connect(
        config: &PlatformConfig,
        tls: Option<&PlatformTls>,
        receiver: Arc<dyn KeyReceiver>,
    ) -> Result<Arc<Self>, PlatformError> {
        let stream = tokio::time::timeout(config.connect_timeout(), async {
            let tcp = TcpStream::connect(config.address.as_str()).await?;
            tcp.set_nodelay(true)?;
            let stream: Box<dyn Transport> = match tls {
                Some(tls) => Box::new(tls.connector().connect(tls.server_name(), tcp).await?),
                None => Box::new(tcp),
            };
            Ok::<_, std::io::Error>(stream)
        })
        .await
        .map_err(|_| PlatformError::Timeout)??;

        tracing::info!(
            address = %config.address,
            tls = tls.is_some(),
            client_auth = tls.is_some_and(PlatformTls::client_auth),
            "connected to fog platform"
        );

        let (read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(write_half));
        let pending: Pending = Arc::new(DashMap::new());
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(reader_loop(
            read_half,
            writer.clone(),
            pending.clone(),
            receiver,
            closed_tx,
        ));

        Ok(Arc::new(Self {
            writer,
            pending,
            next_id: AtomicU64::new(1),
            request_timeout: config.request_timeout(),
            advertise_address: config.advertised().to_string(),
            closed: closed_rx,
        }))
    }

    /// Announce this gateway to the fog as a 6LoWPAN platform.
    pub async fn register_platform(&self) -> Result<(), PlatformError> {
        let id = self.next_id();
        self.call(
            id,
            Outbound::RegisterPlatform {
                id,
                address: self.advertise_address.clone(),
                kind: NetworkKind::Sixlowpan,
            },
        )
        .await
        .map(|_| ())
    }

    /// Resolves once the platform connection has gone away.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn call(&self, id: u64, frame: Outbound) -> CallResult {
        if *self.closed.borrow() {
            return Err(PlatformError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // The reader flags the close before draining `pending`, so an entry
        // inserted after the drain is always caught here.
        if *self.closed.borrow() {
            self.pending.remove(&id);
            return Err(PlatformError::Closed);
        }

        if let Err(e) = write_frame(&self.writer, &frame).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.pending.remove(&id);
                Err(PlatformError::Timeout)
            }
            // Sender dropped: the reader loop ended.
            Ok(Err(_)) => Err(PlatformError::Closed),
            Ok(Ok(result)) => result,
        }
    }
}

#[async_trait]
impl Platform for FogClient {
    async fn register_device(&self, registration: DeviceRegistration) -> Result<(), PlatformError> {
        let id = self.next_id();
        self.call(
            id,
            Outbound::RegisterDevice {
                id,
                identity: registration.identity.to_hex(),
                inf_type: registration.inf_type.get(),
                is_provider: registration.is_provider,
                address: registration.platform_address,
                kind: registration.platform_kind,
            },
        )
        .await
        .map(|_| ())
    }

    async fn request_link(
        &self,
        identity: &DeviceId,
        inf_type: InfType,
    ) -> Result<Option<LinkContract>, PlatformError> {
        let id = self.next_id();
        self.call(
            id,
            Outbound::RequestLink {
                id,
                identity: identity.to_hex(),
                inf_type: inf_type.get(),
            },
        )
        .await
    }
}

// ── Connection tasks ──────────────────────────────────────────────────────────

async fn write_frame(writer: &Mutex<WriteHalf<Box<dyn Transport>>>, frame: &Outbound) -> Result<(), PlatformError> {
    let mut line =
        serde_json::to_vec(frame).map_err(|e| PlatformError::Protocol(e.to_string()))?;
    line.push(b'\n');
    let mut w = writer.lock().await;
    w.write_all(&line).await?;
    w.flush().await?;
    Ok(())
}

async fn reader_loop(
    read_half: ReadHalf<Box<dyn Transport>>,
    writer: Writer,
    pending: Pending,
    receiver: Arc<dyn KeyReceiver>,
    closed: watch::Sender<bool>,
) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::warn!("fog platform closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "fog platform read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Inbound>(&line) {
            Ok(Inbound::Reply { id, ok, error, contract }) => {
                let result = if ok {
                    decode_contract(contract)
                } else {
                    Err(PlatformError::Rejected(error.unwrap_or_default()))
                };
                match pending.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(result);
                    }
                    None => tracing::debug!(id, "reply for unknown or expired request"),
                }
            }
            Ok(Inbound::PushKey { identity, key }) => {
                let writer = writer.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    let outcome = deliver_pushed_key(receiver.as_ref(), &identity, &key).await;
                    let frame = Outbound::PushKeyResult {
                        identity,
                        ok: outcome.is_ok(),
                        error: outcome.err(),
                    };
                    if let Err(e) = write_frame(&writer, &frame).await {
                        tracing::warn!(error = %e, "failed to report key push result");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "ignoring malformed platform frame"),
        }
    }

    // Flag first, then drop the senders: every outstanding call fails with
    // Closed and no new call can slip in between.
    let _ = closed.send(true);
    pending.clear();
}

fn decode_contract(contract: Option<String>) -> CallResult {
    contract
        .map(|hex| {
            LinkContract::from_hex(&hex)
                .map_err(|e| PlatformError::Protocol(format!("bad link contract: {e}")))
        })
        .transpose()
}

async fn deliver_pushed_key(
    receiver: &dyn KeyReceiver,
    identity: &str,
    key: &str,
) -> Result<(), String> {
    let identity = DeviceId::from_hex(identity).map_err(|e| format!("bad identity: {e}"))?;
    let key = SessionKey::from_hex(key).map_err(|e| e.to_string())?;
    receiver
        .on_key_available(&identity, key)
        .await
        .map_err(|e| {
            tracing::warn!(%identity, error = %e, "key push failed");
            e.to_string()
        })
}
