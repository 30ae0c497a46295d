//! Operator console on stdin.
//!
//! `send <code> <destination> <path> <payload>` fires a raw confirmable
//! request, `nodes` lists the registry, `test req` runs a loopback link
//! request against this gateway, `exit` stops the daemon.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use coap_lite::{MessageClass, RequestType, ResponseType};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use fogbridge_core::wire;
use fogbridge_core::SessionKey;
use fogbridge_services::{CoapClient, NodeRegistry};

const HELP: &str = "\
commands:
  send <code> <destination> <path> <payload>   send a confirmable CoAP request
  nodes                                        list known devices
  test req                                     loopback link request against this gateway
  help                                         show this text
  exit                                         stop the gateway";

/// How long `test req` waits for the platform to push a key back.
const TEST_KEY_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send {
        code: u8,
        destination: String,
        path: String,
        payload: String,
    },
    Nodes,
    TestReq,
    Help,
    Exit,
    Empty,
    /// Known command with bad arguments; carries the message to show.
    Invalid(String),
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let (head, rest) = match line.split_once(' ') {
        Some((head, rest)) => (head, rest.trim_start()),
        None => (line, ""),
    };

    match head {
        "" => Command::Empty,
        "send" => parse_send(rest),
        "nodes" => Command::Nodes,
        "help" => Command::Help,
        "exit" | "quit" => Command::Exit,
        "test" => match rest {
            "req" => Command::TestReq,
            "" => Command::Invalid("usage: test req".into()),
            other => Command::Invalid(format!("no such test: {other}")),
        },
        other => Command::Unknown(other.to_string()),
    }
}

fn parse_send(args: &str) -> Command {
    let mut parts = args.splitn(4, ' ');
    let (Some(code), Some(destination), Some(path)) = (parts.next(), parts.next(), parts.next())
    else {
        return Command::Invalid("usage: send <code> <destination> <path> <payload>".into());
    };
    let code = match code.parse::<u8>() {
        Ok(c) => c,
        Err(e) => return Command::Invalid(format!("bad code {code:?}: {e}")),
    };
    Command::Send {
        code,
        destination: destination.to_string(),
        path: path.to_string(),
        payload: parts.next().unwrap_or("").to_string(),
    }
}

/// Everything a command may touch.
pub struct ShellContext {
    pub registry: NodeRegistry,
    pub client: CoapClient,
    /// Where this gateway listens; target of `test req`.
    pub gateway: SocketAddr,
    pub shutdown: broadcast::Sender<()>,
}

/// Read commands until stdin closes or shutdown is signalled.
pub async fn run_shell(ctx: ShellContext) {
    let mut shutdown = ctx.shutdown.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.recv() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("stdin closed, operator console off");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stdin");
                return;
            }
        };

        if execute(&ctx, parse_command(&line)).await {
            let _ = ctx.shutdown.send(());
            return;
        }
    }
}

/// Run one command. Returns true when the operator asked to exit.
async fn execute(ctx: &ShellContext, command: Command) -> bool {
    match command {
        Command::Exit => return true,
        Command::Empty => {}
        Command::Help => println!("{HELP}"),
        Command::Invalid(msg) => println!("{msg}"),
        Command::Unknown(cmd) => println!("did not understand command: {cmd}"),
        Command::Nodes => print_nodes(&ctx.registry),
        Command::Send {
            code,
            destination,
            path,
            payload,
        } => {
            if let Err(e) = send(&ctx.client, code, &destination, &path, &payload).await {
                println!("error sending request: {e:#}");
            }
        }
        Command::TestReq => {
            tracing::info!(gateway = %ctx.gateway, "testing link request");
            match test_req(ctx.gateway).await {
                Ok(key) => println!("test req: received key {}", key.to_hex()),
                Err(e) => println!("test req failed: {e:#}"),
            }
        }
    }
    false
}

fn print_nodes(registry: &NodeRegistry) {
    let nodes = registry.snapshot();
    if nodes.is_empty() {
        println!("no devices");
        return;
    }
    for node in nodes {
        println!(
            "{}  {}  registered={}  link={}  key={}",
            node.identity,
            node.addr,
            node.registered,
            node.link.as_ref().map_or(0, |c| c.len()),
            if node.session_key.is_some() { "yes" } else { "no" },
        );
    }
}

async fn send(
    client: &CoapClient,
    code: u8,
    destination: &str,
    path: &str,
    payload: &str,
) -> Result<()> {
    let addr = tokio::net::lookup_host(destination)
        .await
        .with_context(|| format!("cannot resolve {destination}"))?
        .next()
        .with_context(|| format!("{destination} resolved to nothing"))?;

    let reply = client
        .send(MessageClass::from(code), addr, path, payload.as_bytes())
        .await?;
    println!(
        "{:?} {}",
        reply.code,
        String::from_utf8_lossy(&reply.payload)
    );
    Ok(())
}

/// Act as a device: ask the gateway for a link of type 1 and wait for the
/// platform's key to arrive on `/key` at the same socket.
async fn test_req(gateway: SocketAddr) -> Result<SessionKey> {
    let bind: SocketAddr = if gateway.is_ipv6() {
        "[::1]:0".parse()?
    } else {
        "127.0.0.1:0".parse()?
    };
    let gateway = SocketAddr::new(bind.ip(), gateway.port());
    let socket = UdpSocket::bind(bind).await.context("bind test socket")?;

    let message_id = fogbridge_core::crypto::generate_message_id();
    let token = fogbridge_core::crypto::generate_token();
    let request = wire::confirmable_request(
        MessageClass::Request(RequestType::Post),
        wire::PATH_REQ,
        &wire::encode_uvarint(1),
        message_id,
        &token,
    );
    socket
        .send_to(&wire::encode_packet(&request)?, gateway)
        .await
        .context("send /req")?;

    let mut buf = vec![0u8; 1152];
    let deadline = tokio::time::Instant::now() + TEST_KEY_WAIT;
    loop {
        let (len, peer) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .context("no key pushed before the deadline")??;
        let packet = match wire::parse_packet(&buf[..len]) {
            Ok(p) => p,
            Err(_) => continue,
        };

        if packet.header.message_id == message_id && !wire::is_request(&packet) {
            println!(
                "test req: gateway answered {:?} {}",
                packet.header.code,
                String::from_utf8_lossy(&packet.payload)
            );
            continue;
        }

        let key_path = wire::PATH_KEY.trim_start_matches('/');
        if wire::is_request(&packet) && wire::request_path(&packet) == key_path {
            if wire::is_confirmable(&packet) {
                let ack = wire::ack_for(&packet, ResponseType::Changed, b"");
                socket.send_to(&wire::encode_packet(&ack)?, peer).await?;
            }
            return SessionKey::try_from(packet.payload.as_slice()).map_err(Into::into);
        }
    }
}
