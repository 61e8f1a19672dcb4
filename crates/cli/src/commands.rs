//! Subcommands.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Subcommand;
use corelib::{Addr, KeyPair, NetworkType, PublicKey, SETUP_PORT, TRANSPORT_PORT};
use network::{
    DirectConfig, Listener, MemoryBackend, MemoryHub, MeshConfig, Network, NetworkConfig,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::load_node_config;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a key pair and print it as JSON
    Keygen,

    /// Split a `<public-key>:<port>` address into its parts
    ParseAddr { addr: String },

    /// Run a direct-only node that echoes every connection
    Serve {
        /// Node configuration file (JSON)
        #[arg(long, short)]
        config: PathBuf,

        /// Port to accept connections on
        #[arg(long, default_value_t = TRANSPORT_PORT)]
        port: u16,
    },

    /// Send a message to an echoing peer over the direct backend
    Dial {
        /// Node configuration file (JSON)
        #[arg(long, short)]
        config: PathBuf,

        /// Public key of the peer, hex encoded
        #[arg(long)]
        peer: PublicKey,

        #[arg(long, default_value_t = TRANSPORT_PORT)]
        port: u16,

        #[arg(long, default_value = "hello")]
        message: String,

        /// Give up on the dial after this many milliseconds
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },

    /// Run two nodes in this process and exchange messages over both backends
    Demo,
}

/// Output of a command.
#[derive(Debug)]
pub enum CommandResult {
    Text(String),
    Json(serde_json::Value),
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandResult::Text(text) => f.write_str(text),
            CommandResult::Json(value) => match serde_json::to_string_pretty(value) {
                Ok(text) => f.write_str(&text),
                Err(_) => write!(f, "{}", value),
            },
        }
    }
}

impl Command {
    pub async fn execute(self) -> anyhow::Result<CommandResult> {
        match self {
            Command::Keygen => keygen(),
            Command::ParseAddr { addr } => parse_addr(&addr),
            Command::Serve { config, port } => serve(config, port).await,
            Command::Dial {
                config,
                peer,
                port,
                message,
                timeout_ms,
            } => dial(config, peer, port, message, Duration::from_millis(timeout_ms)).await,
            Command::Demo => demo().await,
        }
    }
}

fn keygen() -> anyhow::Result<CommandResult> {
    let keys = KeyPair::generate();
    Ok(CommandResult::Json(serde_json::to_value(&keys)?))
}

fn parse_addr(text: &str) -> anyhow::Result<CommandResult> {
    let addr = Addr::parse(text)?;
    Ok(CommandResult::Json(json!({
        "pk": addr.pk,
        "port": addr.port,
        "any_port": addr.is_any_port(),
        "normalized": addr.to_string(),
    })))
}

async fn serve(config: PathBuf, port: u16) -> anyhow::Result<CommandResult> {
    let conf = load_node_config(&config)?;
    if conf.mesh.is_some() {
        bail!("the mesh backend cannot be started from the command line; remove the mesh block");
    }
    let net = Network::direct_only(conf)?;
    net.init(&CancellationToken::new()).await?;

    let listener = net.listen(NetworkType::Direct, port).await?;
    let bound = net.direct().and_then(|direct| direct.local_addr());
    info!(addr = %listener.local_addr(), tcp = ?bound, "echo node ready, press Ctrl+C to stop");

    tokio::select! {
        _ = echo(listener) => warn!("listener stopped"),
        res = tokio::signal::ctrl_c() => {
            res.context("failed to wait for Ctrl+C")?;
            info!("shutdown signal received");
        }
    }

    net.close().await?;
    Ok(CommandResult::Text("stopped".to_string()))
}

async fn dial(
    config: PathBuf,
    peer: PublicKey,
    port: u16,
    message: String,
    timeout: Duration,
) -> anyhow::Result<CommandResult> {
    let conf = load_node_config(&config)?;
    let net = Network::direct_only(conf)?;
    net.init(&CancellationToken::new()).await?;

    let cancel = CancellationToken::new();
    let timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };
    let result = net.dial(&cancel, NetworkType::Direct, peer, port).await;
    timer.abort();

    let reply = match result {
        Ok(conn) => exchange(conn, message.as_bytes()).await,
        Err(err) => Err(err.into()),
    };
    net.close().await?;
    Ok(CommandResult::Text(reply?))
}

/// Two nodes sharing an in-process mesh, also reachable over loopback TCP.
async fn demo() -> anyhow::Result<CommandResult> {
    let hub = MemoryHub::new();
    let alice = demo_node(&hub).await?;
    let bob = demo_node(&hub).await?;

    let bob_tcp = bob
        .direct()
        .and_then(|direct| direct.local_addr())
        .context("direct backend is not listening")?;
    if let Some(direct) = alice.direct() {
        direct.table().insert(bob.local_pk(), bob_tcp.to_string());
    }

    let mesh_listener = bob.listen(NetworkType::Mesh, SETUP_PORT).await?;
    let direct_listener = bob.listen(NetworkType::Direct, TRANSPORT_PORT).await?;
    let echoes = tokio::spawn(async move {
        tokio::join!(echo(mesh_listener), echo(direct_listener));
    });

    let cancel = CancellationToken::new();
    let mut replies = serde_json::Map::new();
    let routes = [
        (NetworkType::Mesh, SETUP_PORT),
        (NetworkType::Direct, TRANSPORT_PORT),
    ];
    for (network, port) in routes {
        let conn = alice.dial(&cancel, network, bob.local_pk(), port).await?;
        let route = format!("{} -> {}", conn.local_addr(), conn.remote_addr());
        let reply = exchange(conn, format!("hello over {}", network).as_bytes()).await?;
        replies.insert(network.to_string(), json!({ "route": route, "reply": reply }));
    }

    let health = json!({
        "alice": alice.health(),
        "bob": bob.health(),
    });

    alice.close().await?;
    bob.close().await?;
    echoes.abort();

    Ok(CommandResult::Json(json!({
        "replies": replies,
        "health": health,
    })))
}

async fn demo_node(hub: &MemoryHub) -> anyhow::Result<Network<MemoryBackend>> {
    let keys = KeyPair::generate();
    let mesh = MemoryBackend::new(hub, keys.public_key(), NetworkType::Mesh);
    let conf = NetworkConfig::new(keys)
        .with_mesh(MeshConfig {
            discovery_addr: "memory://demo".to_string(),
            min_sessions: 1,
        })
        .with_direct(DirectConfig {
            local_addr: Some("127.0.0.1:0".to_string()),
            ..DirectConfig::default()
        })
        .with_transport_networks([NetworkType::Mesh, NetworkType::Direct]);

    let net = Network::new(conf, Some(mesh))?;
    net.init(&CancellationToken::new()).await?;
    Ok(net)
}

/// Echoes every accepted connection until the listener closes.
async fn echo(listener: Listener) {
    loop {
        let conn = match listener.accept_conn().await {
            Ok(conn) => conn,
            Err(err) => {
                debug!(error = %err, "accept loop finished");
                return;
            }
        };
        tokio::spawn(async move {
            let remote = conn.remote_addr();
            let (mut reader, mut writer) = tokio::io::split(conn);
            match tokio::io::copy(&mut reader, &mut writer).await {
                Ok(bytes) => debug!(%remote, bytes, "echo finished"),
                Err(err) => debug!(%remote, error = %err, "echo failed"),
            }
        });
    }
}

/// Writes `message`, half-closes, and reads the peer's reply to the end.
async fn exchange(mut conn: network::Conn, message: &[u8]) -> anyhow::Result<String> {
    conn.write_all(message).await?;
    conn.shutdown().await?;
    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).await?;
    Ok(String::from_utf8_lossy(&reply).into_owned())
}
