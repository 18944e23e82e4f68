//! Entry point for `rdt`.
//!
//! Parses CLI arguments and dispatches into **server**, **client** or
//! **channel** mode.  All protocol work is delegated to library modules;
//! `main.rs` owns only process setup (logging, signal handling, argument
//! parsing, printing results).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use rdt_udp::channel::{Channel, ChannelConfig, ChannelParams};
use rdt_udp::client::{Client, ClientConfig, DEFAULT_MSS};
use rdt_udp::sender::{average_time_to_ack, DEFAULT_MAX_ATTEMPTS};
use rdt_udp::server::{Server, ServerConfig};
use rdt_udp::sink::{DirSink, MemorySink, PayloadSink};
use rdt_udp::timer::TimerConfig;

/// TCP-like reliable byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log at debug level (RUST_LOG still takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

/// Fault-model parameters, shared by the channel and the client.
#[derive(Args, Debug, Clone)]
struct ChannelArgs {
    /// Base propagation delay in milliseconds.
    #[arg(long, default_value_t = 50)]
    sleep_v: u64,
    /// Maximum delay as a multiple of --sleep-v.
    #[arg(long, default_value_t = 4.0)]
    sleep_factor: f64,
    /// Probability of dropping a pure ACK from the server.
    #[arg(long, default_value_t = 0.0)]
    p_drop_server: f64,
    /// Probability of dropping a payload segment from the client.
    #[arg(long, default_value_t = 0.0)]
    p_drop_client: f64,
}

impl From<&ChannelArgs> for ChannelParams {
    fn from(args: &ChannelArgs) -> Self {
        Self {
            sleep_v: Duration::from_millis(args.sleep_v),
            sleep_factor: args.sleep_factor,
            p_drop_server: args.p_drop_server,
            p_drop_client: args.p_drop_client,
        }
    }
}

/// What the client sends.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Payload {
    /// Send this string.
    #[arg(short, long)]
    message: Option<String>,
    /// Send the contents of this file.
    #[arg(short, long)]
    file: Option<PathBuf>,
}

impl Payload {
    fn bytes(&self) -> Result<Vec<u8>> {
        match (&self.message, &self.file) {
            (Some(message), _) => Ok(message.clone().into_bytes()),
            (None, Some(path)) => {
                std::fs::read(path).with_context(|| format!("reading {}", path.display()))
            }
            (None, None) => anyhow::bail!("nothing to send"),
        }
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Run as a server, accepting one connection after another.
    Server {
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:5008")]
        bind: SocketAddr,
        /// Write received payload into this directory.
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Receive timeout in milliseconds.
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
        /// Maximum segment lifetime in milliseconds.
        #[arg(long, default_value_t = 5000)]
        msl_ms: u64,
    },
    /// Run as a client: connect, send one message, close.
    Client {
        /// Server (or channel) address.
        #[arg(short, long, default_value = "127.0.0.1:5007")]
        server: SocketAddr,
        #[command(flatten)]
        payload: Payload,
        /// Maximum segment size announced to the server (1-15).
        #[arg(long, default_value_t = DEFAULT_MSS)]
        mss: u8,
        /// Receive timeout in milliseconds; expiry triggers a resend.
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
        /// Timeouts tolerated per chunk before giving up on the peer.
        #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,
        /// Maximum segment lifetime in milliseconds.
        #[arg(long, default_value_t = 5000)]
        msl_ms: u64,
        #[command(flatten)]
        channel: ChannelArgs,
    },
    /// Run the lossy channel between client and server.
    Channel {
        /// Client-facing address to bind.
        #[arg(short, long, default_value = "0.0.0.0:5007")]
        listen: SocketAddr,
        /// Server address to relay to.
        #[arg(short, long, default_value = "127.0.0.1:5008")]
        server: SocketAddr,
        /// Bound on each relay receive, in milliseconds.
        #[arg(long, default_value_t = 3000)]
        recv_timeout_ms: u64,
        #[command(flatten)]
        channel: ChannelArgs,
    },
}

fn timers(timeout_ms: u64, msl_ms: u64) -> TimerConfig {
    TimerConfig {
        recv_timeout: Duration::from_millis(timeout_ms),
        msl: Duration::from_millis(msl_ms),
    }
}

async fn serve<S: PayloadSink>(config: ServerConfig, sink: S) -> Result<()> {
    let server = Server::bind(config, sink).await?;
    log::info!("Starting server on {}", server.local_addr());
    tokio::select! {
        res = server.run() => res.context("server stopped")?,
        _ = tokio::signal::ctrl_c() => log::info!("[server] interrupted, exiting"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match cli.mode {
        Mode::Server {
            bind,
            out,
            timeout_ms,
            msl_ms,
        } => {
            let config = ServerConfig {
                bind,
                timers: timers(timeout_ms, msl_ms),
            };
            match out {
                Some(dir) => {
                    let sink = DirSink::create(&dir)
                        .with_context(|| format!("creating {}", dir.display()))?;
                    serve(config, sink).await?;
                }
                None => serve(config, MemorySink::default()).await?,
            }
        }
        Mode::Client {
            server,
            payload,
            mss,
            timeout_ms,
            max_attempts,
            msl_ms,
            channel,
        } => {
            let message = payload.bytes()?;
            let config = ClientConfig {
                server,
                max_segment_size: mss,
                max_attempts,
                timers: timers(timeout_ms, msl_ms),
                channel: ChannelParams::from(&channel),
                ..ClientConfig::default()
            };
            log::info!("Starting client, connecting to {server}");

            let mut client = Client::bind(config).await?;
            client.connect().await.context("handshake failed")?;
            let records = client
                .send_reliable(&message)
                .await
                .context("transfer aborted")?;

            for (i, record) in records.iter().enumerate() {
                println!(
                    "chunk {i:>4}  {:>3} bytes  acked in {:.6}s",
                    record.chunk.len(),
                    record.time_to_ack.as_secs_f64()
                );
            }
            if let Some(avg) = average_time_to_ack(&records) {
                println!("average time to ack: {:.6}s", avg.as_secs_f64());
            }

            client.terminate().await.context("teardown failed")?;
        }
        Mode::Channel {
            listen,
            server,
            recv_timeout_ms,
            channel,
        } => {
            let config = ChannelConfig {
                listen,
                server,
                params: ChannelParams::from(&channel),
                recv_timeout: Duration::from_millis(recv_timeout_ms),
                ..ChannelConfig::default()
            };
            let channel = Channel::bind(config).await?;
            let handle = channel.handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("[channel] interrupted, shutting down");
                    handle.shutdown();
                }
            });

            let stats = channel.run().await;
            log::info!(
                "[channel] finished after {} rounds; dropped {} client messages, {} server acks",
                stats.rounds,
                stats.client_msg_drop_count,
                stats.server_ack_drop_count
            );
        }
    }

    Ok(())
}
