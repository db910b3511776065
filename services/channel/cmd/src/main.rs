//! RPC channel node binary.
//!
//! Runs an echo server, a client driver, or both over one channel.

use anyhow::Context;
use channel_session::{
    ChannelEvent, Message, Payload, RpcChannel, SessionId, StreamSource, TcpChannel,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod logging;
mod config;
mod echo;

use config::NodeConfig;
use echo::EchoHandler;
use logging::ChannelLogFormatter;

/// Session-oriented RPC channel node
#[derive(Parser, Debug)]
#[command(name = "channel-node", version, about = "Session-oriented RPC channel node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Serve echo requests on this address, e.g. 0.0.0.0:9000
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Connect to this address and send requests
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Number of messages the client sends
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Attach this file to every message as a side-channel stream
    #[arg(long)]
    send_file: Option<PathBuf>,

    /// Send one-way datagrams instead of requests
    #[arg(long)]
    oneway: bool,

    /// Per-call timeout, e.g. 5s
    #[arg(long)]
    timeout: Option<humantime::Duration>,

    /// Folder for received streams
    #[arg(long)]
    temp_folder: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("channel_node={}", args.log_level).parse()?)
        .add_directive(format!("channel_session={}", args.log_level).parse()?)
        .add_directive(format!("channel_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(ChannelLogFormatter::new("channel"))
        .init();

    info!("Starting channel node v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config);

    if let Some(listen) = args.listen {
        node_config.channel.listen_addr = listen;
    }
    if let Some(timeout) = args.timeout {
        node_config.channel.default_timeout = timeout.into();
    }
    if let Some(folder) = &args.temp_folder {
        node_config.channel.temp_stream_folder = folder.clone();
    }
    let connect = args.connect.or(node_config.channel.remote_endpoint);
    let serve = args.listen.is_some() || connect.is_none();

    let channel = TcpChannel::new(node_config.channel.clone())
        .context("Invalid channel configuration")?;
    tokio::spawn(log_session_events(channel.subscribe()));

    if serve {
        channel.set_message_handler(Arc::new(EchoHandler)).await;
        let addr = channel
            .start_listening()
            .await
            .context("Failed to start listening")?;
        component_info!("server", "Echo server listening on {}", addr);
    }

    if let Some(endpoint) = connect {
        let outcome = run_client(&channel, endpoint, &args).await;
        if let Err(e) = &outcome {
            component_error!("client", "Client run failed: {:#}", e);
        }
        if !serve {
            channel.shutdown().await;
            return outcome;
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, shutting down");

    channel.shutdown().await;
    info!("Channel node shutdown complete");
    Ok(())
}

async fn run_client(channel: &TcpChannel, endpoint: SocketAddr, args: &Args) -> anyhow::Result<()> {
    let session_id = channel
        .connect_to(endpoint)
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;
    component_info!("client", "Connected to {} as session {}", endpoint, session_id);

    let timeout = args.timeout.map(Duration::from);
    for i in 0..args.count {
        let message = build_message(i, args).await?;
        let correlation_id = message.correlation_id.clone();
        let started = Instant::now();

        let response = channel
            .send_message(&session_id, message, timeout)
            .await
            .with_context(|| format!("Message {} on session {} failed", correlation_id, session_id))?;

        report(&session_id, &correlation_id, started.elapsed(), response);
    }

    channel.disconnect(&session_id).await;
    Ok(())
}

async fn build_message(index: u32, args: &Args) -> anyhow::Result<Message> {
    let mut message = if args.oneway {
        Message::oneway("echo")
    } else {
        Message::request("echo")
    };
    message = message.with_inline(format!("ping {}", index));

    if let Some(path) = &args.send_file {
        let source = StreamSource::from_file(path)
            .await
            .with_context(|| format!("Failed to open {:?}", path))?;
        message = message.with_stream(source);
    }
    Ok(message)
}

fn report(session_id: &SessionId, correlation_id: &str, elapsed: Duration, response: Option<Message>) {
    match response {
        Some(response) if response.is_error() => {
            component_warn!(
                "client",
                "Request {} on session {} failed remotely after {:?}: {}",
                correlation_id,
                session_id,
                elapsed,
                response.error.unwrap_or_default()
            );
        }
        Some(response) => {
            let text = response
                .return_value
                .as_ref()
                .and_then(Payload::as_inline)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            component_info!(
                "client",
                "Request {} answered in {:?}: {}",
                correlation_id,
                elapsed,
                text
            );
        }
        None => component_info!("client", "Message {} sent in {:?}", correlation_id, elapsed),
    }
}

async fn log_session_events(mut events: broadcast::Receiver<ChannelEvent>) {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::SessionStateChange {
                session_id,
                connected,
            }) => {
                component_info!(
                    "session",
                    "Session {} {}",
                    session_id,
                    if connected { "connected" } else { "disconnected" }
                );
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Missed {} session events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
