//! platewise-chat: a line-oriented terminal client.
//!
//! Each stdin line is sent as one turn. `/quit` exits.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use platewise_client::{ConnectionSupervisor, FrameKind, MessageCallback, ReceivedMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "platewise-chat", about = "Chat with a Platewise server")]
struct Cli {
    /// WebSocket endpoint of the server
    #[arg(long, env = "PLATEWISE_ENDPOINT", default_value = "ws://127.0.0.1:4000/ws")]
    endpoint: String,

    /// Identity to chat as
    #[arg(long, env = "PLATEWISE_IDENTITY")]
    identity: String,
}

fn render(message: ReceivedMessage) {
    let mut out = std::io::stdout().lock();
    let _ = match message.kind {
        FrameKind::Message => writeln!(out, "platewise> {}", message.content),
        FrameKind::System => writeln!(out, "* {}", message.content),
        FrameKind::Error => writeln!(out, "! {}", message.content),
        FrameKind::StreamStart => write!(out, "platewise> "),
        FrameKind::StreamChunk => write!(out, "{}", message.content),
        FrameKind::StreamEnd => writeln!(out),
    };
    let _ = out.flush();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let on_message: MessageCallback = Arc::new(render);
    let supervisor = ConnectionSupervisor::new(&cli.endpoint, &cli.identity, on_message)
        .context("invalid endpoint")?;
    supervisor.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if !supervisor.send(line) {
                    eprintln!("! not connected; message not sent");
                    if !supervisor.has_pending_retry() {
                        supervisor.connect();
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    supervisor.shutdown();
    // Let the close frame go out.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Ok(())
}
