//! Interactive terminal client for the finance assistant.
//!
//! Run with: cargo run -p finchat-cli -- <user-id>
//!
//! Reads `~/.config/finchat/config.json` (if present) and `FINCHAT_*`
//! environment overrides, then chats over the socket, falling back to HTTP.
//! Type `/help` for commands.

use anyhow::Context;
use finchat_core::{ChatMessage, ChatMode, Role, TranscriptEvent, TransportConfig};
use finchat_transport::ChatTransport;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
Commands:
  /clear              clear conversation history
  /realtime on|off    toggle the live socket (off = HTTP only)
  /mode agent|gemini  choose the HTTP chat endpoint
  /status             show connection and assistant status
  /summary            show what the server remembers
  /quit               exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they don't interleave with the transcript
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let config = TransportConfig::load().context("failed to load configuration")?;
    let user_id = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FINCHAT_USER").ok())
        .unwrap_or_else(|| "demo-user".to_string());

    tracing::info!(api = config.api_base(), user_id = %user_id, mode = %config.mode, "starting chat");
    let transport = ChatTransport::from_config(config, user_id.clone())
        .context("failed to build HTTP client")?;
    transport.connect(&user_id);

    let mut transcript = transport.transcript().history_plus_stream();
    let printer = tokio::spawn(async move {
        while let Some(event) = transcript.next().await {
            match event {
                TranscriptEvent::Appended(msg) => print_message(&msg),
                TranscriptEvent::Reset(msg) => {
                    println!("--- history cleared ---");
                    print_message(&msg);
                }
            }
        }
    });

    let mut connection = transport.watch_connection();
    let watcher = tokio::spawn(async move {
        while connection.changed().await.is_ok() {
            let state = *connection.borrow_and_update();
            tracing::info!(?state, "connection state changed");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let Some(command) = line.strip_prefix('/') else {
            transport.send(line).await;
            continue;
        };

        let mut parts = command.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("quit" | "exit"), _) => break,
            (Some("help"), _) => println!("{HELP}"),
            (Some("clear"), _) => transport.clear_history().await,
            (Some("realtime"), Some("on")) => transport.enable(),
            (Some("realtime"), Some("off")) => transport.disable(),
            (Some("mode"), Some(mode)) => match mode.parse::<ChatMode>() {
                Ok(mode) => transport.set_mode(mode),
                Err(e) => println!("{e}"),
            },
            (Some("status"), _) => {
                println!(
                    "socket: {:?} (real-time {}), mode: {}, reconnect attempts: {}",
                    transport.connection_state(),
                    if transport.is_realtime_enabled() { "on" } else { "off" },
                    transport.mode(),
                    transport.reconnect_attempts(),
                );
                match transport.service_status().await {
                    Ok(status) => println!("assistant: {}", status.message),
                    Err(e) => println!("assistant status unavailable: {e}"),
                }
            }
            (Some("summary"), _) => match transport.conversation_summary().await {
                Ok(summary) => println!(
                    "{} messages remembered; topics: {}",
                    summary.message_count,
                    summary.conversation_topics.join(", ")
                ),
                Err(e) => println!("summary unavailable: {e}"),
            },
            _ => println!("{HELP}"),
        }
    }

    transport.dispose();
    printer.abort();
    watcher.abort();
    Ok(())
}

fn print_message(msg: &ChatMessage) {
    let who = match msg.role() {
        Role::User => "you",
        Role::Bot => "assistant",
        Role::System => "system",
    };
    println!("[{who}] {}", msg.content());
    for insight in msg.insights() {
        println!("    * {insight}");
    }
}
