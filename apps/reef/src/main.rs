use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reef_client_core::config::Config;
use reef_client_core::session::{
    ConnectionManager, EditorSink, SessionRouter, StaticAuth,
};
use reef_client_core::storage::LayeredStorage;
use reef_client_core::transport::websocket::WebSocketDialer;

use reef_proto::{ChatEntry, ConversationEntry, Participant};

#[derive(Parser, Debug)]
#[command(name = "reef", about = "Join a collaborative pattern session")]
struct Cli {
    /// Session id to join.
    session_id: String,

    /// Session server address (overrides REEF_SESSION_SERVER).
    #[arg(long)]
    server: Option<String>,

    /// Auth token; omit to join anonymously.
    #[arg(long, env = "REEF_TOKEN")]
    token: Option<String>,
}

/// Logs everything the editor store would render. The CLI has no editor;
/// this stands in for it.
struct LoggingSink;

impl EditorSink for LoggingSink {
    fn set_code(&self, code: &str, is_remote: bool) {
        info!(is_remote, lines = code.lines().count(), "editor code updated");
        println!("{code}");
    }
    fn set_conversation_history(&self, entries: &[ConversationEntry]) {
        info!(turns = entries.len(), "conversation history rehydrated");
    }
    fn set_chat_history(&self, entries: &[ChatEntry]) {
        info!(messages = entries.len(), "chat history rehydrated");
    }
    fn chat_received(&self, entry: &ChatEntry) {
        println!("[chat] {}: {}", entry.from, entry.content);
    }
    fn participant_joined(&self, participant: &Participant) {
        println!("[session] {} joined", participant.id);
    }
    fn participant_left(&self, participant_id: &str) {
        println!("[session] {participant_id} left");
    }
    fn set_playing(&self, playing: bool) {
        println!("[session] playback {}", if playing { "started" } else { "stopped" });
    }
    fn session_ended(&self, reason: Option<&str>) {
        println!("[session] ended{}", reason.map(|r| format!(": {r}")).unwrap_or_default());
    }
    fn session_error(&self, message: &str) {
        eprintln!("[session] error: {message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config.session_server = server;
    }

    let dialer = WebSocketDialer::new(&config.session_server, &cli.session_id);
    info!(url = dialer.url(), "joining session");

    let storage = LayeredStorage::in_memory();
    let manager = Arc::new(ConnectionManager::new(config.clone(), Box::new(dialer)));
    let router = Arc::new(SessionRouter::new(
        &config,
        storage,
        Arc::new(LoggingSink),
        Arc::new(StaticAuth::new(cli.token)),
        &manager,
    ));

    manager.connect(router);
    manager.once_connected().await;
    info!("connected");

    tokio::signal::ctrl_c().await?;
    manager.disconnect();
    Ok(())
}
