use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chat_transport::{
    AuthClass, ChatFileConfig, ChatRequest, Collaborators, ConnectionEvent, ConnectionManager,
    DispatchOutcome, ManualSignals, MessageDispatch, RequestAuth, StaticCredentials,
    TransportConfig, WebSocketConnector, load_config,
};
use clap::Parser;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "chat-probe")]
#[command(about = "Hold chat connections open and log their lifecycle")]
struct Args {
    /// TOML config file, layered under CHAT_* environment variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the chat server base URL
    #[arg(long)]
    url: Option<String>,

    #[arg(long, env = "CHAT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "CHAT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Behave like a backgrounded app instead of a foregrounded one
    #[arg(long)]
    background: bool,

    /// GET this path once connected (repeatable)
    #[arg(long = "request", value_name = "PATH")]
    requests: Vec<String>,
}

/// Acks everything, logging what arrived.
struct AckAll;

impl MessageDispatch for AckAll {
    fn process(
        &self,
        envelope: Vec<u8>,
        delivery_timestamp: u64,
    ) -> BoxFuture<'static, DispatchOutcome> {
        info!(bytes = envelope.len(), delivery_timestamp, "message pushed");
        futures::future::ready(DispatchOutcome::ShouldAck).boxed()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chat_transport=info,chat_probe=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let args = Args::parse();

    let mut file_config: ChatFileConfig = load_config(args.config.as_deref())
        .extract()
        .context("Failed to load chat config")?;
    if let Some(url) = args.url {
        file_config.transport.chat_url = url;
    }
    let config = TransportConfig::from_file(&file_config);

    let credentials = match (args.username, args.password) {
        (Some(username), Some(password)) => StaticCredentials::new(username, password),
        (None, None) => StaticCredentials::default(),
        _ => anyhow::bail!("--username and --password must be given together"),
    };
    let registered = credentials.0.is_some();

    let signals = Arc::new(ManualSignals::ready());
    signals.set_registered(registered);
    signals.set_foreground(!args.background);

    let connector = Arc::new(
        WebSocketConnector::new(config.chat_url.clone())
            .with_connect_timeout(config.request_timeout),
    );
    let manager = Arc::new(ConnectionManager::start(
        config,
        Collaborators::new(signals.clone(), Arc::new(credentials), Arc::new(AckAll), connector),
    ));

    let mut events = manager.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::StateChanged { class, state }) => {
                    info!(%class, %state, "connection state");
                }
                Ok(ConnectionEvent::InitialQueueEmptied { class }) => {
                    info!(%class, "initial queue emptied");
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let tokens = manager.request_connections();

    let auth = if registered {
        RequestAuth::Identified
    } else {
        RequestAuth::Anonymous
    };
    for path in args.requests {
        let manager = manager.clone();
        let auth = auth.clone();
        tokio::spawn(async move {
            match manager.make_request(ChatRequest::get(path.clone(), auth)).await {
                Ok(response) => info!(
                    %path,
                    status = response.status,
                    bytes = response.body.as_ref().map_or(0, Vec::len),
                    "request succeeded"
                ),
                Err(e) => warn!(%path, "request failed: {e}"),
            }
        });
    }

    if registered {
        info!(state = %manager.connection_state(AuthClass::Identified), "waiting for Ctrl-C");
    } else {
        info!("no credentials, only the unidentified connection will open");
    }
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!(metrics = ?manager.metrics(), "shutting down");
    drop(tokens);
    manager.shutdown().await;
    logger.abort();
    Ok(())
}
