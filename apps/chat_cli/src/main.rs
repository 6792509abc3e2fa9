use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{
    load_config, ChatEvent, DeliveryCoordinator, HttpChatApi, SelectOutcome, SendOutcome,
    StompConnector, StoreEvent,
};
use shared::domain::{Credentials, Message, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// TOML file layered over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    user_id: i64,
    #[arg(long, env = "CHAT_TOKEN")]
    token: Option<String>,
    #[arg(long)]
    login: Option<String>,
    #[arg(long)]
    passcode: Option<String>,
    #[arg(long)]
    broker_url: Option<String>,
    #[arg(long)]
    api_url: Option<String>,
    /// Open this conversation right away instead of listing the roster.
    #[arg(long)]
    recipient: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(url) = args.broker_url {
        config.broker_url = url;
    }
    if let Some(url) = args.api_url {
        config.api_base_url = url;
    }
    let credentials = Credentials {
        token: args.token,
        login: args.login,
        passcode: args.passcode,
    };

    let self_id = UserId(args.user_id);
    let api = Arc::new(HttpChatApi::new(config.api_base_url.clone(), &credentials));
    let coordinator = DeliveryCoordinator::start(
        self_id,
        &config,
        &credentials,
        Arc::new(StompConnector::new(config.heartbeat_interval)),
        api.as_ref(),
        api.clone(),
    )
    .await?;

    let roster = coordinator.roster().await;
    if roster.is_empty() {
        bail!("no correspondents available for user {self_id}");
    }
    println!("Correspondents:");
    for correspondent in &roster {
        println!("  {:>6}  {}", correspondent.id, correspondent.full_name());
    }

    spawn_printers(&coordinator);

    if let Some(recipient) = args.recipient {
        open(&coordinator, UserId(recipient)).await;
    }
    println!("Type '/open <id>' to switch conversation, '/quit' to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line == "/quit" {
            break;
        }
        if let Some(id) = line.strip_prefix("/open ") {
            match id.trim().parse::<i64>() {
                Ok(id) => open(&coordinator, UserId(id)).await,
                Err(_) => println!("not a user id: {id}"),
            }
            continue;
        }
        match coordinator.send(&line).await {
            Ok(SendOutcome::Sent(_)) if !coordinator.can_send().await => {
                println!("(offline: message kept locally)");
            }
            Ok(_) => {}
            Err(err) => println!("{err}"),
        }
    }

    coordinator.disconnect().await;
    Ok(())
}

async fn open(coordinator: &Arc<DeliveryCoordinator>, recipient_id: UserId) {
    match coordinator.select(recipient_id).await {
        Ok(SelectOutcome::Opened(selection)) => {
            println!("--- {} ---", selection.full_name);
            for message in coordinator.messages().await {
                print_message(coordinator.self_id(), &message);
            }
        }
        Ok(SelectOutcome::AlreadySelected) => {}
        Ok(SelectOutcome::Superseded) => {}
        Err(err) => println!("{err}"),
    }
}

fn spawn_printers(coordinator: &Arc<DeliveryCoordinator>) {
    let self_id = coordinator.self_id();
    let mut store_events = coordinator.subscribe_store();
    tokio::spawn(async move {
        loop {
            match store_events.recv().await {
                Ok(StoreEvent::Appended(message)) if message.sender_id != self_id => {
                    print_message(self_id, &message);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "message display fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut events = coordinator.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ChatEvent::ConnectionChanged { online } => {
                    println!("[{}]", if online { "online" } else { "offline" });
                }
                ChatEvent::LoadFailed { recipient_id, reason } => {
                    println!("[could not load conversation {recipient_id}: {reason}]");
                }
                _ => {}
            }
        }
    });
}

fn print_message(self_id: UserId, message: &Message) {
    let who = if message.sender_id == self_id {
        "me".to_string()
    } else {
        message.sender_id.to_string()
    };
    match message.sent_at() {
        Some(at) => println!("[{}] {who}> {}", at.format("%H:%M"), message.content),
        None => println!("{who}> {}", message.content),
    }
}
