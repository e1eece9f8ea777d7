use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use chatsync_channel::WsChannel;
use chatsync_engine::{EngineConfig, EngineHandle, HttpHistory, Session};
use chatsync_types::SessionIdentity;

mod input;
mod render;

use input::Line;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatsync=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Config
    let config = EngineConfig::from_env()?;
    let identity = identity_from_env()?;

    let history = HttpHistory::new(&config.api_base_url, config.request_timeout)?;
    match history.health().await {
        Ok(health) => info!("API at {}: {}", config.api_base_url, health.message),
        Err(e) => warn!("API at {} not healthy: {}", config.api_base_url, e),
    }

    let channel = WsChannel::new(config.ws_config());
    let session = Session::new();
    let engine = chatsync_engine::spawn(
        config,
        Arc::new(channel),
        Arc::new(history),
        session.subscribe(),
    );

    info!("signed in as {} ({})", identity.user_name, identity.user_id);
    session.login(identity);

    tokio::spawn(print_updates(engine.clone()));
    read_input(&engine).await?;

    session.logout();
    engine.shutdown().await;
    Ok(())
}

fn identity_from_env() -> anyhow::Result<SessionIdentity> {
    let var = |name: &str| std::env::var(name).with_context(|| format!("{} must be set", name));
    let user_id = var("CHATSYNC_USER_ID")?;
    let user_name = std::env::var("CHATSYNC_USER_NAME").unwrap_or_else(|_| user_id.clone());
    let token = var("CHATSYNC_TOKEN")?;
    Ok(SessionIdentity::new(user_id, user_name, token))
}

async fn read_input(engine: &EngineHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(raw) = lines.next_line().await? {
        match input::parse(&raw) {
            Line::Say(text) => {
                let scope = engine.snapshot().scope;
                engine.notify_typing(scope.clone());
                engine.send_message(text, scope);
            }
            Line::Scope(scope) => engine.select_scope(scope),
            Line::Who => println!("{}", render::who(&engine.snapshot())),
            Line::Reconnect => engine.reconnect(),
            Line::Help => println!("{}", input::HELP),
            Line::Quit => break,
            Line::Nothing => {}
            Line::Unknown(line) => println!("unknown command: {} (try /help)", line),
        }
    }
    Ok(())
}

async fn print_updates(engine: EngineHandle) {
    let mut view = engine.view();
    let mut notices = engine.notices();
    let mut shown = view.borrow_and_update().clone();

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = view.borrow_and_update().clone();
                for line in render::changes(&shown, &next) {
                    println!("{}", line);
                }
                shown = next;
            }
            notice = notices.recv() => match notice {
                Ok(notice) => println!("{}", render::notice(&notice)),
                Err(RecvError::Lagged(n)) => warn!("missed {} notices", n),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
