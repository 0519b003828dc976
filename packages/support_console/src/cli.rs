use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use support_sync::{HttpGateway, PersistenceGateway, SessionHandle, SyncConfig};

use crate::render::{Renderer, format_summary};

/// One line typed at the chat prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum ChatInput {
    Open(String),
    List,
    Refresh,
    Help,
    Quit,
    Send(String),
    Empty,
    Unknown(String),
}

pub fn parse_input(line: &str) -> ChatInput {
    let line = line.trim();
    if line.is_empty() {
        return ChatInput::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ChatInput::Send(line.to_string());
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match (name, arg) {
        ("open", id) if !id.is_empty() => ChatInput::Open(id.to_string()),
        ("list", "") => ChatInput::List,
        ("refresh", "") => ChatInput::Refresh,
        ("help", "") => ChatInput::Help,
        ("quit" | "exit", "") => ChatInput::Quit,
        // "//text" sends a message that starts with a slash
        _ if command.starts_with('/') => ChatInput::Send(command.to_string()),
        _ => ChatInput::Unknown(line.to_string()),
    }
}

const HELP: &str = "\
/open <id>   switch to a conversation
/list        show conversations
/refresh     reload conversations and the open history
/help        show this help
/quit        leave
//text       send a message that starts with a slash
anything else is sent to the open conversation";

/// Print the agent's conversations once and exit.
pub async fn list_command(config: &SyncConfig, json: bool) -> Result<()> {
    let gateway = HttpGateway::new(&config.gateway)?;
    let conversations = gateway
        .list_conversations(&config.agent.owner_id)
        .await
        .context("Failed to list conversations")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conversations)?);
    } else if conversations.is_empty() {
        println!("No conversations.");
    } else {
        for summary in &conversations {
            println!("{}", format_summary(summary));
        }
        println!("\n{} conversation(s)", conversations.len());
    }
    Ok(())
}

/// Print the merged configuration. The token is masked.
pub fn config_command(config: &SyncConfig) -> Result<()> {
    println!("{}", masked_config_toml(config)?);
    Ok(())
}

fn masked_config_toml(config: &SyncConfig) -> Result<String> {
    let mut shown = config.clone();
    if shown.gateway.token.is_some() {
        shown.gateway.token = Some("********".to_string());
    }
    toml::to_string_pretty(&shown).context("Failed to serialize configuration")
}

/// Interactive chat: store events are printed as they arrive, stdin lines
/// are commands or messages for the open conversation.
pub async fn chat_command(config: SyncConfig, conversation: Option<String>) -> Result<()> {
    let session = support_sync::connect(config)?;
    let result = chat_loop(&session, conversation).await;
    session.shutdown();
    result
}

async fn chat_loop(session: &SessionHandle, conversation: Option<String>) -> Result<()> {
    let mut events = session.subscribe();
    let mut renderer = Renderer::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    session.start()?;
    if let Some(id) = conversation {
        session.select(id)?;
    }
    println!("Type /help for commands.");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    for line in renderer.render(&event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Renderer fell behind the session");
                }
                Err(RecvError::Closed) => {
                    println!("[session closed]");
                    return Ok(());
                }
            },
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    debug!("stdin closed");
                    return Ok(());
                };
                match parse_input(&line) {
                    ChatInput::Empty => {}
                    ChatInput::Quit => return Ok(()),
                    ChatInput::Help => println!("{HELP}"),
                    ChatInput::Open(id) => session.select(id)?,
                    ChatInput::Refresh => session.refresh()?,
                    ChatInput::List => {
                        if renderer.conversations().is_empty() {
                            println!("No conversations.");
                        }
                        for summary in renderer.conversations() {
                            println!("{}", format_summary(summary));
                        }
                    }
                    ChatInput::Send(body) => {
                        if renderer.active().is_none() {
                            println!("Open a conversation first (/open <id>).");
                        } else {
                            session.send(body)?;
                        }
                    }
                    ChatInput::Unknown(text) => println!("Unknown command: {text}"),
                }
            }
        }
    }
}
