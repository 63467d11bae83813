#![deny(dead_code)]
use anyhow::Result;
use clap::Parser;
use log::{debug, error, info, LevelFilter};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

mod utils;

use chatsync::chat::{ChatClient, ClientUpdate, Command, ConnectionStatus, EventKind};
use chatsync::config::{self, ChatConfig};
use chatsync::models::Notice;

/// Command line arguments for chatsync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatsync: a terminal client for the real-time chat socket.",
    long_about = "chatsync keeps a conversation timeline, presence and typing indicators in sync \
    over a single websocket.\n\n\
    Commands once connected:\n\
    /join <conversation>   switch to an existing conversation\n\
    /to <user>             start a new conversation with a user\n\
    /delete <message id>   delete one of your recent messages\n\
    /inbox                 request the inbox listing\n\
    /leave                 leave the current conversation\n\
    /quit                  exit\n\
    Any other line is sent as a message."
)]
struct Args {
    /// Path to the JSON config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Websocket endpoint, e.g. ws://localhost:8080/ws
    #[arg(long)]
    endpoint: Option<String>,

    /// Local user id
    #[arg(long)]
    user: Option<String>,

    /// Auth token appended to the endpoint
    #[arg(long)]
    token: Option<String>,

    /// Conversation to join on startup
    #[arg(long)]
    conversation: Option<String>,

    /// Start a new conversation with this user
    #[arg(long, conflicts_with = "conversation")]
    to: Option<String>,

    /// Keep retrying after an established session drops
    #[arg(long)]
    reconnect: bool,

    /// Log file (defaults to chatsync.log)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<ChatConfig> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };
    let mut config = config::load_config(&path)?;
    config.apply_env();

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(user) = &args.user {
        config.user_id = user.clone();
    }
    if let Some(token) = &args.token {
        config.auth_token = Some(token.clone());
    }
    if args.reconnect {
        config.reconnect_after_established = true;
    }
    config.validate()?;
    Ok(config)
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (head, rest) = match line.split_once(' ') {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    let command = match head {
        "/quit" | "/exit" => Command::Quit,
        "/join" if !rest.is_empty() => Command::Open(rest.to_string()),
        "/to" if !rest.is_empty() => Command::StartWith(rest.to_string()),
        "/delete" if !rest.is_empty() => Command::Delete(rest.to_string()),
        "/inbox" => Command::RequestInbox,
        "/leave" => Command::Leave,
        _ if head.starts_with('/') => {
            eprintln!("Unknown command: {}", head);
            return None;
        }
        _ => Command::SendText(line.to_string()),
    };
    Some(command)
}

fn print_update(update: ClientUpdate) {
    match update {
        ClientUpdate::Status(ConnectionStatus::GaveUp) => {
            println!("*** Could not reach the chat server, giving up");
        }
        ClientUpdate::Status(status) => println!("*** {:?}", status),
        ClientUpdate::Timeline(messages) => {
            println!("----------------------------------------");
            for message in &messages {
                println!("{}", utils::format_message(message));
            }
        }
        ClientUpdate::Typing(users) if users.is_empty() => {}
        ClientUpdate::Typing(users) => println!("... {} typing", users.join(", ")),
        ClientUpdate::Presence(records) => {
            for record in records {
                let name = record.display_name.as_deref().unwrap_or(&record.user_id);
                let state = if record.is_online { "online" } else { "offline" };
                println!("*** {} is {}", name, state);
            }
        }
        ClientUpdate::Inbox(conversations) => {
            println!("Inbox:");
            for summary in conversations {
                println!(
                    "  {} {} ({} unread) {}",
                    summary.conversation_id,
                    summary.counterpart_name.as_deref().unwrap_or("-"),
                    summary.unread_count,
                    summary.last_message.as_deref().unwrap_or("")
                );
            }
        }
        ClientUpdate::Notice(Notice::Info(text)) => println!("*** {}", text),
        ClientUpdate::Notice(Notice::Error(text)) => eprintln!("!!! {}", text),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file_path = args.log_file.clone().unwrap_or_else(|| PathBuf::from("chatsync.log"));
    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    utils::setup_logging(Some(&log_file_path), level)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            eprintln!("Invalid configuration: {}", e);
            return Err(e);
        }
    };
    println!("Connecting to {} as {}...", config.endpoint, config.user_id);

    let mut client = ChatClient::new(config, args.conversation.clone(), args.to.clone());
    client.dispatcher_mut().subscribe(EventKind::Fallback, |event| {
        debug!("Unhandled frame: {:?}", event);
    });

    let (command_tx, command_rx) = mpsc::channel::<Command>(64);
    let (update_tx, mut update_rx) = mpsc::unbounded_channel::<ClientUpdate>();
    let client_task = tokio::spawn(client.run(command_rx, update_tx));

    let input_tx = command_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    let _ = input_tx.send(Command::Quit).await;
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    let _ = input_tx.send(Command::Quit).await;
                    break;
                }
            };
            let Some(command) = parse_command(&line) else {
                continue;
            };
            let quit = matches!(command, Command::Quit);
            if matches!(command, Command::SendText(_)) && input_tx.send(Command::Input).await.is_err() {
                break;
            }
            if input_tx.send(command).await.is_err() || quit {
                break;
            }
        }
    });
    drop(command_tx);

    while let Some(update) = update_rx.recv().await {
        print_update(update);
    }

    match client_task.await {
        Ok(result) => result?,
        Err(e) => error!("Chat client task failed: {}", e),
    }
    info!("Goodbye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert!(parse_command("   ").is_none());
        assert!(matches!(parse_command("/quit"), Some(Command::Quit)));
        assert!(matches!(parse_command("/join c42"), Some(Command::Open(id)) if id == "c42"));
        assert!(matches!(parse_command("/to u7"), Some(Command::StartWith(id)) if id == "u7"));
        assert!(matches!(parse_command("/delete m9"), Some(Command::Delete(id)) if id == "m9"));
        assert!(matches!(parse_command("hello there"), Some(Command::SendText(t)) if t == "hello there"));
        assert!(parse_command("/bogus").is_none());
        // Bare /join without an argument is not a command
        assert!(parse_command("/join").is_none());
    }
}
