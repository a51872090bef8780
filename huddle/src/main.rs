//! `huddle`: headless line-oriented chat client.
//!
//! Connects to a server, keeps the sync engine running and prints what
//! changes. Lines typed on stdin are sent to the open channel; lines
//! starting with `/` are commands (`/help` lists them). Configuration via
//! CLI flags, environment variables, or config file
//! (`~/.config/huddle/config.toml`).
//!
//! ```bash
//! cargo run --bin huddle -- --ws-url ws://127.0.0.1:9000/ws \
//!     --api-url http://127.0.0.1:9000 --user-id 1 --username alice
//! ```

use std::io;
use std::path::Path;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing_appender::non_blocking::WorkerGuard;

use huddle::config::{CliArgs, ClientConfig};
use huddle::net::{self, NetCommand, NetEvent};
use huddle::sync::{ChannelView, SyncEvent};
use huddle_proto::ids::{ChannelId, MessageId};

const HELP: &str = "\
/list                 channels with unread counts
/open <channel>       open a channel
/close                close the open channel
/older                load older history
/show                 print the open channel
/reply <msg> <text>   reply to a message
/react <msg> <emoji>  toggle a reaction
/retry <msg>          resend a failed message
/typing               signal typing
/board                mark shared documents seen
/quit                 exit";

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("huddle starting");

    let net_config = config.to_net_config().map_err(io::Error::other)?;
    let (cmd_tx, evt_rx) = net::spawn_sync(net_config).map_err(io::Error::other)?;

    let result = run(cmd_tx, evt_rx).await;
    tracing::info!("huddle exiting");
    result
}

/// Initialize file-based logging, keeping stdout for chat output.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("huddle.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// What the user typed.
#[derive(Debug)]
enum Input {
    Command(NetCommand),
    List,
    Show,
    Help,
    Quit,
    Invalid(&'static str),
}

async fn run(cmd_tx: mpsc::Sender<NetCommand>, mut evt_rx: mpsc::Receiver<NetEvent>) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut active: Option<ChannelId> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line, active) {
                    Input::Command(cmd) => {
                        if cmd_tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Input::List => print_channels(&cmd_tx).await,
                    Input::Show => {
                        if let Some(channel_id) = active {
                            print_view(&cmd_tx, channel_id).await;
                        }
                    }
                    Input::Help => println!("{HELP}"),
                    Input::Quit => break,
                    Input::Invalid(reason) => println!("! {reason}"),
                }
            }
            event = evt_rx.recv() => {
                let Some(event) = event else { break };
                if let NetEvent::Sync(SyncEvent::ActiveChannelChanged { channel_id }) = &event {
                    active = *channel_id;
                }
                if let Some(text) = describe(&event) {
                    println!("{text}");
                }
            }
        }
    }

    let _ = cmd_tx.send(NetCommand::Shutdown).await;
    Ok(())
}

fn parse_input(line: &str, active: Option<ChannelId>) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Invalid("empty line");
    }
    let Some(command) = line.strip_prefix('/') else {
        return active.map_or(Input::Invalid("no channel open, use /open <id>"), |channel_id| {
            Input::Command(NetCommand::Send {
                channel_id,
                content: line.to_string(),
                parent_id: None,
            })
        });
    };

    let mut parts = command.splitn(3, ' ');
    let name = parts.next().unwrap_or_default();
    let first = parts.next();
    let rest = parts.next();

    match name {
        "list" => Input::List,
        "show" => Input::Show,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        "close" => Input::Command(NetCommand::CloseChannel),
        "older" => Input::Command(NetCommand::LoadOlder),
        "typing" => Input::Command(NetCommand::SetTyping(true)),
        "board" => Input::Command(NetCommand::VisitBoard),
        "open" => match parse_id(first) {
            Some(id) => Input::Command(NetCommand::OpenChannel(ChannelId(id))),
            None => Input::Invalid("usage: /open <channel>"),
        },
        "retry" => match parse_id(first) {
            Some(id) => Input::Command(NetCommand::Retry(MessageId(id))),
            None => Input::Invalid("usage: /retry <msg>"),
        },
        "react" => match (parse_id(first), rest) {
            (Some(id), Some(emoji)) => Input::Command(NetCommand::ToggleReaction {
                message_id: MessageId(id),
                emoji: emoji.trim().to_string(),
            }),
            _ => Input::Invalid("usage: /react <msg> <emoji>"),
        },
        "reply" => match (active, parse_id(first), rest) {
            (Some(channel_id), Some(id), Some(text)) => Input::Command(NetCommand::Send {
                channel_id,
                content: text.to_string(),
                parent_id: Some(MessageId(id)),
            }),
            (None, ..) => Input::Invalid("no channel open, use /open <id>"),
            _ => Input::Invalid("usage: /reply <msg> <text>"),
        },
        _ => Input::Invalid("unknown command, try /help"),
    }
}

fn parse_id(token: Option<&str>) -> Option<i64> {
    token?.trim().parse().ok()
}

async fn print_channels(cmd_tx: &mpsc::Sender<NetCommand>) {
    let (reply, rx) = oneshot::channel();
    if cmd_tx.send(NetCommand::Channels { reply }).await.is_err() {
        return;
    }
    let Ok(list) = rx.await else { return };
    for (channel, unread) in list {
        let pin = if channel.pinned { "*" } else { " " };
        println!(
            "{pin} #{} {} ({unread} unread, {} online)",
            channel.id, channel.name, channel.online_count
        );
    }
}

async fn print_view(cmd_tx: &mpsc::Sender<NetCommand>, channel_id: ChannelId) {
    let (reply, rx) = oneshot::channel();
    if cmd_tx
        .send(NetCommand::View { channel_id, reply })
        .await
        .is_err()
    {
        return;
    }
    let Ok(view) = rx.await else { return };
    println!("{}", render_view(&view));
}

fn render_view(view: &ChannelView) -> String {
    let mut out = String::new();
    if let Some(channel) = &view.channel {
        out.push_str(&format!("== #{} {} ==\n", channel.id, channel.name));
    }
    if view.exhausted {
        out.push_str("(start of history)\n");
    }
    for message in &view.messages {
        out.push_str(&format!(
            "[{}] {}: {} ({:?})\n",
            message.id,
            message.author_name.as_deref().unwrap_or("?"),
            message.body,
            message.delivery
        ));
    }
    if !view.typing.is_empty() {
        let names: Vec<&str> = view.typing.iter().map(|t| t.display_name.as_str()).collect();
        out.push_str(&format!("{} typing...\n", names.join(", ")));
    }
    out.push_str(&format!("{} unread", view.unread));
    out
}

fn describe(event: &NetEvent) -> Option<String> {
    match event {
        NetEvent::Connection(status) => Some(format!("~ {}", status.state)),
        NetEvent::Error(e) => Some(format!("! {e}")),
        NetEvent::Sync(event) => match event {
            SyncEvent::ActiveChannelChanged {
                channel_id: Some(id),
            } => Some(format!("~ opened #{id}")),
            SyncEvent::UnreadChanged { channel_id, count } if *count > 0 => {
                Some(format!("~ #{channel_id}: {count} unread"))
            }
            SyncEvent::MessageConfirmed { temp_id, id, .. } => {
                Some(format!("~ message {temp_id} delivered as {id}"))
            }
            SyncEvent::PresenceChanged { user_id, online } => Some(format!(
                "~ user {user_id} is {}",
                if *online { "online" } else { "offline" }
            )),
            SyncEvent::Notify(n) => Some(format!("* {}: {}", n.title, n.body)),
            _ => None,
        },
    }
}
