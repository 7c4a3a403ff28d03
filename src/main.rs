use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use gtalk_sync::cli::Args;
use gtalk_sync::{AddKind, ChannelId, ChatClient, Credential, Message, Sender, SyncEvent};

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render(message: &Message) -> String {
    let time = chrono::DateTime::from_timestamp_millis(message.created_at_ms)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let line = format!(
        "[{}] {}: {}",
        time,
        message.sender.display_name.bold(),
        message.body
    );
    if message.is_optimistic() {
        line.dimmed().to_string()
    } else {
        line
    }
}

async fn print_events(
    client: ChatClient,
    channel_id: ChannelId,
    mut events: broadcast::Receiver<SyncEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            SyncEvent::ConnectionOpened => println!("{}", "* connected".green()),
            SyncEvent::ConnectionClosed { code } => {
                println!("{}", format!("* disconnected ({code})").yellow())
            }
            SyncEvent::HistoryLoaded { channel_id: loaded, count } if loaded == channel_id => {
                println!("{}", format!("* {count} earlier messages").cyan());
                for message in client.messages(&channel_id).iter() {
                    println!("{}", render(message));
                }
            }
            SyncEvent::MessageAdded {
                channel_id: added,
                message_id,
                kind,
            } if added == channel_id => {
                let timeline = client.messages(&channel_id);
                let Some(message) = timeline.iter().find(|m| m.id == message_id) else {
                    continue;
                };
                match kind {
                    AddKind::Confirmed => {}
                    AddKind::Optimistic | AddKind::Pushed => println!("{}", render(message)),
                }
            }
            SyncEvent::ProtocolError { message } => {
                println!("{}", format!("* server error: {message}").red())
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gtalk_sync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.resolve_config()?;
    let channel_id = ChannelId::from(args.channel.as_str());
    let me = Sender::new(args.user_id.as_str(), args.username.as_str());

    let client = ChatClient::start(config)?;
    let printer = tokio::spawn(print_events(
        client.clone(),
        channel_id.clone(),
        client.subscribe(),
    ));

    client.connect(Credential::new(args.token.clone()));
    if let Some(guild) = &args.guild {
        client.set_active_server(guild.as_str());
    }
    client.select_channel(Some(channel_id.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if client
                    .send_message(channel_id.clone(), me.clone(), line, Vec::new())
                    .await
                    .is_none()
                {
                    eprintln!("{}", "message not sent: not connected".red());
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect();
    client.shutdown();
    printer.abort();
    Ok(())
}
