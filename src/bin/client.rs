use presence_sync::{
    channel::RemoteProvider,
    config::PresenceConfig,
    identity::{Identity, StaticIdentity},
    lifecycle::{PresenceController, PresenceHandle, Visibility},
    presence::{PresenceState, PresenceStatus},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal::ctrl_c,
    sync::watch,
};

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/ws";

const HELP: &str = "commands: /typing /idle /hide /show /room [id] /who /quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // usage: client [user_id] [room_id] [relay_url]
    let mut args = std::env::args().skip(1);
    let user_id = args
        .next()
        .unwrap_or_else(|| format!("guest-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    let room_id = args.next();
    let url = args.next().unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

    tracing::info!(%user_id, ?room_id, "Connecting to {}", url);
    let provider = RemoteProvider::connect(&url).await?;

    let handle = PresenceController::spawn(
        provider,
        StaticIdentity::new(Identity::new(user_id.clone()).with_name(user_id.clone())),
        PresenceConfig::default(),
        room_id,
        Visibility::Visible,
    );

    let printer = tokio::spawn(print_changes(handle.state()));
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&handle, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            result = ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
                tracing::info!("Ctrl+C received, leaving presence...");
                break;
            }
        }
    }

    handle.shutdown().await;
    printer.abort();
    tracing::info!("Client exiting.");
    Ok(())
}

/// Returns `false` when the client should exit.
async fn run_command(handle: &PresenceHandle, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("/typing") => handle.set_typing(true).await,
        Some("/idle") => handle.set_typing(false).await,
        Some("/hide") => handle.set_visibility(Visibility::Hidden),
        Some("/show") => handle.set_visibility(Visibility::Visible),
        Some("/room") => handle.set_room(words.next().map(str::to_string)),
        Some("/who") => print_state(&handle.state().borrow()),
        Some("/quit") => return false,
        None => {}
        Some(_) => println!("{}", HELP),
    }
    true
}

async fn print_changes(mut state: watch::Receiver<PresenceState>) {
    while state.changed().await.is_ok() {
        print_state(&state.borrow_and_update());
    }
}

fn print_state(state: &PresenceState) {
    if state.is_empty() {
        println!("-- nobody online --");
        return;
    }
    println!("-- {} user(s) --", state.len());
    for record in state.records() {
        let status = match record.status {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        };
        let rooms: Vec<&str> = record.active_rooms.iter().map(String::as_str).collect();
        println!(
            "{:<20} {:<8} rooms=[{}]{}",
            record.identity.name.as_deref().unwrap_or(&record.identity.id),
            status,
            rooms.join(", "),
            if record.is_typing { " (typing...)" } else { "" },
        );
    }
}
