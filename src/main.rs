//! lobbylink - Host-authoritative lobby synchronization for small peer groups

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lobbylink::bootstrap::{parse_handle, split_launch_args};
use lobbylink::config::{default_settings_path, Settings, SettingsStore};
use lobbylink::content::{normalize_item_id, ContentAcquirer, MemoryCatalog};
use lobbylink::lobby::{
    ActivityModifiers, ControllerConfig, LobbyHandle, LobbyNotice, LobbyOp, LobbyService,
    LobbySnapshot, Phase, SessionController,
};
use lobbylink::transport::{MemoryDirectory, SessionFilter, SessionHandle, TransportAdapter};

/// How long to wait for a create/join to settle
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the demo waits for everyone to become ready
const START_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "lobbylink")]
#[command(about = "Host-authoritative lobby synchronization for small peer groups")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true, env = "LOBBYLINK_SETTINGS")]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive lobby on an in-process directory
    Run {
        /// Your display name
        #[arg(short, long, default_value = "Host")]
        name: String,

        /// Simulated peers that join your session and follow the host
        #[arg(long, default_value = "0")]
        bots: usize,

        /// Join this session at start
        #[arg(long)]
        connect_lobby: Option<String>,
    },

    /// Scripted round: host selects an item, everyone fetches it, the
    /// activity starts and finishes
    Demo {
        /// Number of members including the host
        #[arg(long, default_value = "3")]
        peers: usize,

        /// Item to play
        #[arg(long, default_value = "0123456789abcdef0123456789abcdef")]
        item_id: String,

        #[arg(long, default_value = "Demo Song")]
        item_name: String,

        #[arg(long, default_value = "2")]
        difficulty: u8,
    },

    /// Show or change local settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the current settings
    Show,
    /// Print the settings file location
    Path,
    /// Change one setting, e.g. `set MaxLobbySize 4`
    Set { name: String, value: String },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn settings_path(cli_path: Option<PathBuf>) -> Result<PathBuf> {
    cli_path
        .or_else(default_settings_path)
        .ok_or_else(|| anyhow!("Could not determine settings path; pass --settings"))
}

/// Start a lobby service for one peer of `directory`
fn spawn_peer(directory: &MemoryDirectory, name: &str, config: ControllerConfig) -> LobbyHandle {
    let (backend, events) = directory.connect(name);
    let controller = SessionController::new(TransportAdapter::new(backend), config);
    let (_task, handle) = LobbyService::spawn(controller, events);
    handle
}

async fn connect(lobby: &LobbyHandle, op: LobbyOp) -> Result<SessionHandle> {
    let session = timeout(CONNECT_TIMEOUT, lobby.connect(op))
        .await
        .context("Timed out connecting")??;
    Ok(session)
}

/// A simulated member: joins `session`, fetches whatever the host asks for,
/// reports ready, and leaves when the session ends.
fn spawn_follower(
    directory: &MemoryDirectory,
    catalog: MemoryCatalog,
    name: String,
    session: SessionHandle,
) {
    let lobby = spawn_peer(directory, &name, ControllerConfig::default());
    tokio::spawn(async move {
        let mut notices = lobby.subscribe();
        if let Err(e) = connect(&lobby, LobbyOp::JoinSession(session)).await {
            warn!("{} could not join {}: {}", name, session, e);
            return;
        }
        let acquirer = ContentAcquirer::new(catalog);

        while let Ok(notice) = notices.recv().await {
            match notice {
                LobbyNotice::ContentRequested { item_id } => {
                    if let Err(e) = acquirer.acquire_for(&lobby, &item_id).await {
                        warn!("{} could not fetch {}: {}", name, item_id, e);
                    }
                }
                LobbyNotice::ConnectionChanged(state) if state.is_terminal() => break,
                _ => {}
            }
        }
        info!("{} is done", name);
        let _ = lobby.shutdown().await;
    });
}

fn print_snapshot(snapshot: &LobbySnapshot) {
    let metadata = &snapshot.metadata;
    println!("\n───────────────────────────────────────────────");
    println!(" Connection:  {:?}", snapshot.connection);
    if metadata.is_session() {
        println!(" Session:     {}", metadata.session_id);
        println!(
            " Host:        {}{}",
            metadata.host_display_name,
            if snapshot.is_host { " (you)" } else { "" }
        );
        println!(" Phase:       {:?}", metadata.phase);
        println!(" Status:      {}", metadata.status);
        println!(
            " Slots:       {}/{} (max {}){}",
            metadata.used_slots,
            metadata.total_slots,
            metadata.max_slots,
            if metadata.joinable { "" } else { ", closed" }
        );
        if !metadata.current_item_id.is_empty() {
            println!(
                " Item:        {} [{}] difficulty {}",
                metadata.current_item_name, metadata.current_item_id, metadata.current_item_difficulty
            );
        }
        println!(" Members:");
        for (name, ready) in &snapshot.members {
            println!("   - {}{}", name, if *ready { " (ready)" } else { "" });
        }
    }
    if !snapshot.directory.is_empty() {
        println!(" Listed sessions:");
        for entry in &snapshot.directory {
            println!(
                "   - {} hosted by {}: {}/{} - {}",
                entry.session_id,
                entry.host_display_name,
                entry.used_slots,
                entry.total_slots,
                entry.status
            );
        }
    }
    println!("───────────────────────────────────────────────\n");
}

async fn run_demo(
    settings: &Settings,
    peers: usize,
    item_id: String,
    item_name: String,
    difficulty: u8,
) -> Result<()> {
    if peers == 0 {
        bail!("A demo needs at least one peer");
    }
    let directory = MemoryDirectory::new();
    let catalog = MemoryCatalog::new();
    catalog.insert(normalize_item_id(&item_id), &item_name);
    catalog.set_fetch_delay(Duration::from_millis(200));

    let host = spawn_peer(&directory, "Host", settings.controller_config());
    let session = connect(&host, LobbyOp::CreateSession).await?;
    info!("Hosting session {}", session);

    // Make room for everyone before they join
    while host.snapshot().await?.metadata.total_slots < peers.min(settings.max_lobby_size) {
        host.adjust_slot_count().await?;
    }
    for i in 1..peers {
        spawn_follower(&directory, catalog.clone(), format!("Peer {}", i), session);
    }

    let mut notices = host.subscribe();
    timeout(CONNECT_TIMEOUT, async {
        loop {
            if host.snapshot().await?.members.len() >= peers.min(settings.max_lobby_size) {
                return Ok::<_, anyhow::Error>(());
            }
            let _ = notices.recv().await;
        }
    })
    .await
    .context("Timed out waiting for peers")??;

    host.select_item(&item_id, &item_name).await?;
    host.select_difficulty(difficulty).await?;
    let modifiers = ActivityModifiers {
        no_fail: settings.no_fail_mode,
        ..ActivityModifiers::default()
    };
    host.request_start(modifiers).await?;
    host.mark_ready().await?;

    timeout(START_TIMEOUT, async {
        loop {
            let snapshot = host.snapshot().await?;
            if snapshot.metadata.phase == Phase::InActivity {
                return Ok::<_, anyhow::Error>(snapshot);
            }
            let _ = notices.recv().await;
        }
    })
    .await
    .context("Timed out waiting for everyone to be ready")?
    .map(|snapshot| print_snapshot(&snapshot))?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    host.finish_activity().await?;
    print_snapshot(&host.snapshot().await?);

    host.shutdown().await?;
    // Followers see the teardown and leave on their own
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  create                 host a new session");
    println!("  join <handle>          join a session");
    println!("  cancel                 abandon a pending create/join");
    println!("  list                   refresh the session list");
    println!("  select <id> <name>     choose the shared item (host)");
    println!("  difficulty <n>         choose the difficulty (host)");
    println!("  start                  ask everyone to fetch the item (host)");
    println!("  ready                  report the item as fetched");
    println!("  finish                 end the activity");
    println!("  stop                   back to the menu");
    println!("  slots                  cycle the slot count (host)");
    println!("  joinable               open/close the session (host)");
    println!("  status                 print the lobby state");
    println!("  leave                  disconnect");
    println!("  quit                   exit");
}

/// Turn one input line into an operation
fn parse_command(line: &str) -> Result<Option<LobbyOp>> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let op = match command {
        "create" => LobbyOp::CreateSession,
        "join" => {
            let raw = words.next().ok_or_else(|| anyhow!("join needs a handle"))?;
            let handle = parse_handle(raw).ok_or_else(|| anyhow!("invalid handle {}", raw))?;
            LobbyOp::JoinSession(handle)
        }
        "cancel" => LobbyOp::CancelConnect,
        "list" => LobbyOp::RefreshDirectory(SessionFilter::default()),
        "select" => {
            let item_id = words.next().ok_or_else(|| anyhow!("select needs an item id"))?;
            let item_name = words.collect::<Vec<_>>().join(" ");
            LobbyOp::SelectItem {
                item_id: item_id.to_string(),
                item_name: if item_name.is_empty() {
                    item_id.to_string()
                } else {
                    item_name
                },
            }
        }
        "difficulty" => {
            let raw = words.next().ok_or_else(|| anyhow!("difficulty needs a number"))?;
            LobbyOp::SelectDifficulty(raw.parse().context("difficulty must be 0-255")?)
        }
        "start" => LobbyOp::RequestStart(ActivityModifiers::default()),
        "ready" => LobbyOp::MarkReady,
        "finish" => LobbyOp::FinishActivity,
        "stop" => LobbyOp::Stop,
        "slots" => LobbyOp::AdjustSlotCount,
        "joinable" => LobbyOp::ToggleJoinable,
        "leave" => LobbyOp::Disconnect,
        other => bail!("unknown command {:?} (try help)", other),
    };
    Ok(Some(op))
}

async fn run_interactive(
    settings: &Settings,
    name: String,
    bots: usize,
    connect_target: Option<SessionHandle>,
) -> Result<()> {
    let directory = MemoryDirectory::new();
    let catalog = MemoryCatalog::new();
    let lobby = spawn_peer(&directory, &name, settings.controller_config());

    if let Some(target) = connect_target {
        info!("Joining session {} from the command line", target);
        if let Err(e) = connect(&lobby, LobbyOp::JoinSession(target)).await {
            warn!("Auto-join failed: {}", e);
        }
    } else if settings.auto_start_lobby {
        let session = connect(&lobby, LobbyOp::CreateSession).await?;
        info!("Auto-started session {}", session);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut notices = lobby.subscribe();
    let mut bots_spawned = false;
    print_help();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                match line {
                    "" => continue,
                    "quit" | "exit" => break,
                    "help" => { print_help(); continue; }
                    "status" => { print_snapshot(&lobby.snapshot().await?); continue; }
                    _ => {}
                }
                match parse_command(line) {
                    Ok(Some(op)) => {
                        if let Err(e) = lobby.apply(op).await {
                            println!("  error: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("  {}", e),
                }
            }
            notice = notices.recv() => {
                match notice {
                    Ok(LobbyNotice::ConnectionChanged(state)) => {
                        println!("  [connection] {:?}", state);
                        let snapshot = lobby.snapshot().await?;
                        if state.is_connected() && snapshot.is_host && bots > 0 && !bots_spawned {
                            catalog_for_bots(&catalog, &snapshot);
                            for i in 1..=bots {
                                spawn_follower(&directory, catalog.clone(), format!("Bot {}", i), snapshot.metadata.session_id);
                            }
                            bots_spawned = true;
                        }
                    }
                    Ok(LobbyNotice::ContentRequested { item_id }) => {
                        println!("  [content] host wants {}; type `ready` when you have it", item_id);
                    }
                    Ok(LobbyNotice::DirectoryRefreshed { sessions }) => {
                        println!("  [directory] {} sessions", sessions);
                    }
                    Ok(LobbyNotice::MetadataUpdated) => {
                        let snapshot = lobby.snapshot().await?;
                        // Bots fetch from the catalog, so keep the host's pick in it
                        catalog_for_bots(&catalog, &snapshot);
                    }
                    Ok(LobbyNotice::PlayerInfoReceived { .. }) => {}
                    Err(e) => warn!("Notice stream: {}", e),
                }
            }
        }
    }

    lobby.shutdown().await?;
    Ok(())
}

/// Bots can fetch whatever item the host has selected
fn catalog_for_bots(catalog: &MemoryCatalog, snapshot: &LobbySnapshot) {
    let metadata = &snapshot.metadata;
    if snapshot.is_host && !metadata.current_item_id.is_empty() {
        let item_id = normalize_item_id(&metadata.current_item_id);
        if catalog.name_of(item_id).is_none() {
            catalog.insert(item_id, &metadata.current_item_name);
        }
    }
}

fn run_settings(path: PathBuf, action: SettingsAction) -> Result<()> {
    match action {
        SettingsAction::Path => println!("{}", path.display()),
        SettingsAction::Show => {
            let store = SettingsStore::load_or_create(&path);
            println!("{}", serde_json::to_string_pretty(store.settings())?);
        }
        SettingsAction::Set { name, value } => {
            let mut store = SettingsStore::load_or_create(&path);
            store.set_by_name(&name, &value)?;
            println!("{} = {}", name, value);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let (args, launch_target) = split_launch_args(std::env::args());
    let cli = Cli::parse_from(args);

    let path = settings_path(cli.settings)?;
    let settings = SettingsStore::load_or_create(&path).settings().clone();
    setup_logging(cli.verbose || settings.debug_mode);

    match cli.command {
        Commands::Run {
            name,
            bots,
            connect_lobby,
        } => {
            let target = launch_target.or_else(|| connect_lobby.as_deref().and_then(parse_handle));
            run_interactive(&settings, name, bots, target).await?;
        }
        Commands::Demo {
            peers,
            item_id,
            item_name,
            difficulty,
        } => {
            if launch_target.is_some() {
                warn!("Ignoring launch join request: the demo hosts its own session");
            }
            run_demo(&settings, peers, item_id, item_name, difficulty).await?;
        }
        Commands::Settings { action } => {
            run_settings(path, action)?;
        }
    }

    Ok(())
}
