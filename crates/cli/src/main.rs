use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use relay::gateway::ServerFrame;
use relay::renderer::{ChatLog, EntryStyle, LogEntry};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const TERMINAL_WIDTH: usize = 80;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (HTTP health + WebSocket chat relay).
    Gateway {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Join a room on a running gateway and chat interactively.
    Chat {
        /// Config file path (default: RELAY_CONFIG_PATH or ~/.relay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Name shown before your messages.
        #[arg(long, short)]
        username: String,

        /// Room to join (default from config, usually "default").
        #[arg(long, short)]
        room: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("relay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            username,
            room,
        }) => {
            if let Err(e) = run_chat(config, username, room).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(relay::config::default_config_path);
    let dir = relay::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, _path) = relay::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    relay::gateway::run_gateway(config).await
}

/// Own entries right aligned, peer entries left aligned.
fn render(entry: &LogEntry) -> String {
    match entry.style {
        EntryStyle::Own => format!("{:>width$}", entry.line(), width = TERMINAL_WIDTH),
        EntryStyle::Peer => entry.line(),
    }
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    username: String,
    room: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = relay::config::load_config(config_path)?;
    let room = room.unwrap_or_else(|| config.relay.default_room.clone());
    let ws_url = format!("ws://{}:{}/ws", config.gateway.bind.trim(), config.gateway.port);

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| anyhow::anyhow!("connecting to {}: {}", ws_url, e))?;

    let mut chat_log = ChatLog::new(username, room);
    ws.send(Message::Text(chat_log.join_frame().to_text())).await?;
    println!("joined {} as {} (Ctrl+D to quit)", chat_log.room(), chat_log.username());

    // Stdin is blocking; read it on its own thread and forward lines.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if line_tx.blocking_send(line.clone()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(mut input) = line else { break };
                if let Some(frame) = chat_log.submit(&mut input) {
                    ws.send(Message::Text(frame.to_text())).await?;
                }
            }
            msg = ws.next() => {
                let Some(msg) = msg else { break };
                let Message::Text(text) = msg? else { continue };
                match ServerFrame::parse(&text) {
                    Ok(frame) => {
                        let shutdown = frame.is_shutdown();
                        if let Some(entry) = chat_log.receive(&frame) {
                            println!("{}", render(entry));
                        }
                        if shutdown {
                            println!("gateway is shutting down");
                            break;
                        }
                    }
                    Err(e) => log::debug!("ignoring frame: {}", e),
                }
            }
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}
