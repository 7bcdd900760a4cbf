use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use camp_live_core::config::LiveConfig;
use camp_live_core::media::synthetic::SyntheticDevices;
use camp_live_core::model::{AttendConfig, BeginConfig, Capability, CaptureFlags, Identity};
use camp_live_core::session::{ControllerDeps, LiveView, SessionController};
use camp_live_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use camp_live_core::transport::webrtc::RtcTransportFactory;
use camp_live_core::SessionHandle;
use clap::{Args, Parser, Subcommand};
use stream_registry::{RegistryClient, SessionRegistry, StreamKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use transport_bus::stomp::{StompConfig, StompConnector};
use url::Url;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = LiveConfig::from_env();
    if let Some(api_base) = cli.api_base {
        config.api_base = api_base;
    }
    if let Some(url) = cli.signaling_url {
        config.signaling_url = url;
    }
    let mut identity = cli
        .peer_id
        .map(Identity::new)
        .unwrap_or_else(Identity::ephemeral);
    if let Some(token) = cli.token {
        identity = identity.with_token(token);
    }

    match cli.command {
        Command::Stream(args) => handle_stream(config, identity, args).await,
        Command::Attend(args) => handle_attend(config, identity, args).await,
        Command::List(args) => handle_list(&config, &identity, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "camp-live",
    about = "Go live in a camp, or join someone else's stream, over WebRTC",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "CAMP_LIVE_API_BASE",
        help = "Base URL of the stream registry REST API"
    )]
    api_base: Option<String>,

    #[arg(
        long,
        global = true,
        env = "CAMP_LIVE_SIGNALING_URL",
        help = "WebSocket URL of the STOMP signaling broker"
    )]
    signaling_url: Option<String>,

    #[arg(long, global = true, env = "CAMP_LIVE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(
        long,
        global = true,
        env = "CAMP_LIVE_PEER_ID",
        help = "Peer id announced on the signaling topic (random when omitted)"
    )]
    peer_id: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "CAMP_LIVE_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "CAMP_LIVE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a stream in a camp and broadcast until interrupted
    Stream(StreamArgs),
    /// Join a stream someone else registered
    Attend(AttendArgs),
    /// List the active streams of a camp
    List(ListArgs),
}

#[derive(Args, Debug)]
struct StreamArgs {
    #[arg(long, value_name = "CAMP")]
    camp: String,

    #[arg(long)]
    title: String,

    #[arg(long, default_value = "LIVE", help = "LIVE (lecture) or MOGAKCO (peer study)")]
    kind: StreamKind,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Start with the microphone enabled")]
    mic: bool,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Start with the camera enabled")]
    cam: bool,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Share the screen as well")]
    screen: bool,

    #[arg(long, value_name = "TARGET", requires = "screen")]
    share_target: Option<String>,

    #[arg(long, help = "Curriculum track the stream belongs to")]
    track: Option<String>,
}

#[derive(Args, Debug)]
struct AttendArgs {
    #[arg(long, value_name = "CAMP")]
    camp: String,

    #[arg(long, value_name = "SESSION")]
    session: String,

    #[arg(long, default_value = "MOGAKCO")]
    kind: StreamKind,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    mic: bool,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    cam: bool,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long, value_name = "CAMP")]
    camp: String,
}

fn build_controller(config: LiveConfig, identity: Identity) -> anyhow::Result<SessionController> {
    let url = Url::parse(&config.signaling_url)
        .with_context(|| format!("invalid signaling url '{}'", config.signaling_url))?;
    let bus = StompConnector::new(StompConfig::new(url).with_token(identity.token.clone()));
    let registry = RegistryClient::new(config.api_base.clone(), identity.token.clone());
    let transports =
        RtcTransportFactory::new(&config.ice_servers).context("webrtc setup failed")?;

    Ok(SessionController::spawn(ControllerDeps {
        identity,
        config,
        registry: Arc::new(registry),
        bus: Arc::new(bus),
        // No OS capture backend yet; synthetic tracks stand in for devices.
        media: SyntheticDevices::new(),
        transports: Arc::new(transports),
    }))
}

async fn handle_stream(
    config: LiveConfig,
    identity: Identity,
    args: StreamArgs,
) -> anyhow::Result<()> {
    let controller = build_controller(config, identity)?;
    let handle = controller
        .begin(BeginConfig {
            camp_id: args.camp,
            title: args.title,
            kind: args.kind,
            capture: CaptureFlags {
                mic_on: args.mic,
                cam_on: args.cam,
                screen_on: args.screen,
                share_target: args.share_target,
            },
            track: args.track,
        })
        .await?;
    print_banner(&handle);
    watch_until_interrupted(&controller).await?;
    controller.end().await;
    Ok(())
}

async fn handle_attend(
    config: LiveConfig,
    identity: Identity,
    args: AttendArgs,
) -> anyhow::Result<()> {
    let controller = build_controller(config, identity)?;
    let handle = controller
        .attend(AttendConfig {
            camp_id: args.camp,
            session_id: args.session,
            kind: args.kind,
            capture: CaptureFlags {
                mic_on: args.mic,
                cam_on: args.cam,
                ..CaptureFlags::default()
            },
        })
        .await?;
    print_banner(&handle);
    watch_until_interrupted(&controller).await?;
    controller.end().await;
    Ok(())
}

async fn handle_list(config: &LiveConfig, identity: &Identity, args: ListArgs) -> anyhow::Result<()> {
    let registry = RegistryClient::new(config.api_base.clone(), identity.token.clone());
    let streams = registry
        .list_active(&args.camp)
        .await
        .with_context(|| format!("listing streams of camp {}", args.camp))?;
    if streams.is_empty() {
        println!("no active streams in camp {}", args.camp);
    }
    for stream in streams {
        let kind = stream.kind.map(|kind| kind.to_string()).unwrap_or_else(|| "-".into());
        let owner = stream.owner_nickname.as_deref().unwrap_or("-");
        println!("{:<12} {:<8} {:<16} {}", stream.stream_id, kind, owner, stream.title);
    }
    Ok(())
}

fn print_banner(handle: &SessionHandle) {
    println!(
        "live in camp {} as {:?}, session {}",
        handle.session.scope_id,
        handle.role,
        handle.session_id()
    );
    println!("type mic, cam or screen to toggle capture; press ctrl-c to leave");
}

fn parse_toggle(line: &str) -> Option<Capability> {
    match line.trim().to_ascii_lowercase().as_str() {
        "mic" | "microphone" => Some(Capability::Microphone),
        "cam" | "camera" => Some(Capability::Camera),
        "screen" => Some(Capability::Screen),
        _ => None,
    }
}

fn print_capture(flags: &CaptureFlags) {
    let on_off = |on: bool| if on { "on" } else { "off" };
    println!(
        "mic {} cam {} screen {}",
        on_off(flags.mic_on),
        on_off(flags.cam_on),
        on_off(flags.screen_on)
    );
}

/// Log view changes and apply capture toggles typed on stdin until ctrl-c,
/// or until the session ends on its own.
async fn watch_until_interrupted(controller: &SessionController) -> anyhow::Result<()> {
    let mut view: watch::Receiver<LiveView> = controller.view();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            result = &mut interrupt => {
                result?;
                info!("interrupted; ending session");
                return Ok(());
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match parse_toggle(&line) {
                    Some(capability) => print_capture(&controller.toggle(capability).await),
                    None => println!("unknown command '{}'; expected mic, cam or screen", line.trim()),
                },
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!(error = %err, "stdin closed; toggles disabled");
                    stdin_open = false;
                }
            },
            changed = view.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let snapshot = view.borrow_and_update().clone();
                if !snapshot.is_streaming {
                    if let Some(err) = &snapshot.last_error {
                        warn!(error = %err, "session ended");
                    }
                    return Ok(());
                }
                info!(
                    participants = snapshot.participant_ids.len(),
                    connected = snapshot.connected_peers(),
                    signaling = snapshot.signaling_connected,
                    "session update"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_commands() {
        assert_eq!(parse_toggle("mic"), Some(Capability::Microphone));
        assert_eq!(parse_toggle(" Camera \n"), Some(Capability::Camera));
        assert_eq!(parse_toggle("SCREEN"), Some(Capability::Screen));
        assert_eq!(parse_toggle("volume"), None);
        assert_eq!(parse_toggle(""), None);
    }
}
