use std::{sync::Arc, time::Duration};

use clap::Parser;
use futures::StreamExt;
use huddle::{
    config::Config,
    mesh::{
        Args as MeshArgs, HttpMembership, MeshController, MeshEventKind, MeshEventStream,
        ParticipantId,
    },
};
use huddle_wrtc::{RtpCapture, SignalingServer, WrtcBroker, WrtcConfig};
use tracing_subscriber::EnvFilter;

mod render;

#[derive(Parser, Debug)]
#[clap(name = "huddle-repl")]
/// joins a room and drives the call from the command line
struct Args {
    /// room to join
    #[clap(long, env = "HUDDLE_ROOM")]
    room: String,

    /// name shown to the other participants
    #[clap(long, env = "HUDDLE_NAME", default_value = "Guest")]
    name: String,

    /// participant id the room service knows you by. random if omitted
    #[clap(long, env = "HUDDLE_USER_ID")]
    user_id: Option<String>,

    /// base url of the room service
    #[clap(long, env = "HUDDLE_ROOM_SERVICE", default_value = "http://127.0.0.1:8000/")]
    room_service: String,

    /// join with admin actions enabled until the room service says otherwise
    #[clap(long)]
    admin: bool,

    /// membership poll interval in milliseconds
    #[clap(long, env = "HUDDLE_POLL_MS", default_value_t = 5000)]
    poll_ms: u64,

    /// host of the brokering service
    #[clap(long, env = "HUDDLE_SIGNALING_HOST", default_value = "0.peerjs.com")]
    signaling_host: String,

    #[clap(long, env = "HUDDLE_SIGNALING_PORT", default_value_t = 443)]
    signaling_port: u16,

    /// use ws:// instead of wss://
    #[clap(long)]
    insecure: bool,

    /// join without a camera
    #[clap(long)]
    no_video: bool,
}

/// control the call. enter --help to see available commands
#[derive(Parser, Debug, Eq, PartialEq)]
enum Repl {
    /// turn the camera (or shared screen) on or off
    ToggleVideo,
    /// turn the microphone on or off
    ToggleAudio,
    /// send the screen instead of the camera
    ShareScreen,
    /// send the camera again
    StopShare,
    /// ask every participant to mute (admin only)
    MuteAll,
    /// drop every connection (admin only)
    RemoveAll,
    /// poll the room service now
    Refresh,
    /// show the lifecycle state and local media
    State,
    /// show the participants with a connection
    Peers,
    /// leave the room
    Leave,
}

/// returns true once the room was left
async fn handle_command(controller: &MeshController, cmd: Repl) -> anyhow::Result<bool> {
    match cmd {
        Repl::ToggleVideo => {
            let enabled = controller.toggle_video().await?;
            println!("video {}", if enabled { "on" } else { "off" });
        }
        Repl::ToggleAudio => {
            let enabled = controller.toggle_audio().await?;
            println!("audio {}", if enabled { "on" } else { "off" });
        }
        Repl::ShareScreen => controller.share_screen().await?,
        Repl::StopShare => controller.stop_screen_share().await?,
        Repl::MuteAll => {
            let muted = controller.mute_all().await?;
            println!("asked {} participant(s) to mute", muted.len());
        }
        Repl::RemoveAll => controller.remove_all().await?,
        Repl::Refresh => controller.refresh(),
        Repl::State => {
            println!("state: {}", controller.state().await?);
            if let Some(local) = controller.local_media().await? {
                println!(
                    "sending {} (audio: {}, video: {})",
                    local.source_kind(),
                    local.audio_enabled(),
                    local.video_enabled()
                );
            }
        }
        Repl::Peers => {
            let peers = controller.connected_peers().await?;
            if peers.is_empty() {
                println!("no connections");
            }
            for peer in peers {
                println!("{peer}");
            }
        }
        Repl::Leave => {
            controller.leave().await?;
            return Ok(true);
        }
    }
    Ok(false)
}

async fn handle_mesh_event_stream(mut stream: MeshEventStream) {
    while let Some(evt) = stream.next().await {
        // printed by the render sink instead
        if matches!(evt, MeshEventKind::MembershipUpdated { .. }) {
            continue;
        }
        println!("MeshEvent: {evt}");
        if matches!(evt, MeshEventKind::Left { .. }) {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::production(&args.room_service, &args.room, &args.name);
    if let Some(id) = args.user_id {
        *config.local_id_mut() = ParticipantId::new(id);
    }
    *config.is_admin_mut() = args.admin;
    *config.poll_interval_mut() = Duration::from_millis(args.poll_ms);
    config.capture_mut().video = !args.no_video;

    let mut wrtc_config = WrtcConfig::default();
    *wrtc_config.signaling_mut() =
        SignalingServer::new(args.signaling_host, args.signaling_port, !args.insecure);

    let broker = WrtcBroker::connect(config.local_id().clone(), wrtc_config).await?;
    let membership = HttpMembership::new(config.membership_url())?;

    println!("your participant id is {}", config.local_id());

    let controller = MeshController::new(MeshArgs {
        config,
        broker: Arc::new(broker),
        membership: Arc::new(membership),
        capture: Arc::new(RtpCapture::default()),
        render: Arc::new(render::LogRender),
    });

    let events = tokio::spawn(handle_mesh_event_stream(controller.get_event_stream()));

    controller.join().await?;

    println!("starting REPL");
    println!("enter --help to see available commands");

    let mut left = false;
    let mut iter = std::io::stdin().lines();
    while let Some(Ok(line)) = iter.next() {
        let mut v = vec![""];
        v.extend(line.split_ascii_whitespace());
        let cli = match Repl::try_parse_from(v) {
            Ok(r) => r,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match handle_command(&controller, cli).await {
            Ok(true) => {
                left = true;
                break;
            }
            Ok(false) => {}
            Err(e) => println!("command failed: {e}"),
        }
    }

    if !left {
        controller.leave().await?;
    }
    events.await.ok();

    Ok(())
}
