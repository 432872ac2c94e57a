//! `mjpeg-relay` binary
//!
//! ```text
//! mjpeg-relay worker [--input HOST:PORT]... [--test-pattern] [--prompt TEXT]
//! mjpeg-relay hub --worker-host IP [--launch-command "ssh user@host ./launch.sh"]
//! ```
//!
//! Every option can also be given through an `MJPEG_RELAY_*` environment
//! variable. Logging follows `RUST_LOG` and defaults to `mjpeg_relay=info`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mjpeg_relay::capture::{CaptureConfig, CaptureStrategy, MjpegInput, TestPattern};
use mjpeg_relay::gateway::config::{DEFAULT_CAMERA_PORTS, DEFAULT_HTTP_PORT};
use mjpeg_relay::gateway::{Hub, HubConfig};
use mjpeg_relay::relay::RelayConfig;
use mjpeg_relay::supervisor::CommandLauncher;
use mjpeg_relay::worker::config::{DEFAULT_ANNOTATED_PORT, DEFAULT_COMMAND_PORT, DEFAULT_RAW_PORT};
use mjpeg_relay::worker::{CommandConfig, SharedLabels, StreamConfig, Worker, WorkerConfig, DEFAULT_PROMPT};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let matches = cli().get_matches();
    let shutdown = shutdown_on_ctrl_c();

    match matches.subcommand() {
        Some(("worker", args)) => run_worker(args, shutdown).await,
        Some(("hub", args)) => run_hub(args, shutdown).await,
        _ => bail!("expected a subcommand: worker or hub"),
    }
}

fn init_logging() -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("").add_directive("mjpeg_relay=info".parse()?),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Token cancelled on Ctrl+C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutting down");
                trigger.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "Cannot listen for Ctrl+C"),
        }
    });
    token
}

fn cli() -> Command {
    Command::new("mjpeg-relay")
        .about("MJPEG-over-TCP streaming workers and a fan-out relay hub")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(worker_command())
        .subcommand(hub_command())
}

fn worker_command() -> Command {
    Command::new("worker")
        .about("Capture frames and serve them as MJPEG feeds")
        .arg(
            Arg::new("bind")
                .long("bind")
                .env("MJPEG_RELAY_BIND")
                .value_parser(value_parser!(IpAddr))
                .help("Address the feeds and command channel listen on [default: 0.0.0.0]"),
        )
        .arg(
            Arg::new("raw-port")
                .long("raw-port")
                .env("MJPEG_RELAY_RAW_PORT")
                .value_parser(value_parser!(u16))
                .help("Raw feed port [default: 9001]"),
        )
        .arg(
            Arg::new("annotated-port")
                .long("annotated-port")
                .env("MJPEG_RELAY_ANNOTATED_PORT")
                .value_parser(value_parser!(u16))
                .help("Annotated feed port [default: 9000]"),
        )
        .arg(
            Arg::new("command-port")
                .long("command-port")
                .env("MJPEG_RELAY_COMMAND_PORT")
                .value_parser(value_parser!(u16))
                .help("Command channel port [default: 9003]"),
        )
        .arg(
            Arg::new("no-raw")
                .long("no-raw")
                .action(ArgAction::SetTrue)
                .help("Do not serve the raw feed"),
        )
        .arg(
            Arg::new("no-annotated")
                .long("no-annotated")
                .action(ArgAction::SetTrue)
                .help("Do not serve the annotated feed"),
        )
        .arg(
            Arg::new("no-command")
                .long("no-command")
                .action(ArgAction::SetTrue)
                .help("Do not open the command channel"),
        )
        .arg(
            Arg::new("quality")
                .long("quality")
                .env("MJPEG_RELAY_JPEG_QUALITY")
                .value_parser(value_parser!(u8).range(1..=100))
                .help("JPEG quality [default: 85]"),
        )
        .arg(
            Arg::new("input")
                .long("input")
                .env("MJPEG_RELAY_INPUT")
                .value_parser(value_parser!(SocketAddr))
                .action(ArgAction::Append)
                .help("MJPEG feed to read frames from, tried in the order given"),
        )
        .arg(
            Arg::new("test-pattern")
                .long("test-pattern")
                .action(ArgAction::SetTrue)
                .help("Fall back to a synthetic test pattern (the default when no --input is given)"),
        )
        .arg(
            Arg::new("pattern-fps")
                .long("pattern-fps")
                .value_parser(value_parser!(u32))
                .help("Test pattern frame rate [default: 30]"),
        )
        .arg(
            Arg::new("max-failures")
                .long("max-failures")
                .env("MJPEG_RELAY_MAX_FAILURES")
                .value_parser(value_parser!(u32))
                .help("Consecutive read failures before the capture is reinitialized [default: 10]"),
        )
        .arg(
            Arg::new("prompt")
                .long("prompt")
                .env("MJPEG_RELAY_PROMPT")
                .help("Initial comma-separated detection labels"),
        )
}

fn hub_command() -> Command {
    Command::new("hub")
        .about("Relay worker feeds to HTTP viewers")
        .arg(
            Arg::new("bind")
                .long("bind")
                .env("MJPEG_RELAY_BIND")
                .value_parser(value_parser!(IpAddr))
                .help("Address the web UI listens on [default: 0.0.0.0]"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .env("MJPEG_RELAY_HTTP_PORT")
                .value_parser(value_parser!(u16))
                .help("Web UI port [default: 8080]"),
        )
        .arg(
            Arg::new("worker-host")
                .long("worker-host")
                .env("MJPEG_RELAY_WORKER_HOST")
                .value_parser(value_parser!(IpAddr))
                .help("Host running the workers [default: 127.0.0.1]"),
        )
        .arg(
            Arg::new("camera-port")
                .long("camera-port")
                .value_parser(value_parser!(u16))
                .action(ArgAction::Append)
                .help("Worker feed port per camera, camera 0 first [default: 9000 9001]"),
        )
        .arg(
            Arg::new("command-port")
                .long("command-port")
                .env("MJPEG_RELAY_COMMAND_PORT")
                .value_parser(value_parser!(u16))
                .help("Worker command channel port [default: 9003]"),
        )
        .arg(
            Arg::new("launch-command")
                .long("launch-command")
                .env("MJPEG_RELAY_LAUNCH_COMMAND")
                .help("Command line that starts the workers remotely"),
        )
        .arg(
            Arg::new("no-auto-start")
                .long("no-auto-start")
                .action(ArgAction::SetTrue)
                .help("Do not start unreachable workers when the hub starts"),
        )
        .arg(
            Arg::new("reconnect-delay")
                .long("reconnect-delay")
                .env("MJPEG_RELAY_RECONNECT_DELAY")
                .value_parser(value_parser!(u64))
                .help("Seconds between upstream reconnect attempts [default: 5]"),
        )
        .arg(
            Arg::new("camera-wait")
                .long("camera-wait")
                .value_parser(value_parser!(u64))
                .help("Seconds a viewer waits for a disconnected camera [default: 10]"),
        )
        .arg(
            Arg::new("settle")
                .long("settle")
                .value_parser(value_parser!(u64))
                .help("Seconds to wait after a remote start before re-checking [default: 10]"),
        )
}

fn port_or(args: &ArgMatches, id: &str, default: u16) -> u16 {
    args.get_one::<u16>(id).copied().unwrap_or(default)
}

fn bind_host(args: &ArgMatches) -> IpAddr {
    args.get_one::<IpAddr>("bind")
        .copied()
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn worker_config(args: &ArgMatches) -> WorkerConfig {
    let host = bind_host(args);
    let quality = args.get_one::<u8>("quality").copied();
    let feed = |port: u16| {
        let feed = StreamConfig::with_addr(SocketAddr::new(host, port));
        match quality {
            Some(quality) => feed.jpeg_quality(quality),
            None => feed,
        }
    };

    let raw = (!args.get_flag("no-raw")).then(|| feed(port_or(args, "raw-port", DEFAULT_RAW_PORT)));
    let annotated = (!args.get_flag("no-annotated"))
        .then(|| feed(port_or(args, "annotated-port", DEFAULT_ANNOTATED_PORT)));
    let command = (!args.get_flag("no-command")).then(|| {
        CommandConfig::with_addr(SocketAddr::new(
            host,
            port_or(args, "command-port", DEFAULT_COMMAND_PORT),
        ))
    });

    let mut capture = CaptureConfig::default();
    if let Some(&budget) = args.get_one::<u32>("max-failures") {
        capture = capture.max_consecutive_failures(budget);
    }

    WorkerConfig::default()
        .raw_feed(raw)
        .annotated_feed(annotated)
        .command(command)
        .capture(capture)
}

fn capture_strategies(args: &ArgMatches) -> Vec<Box<dyn CaptureStrategy>> {
    let mut strategies: Vec<Box<dyn CaptureStrategy>> = args
        .get_many::<SocketAddr>("input")
        .into_iter()
        .flatten()
        .map(|&addr| Box::new(MjpegInput::new(addr)) as Box<dyn CaptureStrategy>)
        .collect();

    if strategies.is_empty() || args.get_flag("test-pattern") {
        let fps = args.get_one::<u32>("pattern-fps").copied().unwrap_or(30);
        strategies.push(Box::new(TestPattern::new(640, 480, fps)));
    }

    strategies
}

async fn run_worker(args: &ArgMatches, shutdown: CancellationToken) -> Result<()> {
    let config = worker_config(args);
    let prompt = args
        .get_one::<String>("prompt")
        .map(String::as_str)
        .unwrap_or(DEFAULT_PROMPT);

    let worker = Worker::new(config, capture_strategies(args)).with_labels(SharedLabels::from_prompt(prompt));
    let worker = worker.bind().await.context("failed to start worker")?;

    tracing::info!(
        raw = ?worker.raw_addr(),
        annotated = ?worker.annotated_addr(),
        command = ?worker.command_addr(),
        labels = ?worker.labels().snapshot(),
        "Worker running"
    );

    worker.run_until(shutdown).await.context("worker stopped")
}

fn hub_config(args: &ArgMatches) -> HubConfig {
    let worker_host = args
        .get_one::<IpAddr>("worker-host")
        .copied()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let base = HubConfig::for_worker_host(worker_host);

    let camera_ports: Vec<u16> = match args.get_many::<u16>("camera-port") {
        Some(ports) => ports.copied().collect(),
        None => DEFAULT_CAMERA_PORTS.to_vec(),
    };
    let reconnect_delay = args.get_one::<u64>("reconnect-delay").map(|&s| Duration::from_secs(s));
    let cameras = camera_ports
        .iter()
        .map(|&port| {
            let relay = RelayConfig::new(SocketAddr::new(worker_host, port));
            match reconnect_delay {
                Some(delay) => relay.reconnect_delay(delay),
                None => relay,
            }
        })
        .collect();

    let mut gateway = base
        .gateway
        .clone()
        .bind(SocketAddr::new(bind_host(args), port_or(args, "port", DEFAULT_HTTP_PORT)))
        .command_addr(SocketAddr::new(
            worker_host,
            port_or(args, "command-port", DEFAULT_COMMAND_PORT),
        ));
    if let Some(&secs) = args.get_one::<u64>("camera-wait") {
        let poll = gateway.camera_poll;
        gateway = gateway.camera_wait(Duration::from_secs(secs), poll);
    }

    let mut supervisor = base
        .supervisor
        .clone()
        .ports(camera_ports)
        .auto_start(!args.get_flag("no-auto-start"));
    if let Some(&secs) = args.get_one::<u64>("settle") {
        supervisor = supervisor.settle_interval(Duration::from_secs(secs));
    }

    base.gateway(gateway).supervisor(supervisor).cameras(cameras)
}

async fn run_hub(args: &ArgMatches, shutdown: CancellationToken) -> Result<()> {
    let mut hub = Hub::new(hub_config(args));
    if let Some(line) = args.get_one::<String>("launch-command") {
        let launcher = CommandLauncher::from_command_line(line).context("--launch-command is empty")?;
        tracing::info!(program = launcher.program(), "Remote start enabled");
        hub = hub.with_launcher(Arc::new(launcher));
    }

    let hub = hub.bind().context("failed to bind hub")?;
    tracing::info!(url = %format!("http://{}/", hub.local_addr()), "Web UI available");

    hub.run_until(shutdown).await.context("hub stopped")
}
