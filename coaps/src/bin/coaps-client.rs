//! Command-line client: periodic telemetry and firmware downloads against one server

use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use coaps::{
    proto::{self, Purpose},
    Client, ClientConfig, ClientEvent, Platform, RebootCode,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Cellular CoAP client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(short, long, env = "COAPS_CONFIG")]
    config: Option<PathBuf>,

    /// Server address
    #[arg(short, long, env = "COAPS_DESTINATION")]
    destination: Option<SocketAddr>,

    /// Local address to bind
    #[arg(long, env = "COAPS_LOCAL")]
    local: Option<SocketAddr>,

    /// Telemetry interval in seconds
    #[arg(short, long, env = "COAPS_INTERVAL")]
    interval: Option<u64>,

    /// Query parameter for telemetry messages, e.g. the device identity (repeatable)
    #[arg(short, long, env = "COAPS_QUERY")]
    query: Vec<String>,

    /// Directory of the firmware staging area
    #[arg(long, env = "COAPS_IMAGE_DIR", default_value = "coaps-image")]
    image_dir: PathBuf,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send telemetry periodically until interrupted
    Run,
    /// Send one telemetry message and print the reply
    Send,
    /// Download a firmware image; the exit code is the cancellation reason, if any
    Download {
        /// Resource name; relative names get the firmware prefix
        resource: String,
        /// Reboot into the image once it is staged
        #[arg(short, long)]
        apply: bool,
    },
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => ClientConfig::default(),
        };
        if let Some(destination) = self.destination {
            config.destination = destination;
        }
        if let Some(local) = self.local {
            config.local = local;
        }
        if let Some(interval) = self.interval {
            config.interval_secs = interval;
        }
        if !self.query.is_empty() {
            config.telemetry_query = self.query.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish(),
    )
    .ok();

    match run(Args::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = args.client_config()?;
    let reboot = CancellationToken::new();
    let platform = Platform::host(&args.image_dir, reboot.clone())
        .with_context(|| format!("opening {}", args.image_dir.display()))?;
    // TODO: plug in a DTLS record layer once one is available behind `proto::Session`
    let (client, driver) = Client::start(
        &config,
        proto::Plain,
        proto::Credentials::default(),
        platform,
    )?;
    let mut events = client.subscribe();
    info!(destination = %config.destination, "client started");

    let code = match args.command {
        Commands::Run => {
            client.trigger();
            tokio::select! {
                result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
                _ = reboot.cancelled() => warn!("reboot requested, exiting"),
            }
            ExitCode::SUCCESS
        }
        Commands::Send => {
            client.trigger();
            send_once(&mut events, args.json).await?
        }
        Commands::Download { resource, apply } => {
            client.download(&resource, apply)?;
            download(&mut events, apply).await?
        }
    };

    let status = client.status();
    match args.json {
        true => println!("{}", status.to_json()),
        false => println!("{status}"),
    }
    client.shutdown();
    driver.await?;
    Ok(code)
}

async fn send_once(events: &mut broadcast::Receiver<ClientEvent>, json: bool) -> Result<ExitCode> {
    loop {
        match events.recv().await? {
            ClientEvent::Telemetry(reply) => {
                match json {
                    true => println!("{}", serde_json::to_string_pretty(&reply)?),
                    false => println!("{} {}", reply.code, reply.body),
                }
                return Ok(ExitCode::SUCCESS);
            }
            ClientEvent::Failed {
                purpose: Purpose::Telemetry,
                error,
            } => {
                eprintln!("telemetry failed: {error}");
                return Ok(ExitCode::FAILURE);
            }
            ClientEvent::Reboot(code) => bail!("reboot requested ({code})"),
            _ => {}
        }
    }
}

async fn download(events: &mut broadcast::Receiver<ClientEvent>, apply: bool) -> Result<ExitCode> {
    loop {
        match events.recv().await? {
            ClientEvent::UpdateFinished { .. } if !apply => return Ok(ExitCode::SUCCESS),
            ClientEvent::UpdateFinished { .. } => info!("image staged, rebooting into it"),
            ClientEvent::UpdateCanceled(reason) => {
                eprintln!("download canceled: {reason}");
                return Ok(ExitCode::from(reason.code()));
            }
            ClientEvent::Reboot(RebootCode::Update) => return Ok(ExitCode::SUCCESS),
            ClientEvent::Reboot(code) => bail!("reboot requested ({code})"),
            ClientEvent::Recovery(step) => warn!(?step, "recovering"),
            _ => {}
        }
    }
}
