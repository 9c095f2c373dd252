//! camrelay: supervises a gphoto2 -> ffmpeg -> v4l2loopback capture chain and
//! serves the latest frame over HTTP.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use camrelay::{service, Config};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::WrapErr, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Webcam service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CAMRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Port to run the webcam service
    #[arg(long)]
    port: Option<u16>,

    /// Path to gphoto2 executable
    #[arg(long)]
    gphoto2: Option<PathBuf>,

    /// Path to ffmpeg executable
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Loopback video device
    #[arg(long)]
    device: Option<PathBuf>,

    /// Path to log file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Action>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Start the webcam service (default)
    Start,
    /// Stop the webcam service
    Stop,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.http.port = port;
        }
        if let Some(path) = &self.gphoto2 {
            config.pipeline.gphoto2 = path.clone();
        }
        if let Some(path) = &self.ffmpeg {
            config.pipeline.ffmpeg = path.clone();
        }
        if let Some(path) = &self.device {
            config.capture.device = path.clone();
        }
        if let Some(path) = &self.log_file {
            config.logging.file = Some(path.clone());
        }
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .wrap_err("invalid log filter")?;

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .wrap_err_with(|| format!("cannot open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()))
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).wrap_err("failed to load configuration")?;
    args.apply(&mut config);

    init_logging(&config)?;
    info!("Webcam script started");

    match args.command.unwrap_or(Action::Start) {
        Action::Start => {
            info!("Starting webcam service...");
            service::start(config).await
        }
        Action::Stop => {
            tokio::task::spawn_blocking(move || service::stop(&config)).await?;
            Ok(())
        }
    }
}
