//! audiomirror CLI Application

mod settings;

use anyhow::Context;
use audiomirror_core::{AudioBackend, ChannelId, EngineConfig, PcmFormat, StatusSnapshot};
use audiomirror_infra::{CpalBackend, FakeBackend, MirrorEngine};
use clap::{Args, Parser, Subcommand};
use settings::Overrides;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "audiomirror")]
#[command(about = "Mirror one captured audio stream to two outputs", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start mirroring until Ctrl-C
    Run(RunArgs),
    /// Print the default configuration document
    DefaultConfig,
    /// Parse and validate a configuration document
    Check {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// JSON configuration document
    #[arg(long)]
    config: Option<PathBuf>,

    /// Render device for the main channel
    #[arg(long)]
    main_device: Option<String>,

    /// Render device for the aux channel
    #[arg(long)]
    aux_device: Option<String>,

    /// Allow internal resampling instead of failing on format mismatches
    #[arg(long)]
    flexible: bool,

    /// Seconds between status lines
    #[arg(long, default_value_t = 5)]
    status_interval: u64,

    /// Run against in-memory devices fed with silence
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&EngineConfig::default())?);
            Ok(())
        }
        Command::Check { config } => {
            let config = settings::load(Some(&config))?;
            config.validate().context("configuration is not valid")?;
            println!("configuration OK");
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = settings::load(args.config.as_deref())?;
    Overrides {
        main_device: args.main_device,
        aux_device: args.aux_device,
        flexible: args.flexible,
    }
    .apply(&mut config);

    let feeding = Arc::new(AtomicBool::new(false));
    let backend: Arc<dyn AudioBackend> = if args.dry_run {
        info!("dry run: using in-memory devices");
        let fake = FakeBackend::new();
        spawn_silence_feeder(fake.clone(), Arc::clone(&feeding));
        Arc::new(fake)
    } else {
        Arc::new(CpalBackend::new())
    };

    info!("audiomirror starting");
    let mut engine = MirrorEngine::new(backend, config);
    engine.start().context("failed to start mirroring")?;

    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for Ctrl-C")?;
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => log_status(&engine.status_snapshot()),
        }
    }

    engine.stop();
    feeding.store(false, Ordering::Release);
    Ok(())
}

fn log_status(snapshot: &StatusSnapshot) {
    for channel in ChannelId::ALL {
        let status = snapshot.channel(channel);
        info!(
            channel = %channel,
            running = status.running,
            internal_resampler = status.internal_resampler,
            multi_stage_src = status.multi_stage_src,
            underruns = status.underruns,
            frames_rendered = status.frames_rendered,
            "status"
        );
    }
}

/// Deliver 10 ms blocks of silence into the fake capture while it runs
fn spawn_silence_feeder(backend: FakeBackend, feeding: Arc<AtomicBool>) {
    let format = PcmFormat::int(48000, 16);
    let block = vec![0u8; format.frames_to_bytes(format.frames_for(Duration::from_millis(10)))];
    feeding.store(true, Ordering::Release);

    thread::spawn(move || {
        while feeding.load(Ordering::Acquire) {
            backend.inject_capture(&block);
            thread::sleep(Duration::from_millis(10));
        }
    });
}
