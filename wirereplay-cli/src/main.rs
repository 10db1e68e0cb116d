//! WireReplay CLI - Command-line tools for replaying recorded wire traffic

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use wirereplay_core::prelude::*;

#[derive(Parser)]
#[command(name = "wirereplay")]
#[command(about = "Replay recorded database wire-protocol traffic", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "WIREREPLAY_CONFIG")]
    config: Option<PathBuf>,

    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a playback file against a server
    Play {
        /// Playback file to replay
        #[arg(short, long)]
        playback_file: PathBuf,

        #[command(flatten)]
        timing: TimingArgs,

        #[command(flatten)]
        stats: StatsArgs,

        /// Server to replay against
        #[arg(short = 't', long)]
        target: Option<String>,

        /// Ops dispatched between pacing checks
        #[arg(long)]
        queue_granularity: Option<usize>,

        /// Per-connection queue capacity
        #[arg(long)]
        connection_buffer: Option<usize>,

        /// Remap cursor ids before replaying
        #[arg(long)]
        preprocess: bool,
    },
    /// Remove driver ops and split a playback file by connection
    Filter {
        /// Playback file to read
        #[arg(short, long)]
        playback_file: PathBuf,

        /// Output file when not splitting
        #[arg(short, long)]
        output_file: Option<PathBuf>,

        /// Output file prefix when splitting
        #[arg(long)]
        outfile_prefix: Option<String>,

        /// Number of output files
        #[arg(long)]
        split: Option<usize>,

        /// Drop handshake and heartbeat commands
        #[arg(long)]
        remove_driver_ops: bool,

        /// Input is gzip-compressed
        #[arg(long)]
        gzip: bool,

        /// Compress the outputs
        #[arg(long)]
        gzip_output: bool,
    },
    /// Accept ops over HTTP and replay them against a server
    Serve {
        /// Listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Server to replay against
        #[arg(short = 't', long)]
        target: Option<String>,

        /// Time multiplier
        #[arg(long)]
        speed: Option<f64>,

        /// Ignore recorded timing
        #[arg(long)]
        full_speed: bool,

        #[command(flatten)]
        stats: StatsArgs,
    },
    /// Post a playback file to a running ingestion server
    Send {
        /// Playback file to send
        #[arg(short, long)]
        playback_file: PathBuf,

        /// Ingestion server URL
        #[arg(short, long, default_value = "http://localhost:9090/")]
        server: String,

        #[command(flatten)]
        timing: TimingArgs,
    },
    /// Version information
    Version,
}

#[derive(clap::Args)]
struct TimingArgs {
    /// Time multiplier (2.0 plays twice as fast)
    #[arg(long)]
    speed: Option<f64>,

    /// Passes over the file
    #[arg(long)]
    repeat: Option<i32>,

    /// Seconds of ops that may be queued ahead of time
    #[arg(long, value_name = "SECS")]
    queue_time: Option<u64>,

    /// Ignore recorded timing
    #[arg(long)]
    full_speed: bool,

    /// Input is gzip-compressed
    #[arg(long)]
    gzip: bool,
}

impl TimingArgs {
    fn apply(&self, play: &mut PlayConfig) {
        if let Some(speed) = self.speed {
            play.speed = speed;
        }
        if let Some(repeat) = self.repeat {
            play.repeat = repeat;
        }
        if let Some(secs) = self.queue_time {
            play.queue_time = Duration::from_secs(secs);
        }
        play.full_speed |= self.full_speed;
        play.gzip |= self.gzip;
    }
}

#[derive(clap::Args)]
struct StatsArgs {
    /// Stats format: json, text or none
    #[arg(long)]
    collect: Option<StatFormat>,

    /// Write stats to this file instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,
}

impl StatsArgs {
    fn apply(&self, stats: &mut StatsConfig) {
        if let Some(format) = self.collect {
            stats.format = format;
        }
        if let Some(path) = &self.report {
            stats.output = Some(path.clone());
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "wirereplay_core=debug,info",
        (false, _) => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}

fn stat_collector(config: &StatsConfig) -> Result<Arc<StatCollector>> {
    let collector = match &config.output {
        Some(path) => StatCollector::to_file(path, config.format)
            .with_context(|| format!("cannot create stats file {}", path.display()))?,
        None => StatCollector::stdout(config.format),
    };
    Ok(Arc::new(collector))
}

fn report(summary: &PlaybackSummary) {
    info!(
        ops = summary.ops_dispatched,
        connections = summary.connections,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        ops_with_errors = summary.stats.ops_with_errors,
        "{} ops played back in {:.3}s over {} connections",
        summary.ops_dispatched,
        summary.elapsed.as_secs_f64(),
        summary.connections
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Commands::Version = cli.command {
        println!("wirereplay {}", env!("CARGO_PKG_VERSION"));
        println!("wirereplay-core {}", wirereplay_core::VERSION);
        return Ok(());
    }

    let mut config =
        WireReplayConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Play {
            playback_file,
            timing,
            stats,
            target,
            queue_granularity,
            connection_buffer,
            preprocess,
        } => {
            timing.apply(&mut config.play);
            stats.apply(&mut config.stats);
            if let Some(target) = target {
                config.play.target = target;
            }
            if let Some(granularity) = queue_granularity {
                config.play.queue_granularity = granularity;
            }
            if let Some(buffer) = connection_buffer {
                config.play.connection_buffer = buffer;
            }
            config.play.preprocess |= preprocess;
            config.validate()?;

            if config.play.full_speed {
                info!("Doing playback at full speed");
            } else {
                info!("Doing playback at {:.2}x speed", config.play.speed);
            }
            let dialer = TcpDialer::new(&config.play.target, config.play.dial_retry_window)?;
            let stats = stat_collector(&config.stats)?;
            let summary =
                play_file(&config.play, &playback_file, stats, Arc::new(dialer)).await?;
            report(&summary);
        }
        Commands::Filter {
            playback_file,
            output_file,
            outfile_prefix,
            split,
            remove_driver_ops,
            gzip,
            gzip_output,
        } => {
            let filter = &mut config.filter;
            if let Some(split) = split {
                filter.split = split;
            }
            if output_file.is_some() {
                filter.output_file = output_file;
            }
            if outfile_prefix.is_some() {
                filter.output_prefix = outfile_prefix;
            }
            filter.remove_driver_ops |= remove_driver_ops;
            filter.gzip |= gzip;
            filter.gzip_output |= gzip_output;

            let summary = filter_file(&config.filter, &playback_file).await?;
            info!(
                ops_read = summary.ops_read,
                ops_removed = summary.ops_removed,
                files = summary.non_empty_shards(),
                "Filter finished"
            );
        }
        Commands::Serve {
            listen,
            target,
            speed,
            full_speed,
            stats,
        } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(target) = target {
                config.play.target = target;
            }
            if let Some(speed) = speed {
                config.play.speed = speed;
            }
            config.play.full_speed |= full_speed;
            stats.apply(&mut config.stats);
            config.validate()?;

            let dialer = TcpDialer::new(&config.play.target, config.play.dial_retry_window)?;
            let mut options = ExecutionOptions::from(&config.play);
            // posted ops are replayed as sent; the sender decides what to drop
            options.skip_driver_ops = false;
            let context =
                ExecutionContext::new(Arc::new(dialer), stat_collector(&config.stats)?, options);
            context.probe().await?;

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Cannot listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
                info!("Shutting down");
            };
            let summary = serve(&config.server, context, shutdown).await?;
            report(&summary);
        }
        Commands::Send {
            playback_file,
            server,
            timing,
        } => {
            timing.apply(&mut config.play);
            config.validate()?;
            let summary = send_file(&config.play, &playback_file, &server).await?;
            info!(
                ops_sent = summary.ops_sent,
                ops_rejected = summary.ops_rejected,
                "Send finished"
            );
        }
        Commands::Version => {}
    }

    Ok(())
}
