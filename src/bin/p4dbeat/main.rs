// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use p4dbeat::beater::Beater;
use p4dbeat::error::BoxError;
use p4dbeat::init::args::BeatArgs;
use p4dbeat::init::config;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::select;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{error, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// YAML config file. When given, settings come from the file and
    /// P4DBEAT_* environment variables instead of the flags below.
    #[arg(short, long, env = "P4DBEAT_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    beat: BeatArgs,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Ship log files
    Run(Box<RunArgs>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "p4dbeat")]
#[command(bin_name = "p4dbeat")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "P4DBEAT_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }

        Some(Commands::Run(run)) => {
            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            let RunArgs { config: config_file, beat } = *run;
            let args = match config_file {
                Some(path) => match config::load_file(&path) {
                    Ok(args) => args,
                    Err(e) => {
                        error!(error = %e, "Failed to load configuration.");
                        return ExitCode::from(1);
                    }
                },
                None => beat,
            };
            let beat_config = match args.build_config() {
                Ok(config) => config,
                Err(e) => {
                    error!(error = %e, "Invalid configuration.");
                    return ExitCode::from(1);
                }
            };

            if let Err(e) = run_beat(Beater::new(beat_config)) {
                error!(error = %e, "p4dbeat exited with an error.");
                return ExitCode::from(1);
            }
        }

        None => {
            // it shouldn't be possible to get here since we mark a subcommand as
            // required
            eprintln!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_beat(beater: Beater) -> Result<(), BoxError> {
    // Install handlers before anything can report readiness
    let mut sig_term = sig(SignalKind::terminate())?;
    let mut sig_int = sig(SignalKind::interrupt())?;

    let shutdown = CancellationToken::new();
    let mut handle = tokio::spawn(beater.run(shutdown.clone()));

    select! {
        _ = signal_wait(&mut sig_term, &mut sig_int) => {
            info!("Shutdown signal received.");
            shutdown.cancel();
        },
        res = &mut handle => {
            res??;
            return Ok(());
        }
    }

    handle.await??;
    Ok(())
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);
        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = std::io::stdout().is_terminal();

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

async fn signal_wait(sig_term: &mut Signal, sig_int: &mut Signal) {
    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
}

fn sig(kind: SignalKind) -> Result<Signal, BoxError> {
    signal(kind).map_err(|e| format!("failed to install signal handler: {}", e).into())
}
