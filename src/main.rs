use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};

use replaysql::{capture::CaptureFile, dispatcher::Dispatcher, postgres::PgDriver};

#[derive(Debug, Parser)]
#[command(name = "replaysql")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a captured workload against the target server.
    Replay {
        /// Path to config TOML.
        #[arg(long)]
        config: PathBuf,
        /// Path to the capture file to replay.
        #[arg(long)]
        capture: PathBuf,
        /// Log level override (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Print the number of commands in a capture file.
    Inspect {
        /// Path to the capture file.
        #[arg(long)]
        capture: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Replay {
            config,
            capture,
            log_level,
        } => {
            let config = replaysql::config::Config::from_path(config)?;
            replaysql::logging::init(&config, log_level.as_deref())?;

            let capture = CaptureFile::open(capture)?;
            let commands = capture.read_all().await?;
            let total = commands.len();
            tracing::info!(total, "replaying capture");

            let idle_timeout = Duration::from_secs(config.replay.worker_idle_timeout_s);
            let dispatcher = Arc::new(Dispatcher::from_config(&config, Arc::new(PgDriver)));

            let sweeper = {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(idle_timeout.min(Duration::from_secs(30))).await;
                        dispatcher.remove_idle(idle_timeout).await;
                    }
                })
            };

            for command in commands {
                dispatcher.dispatch(command);
            }

            tokio::select! {
                _ = dispatcher.wait_until_idle() => {
                    tracing::info!("replay finished");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted; shutting down");
                }
            }

            sweeper.abort();
            dispatcher.shutdown().await;
        }
        Command::Inspect { capture } => {
            let capture = CaptureFile::open(capture)?;
            println!("{}", capture.command_count().await?);
        }
    }

    Ok(())
}
