use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser)]
#[command(name = "chatplug")]
#[command(about = "Plugin orchestration core for chat applications", long_about = None)]
struct Cli {
    /// Config file (defaults to $CHATPLUG_CONFIG or ~/.chatplug/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load all plugins and print their state and health
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Send one message through the plugin pipeline
    Run {
        /// Message to process
        #[arg(short, long)]
        message: String,
        /// Backend plugin to use (defaults to the first active one)
        #[arg(short, long)]
        backend: Option<String>,
        /// Model name placed on the chat context
        #[arg(long, default_value = "default")]
        model: String,
    },
    /// Print hook metrics
    Metrics {
        /// prometheus or json (defaults to manager.telemetry.format)
        #[arg(short, long)]
        format: Option<String>,
        /// Sample messages to run before rendering
        #[arg(short, long)]
        message: Vec<String>,
        #[arg(long, default_value = "default")]
        model: String,
    },
    /// Watch the config file and hot-reload changed plugins
    Watch {
        /// Poll interval (e.g. 5s, 1m)
        #[arg(short, long, default_value = "5s")]
        interval: String,
        /// Watch even when manager.hot_reload is false
        #[arg(long)]
        force: bool,
    },
    /// Show version information
    Version,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Some(Commands::Version) | None => {
            println!("chatplug {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Status { json }) => {
            cli::status::cmd_status(cli.config, json).await?;
        }
        Some(Commands::Run {
            message,
            backend,
            model,
        }) => {
            cli::run::cmd_run(cli.config, message, backend, model).await?;
        }
        Some(Commands::Metrics {
            format,
            message,
            model,
        }) => {
            cli::metrics::cmd_metrics(cli.config, format, message, model).await?;
        }
        Some(Commands::Watch { interval, force }) => {
            cli::watch::cmd_watch(cli.config, interval, force).await?;
        }
    }

    Ok(())
}
