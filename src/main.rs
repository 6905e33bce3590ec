use std::{path::PathBuf, process, sync::Arc};

use clap::{Args, Parser, Subcommand};
use extension_host::{
    config::{EnvConfig, HostConfig},
    context::ProcessLauncher,
    logger::init_tracing,
    schema::write_schema,
    server::serve,
};
use extension_sdk::message::LogLevel;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "extension_host",
    about = "Runs extension commands and bridges them to a native host over framed stdio",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the framed protocol on stdin/stdout
    Serve(ServeArgs),

    /// Emit JSON-Schema for the wire records
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Optional .env file read before the environment
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Also write rolling log files here
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Relative entrypoints resolve against this directory
    #[arg(long)]
    extensions_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Schema(args) => write_schema(&args.out).map(|files| {
            for file in files {
                eprintln!("wrote {}", args.out.join(file).display());
            }
        }),
    };
    if let Err(err) = result {
        error!(error = %err, "extension host failed");
        eprintln!("❌ {err:#}");
        process::exit(1);
    }
}

async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let source = EnvConfig::new(args.env_file.as_deref());
    let mut host = HostConfig::load(&source).await;
    if let Some(level) = args.log_level {
        host.log_level = level;
    }
    if args.log_dir.is_some() {
        host.log_dir = args.log_dir;
    }
    init_tracing(host.log_level, host.log_dir.as_deref())?;
    info!(?host, "starting extension host");

    let launcher = Arc::new(ProcessLauncher::new(args.extensions_dir, host.runtime()));
    tokio::select! {
        served = serve(tokio::io::stdin(), tokio::io::stdout(), launcher, host.max_frame_bytes) => served,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
