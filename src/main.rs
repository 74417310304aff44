//! Clusterforge CLI.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "clusterforge",
    version,
    about = "Compile declarative Kubernetes cluster configs into CloudFormation stacks"
)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: clusterforge::cli::Commands,
}

/// Initialize the tracing subscriber. RUST_LOG wins over `--log-level`.
fn init_logging(level: &str) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .map_err(|e| format!("invalid log level {:?}: {}", level, e))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = clusterforge::cli::dispatch(cli.command).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
