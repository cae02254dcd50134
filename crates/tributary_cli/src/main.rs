//! Tributary CLI - runs one incremental sync of the configured resources.

mod config;
mod run;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tributary")]
#[command(version)]
#[command(about = "Incremental sync of a cursor-paginated API into JSON lines")]
#[command(
    long_about = "Tributary pulls every configured resource from the upstream API, \
routes objects and change events to per-resource mappings, and writes normalized \
records to a directory of JSON-lines files. The first run (and any run more than \
30 days after the previous one) is a full sync; later runs only download change \
events created since the previous run."
)]
#[command(after_long_help = r#"EXAMPLES
    Sync the resources declared in ./tributary.toml:
        $ tributary

    Use another config file and output directory:
        $ tributary --config prod.toml --output /var/lib/tributary

    Check credentials and configuration without writing anything:
        $ tributary --dry-run

CONFIGURATION
    Tributary reads configuration from:
      1. ~/.config/tributary/config.toml (or $XDG_CONFIG_HOME/tributary/config.toml)
      2. ./tributary.toml, or the file given with --config
      3. Environment variables (TRIBUTARY_* prefix, e.g., TRIBUTARY_API_SECRET)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    TRIBUTARY_API_SECRET    Secret API key
    TRIBUTARY_API_RPS       Maximum requests per second (default: 80)
    TRIBUTARY_SINK_DIR      Output directory (default: ~/.local/state/tributary/output)
"#)]
pub struct Cli {
    /// Config file to use instead of ./tributary.toml
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run the sync without writing records or run state
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Output directory (overrides config)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("tributary=info,tributary_cli=info"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Load configuration (config file -> env vars -> defaults)
    let config = config::Config::load(cli.config.as_deref());

    run::handle_run(&cli, &config).await
}
