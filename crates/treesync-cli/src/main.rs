//! treesync - incremental file-tree updates over HTTP
//!
//! `treesync serve` publishes application trees; `treesync update` brings a
//! local copy of one of them up to date, transferring only changed files.

mod display;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use treesync_config::{ClientConfig, ConfigLoader, ServerConfig, CLIENT_STATE_FILE};
use treesync_network::{serve, UpdateClient};
use treesync_types::TransferMode;

/// treesync - incremental file-tree updates over HTTP
#[derive(Parser, Debug)]
#[command(
    name = "treesync",
    version = env!("CARGO_PKG_VERSION"),
    about = "Incremental file-tree updates over HTTP",
    long_about = "treesync keeps client copies of a directory tree in step with a server.\n\
                  Clients report content hashes, the server answers with the changed files\n\
                  packed into one archive, and clients apply it file by file."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose mode - detailed output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Server configuration file path
    #[arg(short, long, global = true, default_value = "treesync.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish the configured applications
    Serve {
        /// Override the listen address from the configuration
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Bring a local directory up to date
    Update {
        /// Server host[:port], taken from the state file when omitted
        #[arg(long)]
        host: Option<String>,
        /// Application name, taken from the state file when omitted
        #[arg(long)]
        app: Option<String>,
        /// Directory to update
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Glob patterns of local files never reported or overwritten
        #[arg(long)]
        ignore: Vec<String>,
        /// Only report whether an update is available
        #[arg(long)]
        check: bool,
        /// Download changed files one by one instead of as one archive
        #[arg(long)]
        per_file: bool,
        /// Timeout for each HTTP request, in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
    },
    /// Show server configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    init_logging(cli.debug, cli.quiet, cli.verbose, default_level)?;

    info!("treesync v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Serve { listen } => {
            serve_command(&cli.config, listen, cli.quiet).await?;
        }
        Commands::Update {
            host,
            app,
            dir,
            ignore,
            check,
            per_file,
            timeout,
        } => {
            let config = resolve_client_config(host, app, dir, ignore, check, per_file, timeout)?;
            update_command(config, cli.quiet).await?;
        }
        Commands::Config { default, init } => {
            config_command(&cli.config, default, init)?;
        }
    }

    Ok(())
}

fn init_logging(debug: bool, quiet: bool, verbose: bool, default_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else if quiet {
        "error"
    } else {
        default_level
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log filter")?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    Ok(())
}

async fn serve_command(config_path: &Path, listen: Option<String>, quiet: bool) -> Result<()> {
    let mut config = ConfigLoader::load_from_file(config_path)
        .with_context(|| format!("Cannot load {}", config_path.display()))?;
    if let Some(listen) = listen {
        config.listen = listen;
    }

    if !quiet {
        display::print_server_banner(&config);
    }

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
    };
    serve(config, shutdown).await?;
    Ok(())
}

/// Build the client configuration from flags, filling gaps from `.autoupdate`
fn resolve_client_config(
    host: Option<String>,
    app: Option<String>,
    dir: PathBuf,
    ignore: Vec<String>,
    check: bool,
    per_file: bool,
    timeout: u64,
) -> Result<ClientConfig> {
    let state = ConfigLoader::load_client_state(dir.join(CLIENT_STATE_FILE))
        .context("Cannot read client state")?;

    let mut config = ClientConfig::new(host.unwrap_or_default(), app.unwrap_or_default(), dir);
    config.ignore = ignore;
    config.check_only = check;
    config.transfer = if per_file {
        TransferMode::PerFile
    } else {
        TransferMode::Archive
    };
    config.request_timeout = Duration::from_secs(timeout);

    if let Some(state) = state {
        config = config.merge_state(&state);
    }
    config
        .validate()
        .context("Pass --host and --app, or run from a directory updated before")?;
    Ok(config)
}

async fn update_command(config: ClientConfig, quiet: bool) -> Result<()> {
    info!("Updating {} from {}", config.dir.display(), config.host);

    if !quiet {
        println!(
            "{} Updating {} from {} ({})",
            style("→").green().bold(),
            style(config.dir.display()).cyan(),
            style(&config.host).cyan(),
            style(&config.app).cyan()
        );
    }

    let client = UpdateClient::new(config)?;
    let spinner = display::create_spinner(quiet, "Checking for updates...");

    let outcome = client.run().await;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let outcome = outcome?;
    if !quiet {
        display::print_outcome(&outcome);
    }
    Ok(())
}

fn config_command(config_path: &Path, default: bool, init: bool) -> Result<()> {
    if init {
        ConfigLoader::generate_default_config(config_path)
            .with_context(|| format!("Cannot write {}", config_path.display()))?;
        println!(
            "{} Wrote default configuration to {}",
            style("✓").green(),
            style(config_path.display()).cyan()
        );
        return Ok(());
    }

    let config = if default {
        println!("{} Default configuration:", style("⚙").blue().bold());
        ServerConfig::default()
    } else {
        println!(
            "{} Configuration from {}:",
            style("⚙").blue().bold(),
            config_path.display()
        );
        ConfigLoader::load_from_file(config_path)
            .with_context(|| format!("Cannot load {}", config_path.display()))?
    };
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
