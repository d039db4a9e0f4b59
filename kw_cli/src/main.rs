//! kegwright CLI - install, activate and smoke test declared packages.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use kw_io::install::{Installer, create_installer};

mod commands;
mod display;

use display::{format_bytes, header};

#[derive(Parser)]
#[command(name = "kw")]
#[command(about = "kegwright - install, activate and smoke test packages from declarations")]
#[command(version)]
struct Cli {
    /// Directory for kegwright's cache, unpacked artifacts and receipts
    #[arg(long, env = "KW_ROOT", default_value = "/opt/kegwright/.kegwright")]
    root: PathBuf,

    /// Prefix holding Cellar/, opt/, etc/ and var/
    #[arg(long, env = "KW_PREFIX", default_value = "/opt/kegwright")]
    prefix: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, verify and install a package declaration
    Install {
        /// Path to the package declaration (JSON)
        declaration: PathBuf,

        /// Skip runtime directories, links and self-configuration
        #[arg(long)]
        no_bootstrap: bool,

        /// Do not write the service file
        #[arg(long)]
        no_service: bool,
    },

    /// Create runtime directories and links, and self-configure once
    Bootstrap {
        declaration: PathBuf,
    },

    /// Run the smoke-test scenarios of an installed package
    Test {
        declaration: PathBuf,

        /// Run only the scenario with this name
        #[arg(long)]
        scenario: Option<String>,
    },

    /// Manage the service of a package
    Service {
        declaration: PathBuf,

        #[command(subcommand)]
        action: ServiceAction,
    },

    /// Show post-install notes for an installed package
    Caveats {
        declaration: PathBuf,
    },

    /// List installed packages
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the SHA-256 of a file, or the tree digest of a directory
    Digest {
        path: PathBuf,
    },

    /// Validate a package declaration
    Check {
        declaration: PathBuf,
    },

    /// Remove interrupted staging and unreferenced artifacts
    Cleanup,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum ServiceAction {
    /// Print the service file without writing it
    Render,
    /// Write the service file
    Install,
    Start,
    Stop,
    Restart,
    /// Stop the service and delete its file
    Remove,
    Status,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var("KW_LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), kw_core::Error> {
    // Commands that need no state
    match &cli.command {
        Commands::Digest { path } => return commands::info::run_digest(path),
        Commands::Check { declaration } => return commands::info::run_check(declaration),
        _ => {}
    }

    let mut installer = create_installer(&cli.root, &cli.prefix)?;

    match cli.command {
        Commands::Digest { .. } | Commands::Check { .. } => unreachable!(),

        Commands::Install {
            declaration,
            no_bootstrap,
            no_service,
        } => commands::install::run(&mut installer, &declaration, no_bootstrap, no_service).await,

        Commands::Bootstrap { declaration } => {
            commands::bootstrap::run(&mut installer, &declaration)
        }

        Commands::Test {
            declaration,
            scenario,
        } => commands::test::run(&installer, &declaration, scenario.as_deref()).await,

        Commands::Service {
            declaration,
            action,
        } => commands::service::run(&installer, &declaration, action),

        Commands::Caveats { declaration } => commands::info::run_caveats(&installer, &declaration),

        Commands::List { json } => commands::info::run_list(&installer, json),

        Commands::Cleanup => run_cleanup(&mut installer),
    }
}

fn run_cleanup(installer: &mut Installer) -> Result<(), kw_core::Error> {
    header("Cleaning up...");

    let result = installer.cleanup()?;

    if result.store_entries_removed == 0
        && result.blobs_removed == 0
        && result.temp_files_removed == 0
        && result.locks_removed == 0
    {
        println!("Nothing to clean up.");
        return Ok(());
    }

    if result.store_entries_removed > 0 {
        println!(
            "    {} Removed {} unpacked artifacts",
            style("✓").green(),
            result.store_entries_removed
        );
    }
    if result.blobs_removed > 0 {
        println!(
            "    {} Removed {} cached downloads",
            style("✓").green(),
            result.blobs_removed
        );
    }
    if result.temp_files_removed > 0 {
        println!(
            "    {} Removed {} interrupted staging entries",
            style("✓").green(),
            result.temp_files_removed
        );
    }
    if result.locks_removed > 0 {
        println!(
            "    {} Removed {} stale lock files",
            style("✓").green(),
            result.locks_removed
        );
    }
    if result.bytes_freed > 0 {
        println!(
            "\n    Freed {}",
            style(format_bytes(result.bytes_freed)).green().bold()
        );
    }

    Ok(())
}
