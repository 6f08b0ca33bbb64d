//! Binary entry point for ctxscope.
//!
//! Connects a root scope from configuration and checks that every configured
//! resource is usable.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctxscope::config::ScopeConfig;
use ctxscope::observability;
use ctxscope::{ConnectionPool, PgPool, Scope};
use std::path::PathBuf;
use std::process::ExitCode;

/// ctxscope - request-scoped resource environment.
#[derive(Parser)]
#[command(name = "ctxscope")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "CTXSCOPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Connect every configured resource and run one request against it.
    Check,

    /// Show the effective configuration with credentials redacted.
    Config {
        /// Print the default config file path instead.
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is not an error.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = match ScopeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    // Applies to the root scope's logger as well as the subscriber.
    if cli.verbose {
        config.logging.enable_verbose();
    }
    if let Err(e) = observability::init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Check => cmd_check(&config).await,
        Commands::Config { path } => cmd_config(&config, path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Connects the root scope and exercises each active resource.
async fn cmd_check(config: &ScopeConfig) -> Result<()> {
    let root = match Scope::connect(config).await {
        Ok(root) => root,
        Err(err) => {
            let (partial, error) = err.into_parts();
            print_resources(&partial);
            return Err(error).context("root scope construction failed");
        },
    };
    print_resources(&root);

    if root.raw_pool().is_some() {
        let row_count = root
            .with_request(async |scope: &mut Scope<PgPool>| -> Result<usize> {
                let tx = scope.transaction().await?;
                let rows = tx.query("SELECT 1", &[]).await?;
                tx.rollback().await?;
                Ok(rows.len())
            })
            .await
            .context("database request failed")?;
        println!("database: ok ({row_count} row)");
    }

    #[cfg(feature = "redis")]
    {
        if let Some(cache) = root.cache() {
            cache
                .connection()
                .await
                .context("cache connection failed")?;
            println!("cache: ok");
        }
    }

    if let Some(pool) = root.raw_pool() {
        let status = pool.status();
        println!(
            "pool: {}/{} open, {} available",
            status.size, status.max_size, status.available
        );
    }
    Ok(())
}

fn print_resources(scope: &Scope<PgPool>) {
    let active = |on: bool| if on { "active" } else { "inactive" };
    println!("database:  {}", active(scope.raw_pool().is_some()));
    #[cfg(feature = "redis")]
    println!("cache:     {}", active(scope.cache().is_some()));
    println!("reporting: {}", active(scope.reporting_active()));
}

/// Prints the effective configuration.
fn cmd_config(config: &ScopeConfig, path: bool) -> Result<()> {
    if path {
        let default = ScopeConfig::default_path().context("no home directory to resolve config path")?;
        println!("{}", default.display());
        return Ok(());
    }

    for (key, value) in config.redacted_summary() {
        println!("{key:<24} {value}");
    }
    Ok(())
}
