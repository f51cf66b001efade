//! The krait command line interface: a thin layer over the library crates
//! that parses arguments, loads configuration and prints results.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod commands;

/// Command line options of the `krait` cli.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Opt {
    /// The subcommand to execute.
    #[clap(subcommand)]
    command: Command,

    /// Enable verbose logging.
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Emit results and errors as json.
    #[clap(long, global = true)]
    json: bool,

    /// Path to a configuration file.
    #[clap(long, global = true)]
    rc_file: Option<PathBuf>,
}

/// The commands supported by `krait`.
#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Install packages into the active prefix.
    Install(commands::InstallOpt),

    /// Create a new prefix and install packages into it.
    Create(commands::CreateOpt),

    /// Update named packages, or all packages.
    Update(commands::UpdateOpt),

    /// Remove packages from the active prefix.
    Remove(commands::RemoveOpt),

    /// List the installed packages.
    List(commands::ListOpt),

    /// Purge caches.
    Clean(commands::CleanOpt),

    /// Print information about the environment.
    Info(commands::InfoOpt),

    /// Environment file import and export.
    #[clap(subcommand)]
    Env(commands::EnvCommand),
}

fn main() {
    let opt = Opt::parse();
    let json = opt.json;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to construct the tokio runtime");

    match runtime.block_on(async_main(opt)) {
        Ok(()) => {}
        Err(error) => {
            if json {
                let payload = serde_json::json!({
                    "success": false,
                    "error": format!("{error:#}"),
                });
                eprintln!("{payload}");
            } else {
                eprintln!("error: {error:#}");
            }
            std::process::exit(1);
        }
    }
}

async fn async_main(opt: Opt) -> anyhow::Result<()> {
    let default_filter = if opt.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_filter.into())
                .from_env()
                .context("invalid RUST_LOG filter")?,
        )
        .with_writer(std::io::stderr)
        .init();

    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let ctx = commands::build_context(opt.rc_file.as_deref(), command_line)?;

    match opt.command {
        Command::Install(cmd) => commands::install(&ctx, cmd, opt.json).await,
        Command::Create(cmd) => commands::create(&ctx, cmd, opt.json).await,
        Command::Update(cmd) => commands::update(&ctx, cmd, opt.json).await,
        Command::Remove(cmd) => commands::remove(&ctx, cmd, opt.json).await,
        Command::List(cmd) => commands::list(cmd, opt.json),
        Command::Clean(cmd) => commands::clean(&ctx, cmd),
        Command::Info(cmd) => commands::info(&ctx, cmd, opt.json),
        Command::Env(cmd) => commands::env(&ctx, cmd, opt.json).await,
    }
}
