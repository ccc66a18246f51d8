use std::process;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use tracing_subscriber::{filter::LevelFilter, fmt};

use vigil_app::config;
use vigil_app::error::AppError;
use vigil_app::server;

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "vigil",
    version,
    about = "Video policy-risk analysis service"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn parse() -> Self {
        <Self as Parser>::parse()
    }

    fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the vigil HTTP server.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct ServeArgs;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(&cli));

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Serve(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        None => match cli.verbose {
            0 => LevelFilter::OFF,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => {
            let config = config::load()?;
            server::serve(config).await?;
        }
        None => {
            Cli::print_help();
        }
    }

    Ok(())
}
