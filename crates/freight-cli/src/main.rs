use clap::{Parser, Subcommand};
use freight_cli::cmd;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "freight",
    about = "Build a reactive store from a YAML manifest and drive its deeds",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log deed and process activity to stderr
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a manifest and list its deeds
    Check {
        /// Path to the manifest
        manifest: PathBuf,
    },

    /// Call a deed and print the resulting cargo
    Run {
        /// Path to the manifest
        manifest: PathBuf,

        /// Deed to call
        deed: String,

        /// Arguments; each is parsed as JSON, falling back to a plain string
        args: Vec<String>,

        /// Also list every process and its state after the run
        #[arg(long)]
        processes: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Check { manifest } => cmd::check::run(&manifest, cli.json),
        Commands::Run {
            manifest,
            deed,
            args,
            processes,
        } => cmd::run::run(&manifest, &deed, &args, processes, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
