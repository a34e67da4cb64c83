use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod workflows;

#[derive(Parser)]
#[command(name = "forkbuild")]
#[command(version, about = "Fetch, patch, build, package and publish forked releases", long_about = None)]
struct Cli {
    /// Settings file (default: ./forkbuild.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check upstream for a new release and derive the fork version
    Check {
        /// Ignore the recent-check marker and rebuild already built versions
        #[arg(short, long)]
        force: bool,
    },
    /// Fetch the upstream source tree
    Fetch {
        /// Upstream tag (default: from UPSTREAM_VERSION)
        #[arg(long)]
        tag: Option<String>,
    },
    /// Apply the branding, core and addon patch directories
    Patch,
    /// Run the upstream build
    Build,
    /// Package the build output for the target platform
    Package,
    /// Create the fork release and upload the packaged artifacts
    Publish,
    /// Run every stage in order when a build is due
    Run {
        /// Build even if this upstream version was built before
        #[arg(short, long)]
        force: bool,
    },
    /// Check host tools for every stage
    Preflight,
    /// Inspect or rebuild the version mapping
    Mapping {
        #[command(subcommand)]
        command: MappingCommands,
    },
}

#[derive(Subcommand)]
enum MappingCommands {
    /// Print every recorded fork version
    List,
    /// Rebuild records from the fork's published releases
    Import,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    workflows::install_interrupt_handler();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let ctx = workflows::Context::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Check { force } => workflows::check(&ctx, force).map(|_| ()),
        Commands::Fetch { tag } => workflows::fetch_cmd(&ctx, tag.as_deref()),
        Commands::Patch => workflows::patch_cmd(&ctx),
        Commands::Build => workflows::build_cmd(&ctx),
        Commands::Package => workflows::package_cmd(&ctx),
        Commands::Publish => workflows::publish_cmd(&ctx),
        Commands::Run { force } => workflows::run_all(&ctx, force),
        Commands::Preflight => workflows::preflight(&ctx),
        Commands::Mapping { command } => match command {
            MappingCommands::List => workflows::mapping_list(&ctx),
            MappingCommands::Import => workflows::mapping_import(&ctx),
        },
    }
}
