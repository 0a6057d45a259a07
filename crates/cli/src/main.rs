use buildbucket::BbClient;
use clap::{Parser, Subcommand};
use resolver::{resolve_try_mirrors, MirrorTables};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "try-mirrors")]
#[command(about = "Map CI builders to the try builders that mirror them", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the CI builders that run a suite, without querying Buildbucket.
    Builders {
        /// Telemetry suite name (as passed in the isolate's args).
        suite: String,
        /// Directory of autogenerated //testing/buildbot JSON files.
        #[arg(long)]
        buildbot_dir: PathBuf,
    },
    /// Resolve the try builders mirroring the CI builders that run a suite.
    Resolve {
        /// Telemetry suite name (as passed in the isolate's args).
        suite: String,
        /// Directory of autogenerated //testing/buildbot JSON files.
        #[arg(long)]
        buildbot_dir: PathBuf,
        /// Maximum concurrent Buildbucket queries.
        #[arg(long)]
        jobs: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("warning: .env: {}", e);
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Builders { suite, buildbot_dir } => cmd_builders(&suite, &buildbot_dir),
        Commands::Resolve {
            suite,
            buildbot_dir,
            jobs,
        } => cmd_resolve(&suite, &buildbot_dir, jobs).await,
    }
}

// ---------------------------------------------------------------------------
// builders
// ---------------------------------------------------------------------------

fn cmd_builders(suite: &str, buildbot_dir: &Path) -> anyhow::Result<()> {
    let ci_builders = suiteconf::relevant_ci_builders(suite, buildbot_dir)?;

    println!("+------------------------------------------+");
    println!("| CI BUILDERS                              |");
    println!("+------------------------------------------+");
    println!("| Suite          : {:>22} |", suite);
    println!("| Builders       : {:>22} |", ci_builders.len());
    println!("+------------------------------------------+");

    if ci_builders.is_empty() {
        println!("No CI builders run this suite.");
    } else {
        for builder in &ci_builders {
            println!("  {builder}");
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// resolve
// ---------------------------------------------------------------------------

async fn cmd_resolve(suite: &str, buildbot_dir: &Path, jobs: Option<usize>) -> anyhow::Result<()> {
    let ci_builders = suiteconf::relevant_ci_builders(suite, buildbot_dir)?;
    if ci_builders.is_empty() {
        println!("No CI builders run suite `{suite}` - nothing to resolve.");
        return Ok(());
    }

    let jobs = jobs.unwrap_or_else(default_jobs);
    let merged = resolve_try_mirrors(
        ci_builders.clone(),
        Arc::new(MirrorTables::chromium_defaults()),
        Arc::new(BbClient::from_env()),
        jobs,
    )
    .await?;
    let mirrors = merged.into_result()?;

    println!("+------------------------------------------+");
    println!("| TRY MIRRORS                              |");
    println!("+------------------------------------------+");
    println!("| Suite          : {:>22} |", suite);
    println!("| CI builders    : {:>22} |", ci_builders.len());
    println!("| Try builders   : {:>22} |", mirrors.len());
    println!("+------------------------------------------+");

    if mirrors.is_empty() {
        println!("No try builders mirror this suite's CI builders.");
    } else {
        for try_builder in &mirrors {
            println!("  {try_builder}");
        }
    }

    Ok(())
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}
