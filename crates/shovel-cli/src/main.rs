mod config;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};

use run_cmd::RunArgs;

#[derive(Parser)]
#[command(
    name = "shovel",
    about = "Generate Docker evaluation environments for bug-fix instances with Claude Code"
)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a shovel config file with default values
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Process an instance file and write the environment specs
    Run(RunArgs),
    /// Summarize an output file and its failure log
    Status {
        /// Output file written by `shovel run`
        #[arg(long, default_value = "docker_res.json")]
        output: PathBuf,
    },
    /// Print shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

/// Execute the `shovel init` command: write config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    config::save_config(&config::ConfigFile::with_defaults())?;

    println!("Config written to {}", path.display());
    println!();
    println!("Next: run `shovel run --input <instances.jsonl>`.");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init { force } => {
            cmd_init(force)?;
        }
        Commands::Run(args) => {
            let code = run_cmd::run(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status { output } => {
            status_cmd::run_status(&output)?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "shovel", &mut std::io::stdout());
        }
    }

    Ok(())
}
