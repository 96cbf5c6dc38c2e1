use std::path::PathBuf;

use clap::{Parser, Subcommand};

use lumen_app::{commands, logging, LogConfig, LogFormat};
use lumen_history::{CatchupTarget, DEFAULT_CHECKPOINT_FREQUENCY};

/// Consensus and ledger sync tooling for a lumen validator
#[derive(Parser)]
#[command(name = "lumen")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, default_value = "text", global = true)]
    log_format: CliLogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum CliLogFormat {
    #[default]
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the local quorum set hash
    CheckConfig {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Show which ledgers a catch-up run would replay
    PlanCatchup {
        /// Local last closed ledger
        #[arg(long)]
        lcl: u32,

        /// Target ledger or "current"
        #[arg(long)]
        to: CatchupTarget,

        /// Ledgers of history to replay before the target, or "complete"
        #[arg(long, default_value = "0", value_parser = commands::parse_count)]
        count: u32,

        #[arg(long, default_value_t = DEFAULT_CHECKPOINT_FREQUENCY)]
        frequency: u32,

        /// Latest ledger the archive would report, for a "current" target
        #[arg(long)]
        current_ledger: Option<u32>,
    },

    /// List the checkpoints covering a ledger range
    PrintCheckpoints {
        #[arg(long)]
        from: u32,

        #[arg(long)]
        to: u32,

        #[arg(long, default_value_t = DEFAULT_CHECKPOINT_FREQUENCY)]
        frequency: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    match cli.command {
        Commands::CheckConfig { path } => {
            print!("{}", commands::check_config(&path)?);
        }
        Commands::PlanCatchup {
            lcl,
            to,
            count,
            frequency,
            current_ledger,
        } => {
            let range = commands::plan_catchup(lcl, to, count, frequency, current_ledger)?;
            print!("{}", commands::format_plan(&range));
        }
        Commands::PrintCheckpoints {
            from,
            to,
            frequency,
        } => {
            for checkpoint in commands::print_checkpoints(from, to, frequency)? {
                println!("{checkpoint}");
            }
        }
    }
    Ok(())
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };
    let config = LogConfig::default().with_level(level)?;
    let config = match cli.log_format {
        CliLogFormat::Text => config,
        format @ CliLogFormat::Json => config.with_format(format.into()).with_colors(false),
    };
    logging::init(&config)?;
    tracing::debug!("logging initialized");
    Ok(())
}
