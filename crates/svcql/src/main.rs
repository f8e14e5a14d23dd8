use clap::{Parser, ValueEnum};
use logutil::LogFormat;
use svcql::commands::Commands;
use svcql_error::Result;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogFormatArg {
    #[default]
    Pretty,
    Json,
    Compact,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Pretty => LogFormat::HumanReadable,
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Compact => LogFormat::Compact,
        }
    }
}

#[derive(Parser)]
#[clap(name = "svcql")]
#[clap(version)]
#[clap(about = "Run SQL against dataflow services", long_about = None)]
struct Cli {
    /// Log verbosity.
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Format of log lines.
    #[clap(long, global = true, value_enum, default_value_t)]
    log_format: LogFormatArg,

    #[clap(subcommand)]
    command: Commands,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logutil::configure_global_logger(
        logutil::level_from_verbosity(cli.verbose),
        cli.log_format.into(),
        std::io::stderr,
    );
    info!(version = env!("CARGO_PKG_VERSION"), "starting...");

    cli.command.run()
}
