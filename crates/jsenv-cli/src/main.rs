//! jsenv - drive the native script-engine boundary from the command line

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

/// Script-engine boundary driver
#[derive(Parser, Debug)]
#[command(name = "jsenv")]
#[command(author, version, about = "Run scripts and check engines through the jsenv boundary")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a script against a fresh heap engine
    Run(commands::run::RunArgs),

    /// Open an engine library and negotiate versions through its entry point
    Handshake(commands::handshake::HandshakeArgs),

    /// Print the effective configuration
    Config(commands::config::ConfigArgs),
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let use_color = !cli.no_color && !cli.quiet && atty::is(atty::Stream::Stdout);

    let Some(command) = cli.command else {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Run(args) => commands::run::run(args, cli.format, use_color, cli.quiet),
        Commands::Handshake(args) => commands::handshake::run(args, cli.format, use_color),
        Commands::Config(args) => commands::config::run(args, cli.format),
    }
}
