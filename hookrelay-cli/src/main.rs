use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

mod command;
mod config;
mod signal;
mod supervisor;
mod sys;
mod ui;

use command::listen::Globals;
use ui::Mode;

#[derive(Debug, clap::Parser)]
#[command(name = "hookrelay", version)]
#[command(about = "Receive webhooks on your local server while you develop.", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,

    /// Profile to use for authentication and configuration
    #[arg(long, default_value = "default", global = true)]
    profile: String,

    /// Credentials file to read the API key from
    #[arg(long, env = "HOOKRELAY_CREDENTIALS", global = true)]
    credentials: Option<PathBuf>,

    #[command(subcommand)]
    command: command::Command,
}

/// Log file used while the full-screen UI owns the terminal.
fn log_file_path() -> Option<PathBuf> {
    sys::dirs::state_dir().map(|dir| dir.join("hookrelay").join("hookrelay.log"))
}

fn log_writer(mode: Mode) -> BoxMakeWriter {
    if mode == Mode::Log {
        return BoxMakeWriter::new(std::io::stderr);
    }
    let file = log_file_path().and_then(|path| {
        fs::create_dir_all(path.parent()?).ok()?;
        OpenOptions::new().create(true).append(true).open(path).ok()
    });
    match file {
        Some(file) => BoxMakeWriter::new(Mutex::new(file)),
        None => BoxMakeWriter::new(std::io::sink),
    }
}

fn init_logger_env(verbosity: &Verbosity, mode: Mode) {
    use tracing::level_filters::LevelFilter;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .with_env_var("HOOKRELAY_LOG")
        .from_env_lossy();

    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(match (verbosity.is_present(), verbosity.is_silent()) {
            (false, _) => env_filter,
            (true, true) => env_filter.add_directive(LevelFilter::OFF.into()),
            (true, false) => {
                let level_filter = match verbosity.log_level_filter() {
                    clap_verbosity_flag::LevelFilter::Off => LevelFilter::OFF,
                    clap_verbosity_flag::LevelFilter::Error => LevelFilter::ERROR,
                    clap_verbosity_flag::LevelFilter::Warn => LevelFilter::WARN,
                    clap_verbosity_flag::LevelFilter::Info => LevelFilter::INFO,
                    clap_verbosity_flag::LevelFilter::Debug => LevelFilter::DEBUG,
                    clap_verbosity_flag::LevelFilter::Trace => LevelFilter::TRACE,
                };
                env_filter.add_directive(level_filter.into())
            }
        })
        .with_ansi(mode == Mode::Log)
        .with_writer(log_writer(mode))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match &cli.command {
        command::Command::Listen(args) => {
            let mode = Mode::detect(args.no_ui);
            init_logger_env(&cli.verbose, mode);

            let globals = Globals {
                profile: &cli.profile,
                credentials: cli.credentials.clone(),
                mode,
            };
            match command::listen::execute(args, &globals).await {
                Ok(summary) => ExitCode::from(summary.exit_code()),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    if let Some(hint) = e.hint() {
                        eprintln!();
                        eprintln!("{}", hint);
                    }
                    ExitCode::from(e.exit_code())
                }
            }
        }
    }
}
