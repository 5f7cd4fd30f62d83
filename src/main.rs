use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use devmode::amfi::{AmfiClient, DevModeError, RetryPolicy};
use devmode::session::{SessionError, SessionFactory, TcpSessionFactory};
use devmode::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use thiserror::Error;
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(udid = %cli.udid, addr = %cli.lockdown_addr, "connecting to device");

    let factory: Arc<dyn SessionFactory> = Arc::new(TcpSessionFactory::new(&cli.lockdown_addr));
    let session = factory.connect(&cli.udid).await?;
    let mut client = AmfiClient::new(session, factory);

    match cli.command {
        Command::OverridePath => {
            client.create_show_override_path_file().await?;
            println!("override path marker file created");
        }
        Command::Enable(args) => {
            client = client.with_retry_policy(RetryPolicy {
                max_retries: args.reconnect_retries,
                delay: Duration::from_secs(args.reconnect_delay_secs),
            });
            client.enable_developer_mode(!args.skip_restart_wait).await?;
            if args.skip_restart_wait {
                println!("developer mode requested; the device may reboot shortly");
            } else {
                println!(
                    "developer mode enabled; answer the on-device prompt, then run `devmode confirm`"
                );
            }
        }
        Command::Confirm => {
            client.confirm_post_restart().await?;
            println!("developer mode confirmed");
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "devmode",
    about = "Toggle Developer Mode on a device over the lockdown protocol",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "DEVMODE_LOCKDOWN_ADDR",
        default_value = "127.0.0.1:62078",
        help = "Address of the device's lockdown endpoint"
    )]
    lockdown_addr: String,

    #[arg(long, env = "DEVMODE_UDID", help = "Udid of the target device")]
    udid: String,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "DEVMODE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    log_level: LogLevel,

    #[arg(long = "log-file", help = "Append logs to this file instead of stderr")]
    log_file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the show-override-path marker file on the device
    OverridePath,
    /// Enable developer mode; the device reboots once it accepts
    Enable(EnableArgs),
    /// Answer the post-reboot on-device prompt with "yes"
    Confirm,
}

#[derive(Args, Debug)]
struct EnableArgs {
    #[arg(
        long,
        help = "Return as soon as the device accepts instead of waiting for it to reboot and reappear"
    )]
    skip_restart_wait: bool,

    #[arg(long, default_value_t = 60, help = "Reconnect attempts after the reboot")]
    reconnect_retries: u32,

    #[arg(long, default_value_t = 1, help = "Seconds between reconnect attempts")]
    reconnect_delay_secs: u64,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("logging setup failed: {0}")]
    Logging(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    DevMode(#[from] DevModeError),
}
