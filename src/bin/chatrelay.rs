use std::path::PathBuf;

use chatrelay::service::setup_tracing;
use chatrelay::{AppResult, Relay, RelayConfig};
use clap::Parser;
use dotenv::dotenv;
use tokio::runtime;
use tracing::info;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let mut config = RelayConfig::set_up_config(config_path)?;
    match commandline.verbose {
        0 => {}
        1 => config.tracing.level = "info".to_string(),
        2 => config.tracing.level = "debug".to_string(),
        _ => config.tracing.level = "trace".to_string(),
    }

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(config.general.worker_threads())
        .thread_name("chatrelay-worker")
        .enable_all()
        .build()?;

    let _tracing_guard = rt.block_on(setup_tracing(&config.tracing))?;
    info!("starting chat relay with {:?}", config.network);

    let relay = Relay::new(config);
    rt.block_on(relay.run())
}
