use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use orion::agent::Agent;
use orion::bridge::{discover_tools, McpBridge};
use orion::providers::factory::get_provider;
use tracing_subscriber::EnvFilter;

mod session;
mod settings;

use session::Session;
use settings::Settings;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to orion/orion.toml in the user config directory)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// System message for this session, replacing the configured one
    #[arg(short, long, value_name = "TEXT")]
    system: Option<String>,

    /// Wait for whole answers instead of streaming them
    #[arg(long)]
    no_stream: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let settings = Settings::new(cli.config.as_deref())?;
    let mut agent_config = settings.agent.into_config();
    if let Some(system) = cli.system {
        agent_config.system_message = system;
    }

    let provider = get_provider(settings.provider.into_config())?;
    let bridges = settings
        .bridges
        .iter()
        .map(|config| McpBridge::from_config(config).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;
    let tools = discover_tools(&bridges).await;

    let agent = Agent::new(provider, agent_config).with_tools(tools)?;
    let mut session = Session::new(agent, bridges, !cli.no_stream);
    session.install_interrupt_handler()?;

    let result = session.start().await;
    session.close().await;
    result
}
