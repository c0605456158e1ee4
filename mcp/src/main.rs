use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloudkit_mcp_runtime::{McpCommands, run as run_mcp};

#[derive(Parser)]
#[command(
    name = "cloudkit-mcp",
    version,
    about = "cloudkit MCP server with interactive environment selection over stdio"
)]
struct Cli {
    /// Platform API base URL
    #[arg(long, env = "CLOUDKIT_API_URL", default_value = cloudkit_mcp_runtime::config::DEFAULT_API_URL)]
    api_url: String,

    /// Skip credential check (for use behind an auth-injecting proxy)
    #[arg(long, env = "CLOUDKIT_NO_AUTH")]
    no_auth: bool,

    #[command(subcommand)]
    command: McpCommands,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudkit_mcp_runtime=info,cloudkit_mcp=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let code = run_mcp(&cli.api_url, cli.no_auth, cli.command).await;
    std::process::exit(code);
}
