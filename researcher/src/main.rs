use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use deep_researcher::{
    init,
    server::{run_server, ServerInfo},
    tool_server::ToolServer,
    Configuration, ResearchGraph, ResearchService,
};

#[derive(Parser)]
#[command(name = "deep-researcher", version, about = "Multi-agent web research assistant")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Research a topic once and print the report
    Research {
        /// The subject to research
        #[arg(required = true)]
        topic: Vec<String>,
    },
    /// Serve the web UI
    Serve {
        #[arg(long, default_value = "0.0.0.0:3000")]
        addr: SocketAddr,
    },
    /// Run as a stdio tool server
    Mcp,
}

#[tokio::main]
async fn main() -> ExitCode {
    init();
    let cli = Cli::parse();

    // Stdout belongs to reports and tool-server messages; logs go to stderr.
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));
    tracing_subscriber::registry().with(stderr_layer).init();

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> anyhow::Result<ExitCode> {
    let config = Configuration::from_env()?;
    info!(
        search_api = ?config.search_api,
        mode = ?config.research_mode,
        model = config.model_name(),
        "Loaded configuration"
    );
    let graph = ResearchGraph::from_config(&config)?;

    match command {
        Command::Research { topic } => {
            let topic = topic.join(" ");
            let token = CancellationToken::new();
            let ctrl_c = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            match graph.run_with_cancel(&topic, token).await {
                Ok(report) => {
                    println!("{}", report.render());
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("Error: {}", e.user_message());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Serve { addr } => {
            let info = ServerInfo::from_config(&config);
            let service: Arc<dyn ResearchService> = Arc::new(graph);
            run_server(addr, service, info).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Mcp => {
            let server = ToolServer::new(Arc::new(graph));
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            server.serve(stdin, tokio::io::stdout()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
