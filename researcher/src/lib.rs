pub mod assistant;
pub mod history;
pub mod server;
pub mod tool_server;

pub use assistant::configuration::Configuration;
pub use assistant::error::{ErrorKind, PipelineError};
pub use assistant::graph::{ResearchGraph, ResearchService};
pub use assistant::state::{ResearchReport, StatusUpdate};

use dotenv::dotenv;
use once_cell::sync::OnceCell;

static SHARED_GRAPH: OnceCell<ResearchGraph> = OnceCell::new();

pub fn init() {
    dotenv().ok();
}

/// The process-wide graph behind [`run_research`], built from the
/// environment on first use. Every caller shares its model gate, so a local
/// backend sees one call at a time however many runs are in flight.
///
/// A configuration error is returned without being cached.
pub fn shared_graph() -> Result<&'static ResearchGraph, PipelineError> {
    SHARED_GRAPH.get_or_try_init(|| {
        let config = Configuration::from_env()?;
        ResearchGraph::from_config(&config)
    })
}

/// Research `topic` using configuration from the process environment and
/// return the rendered report.
///
/// Every failure is a [`PipelineError`] whose `Display` text is safe to show
/// to an end user.
pub async fn run_research(topic: &str) -> Result<String, PipelineError> {
    shared_graph()?.run_research(topic).await
}
