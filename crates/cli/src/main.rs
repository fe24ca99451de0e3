// Workflow engine CLI
//
// Design Decision: use clap derive for ergonomic argument parsing.
// Design Decision: support text/json/yaml output formats for scripting.
// Design Decision: drive the engine library in-process rather than over
// HTTP — this binary is a local development/scripting front end, not a
// client of the (separately deployed) REST surface.

mod commands;
mod output;

use clap::Parser;
use workflow_engine::prelude::{EngineConfig, StoreBackend};

use commands::WorkflowCommand;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "workflowctl")]
#[command(about = "Drive the workflow orchestration engine from the command line")]
#[command(version)]
struct Cli {
    /// Execution store backend; overrides WORKFLOW_STORE.
    #[arg(long, value_parser = ["memory", "postgres"])]
    store: Option<String>,

    /// Postgres connection string; overrides DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Project id new workflow definitions/executions are scoped to;
    /// overrides WORKFLOW_PROJECT_ID.
    #[arg(long)]
    project_id: Option<String>,

    /// Output format.
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    output: String,

    #[command(subcommand)]
    command: WorkflowCommand,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env().unwrap_or_else(|err| {
        eprintln!("error: {err}");
        std::process::exit(commands::EXIT_ERROR);
    });

    if let Some(store) = cli.store.as_deref() {
        config.store = match store {
            "postgres" => StoreBackend::Postgres,
            _ => StoreBackend::Memory,
        };
    }
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }
    if let Some(project_id) = cli.project_id {
        config.project_id = project_id;
    }

    let output = OutputFormat::from_str(&cli.output);
    let code = commands::run(cli.command, &config, output).await;
    std::process::exit(code);
}
