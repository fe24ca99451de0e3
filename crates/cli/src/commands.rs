// Workflow engine commands

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use uuid::Uuid;
use workflow_engine::prelude::*;

use crate::output::{print_field, OutputFormat};

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Validate a workflow definition file without starting it.
    Validate {
        /// Path to a YAML or JSON workflow definition.
        file: PathBuf,
    },

    /// Register a workflow definition and start an execution.
    Start {
        /// Path to a YAML or JSON workflow definition.
        file: PathBuf,
        /// JSON input payload for the workflow.
        #[arg(long, default_value = "{}")]
        input: String,
    },

    /// Fetch the current state of a workflow execution.
    Get {
        /// Workflow execution id.
        id: Uuid,
    },

    /// Request a running workflow execution stop.
    Stop {
        id: Uuid,
    },

    /// Cancel a workflow execution.
    Cancel {
        id: Uuid,
    },

    /// Reset a terminal task and everything downstream of it back to IDLE,
    /// then re-dispatch it.
    Rerun {
        id: Uuid,
        task_name: String,
    },
}

/// Exit codes per the engine-facing API: 0 success, 1 generic error,
/// 2 validation failure, 3 not found.
pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_VALIDATION: i32 = 2;
pub const EXIT_NOT_FOUND: i32 = 3;

pub async fn run(command: WorkflowCommand, config: &EngineConfig, output: OutputFormat) -> i32 {
    let result = match config.store {
        StoreBackend::Memory => {
            run_against(Arc::new(InMemoryExecutionStore::new()), command, config, output).await
        }
        StoreBackend::Postgres => match connect_postgres(config).await {
            Ok(store) => run_against(Arc::new(store), command, config, output).await,
            Err(err) => Err(err),
        },
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    }
}

async fn connect_postgres(config: &EngineConfig) -> Result<PostgresExecutionStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for the postgres backend")?;
    PostgresExecutionStore::connect(url)
        .await
        .context("failed to connect to postgres")
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(DispatchError::Spec(_)) = err.downcast_ref::<DispatchError>() {
        return EXIT_VALIDATION;
    }
    if let Some(StoreError::WorkflowExecutionNotFound(_)) = err.downcast_ref::<StoreError>() {
        return EXIT_NOT_FOUND;
    }
    if let Some(StoreError::TaskExecutionNotFound(_)) = err.downcast_ref::<StoreError>() {
        return EXIT_NOT_FOUND;
    }
    if err.downcast_ref::<SpecError>().is_some() {
        return EXIT_VALIDATION;
    }
    EXIT_ERROR
}

async fn run_against<S: ExecutionStore>(
    store: Arc<S>,
    command: WorkflowCommand,
    config: &EngineConfig,
    output: OutputFormat,
) -> Result<i32> {
    let dispatcher = Dispatcher::new(store.clone());

    match command {
        WorkflowCommand::Validate { file } => {
            let spec = load_spec(&file)?;
            spec.validate().context("validation failed")?;
            println!("'{}' is valid", spec.name);
            Ok(EXIT_OK)
        }
        WorkflowCommand::Start { file, input } => {
            let spec = load_spec(&file)?;
            spec.validate().context("validation failed")?;
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;

            let mut tx = store.begin().await?;
            store
                .put_workflow_definition(&mut tx, &config.project_id, spec.clone())
                .await?;
            store.commit(tx).await?;

            let id = dispatcher.start(&spec, input, &config.project_id).await?;
            print_execution_started(&id, output);
            Ok(EXIT_OK)
        }
        WorkflowCommand::Get { id } => {
            let execution = store.get_workflow_execution(id).await?;
            print_execution(&execution, output);
            Ok(EXIT_OK)
        }
        WorkflowCommand::Stop { id } => {
            dispatcher
                .dispatch(DispatchEvent::new(id, DispatchEventKind::Stop))
                .await?;
            println!("stopped {id}");
            Ok(EXIT_OK)
        }
        WorkflowCommand::Cancel { id } => {
            dispatcher
                .dispatch(DispatchEvent::new(id, DispatchEventKind::Cancel))
                .await?;
            println!("cancelled {id}");
            Ok(EXIT_OK)
        }
        WorkflowCommand::Rerun { id, task_name } => {
            dispatcher.rerun(id, &task_name).await?;
            println!("rerunning '{task_name}' on {id}");
            Ok(EXIT_OK)
        }
    }
}

fn load_spec(path: &PathBuf) -> Result<WorkflowSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    parse_workflow_spec(&text).context("failed to parse workflow definition")
}

fn print_execution_started(id: &Uuid, output: OutputFormat) {
    match output {
        OutputFormat::Text => print_field("execution", &id.to_string()),
        _ => output.print_value(&serde_json::json!({ "workflow_execution_id": id })),
    }
}

fn print_execution(execution: &WorkflowExecution, output: OutputFormat) {
    match output {
        OutputFormat::Text => {
            print_field("id", &execution.id.to_string());
            print_field("spec", &format!("{}/{}", execution.spec_namespace, execution.spec_name));
            print_field("state", &execution.state.to_string());
            if let Some(error) = &execution.error {
                print_field("error", error);
            }
        }
        _ => output.print_value(execution),
    }
}
