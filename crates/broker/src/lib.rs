#![forbid(unsafe_code)]
//! Capability-brokering facade between an LLM client and a Zoekt code-search
//! backend.
//!
//! Ties the catalog and the execution subsystem into the four operations the
//! transport layer exposes upward: `list_capabilities`, `read_capability`,
//! `run_workflow_cli`, and `run_custom_workflow_code`. Invocation-level
//! failures (bad commands, unknown workflows, safety rejections) come back
//! as structured results with the conventional exit codes; `Err` is reserved
//! for startup faults.

mod config;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::info;
use zoekt_catalog::{CapabilityCatalog, CapabilityHit, CatalogError, Manifest};
use zoekt_execution::{
    format_workflow_result_markdown, parse_workflow_command, ExecutionResult, ExecutionRunner,
    RunnerConfig,
};

pub use config::{BrokerConfig, ConfigError};

/// Synthetic workflow id under which custom-code runs are rendered.
pub const CUSTOM_WORKFLOW_ID: &str = "custom_workflow_code";

const USAGE_FAILURE_EXIT_CODE: i32 = 2;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("catalog load task failed: {0}")]
    LoadTask(String),
}

/// Outcome of one workflow or custom-code invocation: the structured result
/// plus its rendered markdown report.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub result: ExecutionResult,
    pub report: String,
}

/// The broker facade. Immutable after [`Broker::load`]; all operations take
/// `&self` and may run concurrently.
pub struct Broker {
    catalog: CapabilityCatalog,
    runner: ExecutionRunner,
}

impl Broker {
    /// Loads the manifest (off the cooperative scheduler), builds the
    /// catalog and the runner.
    pub async fn load(config: BrokerConfig) -> Result<Self, BrokerError> {
        let manifest_path = config.manifest_path.clone();
        let manifest = tokio::task::spawn_blocking(move || Manifest::load(&manifest_path))
            .await
            .map_err(|err| BrokerError::LoadTask(err.to_string()))??;

        let catalog = CapabilityCatalog::from_manifest(&manifest)?;
        info!(capabilities = catalog.len(), "broker catalog ready");

        let mut runner_config = RunnerConfig::new(config.source_root.clone());
        runner_config.timeout_default = config.execution_timeout_default;
        runner_config.timeout_max = config.execution_timeout_max;
        runner_config.stdout_max_bytes = config.execution_stdout_max_bytes;
        runner_config.stderr_max_bytes = config.execution_stderr_max_bytes;
        let runner = ExecutionRunner::new(runner_config, &manifest);

        Ok(Self { catalog, runner })
    }

    /// Facade over preconstructed parts, for embedders that manage their own
    /// catalog and runner lifetimes.
    pub fn from_parts(catalog: CapabilityCatalog, runner: ExecutionRunner) -> Self {
        Self { catalog, runner }
    }

    /// Every capability as a hit summary.
    pub fn list_capabilities(&self) -> Vec<CapabilityHit> {
        self.catalog.list()
    }

    /// Keyword search over the capability catalog.
    pub fn search_capabilities(&self, query: &str, limit: usize) -> Vec<CapabilityHit> {
        self.catalog.search(query, limit)
    }

    /// Full capability document, or an error document (`kind: "error"`) when
    /// the id is unknown. Presentation is left to the transport.
    pub fn read_capability(&self, capability_id: &str) -> Value {
        match self.catalog.read(capability_id) {
            Some(doc) => serde_json::to_value(doc).unwrap_or_else(|_| error_doc(capability_id)),
            None => error_doc(capability_id),
        }
    }

    /// Parses a CLI-style workflow command and executes the workflow.
    /// Validation failures come back as exit-2 results carrying the usage
    /// hint in stderr.
    pub async fn run_workflow_cli(&self, command: &str, timeout_seconds: i64) -> WorkflowOutcome {
        match parse_workflow_command(self.runner.workflows(), command) {
            Ok((workflow_id, args)) => {
                let result = self
                    .runner
                    .run_workflow_script(&workflow_id, &args, timeout_seconds)
                    .await;
                let report = format_workflow_result_markdown(&workflow_id, &result);
                WorkflowOutcome {
                    workflow_id,
                    result,
                    report,
                }
            }
            Err(parse_error) => {
                let workflow_id = command
                    .split_whitespace()
                    .next()
                    .unwrap_or("unknown")
                    .to_string();
                let result = ExecutionResult {
                    success: false,
                    exit_code: USAGE_FAILURE_EXIT_CODE,
                    stdout: String::new(),
                    stderr: parse_error.message,
                    result_json: None,
                    timing_ms: 0,
                    safety_rejections: Vec::new(),
                };
                let report = format_workflow_result_markdown(&workflow_id, &result);
                WorkflowOutcome {
                    workflow_id,
                    result,
                    report,
                }
            }
        }
    }

    /// Safety-validates and executes caller-supplied workflow code.
    pub async fn run_custom_workflow_code(
        &self,
        code: &str,
        args: &Map<String, Value>,
        timeout_seconds: i64,
    ) -> WorkflowOutcome {
        let result = self
            .runner
            .run_custom_workflow_code(code, args, timeout_seconds)
            .await;
        let report = format_workflow_result_markdown(CUSTOM_WORKFLOW_ID, &result);
        WorkflowOutcome {
            workflow_id: CUSTOM_WORKFLOW_ID.to_string(),
            result,
            report,
        }
    }
}

fn error_doc(capability_id: &str) -> Value {
    json!({
        "id": capability_id,
        "kind": "error",
        "description": format!("capability not found: {capability_id}"),
    })
}
