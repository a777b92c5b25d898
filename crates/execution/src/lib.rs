#![forbid(unsafe_code)]
//! Execution subsystem for the Zoekt broker: the CLI-style workflow command
//! parser, the static safety validator for caller-supplied workflow code,
//! the sandboxed subprocess runner, and the result renderer.
//!
//! The runner turns every invocation into an [`ExecutionResult`]: pre-spawn
//! failures (unknown workflow, argument problems, safety rejections) become
//! structured results with the conventional exit codes rather than errors.

mod cli;
mod render;
mod result;
mod runner;
mod safety;

pub use cli::{parse_workflow_command, CliParseError};
pub use render::{format_workflow_result_markdown, output_status, OutputStatus};
pub use result::ExecutionResult;
pub use runner::{ExecutionRunner, RunnerConfig, RESULT_MARKER, TIMEOUT_EXIT_CODE};
pub use safety::validate_custom_workflow_code;
