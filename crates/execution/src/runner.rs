use std::path::{Path, PathBuf};
use std::time::Instant;

use serde_json::{Map, Value};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{self, Duration};
use tracing::{debug, warn};
use zoekt_catalog::{Manifest, WorkflowIndex};

use crate::result::ExecutionResult;
use crate::safety::validate_custom_workflow_code;

/// Stdout sentinel prefix carrying a workflow's structured payload.
pub const RESULT_MARKER: &str = "__RESULT_JSON__=";

/// Exit code the runner assigns when the wall-clock deadline fires.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const USAGE_FAILURE_EXIT_CODE: i32 = 2;
const SAFETY_FAILURE_EXIT_CODE: i32 = 1;
const RUNNER_FAULT_EXIT_CODE: i32 = 70;

/// Only these names pass through from the parent environment into the child.
const ENV_ALLOWLIST: &[&str] = &["HOME", "LANG", "LC_ALL", "LC_CTYPE", "PATH", "TZ", "ZOEKT_API_URL"];

/// Tuning for the execution runner. Timeouts are seconds; caps are bytes per
/// stream.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root the manifest's `script_path` entries resolve under; also holds
    /// the `runtime/` helper tree mirrored into every sandbox.
    pub src_root: PathBuf,
    /// Interpreter spawned for every invocation, always with `-I -u -c`.
    pub interpreter: PathBuf,
    pub timeout_default: u64,
    pub timeout_max: u64,
    pub stdout_max_bytes: usize,
    pub stderr_max_bytes: usize,
}

impl RunnerConfig {
    pub fn new(src_root: impl Into<PathBuf>) -> Self {
        Self {
            src_root: src_root.into(),
            interpreter: PathBuf::from("python3"),
            timeout_default: 30,
            timeout_max: 120,
            stdout_max_bytes: 32_768,
            stderr_max_bytes: 32_768,
        }
    }
}

/// Sandboxed workflow executor.
///
/// Each invocation materialises a fresh temporary directory holding the
/// payload script and a mirror of the `runtime/` helper tree, spawns the
/// interpreter with a scrubbed environment, enforces the timeout policy, and
/// extracts the tagged JSON result from stdout. Pre-spawn failures become
/// structured results, never errors.
pub struct ExecutionRunner {
    config: RunnerConfig,
    workflows: WorkflowIndex,
}

impl ExecutionRunner {
    pub fn new(config: RunnerConfig, manifest: &Manifest) -> Self {
        Self {
            config,
            workflows: WorkflowIndex::from_manifest(manifest),
        }
    }

    pub fn workflows(&self) -> &WorkflowIndex {
        &self.workflows
    }

    /// Runs a prebuilt workflow script by id with already-validated args.
    pub async fn run_workflow_script(
        &self,
        workflow_id: &str,
        args: &Map<String, Value>,
        timeout_seconds: i64,
    ) -> ExecutionResult {
        let Some(workflow) = self.workflows.get(workflow_id) else {
            return ExecutionResult::error(
                format!("unknown workflow_id: {workflow_id}"),
                USAGE_FAILURE_EXIT_CODE,
                0,
            );
        };

        let missing: Vec<&str> = workflow
            .arg_schema
            .iter()
            .filter(|(name, spec)| spec.required && !args.contains_key(*name))
            .map(|(name, _)| name.as_str())
            .collect();
        if !missing.is_empty() {
            return ExecutionResult::error(
                format!(
                    "args validation failure: missing required args: {}",
                    missing.join(", ")
                ),
                USAGE_FAILURE_EXIT_CODE,
                0,
            );
        }

        let Some(script_rel_path) = workflow
            .script_path
            .as_deref()
            .filter(|path| !path.is_empty())
        else {
            return ExecutionResult::error(
                format!("workflow script_path missing: {workflow_id}"),
                USAGE_FAILURE_EXIT_CODE,
                0,
            );
        };

        // The manifest may have been edited since startup, so the script
        // location is re-verified on every invocation.
        let script_path = self.config.src_root.join(script_rel_path);
        if !script_stays_under_root(&script_path, &self.config.src_root) {
            return ExecutionResult::error(
                format!("workflow script escapes source root: {script_rel_path}"),
                USAGE_FAILURE_EXIT_CODE,
                0,
            );
        }
        if !script_path.exists() {
            return ExecutionResult::error(
                format!("workflow script missing: {}", script_path.display()),
                USAGE_FAILURE_EXIT_CODE,
                0,
            );
        }

        let args_json = match serde_json::to_string(&Value::Object(args.clone())) {
            Ok(json) => json,
            Err(err) => return runner_fault(format!("failed to encode args: {err}"), 0),
        };

        let temp_dir = match self.materialize_sandbox(&format!("zoekt-workflow-{workflow_id}-"))
        {
            Ok(dir) => dir,
            Err(message) => return runner_fault(message, 0),
        };
        let temp_script = temp_dir.path().join("workflow_script.py");
        if let Err(err) = tokio::fs::copy(&script_path, &temp_script).await {
            return runner_fault(format!("failed to stage workflow script: {err}"), 0);
        }

        let bootstrap = workflow_bootstrap(&temp_script, temp_dir.path(), &args_json);
        self.execute(&bootstrap, temp_dir.path(), timeout_seconds, true)
            .await
    }

    /// Validates and runs caller-supplied workflow code.
    pub async fn run_custom_workflow_code(
        &self,
        code: &str,
        args: &Map<String, Value>,
        timeout_seconds: i64,
    ) -> ExecutionResult {
        let rejections = validate_custom_workflow_code(code);
        if !rejections.is_empty() {
            debug!(rejections = rejections.len(), "custom workflow code rejected");
            return ExecutionResult {
                success: false,
                exit_code: SAFETY_FAILURE_EXIT_CODE,
                stdout: String::new(),
                stderr: "custom workflow code rejected by safety policy".to_string(),
                result_json: None,
                timing_ms: 0,
                safety_rejections: rejections,
            };
        }

        let args_json = match serde_json::to_string(&Value::Object(args.clone())) {
            Ok(json) => json,
            Err(err) => return runner_fault(format!("failed to encode args: {err}"), 0),
        };

        let temp_dir = match self.materialize_sandbox("zoekt-custom-") {
            Ok(dir) => dir,
            Err(message) => return runner_fault(message, 0),
        };
        let script_path = temp_dir.path().join("custom_workflow_code.py");
        if let Err(err) = tokio::fs::write(&script_path, code).await {
            return runner_fault(format!("failed to stage custom workflow code: {err}"), 0);
        }

        let bootstrap = custom_code_bootstrap(&script_path, temp_dir.path(), &args_json);
        self.execute(&bootstrap, temp_dir.path(), timeout_seconds, false)
            .await
    }

    /// Creates the invocation temp dir and mirrors the `runtime/` helper
    /// tree into it.
    fn materialize_sandbox(&self, prefix: &str) -> Result<TempDir, String> {
        let temp_dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .map_err(|err| format!("failed to create sandbox directory: {err}"))?;

        let runtime_src = self.config.src_root.join("runtime");
        let runtime_dst = temp_dir.path().join("runtime");
        copy_dir_all(&runtime_src, &runtime_dst)
            .map_err(|err| format!("failed to mirror runtime helpers: {err}"))?;

        Ok(temp_dir)
    }

    async fn execute(
        &self,
        bootstrap: &str,
        cwd: &Path,
        timeout_seconds: i64,
        bare_json_fallback: bool,
    ) -> ExecutionResult {
        let timeout = self.normalize_timeout(timeout_seconds);
        let start = Instant::now();

        let mut command = Command::new(&self.config.interpreter);
        command
            .arg("-I")
            .arg("-u")
            .arg("-c")
            .arg(bootstrap)
            .current_dir(cwd)
            .env_clear()
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    command.env(key, value);
                }
            }
        }
        command.env("PYTHONUNBUFFERED", "1");
        command.env("PYTHONDONTWRITEBYTECODE", "1");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return runner_spawn_failure(err, elapsed_ms(start));
            }
        };

        let Some(stdout) = child.stdout.take() else {
            return runner_fault("child stdout unavailable".to_string(), elapsed_ms(start));
        };
        let Some(stderr) = child.stderr.take() else {
            return runner_fault("child stderr unavailable".to_string(), elapsed_ms(start));
        };

        let stdout_task = tokio::spawn(drain_stream(stdout));
        let stderr_task = tokio::spawn(drain_stream(stderr));

        let status = match time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                return runner_fault(
                    format!("failed to wait for subprocess: {err}"),
                    elapsed_ms(start),
                );
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "execution timed out, killing child");
                kill_and_reap(&mut child).await;
                None
            }
        };

        let stdout_bytes = match join_drain(stdout_task).await {
            Ok(bytes) => bytes,
            Err(message) => return runner_fault(message, elapsed_ms(start)),
        };
        let stderr_bytes = match join_drain(stderr_task).await {
            Ok(bytes) => bytes,
            Err(message) => return runner_fault(message, elapsed_ms(start)),
        };

        let timing_ms = elapsed_ms(start);

        let Some(status) = status else {
            // Timeout path: cap whatever was drained, flag the timeout.
            let stdout = decode_and_cap(&stdout_bytes, self.config.stdout_max_bytes, "stdout");
            let stderr = decode_and_cap(&stderr_bytes, self.config.stderr_max_bytes, "stderr");
            return ExecutionResult {
                success: false,
                exit_code: TIMEOUT_EXIT_CODE,
                stdout,
                stderr: append_line(stderr, "execution timed out"),
                result_json: None,
                timing_ms,
                safety_rejections: Vec::new(),
            };
        };

        let full_stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
        let full_stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();

        let extraction = extract_result_json(&full_stdout);
        let mut result_json = extraction.result_json;
        let mut marker_satisfied = extraction.marker_found;
        if !extraction.marker_found && bare_json_fallback {
            let trimmed = full_stdout.trim();
            if !trimmed.is_empty() {
                if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                    result_json = normalize_payload(value);
                    marker_satisfied = true;
                }
            }
        }

        let stdout = cap_text(&extraction.cleaned_stdout, self.config.stdout_max_bytes, "stdout");
        let mut stderr = cap_text(&full_stderr, self.config.stderr_max_bytes, "stderr");
        if !marker_satisfied {
            stderr = append_line(stderr, "result marker not found");
        }
        if let Some(parse_error) = extraction.parse_error {
            stderr = append_line(stderr, &parse_error);
        }

        let exit_code = status.code().unwrap_or(-1);
        ExecutionResult {
            success: exit_code == 0,
            exit_code,
            stdout,
            stderr,
            result_json,
            timing_ms,
            safety_rejections: Vec::new(),
        }
    }

    fn normalize_timeout(&self, timeout_seconds: i64) -> Duration {
        let seconds = if timeout_seconds <= 0 {
            self.config.timeout_default
        } else {
            (timeout_seconds as u64).min(self.config.timeout_max)
        };
        Duration::from_secs(seconds)
    }
}

struct MarkerExtraction {
    cleaned_stdout: String,
    result_json: Option<Value>,
    parse_error: Option<String>,
    marker_found: bool,
}

/// Scans stdout from the last line toward the first for the result marker.
/// The first match wins, its line is removed from the returned stdout, and
/// its payload is parsed; a malformed payload surfaces as a parse error
/// without clearing the marker-found flag.
fn extract_result_json(stdout: &str) -> MarkerExtraction {
    let lines: Vec<&str> = stdout.lines().collect();
    for index in (0..lines.len()).rev() {
        let Some(payload) = lines[index].strip_prefix(RESULT_MARKER) else {
            continue;
        };

        let mut cleaned_lines = lines.clone();
        cleaned_lines.remove(index);
        let cleaned_stdout = cleaned_lines.join("\n");

        return match serde_json::from_str::<Value>(payload) {
            Ok(value) => MarkerExtraction {
                cleaned_stdout,
                result_json: normalize_payload(value),
                parse_error: None,
                marker_found: true,
            },
            Err(err) => MarkerExtraction {
                cleaned_stdout,
                result_json: None,
                parse_error: Some(format!("malformed result marker JSON: {err}")),
                marker_found: true,
            },
        };
    }

    MarkerExtraction {
        cleaned_stdout: stdout.to_string(),
        result_json: None,
        parse_error: None,
        marker_found: false,
    }
}

/// A JSON `null` payload counts as "no payload" downstream.
fn normalize_payload(value: Value) -> Option<Value> {
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

/// Caps already-decoded text at `max_bytes`, appending the truncation
/// sentinel line when anything was dropped.
fn cap_text(value: &str, max_bytes: usize, stream_name: &str) -> String {
    let raw = value.as_bytes();
    if raw.len() <= max_bytes {
        return value.to_string();
    }
    let capped = String::from_utf8_lossy(&raw[..max_bytes]);
    format!("{capped}\n[{stream_name} truncated at {max_bytes} bytes]")
}

/// Decode-then-cap for the timeout path, where no marker extraction runs.
fn decode_and_cap(raw: &[u8], max_bytes: usize, stream_name: &str) -> String {
    if raw.len() <= max_bytes {
        return String::from_utf8_lossy(raw).into_owned();
    }
    let capped = String::from_utf8_lossy(&raw[..max_bytes]);
    format!("{capped}\n[{stream_name} truncated at {max_bytes} bytes]")
}

fn append_line(buffer: String, line: &str) -> String {
    if buffer.is_empty() {
        line.to_string()
    } else {
        format!("{buffer}\n{line}")
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn runner_fault(message: String, timing_ms: u64) -> ExecutionResult {
    ExecutionResult::error(
        format!("runner fault: {message}"),
        RUNNER_FAULT_EXIT_CODE,
        timing_ms,
    )
}

fn runner_spawn_failure(err: std::io::Error, timing_ms: u64) -> ExecutionResult {
    ExecutionResult::error(
        format!("runner failed to start subprocess: {err}"),
        RUNNER_FAULT_EXIT_CODE,
        timing_ms,
    )
}

async fn kill_and_reap(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(error = %err, "failed to kill timed-out child");
    }
    let _ = child.wait().await;
}

async fn drain_stream<R>(mut reader: R) -> Result<Vec<u8>, std::io::Error>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;
    Ok(buffer)
}

async fn join_drain(
    task: tokio::task::JoinHandle<Result<Vec<u8>, std::io::Error>>,
) -> Result<Vec<u8>, String> {
    match task.await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(err)) => Err(format!("failed to capture child output: {err}")),
        Err(err) => Err(format!("failed to join output task: {err}")),
    }
}

/// True when `script_path` stays under `src_root` without `..` traversal.
/// Purely lexical so missing files still produce the "script missing" error
/// rather than a canonicalisation failure.
fn script_stays_under_root(script_path: &Path, src_root: &Path) -> bool {
    let Ok(relative) = script_path.strip_prefix(src_root) else {
        return false;
    };
    let mut depth: i32 = 0;
    for component in relative.components() {
        match component {
            std::path::Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            std::path::Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    true
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// One-liner bootstrap that runs the staged workflow script as `__main__`
/// with the sandbox on the module search path and the canonical
/// `--args-json` argv.
fn workflow_bootstrap(script: &Path, sandbox: &Path, args_json: &str) -> String {
    let script_lit = py_str_literal(&script.to_string_lossy());
    let sandbox_lit = py_str_literal(&sandbox.to_string_lossy());
    let args_lit = py_str_literal(args_json);
    format!(
        "import runpy,sys;script={script_lit};sys.path.insert(0,{sandbox_lit});sys.argv=[script,'--args-json',{args_lit}];runpy.run_path(script,run_name='__main__')"
    )
}

/// Bootstrap for caller-supplied code: loads the staged module, prefers the
/// `run(args)` entrypoint (emitting the result marker itself), falls back to
/// legacy `main()` with argv set, and exits 1 when neither exists.
fn custom_code_bootstrap(script: &Path, sandbox: &Path, args_json: &str) -> String {
    let script_lit = py_str_literal(&script.to_string_lossy());
    let sandbox_lit = py_str_literal(&sandbox.to_string_lossy());
    let args_lit = py_str_literal(args_json);
    format!(
        concat!(
            "import asyncio,importlib.util,inspect,json,sys\n",
            "sys.path.insert(0,{sandbox})\n",
            "spec=importlib.util.spec_from_file_location('custom_workflow_code',{script})\n",
            "module=importlib.util.module_from_spec(spec)\n",
            "spec.loader.exec_module(module)\n",
            "args=json.loads({args})\n",
            "entry=getattr(module,'run',None)\n",
            "if callable(entry):\n",
            "    value=entry(args)\n",
            "    if inspect.iscoroutine(value):\n",
            "        value=asyncio.run(value)\n",
            "    if isinstance(value,int) and not isinstance(value,bool):\n",
            "        print('__RESULT_JSON__=null')\n",
            "        sys.exit(value)\n",
            "    print('__RESULT_JSON__='+json.dumps(value))\n",
            "    sys.exit(0)\n",
            "legacy=getattr(module,'main',None)\n",
            "if callable(legacy):\n",
            "    sys.argv=[{script},'--args-json',{args}]\n",
            "    value=legacy()\n",
            "    if inspect.iscoroutine(value):\n",
            "        value=asyncio.run(value)\n",
            "    sys.exit(value if isinstance(value,int) and not isinstance(value,bool) else 0)\n",
            "print('custom workflow code defines neither run(args) nor main()',file=sys.stderr)\n",
            "sys.exit(1)\n",
        ),
        sandbox = sandbox_lit,
        script = script_lit,
        args = args_lit,
    )
}

/// Renders a string as a single-quoted Python literal.
fn py_str_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_extraction_prefers_the_last_marker_line() {
        let extraction = extract_result_json("hello\n__RESULT_JSON__=1\n__RESULT_JSON__=2\n");
        assert!(extraction.marker_found);
        assert_eq!(extraction.result_json, Some(Value::from(2)));
        assert_eq!(extraction.cleaned_stdout, "hello\n__RESULT_JSON__=1");
        assert!(extraction.parse_error.is_none());
    }

    #[test]
    fn malformed_marker_payload_reports_a_parse_error() {
        let extraction = extract_result_json("__RESULT_JSON__={not json}\n");
        assert!(extraction.marker_found);
        assert!(extraction.result_json.is_none());
        let message = extraction.parse_error.unwrap();
        assert!(message.starts_with("malformed result marker JSON: "));
    }

    #[test]
    fn missing_marker_leaves_stdout_untouched() {
        let extraction = extract_result_json("plain logging\nno marker here\n");
        assert!(!extraction.marker_found);
        assert_eq!(extraction.cleaned_stdout, "plain logging\nno marker here\n");
    }

    #[test]
    fn null_marker_payload_normalises_to_no_payload() {
        let extraction = extract_result_json("__RESULT_JSON__=null\n");
        assert!(extraction.marker_found);
        assert!(extraction.result_json.is_none());
        assert!(extraction.parse_error.is_none());
    }

    #[test]
    fn cap_text_appends_sentinel_with_exact_byte_accounting() {
        let capped = cap_text(&"a".repeat(100), 64, "stdout");
        let sentinel = "\n[stdout truncated at 64 bytes]";
        assert!(capped.ends_with(sentinel));
        assert_eq!(capped.len(), 64 + sentinel.len());

        let untouched = cap_text("short", 64, "stdout");
        assert_eq!(untouched, "short");
    }

    #[test]
    fn timeout_normalisation_applies_default_and_ceiling() {
        let runner = ExecutionRunner::new(
            RunnerConfig::new("/nonexistent"),
            &Manifest::default(),
        );
        assert_eq!(runner.normalize_timeout(0), Duration::from_secs(30));
        assert_eq!(runner.normalize_timeout(-5), Duration::from_secs(30));
        assert_eq!(runner.normalize_timeout(10), Duration::from_secs(10));
        assert_eq!(runner.normalize_timeout(500), Duration::from_secs(120));
    }

    #[test]
    fn python_literals_escape_quotes_and_backslashes() {
        assert_eq!(py_str_literal("plain"), "'plain'");
        assert_eq!(py_str_literal("it's"), r"'it\'s'");
        assert_eq!(py_str_literal("a\\b"), r"'a\\b'");
        assert_eq!(py_str_literal("line\nbreak"), r"'line\nbreak'");
    }

    #[test]
    fn lexical_traversal_check_rejects_escaping_paths() {
        let root = Path::new("/srv/payloads");
        assert!(script_stays_under_root(
            &root.join("workflows/scripts/a.py"),
            root
        ));
        assert!(!script_stays_under_root(&root.join("../outside.py"), root));
        assert!(script_stays_under_root(&root.join("workflows/../a.py"), root));
        assert!(!script_stays_under_root(Path::new("/etc/passwd"), root));
    }

    #[test]
    fn append_line_only_adds_separator_when_needed() {
        assert_eq!(append_line(String::new(), "msg"), "msg");
        assert_eq!(append_line("tail".to_string(), "msg"), "tail\nmsg");
    }
}
