#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tempfile::TempDir;
use zoekt_catalog::Manifest;
use zoekt_execution::{ExecutionRunner, RunnerConfig, TIMEOUT_EXIT_CODE};

const MANIFEST_YAML: &str = "workflows:\n  - id: symbol_usage\n    script_path: workflows/scripts/symbol_usage.py\n    arg_schema:\n      query:\n        type: string\n        required: true\n      context_lines:\n        type: integer\n        default: 2\n        minimum: 0\n        maximum: 2\n";

struct Sandbox {
    dir: TempDir,
    config: RunnerConfig,
    manifest: Manifest,
}

impl Sandbox {
    fn new() -> Self {
        let src_root = TempDir::new().unwrap();
        fs::create_dir_all(src_root.path().join("runtime")).unwrap();
        fs::write(
            src_root.path().join("runtime/zoekt_tools.py"),
            "def list_repos():\n    return []\n",
        )
        .unwrap();
        fs::create_dir_all(src_root.path().join("workflows/scripts")).unwrap();
        fs::write(
            src_root.path().join("workflows/scripts/symbol_usage.py"),
            "print('placeholder payload script')\n",
        )
        .unwrap();

        let config = RunnerConfig::new(src_root.path());
        let manifest = Manifest::parse(MANIFEST_YAML).unwrap();
        Self {
            dir: src_root,
            config,
            manifest,
        }
    }

    fn interpreter(mut self, script: &str) -> Self {
        let path = self.dir.path().join("fake-python");
        write_executable(&path, script);
        self.config.interpreter = path;
        self
    }

    fn runner(&self) -> ExecutionRunner {
        ExecutionRunner::new(self.config.clone(), &self.manifest)
    }
}

fn write_executable(path: &Path, script: &str) -> PathBuf {
    fs::write(path, script).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
    path.to_path_buf()
}

fn query_args() -> Map<String, Value> {
    let mut args = Map::new();
    args.insert("query".to_string(), json!("ProcessOrder"));
    args
}

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn workflow_run_extracts_marker_and_strips_it_from_stdout() {
    let sandbox = Sandbox::new().interpreter(
        "#!/bin/sh\necho \"starting search\"\necho '__RESULT_JSON__={\"query\":\"ProcessOrder\",\"total_hits\":2}'\n",
    );
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 10)
        .await;

    assert!(result.success);
    assert_eq!(result.exit_code, 0);
    assert_eq!(
        result.result_json,
        Some(json!({"query": "ProcessOrder", "total_hits": 2}))
    );
    assert_eq!(result.stdout, "starting search");
    assert!(!result.stderr.contains("result marker not found"));
}

#[tokio::test]
async fn sandbox_contains_staged_script_and_runtime_mirror() {
    let sandbox = Sandbox::new().interpreter(
        "#!/bin/sh\nif [ -f workflow_script.py ] && [ -f runtime/zoekt_tools.py ]; then\n  echo '__RESULT_JSON__={\"sandbox\":\"ok\"}'\nelse\n  echo '__RESULT_JSON__={\"sandbox\":\"missing\"}'\nfi\n",
    );
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 10)
        .await;
    assert_eq!(result.result_json, Some(json!({"sandbox": "ok"})));
}

#[tokio::test]
async fn workflow_path_accepts_bare_json_stdout_as_fallback_payload() {
    let sandbox = Sandbox::new().interpreter("#!/bin/sh\nprintf '{\"repositories\": []}\\n'\n");
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 10)
        .await;

    assert!(result.success);
    assert_eq!(result.result_json, Some(json!({"repositories": []})));
    assert!(!result.stderr.contains("result marker not found"));
}

#[tokio::test]
async fn missing_marker_without_fallback_json_is_flagged_in_stderr() {
    let sandbox = Sandbox::new().interpreter("#!/bin/sh\necho \"just logs\"\n");
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 10)
        .await;

    assert!(result.success);
    assert!(result.result_json.is_none());
    assert!(result.stderr.contains("result marker not found"));
}

#[tokio::test]
async fn malformed_marker_payload_is_reported_without_changing_exit_code() {
    let sandbox =
        Sandbox::new().interpreter("#!/bin/sh\necho '__RESULT_JSON__={not json}'\n");
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 10)
        .await;

    assert!(result.success);
    assert_eq!(result.exit_code, 0);
    assert!(result.result_json.is_none());
    assert!(result.stderr.contains("malformed result marker JSON: "));
}

#[tokio::test]
async fn child_failure_preserves_exit_code_and_stderr() {
    let sandbox = Sandbox::new().interpreter(
        "#!/bin/sh\necho \"boom\" >&2\necho '__RESULT_JSON__={\"partial\":true}'\nexit 3\n",
    );
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 10)
        .await;

    assert!(!result.success);
    assert_eq!(result.exit_code, 3);
    assert!(result.stderr.contains("boom"));
    assert_eq!(result.result_json, Some(json!({"partial": true})));
}

#[tokio::test]
async fn timeout_kills_the_child_and_reports_exit_124() {
    let sandbox = Sandbox::new().interpreter("#!/bin/sh\necho \"about to stall\"\nexec sleep 10\n");
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 1)
        .await;

    assert!(!result.success);
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(result.stderr.ends_with("execution timed out"));
    assert!(result.timing_ms >= 1000);
    assert!(result.stdout.contains("about to stall"));
}

#[tokio::test]
async fn spawn_failure_reports_exit_70() {
    let mut sandbox = Sandbox::new();
    sandbox.config.interpreter = PathBuf::from("/nonexistent/interpreter");
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 10)
        .await;

    assert!(!result.success);
    assert_eq!(result.exit_code, 70);
    assert!(result
        .stderr
        .starts_with("runner failed to start subprocess: "));
}

#[tokio::test]
async fn unknown_workflow_id_reports_exit_2() {
    let sandbox = Sandbox::new().interpreter("#!/bin/sh\n");
    let result = sandbox
        .runner()
        .run_workflow_script("nope", &query_args(), 10)
        .await;
    assert_eq!(result.exit_code, 2);
    assert!(result.stderr.contains("unknown workflow_id: nope"));
}

#[tokio::test]
async fn missing_required_args_are_rechecked_before_spawning() {
    let sandbox = Sandbox::new().interpreter("#!/bin/sh\n");
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &Map::new(), 10)
        .await;
    assert_eq!(result.exit_code, 2);
    assert!(result
        .stderr
        .contains("args validation failure: missing required args: query"));
}

#[tokio::test]
async fn deleted_script_is_detected_at_invocation_time() {
    let sandbox = Sandbox::new().interpreter("#!/bin/sh\n");
    fs::remove_file(
        sandbox
            .config
            .src_root
            .join("workflows/scripts/symbol_usage.py"),
    )
    .unwrap();
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 10)
        .await;
    assert_eq!(result.exit_code, 2);
    assert!(result.stderr.contains("workflow script missing: "));
}

#[tokio::test]
async fn oversized_streams_are_capped_with_a_sentinel() {
    let mut sandbox = Sandbox::new().interpreter(
        "#!/bin/sh\nhead -c 100000 /dev/zero | tr '\\0' 'a'\necho\necho '__RESULT_JSON__={\"big\":true}'\n",
    );
    sandbox.config.stdout_max_bytes = 256;
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 10)
        .await;

    // The marker still parses even though the surrounding stdout was capped.
    assert_eq!(result.result_json, Some(json!({"big": true})));
    let sentinel = "\n[stdout truncated at 256 bytes]";
    assert!(result.stdout.ends_with(sentinel));
    assert_eq!(result.stdout.len(), 256 + sentinel.len());
}

#[tokio::test]
async fn environment_is_scrubbed_to_the_allowlist() {
    // CARGO is always set under `cargo test` but is not on the allow-list.
    let sandbox = Sandbox::new().interpreter(
        "#!/bin/sh\necho \"UNBUF=$PYTHONUNBUFFERED\"\necho \"CARGO=${CARGO:-unset}\"\necho '__RESULT_JSON__={}'\n",
    );
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 10)
        .await;

    assert!(result.stdout.contains("UNBUF=1"));
    assert!(result.stdout.contains("CARGO=unset"));
}

#[tokio::test]
async fn rejected_custom_code_never_reaches_the_interpreter() {
    let sandbox = Sandbox::new().interpreter("#!/bin/sh\necho \"should not run\"\n");
    let result = sandbox
        .runner()
        .run_custom_workflow_code("import os\n\ndef run(args):\n    return 1\n", &Map::new(), 10)
        .await;

    assert!(!result.success);
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stderr, "custom workflow code rejected by safety policy");
    assert_eq!(result.safety_rejections, vec!["banned_import: os".to_string()]);
    assert!(result.stdout.is_empty());
}

#[tokio::test]
async fn custom_code_path_has_no_bare_json_fallback() {
    let sandbox = Sandbox::new().interpreter("#!/bin/sh\nprintf '{\"looks\":\"like json\"}\\n'\n");
    let result = sandbox
        .runner()
        .run_custom_workflow_code("def run(args):\n    return {}\n", &Map::new(), 10)
        .await;

    assert!(result.success);
    assert!(result.result_json.is_none());
    assert!(result.stderr.contains("result marker not found"));
}

#[tokio::test]
async fn real_python_workflow_receives_args_json_via_argv() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let sandbox = Sandbox::new();
    fs::write(
        sandbox.config.src_root.join("workflows/scripts/symbol_usage.py"),
        "import json, sys\nargs = json.loads(sys.argv[2])\nprint(\"searching\")\nprint(\"__RESULT_JSON__=\" + json.dumps({\"echo\": args}))\n",
    )
    .unwrap();
    let result = sandbox
        .runner()
        .run_workflow_script("symbol_usage", &query_args(), 30)
        .await;

    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(
        result.result_json,
        Some(json!({"echo": {"query": "ProcessOrder"}}))
    );
    assert_eq!(result.stdout, "searching");
}

#[tokio::test]
async fn real_python_custom_run_entrypoint_emits_payload() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let sandbox = Sandbox::new();
    let mut args = Map::new();
    args.insert("n".to_string(), json!(41));
    let result = sandbox
        .runner()
        .run_custom_workflow_code(
            "def run(args):\n    return {\"n\": args[\"n\"] + 1}\n",
            &args,
            30,
        )
        .await;

    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(result.result_json, Some(json!({"n": 42})));
}

#[tokio::test]
async fn real_python_custom_run_integer_return_becomes_exit_code() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let sandbox = Sandbox::new();
    let result = sandbox
        .runner()
        .run_custom_workflow_code("def run(args):\n    return 3\n", &Map::new(), 30)
        .await;

    assert!(!result.success);
    assert_eq!(result.exit_code, 3);
    assert!(result.result_json.is_none());
}

#[tokio::test]
async fn real_python_custom_async_run_is_awaited() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let sandbox = Sandbox::new();
    let result = sandbox
        .runner()
        .run_custom_workflow_code(
            "import asyncio\n\nasync def run(args):\n    await asyncio.sleep(0)\n    return [1, 2, 3]\n",
            &Map::new(),
            30,
        )
        .await;

    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(result.result_json, Some(json!([1, 2, 3])));
}

#[tokio::test]
async fn real_python_custom_code_can_import_the_runtime_helpers() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let sandbox = Sandbox::new();
    let result = sandbox
        .runner()
        .run_custom_workflow_code(
            "from runtime import zoekt_tools\n\ndef run(args):\n    return {\"repos\": zoekt_tools.list_repos()}\n",
            &Map::new(),
            30,
        )
        .await;

    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(result.result_json, Some(json!({"repos": []})));
}
