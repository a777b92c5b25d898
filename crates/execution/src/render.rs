use std::fmt;
use std::path::Path;

use serde_json::Value;

use crate::result::ExecutionResult;

const MAX_RENDERED_FILES: usize = 10;
const MAX_MATCHES_PER_FILE: usize = 4;
const MAX_MATCH_TEXT_CHARS: usize = 220;
const MAX_GENERIC_LIST_ITEMS: usize = 10;

/// Secondary status describing what happened to the workflow payload,
/// independent of the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    Parsed,
    ParseError,
    MissingResultMarker,
    MissingPayload,
    NotAvailable,
}

impl OutputStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStatus::Parsed => "parsed",
            OutputStatus::ParseError => "parse_error",
            OutputStatus::MissingResultMarker => "missing_result_marker",
            OutputStatus::MissingPayload => "missing_payload",
            OutputStatus::NotAvailable => "not_available",
        }
    }
}

impl fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives the payload status from the result's payload and stderr appendix.
pub fn output_status(result: &ExecutionResult) -> OutputStatus {
    if result.result_json.is_some() {
        return OutputStatus::Parsed;
    }
    let stderr_lc = result.stderr.to_lowercase();
    if stderr_lc.contains("malformed result marker json") {
        return OutputStatus::ParseError;
    }
    if stderr_lc.contains("result marker not found") {
        return OutputStatus::MissingResultMarker;
    }
    if result.success {
        return OutputStatus::MissingPayload;
    }
    OutputStatus::NotAvailable
}

/// Formats an execution result into the human-readable markdown report.
///
/// Known workflow ids get shape-aware bodies; everything else falls through
/// to a generic summariser that introspects the payload's top level. This
/// function never fails.
pub fn format_workflow_result_markdown(workflow_id: &str, result: &ExecutionResult) -> String {
    let process_status = if result.success { "success" } else { "failure" };
    let mut lines = vec![
        format!("## Workflow: `{workflow_id}`"),
        String::new(),
        format!("- Process status: `{process_status}`"),
        format!("- Output status: `{}`", output_status(result)),
        format!("- Exit code: `{}`", result.exit_code),
        format!("- Timing (ms): `{}`", result.timing_ms),
    ];

    if !result.success {
        if !result.safety_rejections.is_empty() {
            lines.push(format!(
                "- Safety rejections: `{}`",
                result.safety_rejections.len()
            ));
            for rejection in &result.safety_rejections {
                lines.push(format!("  - {rejection}"));
            }
        }
        push_fenced_section(&mut lines, "Error", &result.stderr);
        push_fenced_section(&mut lines, "Stdout", &result.stdout);
        return lines.join("\n");
    }

    let Some(payload) = &result.result_json else {
        lines.push(String::new());
        lines.push("No structured workflow payload was produced.".to_string());
        lines.push(
            "This means execution completed, but output parsing or marker contract failed."
                .to_string(),
        );
        push_fenced_section(&mut lines, "Parser / Runtime Details", &result.stderr);
        push_fenced_section(&mut lines, "Stdout", &result.stdout);
        return lines.join("\n");
    };

    let body = match workflow_id {
        "repo_discovery" => render_repo_discovery(payload),
        "symbol_definition" | "symbol_usage" => render_symbol_search(payload),
        "file_context_reader" => render_file_context(payload),
        "cross_repo_trace" => render_cross_repo_trace(payload),
        _ => render_generic(payload),
    };

    if !body.is_empty() {
        lines.push(String::new());
        lines.extend(body);
    }
    push_fenced_section(&mut lines, "Stderr", &result.stderr);
    push_fenced_section(&mut lines, "Stdout", &result.stdout);
    lines.join("\n")
}

fn push_fenced_section(lines: &mut Vec<String>, title: &str, content: &str) {
    if content.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(format!("### {title}"));
    lines.push("```text".to_string());
    lines.push(content.to_string());
    lines.push("```".to_string());
}

fn render_repo_discovery(payload: &Value) -> Vec<String> {
    let Some(object) = payload.as_object() else {
        return render_generic(payload);
    };

    let query = trimmed_field(object, "query");
    let repositories = list_field(object, "repositories");
    let results = list_field(object, "results");

    let mut lines = vec![
        if query.is_empty() {
            format!("Found `{}` repositories.", repositories.len())
        } else {
            format!("Found `{}` repositories for `{query}`.", repositories.len())
        },
        String::new(),
    ];

    if repositories.is_empty() {
        lines.push("No repositories found.".to_string());
    } else {
        lines.push("### Repositories".to_string());
        for (index, repo) in repositories.iter().enumerate() {
            lines.push(format!("{}. `{}`", index + 1, stringify_scalar(repo)));
        }
    }

    if !results.is_empty() {
        lines.push(String::new());
        lines.push("### Top Matches".to_string());
        lines.extend(render_search_results(results, MAX_RENDERED_FILES));
    }
    lines
}

fn render_symbol_search(payload: &Value) -> Vec<String> {
    let Some(object) = payload.as_object() else {
        return render_generic(payload);
    };

    let query = trimmed_field(object, "query");
    let total_hits = int_field(object, "total_hits", 0);
    let results = list_field(object, "results");

    let mut lines = vec![
        if query.is_empty() {
            format!("Found `{total_hits}` matches.")
        } else {
            format!("Found `{total_hits}` matches for `{query}`.")
        },
        String::new(),
    ];
    if results.is_empty() {
        lines.push("No matches found.".to_string());
    } else {
        lines.extend(render_search_results(results, MAX_RENDERED_FILES));
    }
    lines
}

fn render_file_context(payload: &Value) -> Vec<String> {
    let Some(object) = payload.as_object() else {
        return render_generic(payload);
    };

    let repo = trimmed_field(object, "repo");
    let path = trimmed_field(object, "path");
    let start_line = int_field(object, "start_line", 1);
    let end_line = int_field(object, "end_line", start_line);
    let content = str_field(object, "content");

    let header = if !repo.is_empty() && !path.is_empty() {
        format!("`{repo}/{path}` lines `{start_line}-{end_line}`")
    } else {
        format!("Lines `{start_line}-{end_line}`")
    };
    let mut lines = vec![header, String::new()];

    if content.is_empty() {
        lines.push("No content returned for the requested range.".to_string());
        return lines;
    }

    let language = language_from_path(&path);
    lines.push(format!("```{language}"));
    lines.push(with_line_numbers(&content, start_line));
    lines.push("```".to_string());
    lines
}

fn render_cross_repo_trace(payload: &Value) -> Vec<String> {
    let Some(object) = payload.as_object() else {
        return render_generic(payload);
    };

    let symbol = trimmed_field(object, "symbol");
    let inspected_repos = int_field(object, "inspected_repos", 0);
    let trace = list_field(object, "trace");
    let errors = list_field(object, "errors");

    let mut lines = vec![
        if symbol.is_empty() {
            format!("Cross-repo trace across `{inspected_repos}` repos.")
        } else {
            format!("Cross-repo trace for `{symbol}` across `{inspected_repos}` repos.")
        },
        String::new(),
    ];

    if trace.is_empty() {
        lines.push("No trace results found.".to_string());
    } else {
        for (index, repo_entry) in trace.iter().enumerate() {
            let Some(entry) = repo_entry.as_object() else {
                continue;
            };
            let repo = entry
                .get("repo")
                .and_then(Value::as_str)
                .unwrap_or("(unknown repo)");
            let definition_hits = int_field(entry, "definition_hits", 0);
            let usage_hits = int_field(entry, "usage_hits", 0);
            lines.push(format!("### {}. `{repo}`", index + 1));
            lines.push(format!("- Definition hits: `{definition_hits}`"));
            lines.push(format!("- Usage hits: `{usage_hits}`"));

            let definitions = list_field(entry, "definitions");
            let usages = list_field(entry, "usages");
            if !definitions.is_empty() {
                lines.push("- Sample definitions:".to_string());
                lines.extend(indent_markdown(render_search_results(definitions, 2)));
            }
            if !usages.is_empty() {
                lines.push("- Sample usages:".to_string());
                lines.extend(indent_markdown(render_search_results(usages, 2)));
            }
        }
    }

    if !errors.is_empty() {
        lines.push(String::new());
        lines.push("### Errors".to_string());
        for error in errors {
            match error.as_object() {
                Some(entry) => {
                    let repo = entry
                        .get("repo")
                        .and_then(Value::as_str)
                        .unwrap_or("(unknown repo)");
                    let message = entry
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("(unknown error)");
                    lines.push(format!("- `{repo}`: {message}"));
                }
                None => lines.push(format!("- {}", stringify_scalar(error))),
            }
        }
    }

    lines
}

/// Fallback renderer that summarises the payload's top-level structure.
fn render_generic(payload: &Value) -> Vec<String> {
    match payload {
        Value::Null => vec!["No structured workflow payload returned.".to_string()],
        Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            vec![format!("Result: `{}`", stringify_scalar(payload))]
        }
        Value::Array(items) => {
            if items.is_empty() {
                return vec!["Result list is empty.".to_string()];
            }
            let mut lines = vec![format!("Result list with `{}` items:", items.len())];
            for (index, item) in items.iter().take(MAX_GENERIC_LIST_ITEMS).enumerate() {
                lines.push(format!("{}. `{}`", index + 1, stringify_scalar(item)));
            }
            if items.len() > MAX_GENERIC_LIST_ITEMS {
                lines.push(format!(
                    "... and `{}` more items.",
                    items.len() - MAX_GENERIC_LIST_ITEMS
                ));
            }
            lines
        }
        Value::Object(fields) => {
            let mut lines = vec!["Result fields:".to_string()];
            for (key, value) in fields {
                match value {
                    Value::Array(items) => {
                        lines.push(format!("- `{key}`: list with `{}` items", items.len()));
                    }
                    Value::Object(nested) => {
                        lines.push(format!("- `{key}`: object with `{}` fields", nested.len()));
                    }
                    scalar => lines.push(format!("- `{key}`: `{}`", stringify_scalar(scalar))),
                }
            }
            lines
        }
    }
}

fn render_search_results(results: &[Value], max_files: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for (index, entry) in results.iter().take(max_files).enumerate() {
        let Some(object) = entry.as_object() else {
            lines.push(format!("{}. `{}`", index + 1, stringify_scalar(entry)));
            continue;
        };

        let repository = trimmed_field(object, "repository");
        let filename = trimmed_field(object, "filename");
        let location = [repository.as_str(), filename.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/");
        let location = if location.is_empty() {
            "(unknown location)".to_string()
        } else {
            location
        };
        lines.push(format!("{}. `{location}`", index + 1));

        let matches = list_field(object, "matches");
        for match_entry in matches.iter().take(MAX_MATCHES_PER_FILE) {
            let Some(match_object) = match_entry.as_object() else {
                lines.push(format!("   - `{}`", stringify_scalar(match_entry)));
                continue;
            };
            let line_number = int_field(match_object, "line_number", 0);
            let mut text = str_field(match_object, "text").replace('\n', " ");
            text = text.trim().to_string();
            if text.chars().count() > MAX_MATCH_TEXT_CHARS {
                text = format!(
                    "{}...",
                    text.chars()
                        .take(MAX_MATCH_TEXT_CHARS - 3)
                        .collect::<String>()
                );
            }
            lines.push(format!("   - L{line_number}: `{text}`"));
        }
        if matches.len() > MAX_MATCHES_PER_FILE {
            lines.push(format!(
                "   - ... `{}` more matches",
                matches.len() - MAX_MATCHES_PER_FILE
            ));
        }

        let url = trimmed_field(object, "url");
        if !url.is_empty() {
            lines.push(format!("   {url}"));
        }
    }

    if results.len() > max_files {
        lines.push(format!("... and `{}` more files.", results.len() - max_files));
    }
    lines
}

fn indent_markdown(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .map(|line| {
            if line.is_empty() {
                line
            } else {
                format!("  {line}")
            }
        })
        .collect()
}

fn str_field(object: &serde_json::Map<String, Value>, key: &str) -> String {
    match object.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => stringify_scalar(other),
    }
}

/// `str_field` with surrounding whitespace dropped, for display labels.
fn trimmed_field(object: &serde_json::Map<String, Value>, key: &str) -> String {
    str_field(object, key).trim().to_string()
}

fn int_field(object: &serde_json::Map<String, Value>, key: &str, default: i64) -> i64 {
    match object.get(key) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

fn stringify_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) => "list".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

fn with_line_numbers(content: &str, start_line: i64) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let max_line = start_line + lines.len() as i64 - 1;
    let width = max_line.to_string().len().max(2);
    lines
        .iter()
        .enumerate()
        .map(|(offset, line)| {
            format!("{:>width$} | {line}", start_line + offset as i64, width = width)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn language_from_path(path: &str) -> &'static str {
    let suffix = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match suffix.as_str() {
        "py" => "python",
        "ts" => "ts",
        "tsx" => "tsx",
        "js" => "javascript",
        "jsx" => "jsx",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "rs" => "rust",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "cpp",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "md" => "markdown",
        "sh" => "bash",
        "sql" => "sql",
        "html" => "html",
        "css" => "css",
        _ => "text",
    }
}

fn list_field<'a>(object: &'a serde_json::Map<String, Value>, key: &str) -> &'a [Value] {
    object
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
