use std::collections::BTreeSet;

use tree_sitter::{Node, Parser};

const ALLOWED_IMPORTS: &[&str] = &["argparse", "asyncio", "json", "sys", "runtime.zoekt_tools"];

const BANNED_IMPORT_PREFIXES: &[&str] = &[
    "builtins",
    "ctypes",
    "importlib",
    "multiprocessing",
    "os",
    "pathlib",
    "shlex",
    "shutil",
    "socket",
    "subprocess",
    "tempfile",
];

const BANNED_CALLS: &[&str] = &["compile", "eval", "exec", "input", "open", "__import__"];

#[derive(Default)]
struct Analysis {
    rejections: Vec<String>,
    has_parse_args: bool,
    has_main: bool,
    has_run: bool,
    has_main_guard: bool,
}

/// Statically validates caller-supplied workflow code before execution.
///
/// Returns the list of policy rejections in source order, de-duplicated
/// preserving first occurrence. An empty list means the code may run.
///
/// The policy has three parts: imports must resolve under the allow list and
/// stay clear of the banned roots (from-imports are checked per imported
/// name, so `from runtime import zoekt_tools` resolves to
/// `runtime.zoekt_tools`); calls whose terminal callee name is a known
/// escape hatch (`eval`, `open`, ...) are rejected; and the source must
/// expose either `run(args)` or the legacy `parse_args`/`main`/main-guard
/// triple.
pub fn validate_custom_workflow_code(code: &str) -> Vec<String> {
    let mut parser = Parser::new();
    if parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .is_err()
    {
        return vec!["syntax_error: parser unavailable at line 1".to_string()];
    }
    let Some(tree) = parser.parse(code, None) else {
        return vec!["syntax_error: parser unavailable at line 1".to_string()];
    };

    let root = tree.root_node();
    if root.has_error() {
        let line = first_error_line(root).unwrap_or(1);
        return vec![format!("syntax_error: invalid syntax at line {line}")];
    }

    let mut analysis = Analysis::default();
    walk(root, code.as_bytes(), &mut analysis);

    let has_legacy_entrypoint =
        analysis.has_parse_args && analysis.has_main && analysis.has_main_guard;
    if !analysis.has_run && !has_legacy_entrypoint {
        analysis
            .rejections
            .push("missing_required_entrypoint: run(args) or async run(args)".to_string());
        if !analysis.has_parse_args {
            analysis
                .rejections
                .push("missing_required_entrypoint: parse_args (legacy mode)".to_string());
        }
        if !analysis.has_main {
            analysis
                .rejections
                .push("missing_required_entrypoint: main (legacy mode)".to_string());
        }
        if !analysis.has_main_guard {
            analysis.rejections.push(
                "missing_required_entrypoint: if __name__ == '__main__' (legacy mode)".to_string(),
            );
        }
    }

    dedup_preserving_order(analysis.rejections)
}

fn walk(node: Node<'_>, source: &[u8], analysis: &mut Analysis) {
    match node.kind() {
        "function_definition" => {
            let name = field_text(node, "name", source);
            let is_async = node.child(0).is_some_and(|c| c.kind() == "async");
            match name {
                "parse_args" if !is_async => analysis.has_parse_args = true,
                "main" => analysis.has_main = true,
                "run" => analysis.has_run = true,
                _ => {}
            }
        }
        "import_statement" => {
            let mut cursor = node.walk();
            for name_node in node.children_by_field_name("name", &mut cursor) {
                let module = imported_module_name(name_node, source);
                check_import(&module, &mut analysis.rejections);
            }
        }
        "import_from_statement" => {
            let module = field_text(node, "module_name", source).to_string();
            let mut cursor = node.walk();
            let has_wildcard = node
                .children(&mut cursor)
                .any(|c| c.kind() == "wildcard_import");
            if has_wildcard {
                check_import(normalize_module(&module).as_str(), &mut analysis.rejections);
            } else {
                let mut cursor = node.walk();
                for name_node in node.children_by_field_name("name", &mut cursor) {
                    let name = imported_module_name(name_node, source);
                    let resolved = normalize_module(&format!("{module}.{name}"));
                    check_import(&resolved, &mut analysis.rejections);
                }
            }
        }
        "call" => {
            if let Some(callee) = call_terminal_name(node, source) {
                if BANNED_CALLS.contains(&callee) {
                    analysis.rejections.push(format!("banned_call: {callee}"));
                }
            }
        }
        "if_statement" => {
            if let Some(condition) = node.child_by_field_name("condition") {
                if is_name_main_guard(condition, source) {
                    analysis.has_main_guard = true;
                }
            }
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(child, source, analysis);
    }
}

fn field_text<'a>(node: Node<'a>, field: &str, source: &'a [u8]) -> &'a str {
    node.child_by_field_name(field)
        .and_then(|child| child.utf8_text(source).ok())
        .unwrap_or("")
}

/// The real module behind an import clause: `a.b` for both `import a.b` and
/// `import a.b as c`.
fn imported_module_name<'a>(node: Node<'a>, source: &'a [u8]) -> &'a str {
    if node.kind() == "aliased_import" {
        field_text(node, "name", source)
    } else {
        node.utf8_text(source).unwrap_or("")
    }
}

/// Collapses leading relative-import dots so `from . import x` checks as `x`.
fn normalize_module(module: &str) -> String {
    module.trim_start_matches('.').to_string()
}

fn check_import(module_name: &str, rejections: &mut Vec<String>) {
    if module_name.is_empty() {
        return;
    }

    let is_banned = BANNED_IMPORT_PREFIXES.iter().any(|banned| {
        module_name == *banned || module_name.starts_with(&format!("{banned}."))
    });
    if is_banned {
        rejections.push(format!("banned_import: {module_name}"));
        return;
    }

    if ALLOWED_IMPORTS.contains(&module_name) {
        return;
    }
    let is_descendant = ALLOWED_IMPORTS
        .iter()
        .any(|allowed| module_name.starts_with(&format!("{allowed}.")));
    if is_descendant {
        return;
    }

    rejections.push(format!("disallowed_import: {module_name}"));
}

/// Terminal callee name: `eval(...)` and `anything.eval(...)` both resolve
/// to `eval`.
fn call_terminal_name<'a>(node: Node<'a>, source: &'a [u8]) -> Option<&'a str> {
    let function = node.child_by_field_name("function")?;
    match function.kind() {
        "identifier" => function.utf8_text(source).ok(),
        "attribute" => function
            .child_by_field_name("attribute")
            .and_then(|attr| attr.utf8_text(source).ok()),
        _ => None,
    }
}

/// Matches exactly `__name__ == "__main__"` (single equality, name on the
/// left, string literal on the right).
fn is_name_main_guard(condition: Node<'_>, source: &[u8]) -> bool {
    if condition.kind() != "comparison_operator" || condition.named_child_count() != 2 {
        return false;
    }

    let Some(left) = condition.named_child(0) else {
        return false;
    };
    if left.kind() != "identifier" || left.utf8_text(source).unwrap_or("") != "__name__" {
        return false;
    }

    let mut cursor = condition.walk();
    let operators: Vec<&str> = condition
        .children(&mut cursor)
        .filter(|child| !child.is_named())
        .map(|child| child.kind())
        .collect();
    if operators != ["=="] {
        return false;
    }

    let Some(right) = condition.named_child(1) else {
        return false;
    };
    if right.kind() != "string" {
        return false;
    }
    let literal = right.utf8_text(source).unwrap_or("");
    literal.trim_matches(|c| c == '"' || c == '\'') == "__main__"
}

fn first_error_line(node: Node<'_>) -> Option<usize> {
    if node.is_error() || node.is_missing() {
        return Some(node.start_position().row + 1);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(line) = first_error_line(child) {
            return Some(line);
        }
    }
    None
}

fn dedup_preserving_order(rejections: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    rejections
        .into_iter()
        .filter(|rejection| seen.insert(rejection.clone()))
        .collect()
}
