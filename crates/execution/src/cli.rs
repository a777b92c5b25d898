use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;
use zoekt_catalog::{ArgKind, ArgSpec, WorkflowIndex};

const VALIDATION_PREFIX: &str = "args validation failure: ";

const TRUE_FORMS: &[&str] = &["true", "1", "yes", "on"];
const FALSE_FORMS: &[&str] = &["false", "0", "no", "off"];

/// A workflow command string failed validation. The message is already
/// user-facing: prefixed with `args validation failure:` and, where a schema
/// exists, suffixed with a usage line.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CliParseError {
    pub message: String,
}

impl CliParseError {
    fn new(detail: impl AsRef<str>) -> Self {
        Self {
            message: format!("{VALIDATION_PREFIX}{}", detail.as_ref()),
        }
    }

    fn with_usage(detail: impl AsRef<str>, usage: &str) -> Self {
        Self {
            message: format!("{VALIDATION_PREFIX}{}\nUsage: {usage}", detail.as_ref()),
        }
    }
}

/// Parses a workflow command string (`"<id> --flag value ..."`) into the
/// workflow id and a schema-validated argument map.
///
/// Tokenisation follows POSIX shell rules. Flags accept two spellings per
/// argument name: `--context_lines` and `--context-lines` both resolve to the
/// schema entry `context_lines`. Defaults are coerced through the same path
/// as explicit values, so a default that violates its own bounds fails
/// closed. The required-args check runs last.
pub fn parse_workflow_command(
    index: &WorkflowIndex,
    command: &str,
) -> Result<(String, Map<String, Value>), CliParseError> {
    let tokens = shlex::split(command)
        .ok_or_else(|| CliParseError::new("unbalanced quoting in command"))?;
    let mut tokens = tokens.into_iter();

    let Some(workflow_id) = tokens.next() else {
        return Err(CliParseError::new("empty command"));
    };

    let Some(workflow) = index.get(&workflow_id) else {
        let known = index.ids().join(", ");
        return Err(CliParseError::new(format!(
            "unknown workflow id: {workflow_id}. known workflows: {known}"
        )));
    };

    let schema = &workflow.arg_schema;
    let usage = usage_string(&workflow_id, schema);

    let mut supplied: BTreeMap<String, String> = BTreeMap::new();
    let mut tokens = tokens.peekable();
    while let Some(token) = tokens.next() {
        let Some(flag_body) = token.strip_prefix("--") else {
            return Err(CliParseError::with_usage(
                format!("unexpected positional argument: {token}"),
                &usage,
            ));
        };

        let Some(arg_name) = resolve_flag(schema, flag_body) else {
            return Err(CliParseError::with_usage(
                format!("unknown flag --{flag_body}"),
                &usage,
            ));
        };
        if supplied.contains_key(&arg_name) {
            return Err(CliParseError::with_usage(
                format!("duplicate flag --{flag_body}"),
                &usage,
            ));
        }

        match tokens.peek() {
            Some(value) if !value.starts_with("--") => {
                supplied.insert(arg_name, value.clone());
                tokens.next();
            }
            _ => {
                return Err(CliParseError::with_usage(
                    format!("missing value for --{flag_body}"),
                    &usage,
                ));
            }
        }
    }

    let mut args = Map::new();
    for (name, spec) in schema {
        let flag = flag_name(name);
        if let Some(literal) = supplied.get(name) {
            let value = coerce_value(spec, &flag, Value::String(literal.clone()))
                .map_err(|detail| CliParseError::with_usage(detail, &usage))?;
            args.insert(name.clone(), value);
        } else if let Some(default) = &spec.default {
            let value = coerce_value(spec, &flag, default.clone())
                .map_err(|detail| CliParseError::with_usage(detail, &usage))?;
            args.insert(name.clone(), value);
        }
    }

    let missing: Vec<String> = schema
        .iter()
        .filter(|(name, spec)| spec.required && !args.contains_key(*name))
        .map(|(name, _)| format!("--{}", flag_name(name)))
        .collect();
    if !missing.is_empty() {
        return Err(CliParseError::with_usage(
            format!("missing required flags: {}", missing.join(", ")),
            &usage,
        ));
    }

    Ok((workflow_id, args))
}

/// `Usage: <id> --required <value> [--optional <value>]`, required first.
fn usage_string(workflow_id: &str, schema: &BTreeMap<String, ArgSpec>) -> String {
    let mut parts = vec![workflow_id.to_string()];
    for (name, _) in schema.iter().filter(|(_, spec)| spec.required) {
        parts.push(format!("--{} <value>", flag_name(name)));
    }
    for (name, _) in schema.iter().filter(|(_, spec)| !spec.required) {
        parts.push(format!("[--{} <value>]", flag_name(name)));
    }
    parts.join(" ")
}

fn flag_name(arg_name: &str) -> String {
    arg_name.replace('_', "-")
}

/// Resolves a `--flag` body back to its schema argument name, accepting both
/// the underscored and the dashed spelling.
fn resolve_flag(schema: &BTreeMap<String, ArgSpec>, flag_body: &str) -> Option<String> {
    schema
        .keys()
        .find(|name| name.as_str() == flag_body || flag_name(name) == flag_body)
        .cloned()
}

/// Coerces one value (CLI literal or manifest default) against its schema
/// entry. Errors are plain details; the caller attaches prefix and usage.
fn coerce_value(spec: &ArgSpec, flag: &str, value: Value) -> Result<Value, String> {
    match spec.kind() {
        ArgKind::String => match value {
            Value::String(s) => Ok(Value::String(s)),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(format!("invalid string for --{flag}: {other}")),
        },
        ArgKind::Integer { minimum, maximum } => {
            let parsed = match &value {
                Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| format!("invalid integer for --{flag}: {n}")),
                Value::String(s) => s
                    .parse::<i64>()
                    .map_err(|_| format!("invalid integer for --{flag}: '{s}'")),
                other => Err(format!("invalid integer for --{flag}: {other}")),
            }?;
            if let Some(minimum) = minimum {
                if parsed < minimum {
                    return Err(format!("--{flag} must be >= {minimum}"));
                }
            }
            if let Some(maximum) = maximum {
                if parsed > maximum {
                    return Err(format!("--{flag} must be <= {maximum}"));
                }
            }
            Ok(Value::from(parsed))
        }
        ArgKind::Boolean => match &value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => {
                let lowered = s.to_lowercase();
                if TRUE_FORMS.contains(&lowered.as_str()) {
                    Ok(Value::Bool(true))
                } else if FALSE_FORMS.contains(&lowered.as_str()) {
                    Ok(Value::Bool(false))
                } else {
                    Err(format!("invalid boolean for --{flag}: '{s}'"))
                }
            }
            Value::Number(n) => match n.as_i64() {
                Some(1) => Ok(Value::Bool(true)),
                Some(0) => Ok(Value::Bool(false)),
                _ => Err(format!("invalid boolean for --{flag}: {n}")),
            },
            other => Err(format!("invalid boolean for --{flag}: {other}")),
        },
        ArgKind::Unsupported(type_name) => {
            Err(format!("unsupported arg type '{type_name}' for --{flag}"))
        }
    }
}
