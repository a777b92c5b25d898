use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::{debug, warn};

use crate::manifest::{CatalogError, Manifest, ManifestEntry};
use crate::model::{CapabilityDoc, CapabilityHit, CapabilityKind};

const MAX_SEARCH_LIMIT: usize = 50;

/// Hit metadata retained per entry, separate from the document body.
#[derive(Debug, Clone, Default)]
struct HitMetadata {
    summary: String,
    when_to_use: String,
    required_args: Vec<String>,
    example: String,
}

/// Immutable in-memory index over the capability manifest.
///
/// Loaded once at startup; every view method takes `&self` so the catalog
/// can be shared freely across concurrent invocations.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCatalog {
    docs: BTreeMap<String, CapabilityDoc>,
    hit_metadata: BTreeMap<String, HitMetadata>,
}

impl CapabilityCatalog {
    pub fn load(manifest_path: &Path) -> Result<Self, CatalogError> {
        let manifest = Manifest::load(manifest_path)?;
        Self::from_manifest(&manifest)
    }

    pub fn from_manifest(manifest: &Manifest) -> Result<Self, CatalogError> {
        manifest.check_unique_ids()?;
        let mut catalog = Self::default();
        catalog.insert_section(&manifest.workflows, CapabilityKind::Workflow);
        catalog.insert_section(&manifest.runtime_tools, CapabilityKind::RuntimeTool);
        catalog.insert_section(&manifest.execution_patterns, CapabilityKind::ExecutionPattern);
        debug!(capabilities = catalog.docs.len(), "capability catalog loaded");
        Ok(catalog)
    }

    fn insert_section(&mut self, entries: &[ManifestEntry], kind: CapabilityKind) {
        for entry in entries {
            if entry.id.is_empty() {
                warn!(kind = kind.as_str(), "skipping manifest entry without an id");
                continue;
            }
            self.docs.insert(entry.id.clone(), entry_to_doc(entry, kind));
            self.hit_metadata
                .insert(entry.id.clone(), entry_to_hit_metadata(entry));
        }
    }

    /// Every capability as a hit summary.
    pub fn list(&self) -> Vec<CapabilityHit> {
        self.docs
            .values()
            .map(|doc| self.doc_to_hit(doc))
            .collect()
    }

    /// Token-overlap search over id, kind, description, constraints, and
    /// examples, with exact and partial id boosts.
    pub fn search(&self, query: &str, limit: usize) -> Vec<CapabilityHit> {
        let normalized_limit = limit.clamp(1, MAX_SEARCH_LIMIT);
        let query_tokens = tokenize(query);
        let query_lc = query.to_lowercase().trim().to_string();

        let mut scored: Vec<(f64, CapabilityHit)> = self
            .docs
            .values()
            .filter_map(|doc| {
                let score = score_doc(doc, &query_tokens, &query_lc);
                (score > 0.0).then(|| (score, self.doc_to_hit(doc)))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(normalized_limit);
        scored.into_iter().map(|(_, hit)| hit).collect()
    }

    /// Full document by id, or `None` when the capability is unknown.
    pub fn read(&self, capability_id: &str) -> Option<&CapabilityDoc> {
        self.docs.get(capability_id)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn doc_to_hit(&self, doc: &CapabilityDoc) -> CapabilityHit {
        let metadata = self.hit_metadata.get(&doc.id);

        let summary = metadata
            .map(|m| m.summary.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| first_line(&doc.description));
        let when_to_use = metadata
            .map(|m| m.when_to_use.clone())
            .filter(|s| !s.is_empty())
            .or_else(|| (!summary.is_empty()).then(|| summary.clone()))
            .unwrap_or_else(|| "Use when needed.".to_string());

        let required_args = metadata
            .map(|m| m.required_args.clone())
            .filter(|args| !args.is_empty())
            .unwrap_or_else(|| {
                doc.arg_schema
                    .iter()
                    .filter(|(_, spec)| spec.required)
                    .map(|(name, _)| name.clone())
                    .collect()
            });

        let example = metadata
            .map(|m| m.example.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| first_example(doc));

        CapabilityHit {
            id: doc.id.clone(),
            kind: CapabilityKind::parse_lossy(&doc.kind),
            summary,
            when_to_use,
            required_args,
            example,
        }
    }
}

fn entry_to_doc(entry: &ManifestEntry, kind: CapabilityKind) -> CapabilityDoc {
    CapabilityDoc {
        id: entry.id.clone(),
        kind: kind.as_str().to_string(),
        description: entry.description.clone(),
        arg_schema: entry.arg_schema.clone(),
        examples: entry.examples.clone(),
        constraints: entry.constraints.clone(),
        expected_output_shape: entry.expected_output_shape.clone(),
    }
}

fn entry_to_hit_metadata(entry: &ManifestEntry) -> HitMetadata {
    HitMetadata {
        summary: entry.summary.clone(),
        when_to_use: entry.when_to_use.clone(),
        required_args: entry.required_args.clone(),
        example: entry.example.clone(),
    }
}

fn first_line(description: &str) -> String {
    description.lines().next().unwrap_or_default().to_string()
}

fn first_example(doc: &CapabilityDoc) -> String {
    let Some(example) = doc.examples.first() else {
        return String::new();
    };
    let value = example.get("call").or_else(|| example.get("args"));
    match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn score_doc(doc: &CapabilityDoc, query_tokens: &BTreeSet<String>, query_lc: &str) -> f64 {
    if query_tokens.is_empty() && query_lc.is_empty() {
        return 1.0;
    }

    let mut corpus_parts = vec![
        doc.id.clone(),
        doc.kind.clone(),
        doc.description.clone(),
        doc.constraints.join(" "),
    ];
    for example in &doc.examples {
        corpus_parts.push(example.to_string());
    }
    let doc_tokens = tokenize(&corpus_parts.join(" "));

    let overlap = query_tokens.intersection(&doc_tokens).count() as f64;

    let id_lc = doc.id.to_lowercase();
    let exact_id_boost = if !query_lc.is_empty() && query_lc == id_lc {
        3.0
    } else {
        0.0
    };
    let partial_id_boost = if !query_lc.is_empty() && id_lc.contains(query_lc) {
        1.5
    } else {
        0.0
    };

    overlap + exact_id_boost + partial_id_boost
}

fn tokenize(value: &str) -> BTreeSet<String> {
    value
        .to_lowercase()
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}
