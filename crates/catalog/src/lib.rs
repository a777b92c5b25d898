#![forbid(unsafe_code)]
//! Capability manifest store and catalog for the Zoekt broker.
//!
//! The manifest is a single YAML document declaring prebuilt workflows,
//! payload-side runtime tools, and execution patterns. This crate parses it
//! once at startup into an immutable [`CapabilityCatalog`] that serves list,
//! search, and read views, plus the [`WorkflowIndex`] the execution layer
//! uses to resolve workflow scripts and argument schemas.

mod catalog;
mod manifest;
mod model;

pub use catalog::CapabilityCatalog;
pub use manifest::{CatalogError, Manifest, ManifestEntry};
pub use model::{
    ArgKind, ArgSpec, CapabilityDoc, CapabilityHit, CapabilityKind, WorkflowIndex, WorkflowSpec,
};
