//! Registry of loaded domain documents.
//!
//! Adding a domain is a data operation: drop one more document into the
//! domains directory (or call [`DomainRegistry::insert`]) and the engine
//! picks it up without a code change.

use crate::domain::DomainDocument;
use crate::error::{ConfigError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// A document that failed to load, kept for reporting.
#[derive(Debug, Clone)]
pub struct ExcludedDocument {
    pub source: PathBuf,
    pub reason: String,
}

/// Outcome of loading a domains directory.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub excluded: Vec<ExcludedDocument>,
}

/// Domain documents keyed by domain name.
#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    documents: BTreeMap<String, Arc<DomainDocument>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` document below `dir`.
    ///
    /// Each document is loaded independently: a malformed one is logged,
    /// reported as excluded, and does not prevent the others from loading.
    pub fn load_dir(dir: &Path) -> Result<(Self, LoadReport)> {
        if !dir.is_dir() {
            return Err(ConfigError::MissingDirectory(dir.to_path_buf()));
        }

        let mut registry = Self::new();
        let mut report = LoadReport::default();

        let mut paths: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().map(|ext| ext == "toml").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            match DomainDocument::from_file(&path) {
                Ok(document) => {
                    if registry.contains(&document.name) {
                        let reason = format!("duplicate domain '{}'", document.name);
                        tracing::warn!("Skipping {}: {}", path.display(), reason);
                        report.excluded.push(ExcludedDocument { source: path, reason });
                        continue;
                    }
                    tracing::info!("Loaded domain '{}' from {}", document.name, path.display());
                    report.loaded.push(document.name.clone());
                    registry
                        .documents
                        .insert(document.name.clone(), Arc::new(document));
                }
                Err(e) => {
                    tracing::warn!("Excluding domain document {}: {}", path.display(), e);
                    report.excluded.push(ExcludedDocument {
                        source: path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok((registry, report))
    }

    /// Validate and add (or replace) a document.
    pub fn insert(&mut self, document: DomainDocument) -> Result<Arc<DomainDocument>> {
        document.validate(&document.name)?;
        let document = Arc::new(document);
        self.documents
            .insert(document.name.clone(), Arc::clone(&document));
        Ok(document)
    }

    /// Remove a domain; its pool stops receiving new specialists.
    pub fn remove(&mut self, name: &str) -> Option<Arc<DomainDocument>> {
        self.documents.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<DomainDocument>> {
        self.documents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.documents.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.documents.keys().cloned().collect()
    }

    pub fn documents(&self) -> impl Iterator<Item = &Arc<DomainDocument>> {
        self.documents.values()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}
