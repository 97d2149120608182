// Template store - cosine vector index over query templates
// Ephemeral by default, with optional bincode persistence. The similarity
// metric at search time is the same cosine used conceptually at insert time,
// and the stored dimension must equal the embedder's current dimension; a
// mismatch forces a drop-and-rebuild during intent initialization.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One stored template vector with its metadata. Metadata is kept as JSON
/// text because the bincode layout cannot carry self-describing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreEntry {
    template_id: String,
    embedding: Vec<f32>,
    document: String,
    metadata_json: String,
}

impl StoreEntry {
    fn metadata(&self) -> Map<String, Value> {
        serde_json::from_str(&self.metadata_json).unwrap_or_default()
    }
}

/// Serialized store layout.
#[derive(Debug, Serialize, Deserialize)]
struct StoreData {
    name: String,
    dimension: usize,
    entries: HashMap<String, StoreEntry>,
}

/// A search hit before template hydration.
#[derive(Debug, Clone)]
pub struct StoreMatch {
    pub template_id: String,
    pub similarity: f32,
    pub document: String,
    pub metadata: Map<String, Value>,
}

/// Vector index mapping `template_id -> (embedding, metadata)`.
pub struct TemplateStore {
    name: String,
    path: Option<PathBuf>,
    dimension: usize,
    entries: HashMap<String, StoreEntry>,
    dirty: bool,
}

impl TemplateStore {
    /// Open a store. With a path, existing data is loaded from disk; the
    /// stored dimension wins over `dimension` until the caller rebuilds.
    pub fn open(name: &str, path: Option<&Path>, dimension: usize) -> Result<Self> {
        let mut store = Self {
            name: name.to_string(),
            path: path.map(Path::to_path_buf),
            dimension,
            entries: HashMap::new(),
            dirty: false,
        };

        if let Some(path) = &store.path {
            if path.exists() {
                store.load_from_disk()?;
                info!(
                    "Opened persistent template store '{}' with {} entries ({}d)",
                    store.name,
                    store.entries.len(),
                    store.dimension
                );
            } else if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        Ok(store)
    }

    pub fn ephemeral(name: &str, dimension: usize) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            dimension,
            entries: HashMap::new(),
            dirty: false,
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The dimension of the vectors currently stored.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Drop all entries and adopt a new dimension. Used when the embedder's
    /// dimension changed across restarts.
    pub fn recreate(&mut self, dimension: usize) -> Result<()> {
        info!(
            "Recreating template store '{}': dimension {} -> {dimension}",
            self.name, self.dimension
        );
        self.entries.clear();
        self.dimension = dimension;
        self.dirty = true;
        self.persist()
    }

    /// Insert or replace a template vector.
    pub fn insert(
        &mut self,
        template_id: &str,
        embedding: Vec<f32>,
        document: String,
        metadata: Map<String, Value>,
    ) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(anyhow!(
                "Template embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            ));
        }

        self.entries.insert(
            template_id.to_string(),
            StoreEntry {
                template_id: template_id.to_string(),
                embedding,
                document,
                metadata_json: serde_json::to_string(&metadata)?,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Search for templates similar to the query embedding, ordered by
    /// descending cosine similarity, filtered by `threshold`.
    pub fn search_similar(
        &self,
        query_embedding: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<StoreMatch>> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if query_embedding.len() != self.dimension {
            return Err(anyhow!(
                "Query embedding dimension {} does not match store dimension {}",
                query_embedding.len(),
                self.dimension
            ));
        }

        let mut matches: Vec<StoreMatch> = self
            .entries
            .values()
            .map(|entry| StoreMatch {
                template_id: entry.template_id.clone(),
                similarity: cosine_similarity(query_embedding, &entry.embedding),
                document: entry.document.clone(),
                metadata: entry.metadata(),
            })
            .filter(|candidate| candidate.similarity >= threshold)
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(limit);

        debug!(
            "Template store '{}' returned {} matches",
            self.name,
            matches.len()
        );
        Ok(matches)
    }

    /// Flush to disk when persistent and dirty.
    pub fn persist(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        let data = StoreData {
            name: self.name.clone(),
            dimension: self.dimension,
            entries: self.entries.clone(),
        };

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open template store {}", path.display()))?;
        bincode::serialize_into(BufWriter::new(file), &data)
            .context("failed to serialize template store")?;

        self.dirty = false;
        Ok(())
    }

    fn load_from_disk(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = File::open(path)
            .with_context(|| format!("failed to open template store {}", path.display()))?;
        let data: StoreData = bincode::deserialize_from(BufReader::new(file))
            .context("failed to deserialize template store")?;

        self.dimension = data.dimension;
        self.entries = data.entries;
        self.dirty = false;
        Ok(())
    }
}

/// Cosine similarity clamped to [0, 1]. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}
