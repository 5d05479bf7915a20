use super::snapshot::{self, Manifest, StagingDir, FRAGMENTS_FILE, MANIFEST_FILE};
use crate::core::error::{Error, Result};
use crate::indexing::chunker::Fragment;
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Table definition for fragment storage
/// Key: fragment id
/// Value: JSON serialized Fragment (vector included)
const FRAGMENTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("fragments");

const MAX_LOAD_ATTEMPTS: u32 = 3;
const MAX_OPEN_ATTEMPTS: u32 = 10;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(20);

/// A ranked match for a query vector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub fragment_id: String,
    /// Cosine similarity, higher is closer
    pub score: f32,
}

impl QueryResult {
    /// Cosine distance, lower is closer
    pub fn distance(&self) -> f32 {
        1.0 - self.score
    }
}

/// In-memory fragment collection backed by atomically written snapshots.
///
/// Fragments are keyed by id, so adding a fragment that already exists
/// replaces it.
#[derive(Debug, Clone)]
pub struct VectorStore {
    location: PathBuf,
    generation: u64,
    model: Option<String>,
    dimensions: Option<usize>,
    fragments: BTreeMap<String, Fragment>,
}

impl VectorStore {
    /// An empty store that will persist to `location`
    pub fn empty(location: &Path) -> Self {
        Self {
            location: location.to_path_buf(),
            generation: 0,
            model: None,
            dimensions: None,
            fragments: BTreeMap::new(),
        }
    }

    /// Whether a snapshot has been published at `location`.
    ///
    /// An unreadable `CURRENT` pointer is an error, not an absent index.
    pub fn exists(location: &Path) -> Result<bool> {
        Ok(snapshot::current_snapshot(location)?.is_some())
    }

    /// Load the live snapshot at `location`, or an empty store if there is none.
    ///
    /// A writer in another process may publish and collect the snapshot
    /// while it is being read; the load then follows `CURRENT` again.
    pub fn load(location: &Path) -> Result<Self> {
        let mut attempt = 0;
        loop {
            let dir = match snapshot::current_snapshot(location)? {
                Some(dir) => dir,
                None => return Ok(Self::empty(location)),
            };
            match Self::load_snapshot(location, &dir) {
                Ok(store) => return Ok(store),
                Err(e) if attempt < MAX_LOAD_ATTEMPTS
                    && snapshot::current_snapshot(location).ok().flatten().as_ref() != Some(&dir) =>
                {
                    debug!("Snapshot {} was replaced while loading: {}", dir.display(), e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn load_snapshot(location: &Path, dir: &Path) -> Result<Self> {
        let manifest = Manifest::read(&dir.join(MANIFEST_FILE))?;
        let fragments = read_fragments(&dir.join(FRAGMENTS_FILE))?;
        if fragments.len() != manifest.fragment_count {
            return Err(Error::Database(format!(
                "Snapshot {} holds {} fragments but its manifest lists {}",
                dir.display(),
                fragments.len(),
                manifest.fragment_count
            )));
        }

        Ok(Self {
            location: location.to_path_buf(),
            generation: manifest.generation,
            model: manifest.model,
            dimensions: manifest.dimensions,
            fragments,
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Generation of the snapshot this store was loaded from or last persisted as
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    /// Record the embedding model the stored vectors come from
    pub fn set_model(&mut self, model: &str) {
        self.model = Some(model.to_string());
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Drop every fragment and forget the model and dimension
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.model = None;
        self.dimensions = None;
    }

    /// Insert or replace fragments by id.
    ///
    /// Every fragment needs a vector of the store's dimension; a batch with
    /// any invalid fragment is rejected as a whole. Returns how many
    /// existing fragments were replaced.
    pub fn add(&mut self, fragments: Vec<Fragment>) -> Result<usize> {
        let mut dimensions = self.dimensions;
        for fragment in &fragments {
            let vector = fragment.vector.as_ref().ok_or_else(|| {
                Error::Database(format!("Fragment {} has no vector", fragment.id))
            })?;
            match dimensions {
                Some(expected) if expected != vector.len() => {
                    return Err(Error::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
                None => dimensions = Some(vector.len()),
                _ => {}
            }
            if vector.iter().any(|x| !x.is_finite()) {
                return Err(Error::Database(format!(
                    "Fragment {} has a non-finite vector component",
                    fragment.id
                )));
            }
        }
        self.dimensions = dimensions;

        let mut replaced = 0;
        for fragment in fragments {
            if self.fragments.insert(fragment.id.clone(), fragment).is_some() {
                replaced += 1;
            }
        }
        Ok(replaced)
    }

    /// Get a fragment by id
    pub fn get(&self, id: &str) -> Option<&Fragment> {
        self.fragments.get(id)
    }

    /// Remove all fragments of a source, returning how many were removed
    pub fn remove_source(&mut self, source_path: &str) -> usize {
        self.retain_sources(|source| source != source_path)
    }

    /// Keep only fragments whose source satisfies `keep`
    pub fn retain_sources<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.fragments.len();
        self.fragments.retain(|_, f| keep(&f.source_path));
        before - self.fragments.len()
    }

    /// All fragments of a source ordered by offset
    pub fn fragments_for_source(&self, source_path: &str) -> Vec<&Fragment> {
        let mut fragments: Vec<&Fragment> = self
            .fragments
            .values()
            .filter(|f| f.source_path == source_path)
            .collect();
        fragments.sort_by_key(|f| f.start_offset);
        fragments
    }

    /// Stored fragments grouped by source, in one pass over the store
    pub fn fragments_by_source(&self) -> HashMap<&str, Vec<&Fragment>> {
        let mut grouped: HashMap<&str, Vec<&Fragment>> = HashMap::new();
        for fragment in self.fragments.values() {
            grouped
                .entry(fragment.source_path.as_str())
                .or_default()
                .push(fragment);
        }
        grouped
    }

    /// Number of distinct sources in the store
    pub fn source_count(&self) -> usize {
        self.fragments
            .values()
            .map(|f| f.source_path.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Nearest fragments by cosine similarity.
    ///
    /// Uses a bounded heap to keep the top `k`; ties go to the smaller id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<QueryResult>> {
        if k == 0 || self.fragments.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(expected) = self.dimensions {
            if expected != query.len() {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }

        let mut heap: BinaryHeap<SimilarityEntry> = BinaryHeap::with_capacity(k + 1);
        for (id, fragment) in &self.fragments {
            let Some(vector) = fragment.vector.as_deref() else {
                continue;
            };
            heap.push(SimilarityEntry {
                score: cosine_similarity(query, vector),
                id,
            });
            if heap.len() > k {
                heap.pop();
            }
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|entry| QueryResult {
                fragment_id: entry.id.to_string(),
                score: entry.score,
            })
            .collect())
    }

    /// Write the store as a new snapshot and publish it atomically.
    ///
    /// On failure the previously published snapshot stays live and no
    /// partial files remain.
    pub fn persist(&mut self) -> Result<()> {
        let generation = snapshot::next_generation(&self.location)?.max(self.generation + 1);
        let staging = StagingDir::create(&self.location, generation)?;

        write_fragments(&staging.path().join(FRAGMENTS_FILE), &self.fragments)?;
        Manifest::new(
            generation,
            self.model.clone(),
            self.dimensions,
            self.fragments.len(),
        )
        .write(&staging.path().join(MANIFEST_FILE))?;

        staging.commit()?;
        self.generation = generation;
        snapshot::collect_garbage(&self.location, generation, snapshot::STALE_STAGING_AGE);

        info!(
            "Persisted {} fragments to {} (generation {})",
            self.fragments.len(),
            self.location.display(),
            generation
        );
        Ok(())
    }
}

fn read_fragments(path: &Path) -> Result<BTreeMap<String, Fragment>> {
    let db = open_read(path)?;

    let read_txn = db.begin_read().map_err(|e| {
        Error::Database(format!("Failed to begin read transaction: {}", e))
    })?;

    let table = read_txn.open_table(FRAGMENTS_TABLE).map_err(|e| {
        Error::Database(format!("Failed to open table: {}", e))
    })?;

    let mut fragments = BTreeMap::new();
    for item in table.iter().map_err(|e| {
        Error::Database(format!("Failed to iterate table: {}", e))
    })? {
        let (key, value) = item.map_err(|e| {
            Error::Database(format!("Failed to read table item: {}", e))
        })?;
        let fragment: Fragment = serde_json::from_str(value.value()).map_err(|e| {
            Error::Database(format!("Failed to deserialize fragment {}: {}", key.value(), e))
        })?;
        fragments.insert(key.value().to_string(), fragment);
    }

    Ok(fragments)
}

/// Open a snapshot database, waiting briefly while another handle holds its lock
fn open_read(path: &Path) -> Result<Database> {
    let mut attempt = 0;
    loop {
        match Database::open(path) {
            Ok(db) => return Ok(db),
            Err(DatabaseError::DatabaseAlreadyOpen) if attempt < MAX_OPEN_ATTEMPTS => {
                attempt += 1;
                std::thread::sleep(OPEN_RETRY_DELAY * attempt);
            }
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                return Err(Error::Database("Index database is locked. Another docvec process may be running. Close other instances and try again.".to_string()));
            }
            Err(e) => {
                return Err(Error::Database(format!("Failed to open index database: {}", e)));
            }
        }
    }
}

fn write_fragments(path: &Path, fragments: &BTreeMap<String, Fragment>) -> Result<()> {
    let db = Database::create(path).map_err(|e| {
        Error::PersistenceFailure(format!("Failed to create index database: {}", e))
    })?;

    let write_txn = db.begin_write().map_err(|e| {
        Error::PersistenceFailure(format!("Failed to begin write transaction: {}", e))
    })?;
    {
        let mut table = write_txn.open_table(FRAGMENTS_TABLE).map_err(|e| {
            Error::PersistenceFailure(format!("Failed to open table: {}", e))
        })?;

        for (id, fragment) in fragments {
            let json = serde_json::to_string(fragment).map_err(|e| {
                Error::PersistenceFailure(format!("Failed to serialize fragment {}: {}", id, e))
            })?;
            table.insert(id.as_str(), json.as_str()).map_err(|e| {
                Error::PersistenceFailure(format!("Failed to insert fragment {}: {}", id, e))
            })?;
        }
    }
    write_txn.commit().map_err(|e| {
        Error::PersistenceFailure(format!("Failed to commit transaction: {}", e))
    })?;

    Ok(())
}

/// Heap entry for top-K selection.
///
/// Ordered so that the *worst* match is the greatest, which makes
/// `BinaryHeap` pop the worst first and `into_sorted_vec` list the best first.
struct SimilarityEntry<'a> {
    score: f32,
    id: &'a str,
}

impl PartialEq for SimilarityEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SimilarityEntry<'_> {}

impl PartialOrd for SimilarityEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimilarityEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.id.cmp(other.id))
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
