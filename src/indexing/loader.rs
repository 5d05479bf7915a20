use crate::core::error::{Error, Result};
use futures::stream::{self, StreamExt};
use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Files read concurrently while loading a corpus
const MAX_CONCURRENT_READS: usize = 16;

/// A document read from the corpus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Absolute path of the file
    pub path: PathBuf,
    /// Full UTF-8 contents
    pub text: String,
}

impl Document {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }

    /// Source path as stored on fragments
    pub fn source(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Build the glob matcher used to select corpus files under `root`
pub fn build_matcher(root: &Path, glob: &str) -> Result<Override> {
    let mut builder = OverrideBuilder::new(root);
    builder
        .add(glob)
        .map_err(|e| Error::Config(format!("Invalid glob '{}': {}", glob, e)))?;
    builder
        .build()
        .map_err(|e| Error::Config(format!("Invalid glob '{}': {}", glob, e)))
}

/// Ensure `root` is an existing directory and return its canonical form
pub fn resolve_root(root: &Path) -> Result<PathBuf> {
    if !root.is_dir() {
        return Err(Error::CorpusNotFound(root.to_path_buf()));
    }
    Ok(std::fs::canonicalize(root)?)
}

/// List files under `root` matching `glob`, respecting .gitignore rules
pub fn discover_files(root: &Path, glob: &str) -> Result<Vec<PathBuf>> {
    let root = resolve_root(root)?;
    let matcher = build_matcher(&root, glob)?;

    let walker = WalkBuilder::new(&root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .overrides(matcher)
        .build();

    let mut files = Vec::new();
    for result in walker {
        match result {
            Ok(entry) => {
                if entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                    files.push(entry.into_path());
                }
            }
            Err(err) => {
                // Some entries might be inaccessible
                warn!("Skipping unreadable entry: {}", err);
            }
        }
    }

    Ok(files)
}

/// Load every document under `root` matching `glob`.
///
/// Files are read concurrently, so the returned order is unspecified.
/// Unreadable and non-UTF-8 files are skipped with a warning.
pub async fn load(root: &Path, glob: &str) -> Result<Vec<Document>> {
    let files = discover_files(root, glob)?;
    debug!(count = files.len(), "discovered candidate files");

    let documents = stream::iter(files)
        .map(|path| async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Document { path, text }),
                    Err(_) => {
                        warn!("Skipping non-UTF-8 file: {}", path.display());
                        None
                    }
                },
                Err(e) => {
                    warn!("Skipping unreadable file {}: {}", path.display(), e);
                    None
                }
            }
        })
        .buffer_unordered(MAX_CONCURRENT_READS)
        .filter_map(|doc| async move { doc })
        .collect::<Vec<_>>()
        .await;

    Ok(documents)
}
