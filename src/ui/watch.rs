use crate::core::error::{Error, Result};
use crate::indexing::loader;
use crate::search::service::SearchService;
use ignore::overrides::Override;
use notify_debouncer_full::{
    new_debouncer,
    notify::{RecursiveMode, Watcher},
    DebounceEventResult,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Quiet period before a burst of file events triggers a reindex
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// File watcher that keeps the index in sync with a corpus directory
pub struct FileWatcher {
    root: PathBuf,
    service: Arc<SearchService>,
    matcher: Override,
    debounce: Duration,
}

impl FileWatcher {
    /// Create a watcher for `root`, which must be an existing directory
    pub fn new(root: &Path, service: Arc<SearchService>) -> Result<Self> {
        let root = loader::resolve_root(root)?;
        let matcher = loader::build_matcher(&root, &service.settings().glob)?;
        Ok(Self {
            root,
            service,
            matcher,
            debounce: DEFAULT_DEBOUNCE,
        })
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a change to `path` can affect the index.
    ///
    /// Paths outside the corpus or inside the index directory are ignored.
    /// Existing files count when they match the corpus glob. Directories
    /// always count, and so does a vanished path the glob does not match,
    /// since a renamed or removed directory takes its documents with it.
    pub fn is_relevant(&self, path: &Path) -> bool {
        if !path.starts_with(&self.root) || path.starts_with(self.service.location()) {
            return false;
        }
        if self.matcher.matched(path, false).is_whitelist() {
            return true;
        }
        path.is_dir() || !path.exists()
    }

    /// Watch until the event channel closes, reindexing after each burst of
    /// relevant changes. Indexing failures are logged and watching continues.
    pub async fn watch(&self) -> Result<()> {
        info!("Watching directory: {}", self.root.display());

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<PathBuf>>();

        let mut debouncer = new_debouncer(self.debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let paths = events.into_iter().flat_map(|e| e.event.paths).collect();
                    let _ = tx.send(paths);
                }
                Err(errors) => {
                    for e in errors {
                        warn!("Watch error: {}", e);
                    }
                }
            }
        })
        .map_err(|e| Error::Io(std::io::Error::other(format!("Failed to create file watcher: {}", e))))?;

        debouncer
            .watcher()
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| Error::Io(std::io::Error::other(format!("Failed to watch directory: {}", e))))?;

        while let Some(paths) = rx.recv().await {
            let changed: Vec<&PathBuf> = paths.iter().filter(|p| self.is_relevant(p)).collect();
            if changed.is_empty() {
                continue;
            }
            debug!("{} relevant paths changed", changed.len());

            match self.service.reindex(&self.root).await {
                Ok(report) => info!(
                    "Reindexed after {} change(s): {} fragments ({} embedded, {} removed)",
                    changed.len(),
                    report.fragments,
                    report.embedded,
                    report.removed
                ),
                Err(e) => warn!("Reindex failed: {}", e),
            }
        }

        Ok(())
    }
}
