// Core functionality
pub mod core {
    pub mod config;
    pub mod error;
}

// Persistence
pub mod storage {
    pub mod snapshot;
    pub mod vectors;
}

// Indexing pipeline
pub mod indexing {
    pub mod chunker;
    pub mod loader;
}

// Embedding & retrieval
pub mod search {
    pub mod model;
    pub mod provider;
    pub mod service;
}

// User interfaces
pub mod ui {
    pub mod cli;
    pub mod watch;
}

// Re-export commonly used types
pub use core::config::{Config, IndexSettings};
pub use core::error::{Error, Result};
pub use indexing::chunker::{split, Fragment};
pub use indexing::loader::{load, Document};
pub use search::model::BgeEmbedder;
pub use search::provider::{EmbeddingProvider, RetryPolicy};
pub use search::service::{
    IndexReport, IndexResponse, IndexStats, SearchHit, SearchResponse, SearchService,
};
pub use storage::vectors::{QueryResult, VectorStore};
pub use ui::cli::Cli;
pub use ui::watch::FileWatcher;
