use crate::product::ProductId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;

/// Search index failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("search index rejected the request: {0}")]
    Rejected(String),

    #[error("search index unavailable: {0}")]
    Unavailable(String),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Unavailable(_))
    }
}

/// Keyword index over product metadata
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or replace the contents indexed for `id`
    async fn index(&self, id: ProductId, contents: &str) -> Result<(), IndexError>;

    /// Ids whose contents contain `keyword`, case-insensitively
    async fn find_by_keyword(&self, keyword: &str) -> Result<Vec<ProductId>, IndexError>;

    /// Removing an absent id succeeds
    async fn delete(&self, id: ProductId) -> Result<(), IndexError>;
}

/// Process-local search index
#[derive(Default)]
pub struct InMemorySearchIndex {
    entries: RwLock<BTreeMap<ProductId, String>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: ProductId) -> bool {
        self.entries.read().contains_key(&id)
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn index(&self, id: ProductId, contents: &str) -> Result<(), IndexError> {
        self.entries.write().insert(id, contents.to_lowercase());
        Ok(())
    }

    async fn find_by_keyword(&self, keyword: &str) -> Result<Vec<ProductId>, IndexError> {
        let needle = keyword.to_lowercase();
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(_, contents)| contents.contains(&needle))
            .map(|(id, _)| *id)
            .collect())
    }

    async fn delete(&self, id: ProductId) -> Result<(), IndexError> {
        self.entries.write().remove(&id);
        Ok(())
    }
}
