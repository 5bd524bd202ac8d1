use crate::product::{Product, ProductId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use thiserror::Error;

/// Ledger failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("product id {0} already exists")]
    DuplicateId(ProductId),

    #[error("product {0} not found")]
    NotFound(ProductId),

    #[error("product {id} was modified concurrently (expected revision {expected})")]
    Conflict { id: ProductId, expected: u64 },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger record is corrupt: {0}")]
    Corrupt(String),
}

/// Durable per-product records.
///
/// Writes are single-entry compare-and-swaps on [`Product::revision`]; there are
/// no cross-entry transactions.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a new record; an existing id is never overwritten
    async fn create(&self, product: Product) -> Result<Product, LedgerError>;

    async fn get(&self, id: ProductId) -> Result<Option<Product>, LedgerError>;

    /// Store `product` if the stored revision still equals `product.revision`.
    /// Returns the record as stored, with its revision bumped.
    async fn save(&self, product: &Product) -> Result<Product, LedgerError>;

    /// One page of records the watchdog has to look at, ordered by id: non-terminal
    /// products created at or before `cutoff`, plus any product with pending effects
    async fn list_unfinished(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<ProductId>,
        limit: usize,
    ) -> Result<Vec<Product>, LedgerError>;

    /// Readiness check
    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

/// Whether the watchdog has work for `product` at `cutoff`
pub fn needs_attention(product: &Product, cutoff: DateTime<Utc>) -> bool {
    (!product.state.is_terminal() && product.created_at <= cutoff)
        || !product.pending_effects.is_empty()
}

/// Process-local ledger
#[derive(Default)]
pub struct InMemoryLedger {
    entries: RwLock<BTreeMap<ProductId, Product>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create(&self, product: Product) -> Result<Product, LedgerError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&product.id) {
            return Err(LedgerError::DuplicateId(product.id));
        }
        entries.insert(product.id, product.clone());
        Ok(product)
    }

    async fn get(&self, id: ProductId) -> Result<Option<Product>, LedgerError> {
        Ok(self.entries.read().get(&id).cloned())
    }

    async fn save(&self, product: &Product) -> Result<Product, LedgerError> {
        let mut entries = self.entries.write();
        let stored = entries
            .get_mut(&product.id)
            .ok_or(LedgerError::NotFound(product.id))?;
        if stored.revision != product.revision {
            return Err(LedgerError::Conflict {
                id: product.id,
                expected: product.revision,
            });
        }

        let mut next = product.clone();
        next.revision += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_unfinished(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<ProductId>,
        limit: usize,
    ) -> Result<Vec<Product>, LedgerError> {
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(self
            .entries
            .read()
            .range((lower, Bound::Unbounded))
            .map(|(_, product)| product)
            .filter(|product| needs_attention(product, cutoff))
            .take(limit)
            .cloned()
            .collect())
    }
}
