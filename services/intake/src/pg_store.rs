use crate::config::DatabaseConfig;
use crate::ledger::{Ledger, LedgerError};
use crate::lifecycle::Effect;
use crate::product::{CallbackKind, LifecycleState, Product, ProductId, SecurityMarkings};
use crate::search_index::{IndexError, SearchIndex};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const PRODUCT_COLUMNS: &str = r#"
    id, mime_type, file_name, file_size, classification, owner_producer,
    quarantine_key, permanent_key, metadata_key, state, applied_callbacks,
    pending_effects, submitted, failure_reason, revision, created_at, updated_at
"#;

/// PostgreSQL connection pool shared by the ledger and the search index
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    pub fn ledger(&self) -> PgLedger {
        PgLedger {
            pool: self.pool.clone(),
        }
    }

    pub fn search_index(&self) -> PgSearchIndex {
        PgSearchIndex {
            pool: self.pool.clone(),
        }
    }
}

/// Row shape of the `products` table
#[derive(Debug, FromRow)]
struct ProductRow {
    id: Uuid,
    mime_type: String,
    file_name: String,
    file_size: i64,
    classification: Option<String>,
    owner_producer: Option<String>,
    quarantine_key: Option<String>,
    permanent_key: Option<String>,
    metadata_key: Option<String>,
    state: String,
    applied_callbacks: Vec<String>,
    pending_effects: Json<Vec<Effect>>,
    submitted: bool,
    failure_reason: Option<String>,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProductRow> for Product {
    type Error = LedgerError;

    fn try_from(row: ProductRow) -> Result<Self, Self::Error> {
        let security_markings = match (row.classification, row.owner_producer) {
            (Some(classification), Some(owner_producer)) => Some(SecurityMarkings {
                classification,
                owner_producer,
            }),
            _ => None,
        };

        let applied_callbacks = row
            .applied_callbacks
            .iter()
            .map(|kind| kind.parse::<CallbackKind>())
            .collect::<Result<_, _>>()
            .map_err(LedgerError::Corrupt)?;

        Ok(Product {
            id: ProductId::from_uuid(row.id),
            mime_type: row.mime_type,
            file_name: row.file_name,
            file_size: u64::try_from(row.file_size)
                .map_err(|_| LedgerError::Corrupt(format!("negative file size for {}", row.id)))?,
            security_markings,
            quarantine_key: row.quarantine_key,
            permanent_key: row.permanent_key,
            metadata_key: row.metadata_key,
            state: row
                .state
                .parse::<LifecycleState>()
                .map_err(LedgerError::Corrupt)?,
            applied_callbacks,
            pending_effects: row.pending_effects.0,
            submitted: row.submitted,
            failure_reason: row.failure_reason,
            revision: u64::try_from(row.revision)
                .map_err(|_| LedgerError::Corrupt(format!("negative revision for {}", row.id)))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Ledger stored in the `products` table
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    async fn exists(&self, id: ProductId) -> Result<bool, LedgerError> {
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM products WHERE id = $1)")
            .bind(id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(ledger_error)?;
        Ok(exists.0)
    }
}

#[async_trait]
impl Ledger for PgLedger {
    #[instrument(skip(self, product), fields(product_id = %product.id))]
    async fn create(&self, product: Product) -> Result<Product, LedgerError> {
        let applied: Vec<String> = product
            .applied_callbacks
            .iter()
            .map(|kind| kind.as_str().to_string())
            .collect();

        let result = sqlx::query(
            r#"
            INSERT INTO products (
                id, mime_type, file_name, file_size, classification, owner_producer,
                quarantine_key, permanent_key, metadata_key, state, applied_callbacks,
                pending_effects, submitted, failure_reason, revision, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6,
                $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17
            )
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(&product.mime_type)
        .bind(&product.file_name)
        .bind(to_i64(product.file_size, "file size")?)
        .bind(product.security_markings.as_ref().map(|m| m.classification.clone()))
        .bind(product.security_markings.as_ref().map(|m| m.owner_producer.clone()))
        .bind(&product.quarantine_key)
        .bind(&product.permanent_key)
        .bind(&product.metadata_key)
        .bind(product.state.as_str())
        .bind(&applied)
        .bind(Json(&product.pending_effects))
        .bind(product.submitted)
        .bind(&product.failure_reason)
        .bind(to_i64(product.revision, "revision")?)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::DuplicateId(product.id));
        }

        debug!(state = %product.state, "Product recorded");
        Ok(product)
    }

    async fn get(&self, id: ProductId) -> Result<Option<Product>, LedgerError> {
        let row = sqlx::query_as::<_, ProductRow>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(ledger_error)?;

        row.map(Product::try_from).transpose()
    }

    #[instrument(skip(self, product), fields(product_id = %product.id, revision = product.revision))]
    async fn save(&self, product: &Product) -> Result<Product, LedgerError> {
        let applied: Vec<String> = product
            .applied_callbacks
            .iter()
            .map(|kind| kind.as_str().to_string())
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE products SET
                classification = $3,
                owner_producer = $4,
                quarantine_key = $5,
                permanent_key = $6,
                metadata_key = $7,
                state = $8,
                applied_callbacks = $9,
                pending_effects = $10,
                submitted = $11,
                failure_reason = $12,
                updated_at = $13,
                revision = revision + 1
            WHERE id = $1 AND revision = $2
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(to_i64(product.revision, "revision")?)
        .bind(product.security_markings.as_ref().map(|m| m.classification.clone()))
        .bind(product.security_markings.as_ref().map(|m| m.owner_producer.clone()))
        .bind(&product.quarantine_key)
        .bind(&product.permanent_key)
        .bind(&product.metadata_key)
        .bind(product.state.as_str())
        .bind(&applied)
        .bind(Json(&product.pending_effects))
        .bind(product.submitted)
        .bind(&product.failure_reason)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await
        .map_err(ledger_error)?;

        if result.rows_affected() == 0 {
            return if self.exists(product.id).await? {
                Err(LedgerError::Conflict {
                    id: product.id,
                    expected: product.revision,
                })
            } else {
                Err(LedgerError::NotFound(product.id))
            };
        }

        let mut stored = product.clone();
        stored.revision += 1;
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn list_unfinished(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<ProductId>,
        limit: usize,
    ) -> Result<Vec<Product>, LedgerError> {
        let rows = sqlx::query_as::<_, ProductRow>(&format!(
            r#"
            SELECT {PRODUCT_COLUMNS}
            FROM products
            WHERE ($1::uuid IS NULL OR id > $1)
              AND (
                    (state NOT IN ('PROMOTED', 'FAILED') AND created_at <= $2)
                 OR pending_effects <> '[]'::jsonb
              )
            ORDER BY id ASC
            LIMIT $3
            "#
        ))
        .bind(after.map(|id| id.as_uuid()))
        .bind(cutoff)
        .bind(to_i64(limit as u64, "limit")?)
        .fetch_all(&self.pool)
        .await
        .map_err(ledger_error)?;

        rows.into_iter().map(Product::try_from).collect()
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(ledger_error)?;
        Ok(())
    }
}

/// Search index stored in the `indexed_metadata` table
#[derive(Clone)]
pub struct PgSearchIndex {
    pool: PgPool,
}

#[async_trait]
impl SearchIndex for PgSearchIndex {
    #[instrument(skip(self, contents), fields(product_id = %id, size_bytes = contents.len()))]
    async fn index(&self, id: ProductId, contents: &str) -> Result<(), IndexError> {
        sqlx::query(
            r#"
            INSERT INTO indexed_metadata (id, contents, indexed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE
                SET contents = EXCLUDED.contents, indexed_at = NOW()
            "#,
        )
        .bind(id.as_uuid())
        .bind(contents)
        .execute(&self.pool)
        .await
        .map_err(index_error)?;

        metrics::counter!("intake.metadata.indexed").increment(1);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_keyword(&self, keyword: &str) -> Result<Vec<ProductId>, IndexError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM indexed_metadata
            WHERE contents ILIKE $1 ESCAPE '\'
            ORDER BY id
            "#,
        )
        .bind(format!("%{}%", escape_like(keyword)))
        .fetch_all(&self.pool)
        .await
        .map_err(index_error)?;

        Ok(ids.into_iter().map(|(id,)| ProductId::from_uuid(id)).collect())
    }

    async fn delete(&self, id: ProductId) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM indexed_metadata WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(index_error)?;
        Ok(())
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64, LedgerError> {
    i64::try_from(value).map_err(|_| LedgerError::Corrupt(format!("{what} {value} out of range")))
}

/// Escape LIKE wildcards so keywords match literally
fn escape_like(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn ledger_error(e: sqlx::Error) -> LedgerError {
    match e {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            LedgerError::Corrupt(e.to_string())
        }
        other => LedgerError::Unavailable(other.to_string()),
    }
}

fn index_error(e: sqlx::Error) -> IndexError {
    match e {
        sqlx::Error::Database(db) => IndexError::Rejected(db.to_string()),
        other => IndexError::Unavailable(other.to_string()),
    }
}
