//! Intake Service
//!
//! Accepts uploaded products, parks them in quarantine storage, hands them to an
//! external transform service and follows its asynchronous callbacks until the
//! product is promoted into permanent storage, searchable and retrievable by id.
//!
//! ## Features
//!
//! - **Quarantined uploads**: payloads stay invisible until the transform
//!   service reports completion and the promotion copy has landed
//! - **Callback classification**: loosely shaped callback JSON is matched
//!   against a closed set of variants in a fixed precedence order
//! - **Durable lifecycle**: one PostgreSQL row per product, written with
//!   compare-and-swap, carrying the effects still owed by its last transition
//! - **Watchdog recovery**: stalled products are polled, replayed through the
//!   callback path, or failed once their deadline passes
//!
//! ## Architecture
//!
//! ```text
//!  POST /ingest            POST /store/{id}              Watchdog
//!       │                        │                          │
//!       ▼                        ▼                          ▼
//! ┌──────────────┐        ┌──────────────┐          ┌──────────────┐
//! │ Orchestrator │◀───────│ Classifier   │◀─────────│ Transform    │
//! └──────────────┘        └──────────────┘  status  │ status poll  │
//!    │      │                                       └──────────────┘
//!    │      ▼
//!    │  ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//!    │  │ State        │────▶│ Ledger       │     │ Search       │
//!    │  │ Machine      │     │ (PostgreSQL) │     │ Index        │
//!    │  └──────────────┘     └──────────────┘     └──────────────┘
//!    ▼                                                   ▲
//! ┌──────────────┐   promote   ┌──────────────┐          │
//! │ S3           │────────────▶│ S3           │   effects┘
//! │ quarantine   │             │ permanent    │
//! └──────────────┘             └──────────────┘
//! ```

pub mod api;
pub mod callback;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod locks;
pub mod object_store;
pub mod orchestrator;
pub mod pg_store;
pub mod product;
pub mod s3_store;
pub mod search_index;
pub mod transform;
pub mod watchdog;

pub use api::{create_router, start_api_server, AppState};
pub use callback::{classify, CallbackEvent, Rejected};
pub use config::Config;
pub use error::{ErrorResponse, IntakeError};
pub use ledger::{InMemoryLedger, Ledger, LedgerError};
pub use lifecycle::{decide, Decision, Effect, LifecycleEvent};
pub use object_store::{
    single_chunk, Buckets, ByteChunks, InMemoryObjectStore, ObjectStore, StorageError,
};
pub use orchestrator::{Applied, CallbackOutcome, IntakeSettings, Orchestrator, RetrievedProduct};
pub use pg_store::{Database, PgLedger, PgSearchIndex};
pub use product::{CallbackKind, LifecycleState, Product, ProductId, SecurityMarkings};
pub use s3_store::S3ObjectStore;
pub use search_index::{InMemorySearchIndex, SearchIndex};
pub use transform::{HttpTransformService, TransformService, TransformStatus};
pub use watchdog::{PassReport, Watchdog};
