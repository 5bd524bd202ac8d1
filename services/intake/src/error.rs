use crate::callback::Rejected;
use crate::ledger::LedgerError;
use crate::lifecycle::TransitionError;
use crate::object_store::StorageError;
use crate::product::ProductId;
use crate::search_index::IndexError;
use crate::transform::TransformError;
use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by intake operations
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Rejected(#[from] Rejected),

    #[error("product id {0} already exists")]
    DuplicateId(ProductId),

    #[error("downstream service rejected the request: {0}")]
    ServiceRejected(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("product {0} not found")]
    NotFound(ProductId),

    #[error("{0}")]
    OutOfOrder(String),

    #[error("{0}")]
    Terminal(String),

    #[error("product {0} already received its finished callback")]
    AlreadyFinished(ProductId),

    #[error("transform service unavailable: {0}")]
    TransformUnavailable(String),

    #[error("ledger error: {0}")]
    Ledger(LedgerError),
}

impl IntakeError {
    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IntakeError::StorageUnavailable(_)
                | IntakeError::TransformUnavailable(_)
                | IntakeError::Ledger(LedgerError::Unavailable(_) | LedgerError::Conflict { .. })
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            IntakeError::Validation(_) | IntakeError::Rejected(_) => StatusCode::BAD_REQUEST,
            IntakeError::NotFound(_) => StatusCode::NOT_FOUND,
            IntakeError::DuplicateId(_)
            | IntakeError::OutOfOrder(_)
            | IntakeError::Terminal(_)
            | IntakeError::AlreadyFinished(_) => StatusCode::CONFLICT,
            IntakeError::ServiceRejected(_) => StatusCode::BAD_GATEWAY,
            IntakeError::StorageUnavailable(_) | IntakeError::TransformUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            IntakeError::Ledger(e) => match e {
                LedgerError::Unavailable(_) | LedgerError::Conflict { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            IntakeError::Validation(_) => "VALIDATION_ERROR",
            IntakeError::Rejected(_) => "CALLBACK_REJECTED",
            IntakeError::DuplicateId(_) => "DUPLICATE_ID",
            IntakeError::ServiceRejected(_) => "SERVICE_REJECTED",
            IntakeError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            IntakeError::NotFound(_) => "NOT_FOUND",
            IntakeError::OutOfOrder(_) => "OUT_OF_ORDER",
            IntakeError::Terminal(_) => "TERMINAL_STATE",
            IntakeError::AlreadyFinished(_) => "ALREADY_FINISHED",
            IntakeError::TransformUnavailable(_) => "TRANSFORM_UNAVAILABLE",
            IntakeError::Ledger(_) => "LEDGER_ERROR",
        }
    }
}

/// Error body returned by the HTTP API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl From<&IntakeError> for ErrorResponse {
    fn from(e: &IntakeError) -> Self {
        Self {
            error: e.to_string(),
            code: e.code().to_string(),
        }
    }
}

impl From<LedgerError> for IntakeError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::DuplicateId(id) => IntakeError::DuplicateId(id),
            LedgerError::NotFound(id) => IntakeError::NotFound(id),
            other => IntakeError::Ledger(other),
        }
    }
}

impl From<StorageError> for IntakeError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable(message) => IntakeError::StorageUnavailable(message),
            StorageError::ServiceRejected(message) => IntakeError::ServiceRejected(message),
            not_found @ StorageError::NotFound { .. } => {
                IntakeError::ServiceRejected(not_found.to_string())
            }
            StorageError::InvalidBody(message) => IntakeError::Validation(message),
        }
    }
}

impl From<IndexError> for IntakeError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Unavailable(message) => IntakeError::StorageUnavailable(message),
            IndexError::Rejected(message) => IntakeError::ServiceRejected(message),
        }
    }
}

impl From<TransformError> for IntakeError {
    fn from(e: TransformError) -> Self {
        match e {
            TransformError::Unavailable(message) => IntakeError::TransformUnavailable(message),
            TransformError::Rejected(message) => IntakeError::ServiceRejected(message),
        }
    }
}

impl From<TransitionError> for IntakeError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Terminal { .. } => IntakeError::Terminal(e.to_string()),
            TransitionError::OutOfOrder { .. } | TransitionError::Invalid { .. } => {
                IntakeError::OutOfOrder(e.to_string())
            }
        }
    }
}
