use crate::config::TransformConfig;
use crate::product::ProductId;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{redirect, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

/// Transform service failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("transform service rejected the request: {0}")]
    Rejected(String),

    #[error("transform service unavailable: {0}")]
    Unavailable(String),
}

impl TransformError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransformError::Unavailable(_))
    }
}

/// Submission sent when a product lands in quarantine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformRequest {
    pub id: ProductId,
    pub quarantine_bucket: String,
    pub quarantine_key: String,
    pub mime_type: String,
    pub file_size: u64,
    /// Where the transform service posts its callbacks
    pub callback_url: String,
}

/// What the transform service reports when polled
#[derive(Debug, Clone, PartialEq)]
pub enum TransformStatus {
    Pending,
    /// Done; `metadata` is the raw metadata callback payload if one was produced
    Complete { metadata: Option<Value> },
    Failed { reason: String },
    /// The service has no record of the product
    Unknown,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
enum StatusBody {
    Pending,
    Complete {
        #[serde(default)]
        metadata: Option<Value>,
    },
    Failed {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl From<StatusBody> for TransformStatus {
    fn from(body: StatusBody) -> Self {
        match body {
            StatusBody::Pending => TransformStatus::Pending,
            StatusBody::Complete { metadata } => TransformStatus::Complete { metadata },
            StatusBody::Failed { reason } => TransformStatus::Failed {
                reason: reason.unwrap_or_else(|| "no reason given".to_string()),
            },
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransformService: Send + Sync {
    /// Hand a quarantined product to the transform pipeline
    async fn submit(&self, request: &TransformRequest) -> Result<(), TransformError>;

    async fn status(&self, id: ProductId) -> Result<TransformStatus, TransformError>;

    /// Download a metadata document from the location named in a metadata callback.
    /// Locations outside the transform service are rejected.
    async fn fetch_metadata(&self, location: &str) -> Result<Bytes, TransformError>;
}

/// Transform service reached over HTTP
#[derive(Clone)]
pub struct HttpTransformService {
    base_url: String,
    base: Url,
    client: reqwest::Client,
}

impl HttpTransformService {
    pub fn new(config: &TransformConfig) -> Result<Self, TransformError> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            TransformError::Rejected(format!("invalid transform base URL {}: {e}", config.base_url))
        })?;
        // a redirect could leave the transform origin
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| TransformError::Rejected(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            base,
            client,
        })
    }

    /// Parse a metadata location and require it to share the transform service's origin
    fn metadata_url(&self, location: &str) -> Result<Url, TransformError> {
        let url = Url::parse(location)
            .map_err(|e| TransformError::Rejected(format!("invalid metadata location: {e}")))?;
        if url.origin() != self.base.origin() {
            return Err(TransformError::Rejected(format!(
                "metadata location {} is outside {}",
                url.origin().ascii_serialization(),
                self.base.origin().ascii_serialization()
            )));
        }
        Ok(url)
    }

    fn transform_url(&self) -> String {
        format!("{}/transform", self.base_url)
    }

    fn status_url(&self, id: ProductId) -> String {
        format!("{}/transform/{}", self.base_url, id)
    }
}

#[async_trait]
impl TransformService for HttpTransformService {
    #[instrument(skip(self, request), fields(product_id = %request.id))]
    async fn submit(&self, request: &TransformRequest) -> Result<(), TransformError> {
        let response = self
            .client
            .post(self.transform_url())
            .json(request)
            .send()
            .await
            .map_err(send_error)?;

        check_status(response.status(), "submission")?;
        debug!("Transform submission accepted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn status(&self, id: ProductId) -> Result<TransformStatus, TransformError> {
        let response = self
            .client
            .get(self.status_url(id))
            .send()
            .await
            .map_err(send_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(TransformStatus::Unknown);
        }
        check_status(response.status(), "status query")?;

        let body = response.json::<StatusBody>().await.map_err(|e| {
            if e.is_decode() {
                TransformError::Rejected(format!("invalid status response: {e}"))
            } else {
                TransformError::Unavailable(format!("failed reading status response: {e}"))
            }
        })?;
        Ok(body.into())
    }

    #[instrument(skip(self))]
    async fn fetch_metadata(&self, location: &str) -> Result<Bytes, TransformError> {
        let url = self.metadata_url(location)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(send_error)?;

        check_status(response.status(), "metadata download")?;
        response
            .bytes()
            .await
            .map_err(|e| TransformError::Unavailable(format!("failed reading metadata: {e}")))
    }
}

fn send_error(e: reqwest::Error) -> TransformError {
    if e.is_builder() {
        TransformError::Rejected(e.to_string())
    } else {
        TransformError::Unavailable(e.to_string())
    }
}

fn check_status(status: StatusCode, action: &str) -> Result<(), TransformError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(TransformError::Unavailable(format!("{action} failed ({status})")))
    } else {
        Err(TransformError::Rejected(format!("{action} failed ({status})")))
    }
}
