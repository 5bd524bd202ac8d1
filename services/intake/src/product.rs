use crate::lifecycle::Effect;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque product identifier, rendered as 32 lowercase hex characters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProductId(Uuid);

impl ProductId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProductId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for ProductId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl TryFrom<String> for ProductId {
    type Error = uuid::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProductId> for String {
    fn from(id: ProductId) -> Self {
        id.to_string()
    }
}

/// Lifecycle state of a product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Payload written to quarantine, transform not yet acknowledged
    Quarantined,
    /// Transform started on the product
    AwaitingCallbacks,
    /// Security markings accepted, metadata indexed
    MetadataValidated,
    /// Transform finished, promotion in progress
    Finished,
    /// Permanent and retrievable
    Promoted,
    /// Terminal failure
    Failed,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::Quarantined,
        LifecycleState::AwaitingCallbacks,
        LifecycleState::MetadataValidated,
        LifecycleState::Finished,
        LifecycleState::Promoted,
        LifecycleState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Quarantined => "QUARANTINED",
            LifecycleState::AwaitingCallbacks => "AWAITING_CALLBACKS",
            LifecycleState::MetadataValidated => "METADATA_VALIDATED",
            LifecycleState::Finished => "FINISHED",
            LifecycleState::Promoted => "PROMOTED",
            LifecycleState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Promoted | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown lifecycle state: {s}"))
    }
}

/// Callback kinds, used to record which callbacks a product has consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    Product,
    Metadata,
    Finished,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Product => "product",
            CallbackKind::Metadata => "metadata",
            CallbackKind::Finished => "finished",
        }
    }

    /// Singular kinds report a conflict when delivered again instead of a silent no-op
    pub fn is_singular(&self) -> bool {
        matches!(self, CallbackKind::Finished)
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallbackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(CallbackKind::Product),
            "metadata" => Ok(CallbackKind::Metadata),
            "finished" => Ok(CallbackKind::Finished),
            other => Err(format!("unknown callback kind: {other}")),
        }
    }
}

/// Security markings carried by a metadata callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityMarkings {
    pub classification: String,
    pub owner_producer: String,
}

impl SecurityMarkings {
    /// Both markings must be present and non-blank before anything is indexed
    pub fn is_valid(&self) -> bool {
        !self.classification.trim().is_empty() && !self.owner_producer.trim().is_empty()
    }
}

/// Attributes captured at upload time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAttributes {
    pub mime_type: String,
    pub file_name: String,
    pub file_size: u64,
}

/// Ledger record for one product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub mime_type: String,
    pub file_name: String,
    pub file_size: u64,
    pub security_markings: Option<SecurityMarkings>,
    pub quarantine_key: Option<String>,
    pub permanent_key: Option<String>,
    pub metadata_key: Option<String>,
    pub state: LifecycleState,
    pub applied_callbacks: BTreeSet<CallbackKind>,
    pub pending_effects: Vec<Effect>,
    pub submitted: bool,
    pub failure_reason: Option<String>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// A freshly ingested product sitting in quarantine
    pub fn quarantined(
        id: ProductId,
        attributes: UploadAttributes,
        quarantine_key: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            mime_type: attributes.mime_type,
            file_name: attributes.file_name,
            file_size: attributes.file_size,
            security_markings: None,
            quarantine_key: Some(quarantine_key),
            permanent_key: None,
            metadata_key: None,
            state: LifecycleState::Quarantined,
            applied_callbacks: BTreeSet::new(),
            pending_effects: Vec::new(),
            submitted: false,
            failure_reason: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_applied(&self, kind: CallbackKind) -> bool {
        self.applied_callbacks.contains(&kind)
    }

    /// Retrieval and search only ever see promoted products
    pub fn is_visible(&self) -> bool {
        self.state == LifecycleState::Promoted
    }
}
