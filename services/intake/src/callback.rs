use crate::product::{CallbackKind, ProductId, SecurityMarkings};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Order in which variants are tried; first match wins
pub const PRECEDENCE: [CallbackKind; 3] = [
    CallbackKind::Metadata,
    CallbackKind::Finished,
    CallbackKind::Product,
];

const FINISHED_STATUS: &str = "FINISHED";

/// Transform started working on the product
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductCallback {
    pub id: ProductId,
}

/// Transform produced metadata for the product
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataCallback {
    pub id: ProductId,
    pub status: String,
    pub metadata_type: String,
    pub mime_type: String,
    pub bytes: u64,
    /// Absolute URL the metadata can be fetched from
    pub location: String,
    pub security_markings: SecurityMarkings,
}

/// Transform is done with the product
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedCallback {
    pub id: ProductId,
}

/// A classified callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    Product(ProductCallback),
    Metadata(MetadataCallback),
    Finished(FinishedCallback),
}

impl CallbackEvent {
    pub fn id(&self) -> ProductId {
        match self {
            CallbackEvent::Product(cb) => cb.id,
            CallbackEvent::Metadata(cb) => cb.id,
            CallbackEvent::Finished(cb) => cb.id,
        }
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            CallbackEvent::Product(_) => CallbackKind::Product,
            CallbackEvent::Metadata(_) => CallbackKind::Metadata,
            CallbackEvent::Finished(_) => CallbackKind::Finished,
        }
    }
}

/// A payload that matched no callback variant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct Rejected {
    /// Why each variant refused the payload, in precedence order
    pub reasons: Vec<(CallbackKind, String)>,
}

impl Rejected {
    fn malformed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            reasons: PRECEDENCE
                .iter()
                .map(|kind| (*kind, reason.clone()))
                .collect(),
        }
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("payload matched no callback variant")?;
        for (kind, reason) in &self.reasons {
            write!(f, "; {kind}: {reason}")?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataPayload {
    id: String,
    status: String,
    #[serde(rename = "type")]
    metadata_type: String,
    mime_type: String,
    bytes: u64,
    location: String,
    security_markings: SecurityMarkings,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FinishedPayload {
    id: String,
    status: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ProductPayload {
    id: String,
    #[serde(default)]
    #[allow(dead_code)]
    status: Option<String>,
}

/// Classify a raw request body
pub fn classify_slice(body: &[u8]) -> Result<CallbackEvent, Rejected> {
    let raw: Value = serde_json::from_slice(body)
        .map_err(|e| Rejected::malformed(format!("body is not valid JSON: {e}")))?;
    classify(&raw)
}

/// Classify a parsed JSON payload
///
/// Variants are tried in [`PRECEDENCE`] order. Finished and Product refuse
/// unknown fields, so an incomplete metadata payload is rejected rather than
/// mistaken for a product callback.
pub fn classify(raw: &Value) -> Result<CallbackEvent, Rejected> {
    if !raw.is_object() {
        return Err(Rejected::malformed("payload is not a JSON object"));
    }

    let mut reasons = Vec::with_capacity(PRECEDENCE.len());
    for kind in PRECEDENCE {
        let attempt = match kind {
            CallbackKind::Metadata => match_metadata(raw),
            CallbackKind::Finished => match_finished(raw),
            CallbackKind::Product => match_product(raw),
        };
        match attempt {
            Ok(event) => return Ok(event),
            Err(reason) => reasons.push((kind, reason)),
        }
    }

    Err(Rejected { reasons })
}

/// Raw payload for a callback the watchdog has to reconstruct.
///
/// Metadata cannot be synthesized from an id alone; the watchdog forwards the
/// payload the transform service reports instead.
pub fn synthesize(kind: CallbackKind, id: ProductId) -> Option<Value> {
    match kind {
        CallbackKind::Product => Some(serde_json::json!({ "id": id.to_string() })),
        CallbackKind::Finished => Some(serde_json::json!({
            "id": id.to_string(),
            "status": FINISHED_STATUS,
        })),
        CallbackKind::Metadata => None,
    }
}

fn match_metadata(raw: &Value) -> Result<CallbackEvent, String> {
    let payload = MetadataPayload::deserialize(raw).map_err(|e| e.to_string())?;

    let id = parse_id(&payload.id)?;
    require_non_empty("status", &payload.status)?;
    require_non_empty("type", &payload.metadata_type)?;
    require_non_empty("mimeType", &payload.mime_type)?;
    let location = Url::parse(&payload.location)
        .map_err(|e| format!("location is not an absolute URL: {e}"))?;

    Ok(CallbackEvent::Metadata(MetadataCallback {
        id,
        status: payload.status,
        metadata_type: payload.metadata_type,
        mime_type: payload.mime_type,
        bytes: payload.bytes,
        location: location.to_string(),
        security_markings: payload.security_markings,
    }))
}

fn match_finished(raw: &Value) -> Result<CallbackEvent, String> {
    let payload = FinishedPayload::deserialize(raw).map_err(|e| e.to_string())?;
    if !payload.status.eq_ignore_ascii_case(FINISHED_STATUS) {
        return Err(format!("status `{}` is not {FINISHED_STATUS}", payload.status));
    }
    Ok(CallbackEvent::Finished(FinishedCallback {
        id: parse_id(&payload.id)?,
    }))
}

fn match_product(raw: &Value) -> Result<CallbackEvent, String> {
    let payload = ProductPayload::deserialize(raw).map_err(|e| e.to_string())?;
    Ok(CallbackEvent::Product(ProductCallback {
        id: parse_id(&payload.id)?,
    }))
}

fn parse_id(raw: &str) -> Result<ProductId, String> {
    raw.parse()
        .map_err(|e| format!("id `{raw}` is not a product id: {e}"))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}
