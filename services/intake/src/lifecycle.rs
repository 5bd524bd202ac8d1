use crate::callback::CallbackEvent;
use crate::object_store::{metadata_key, permanent_key};
use crate::product::{CallbackKind, LifecycleState, Product, SecurityMarkings};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deferred side effect, executed after the state transition is recorded.
///
/// Every effect is idempotent so it can be replayed after a crash or a
/// transient storage failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    /// Fetch metadata from the transform service and keep a copy
    StoreMetadata { location: String, key: String },
    /// Index the stored metadata copy
    IndexMetadata { key: String },
    /// Copy the payload from quarantine into permanent storage
    PromoteObject {
        quarantine_key: String,
        permanent_key: String,
    },
    /// Remove the quarantine copy
    DeleteQuarantine { key: String },
    /// Remove a permanent copy left behind by a failed promotion
    DeletePermanent { key: String },
    /// Remove the product from the search index
    Unindex,
    /// Emit the failure record
    RecordFailure { reason: String },
}

impl Effect {
    pub fn name(&self) -> &'static str {
        match self {
            Effect::StoreMetadata { .. } => "store_metadata",
            Effect::IndexMetadata { .. } => "index_metadata",
            Effect::PromoteObject { .. } => "promote_object",
            Effect::DeleteQuarantine { .. } => "delete_quarantine",
            Effect::DeletePermanent { .. } => "delete_permanent",
            Effect::Unindex => "unindex",
            Effect::RecordFailure { .. } => "record_failure",
        }
    }
}

/// Anything that can move a product through its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Classified callback, live or synthesized by the watchdog
    Callback(CallbackEvent),
    /// All promotion effects completed
    PromotionSucceeded,
    /// Watchdog deadline passed without a terminal transform status
    DeadlineExceeded,
    /// Transform service reported a permanent failure
    TransformFailed { reason: String },
    /// An effect failed in a way retrying cannot fix
    EffectRejected { reason: String },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Callback(cb) => cb.kind().as_str(),
            LifecycleEvent::PromotionSucceeded => "promotion_succeeded",
            LifecycleEvent::DeadlineExceeded => "deadline_exceeded",
            LifecycleEvent::TransformFailed { .. } => "transform_failed",
            LifecycleEvent::EffectRejected { .. } => "effect_rejected",
        }
    }
}

/// Facts about external collaborators that guards depend on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observations {
    pub quarantine_present: bool,
}

/// Result of applying an event to a product
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Record a new state and its effects
    Advance(Transition),
    /// The callback kind was already consumed; nothing changes
    Duplicate { kind: CallbackKind },
    /// The event has no bearing on the current state
    Unchanged,
}

/// A state change plus everything recorded alongside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: LifecycleState,
    pub effects: Vec<Effect>,
    pub applied: Option<CallbackKind>,
    pub markings: Option<SecurityMarkings>,
    pub metadata_key: Option<String>,
    pub failure_reason: Option<String>,
}

impl Transition {
    fn to(state: LifecycleState) -> Self {
        Self {
            to: state,
            effects: Vec::new(),
            applied: None,
            markings: None,
            metadata_key: None,
            failure_reason: None,
        }
    }

    fn consuming(mut self, kind: CallbackKind) -> Self {
        self.applied = Some(kind);
        self
    }

    /// Write the transition onto a ledger record
    pub fn apply_to(self, product: &mut Product, now: DateTime<Utc>) {
        if self.to == LifecycleState::Failed {
            // forward effects are moot once the product has failed
            product.pending_effects.clear();
            product.failure_reason = self.failure_reason;
        }
        product.state = self.to;
        if let Some(kind) = self.applied {
            product.applied_callbacks.insert(kind);
        }
        if let Some(markings) = self.markings {
            product.security_markings = Some(markings);
        }
        if let Some(key) = self.metadata_key {
            product.metadata_key = Some(key);
        }
        product.pending_effects.extend(self.effects);
        product.updated_at = now;
    }
}

/// Events the current state cannot accept
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{kind} callback arrived before its predecessor (product is {state})")]
    OutOfOrder {
        kind: CallbackKind,
        state: LifecycleState,
    },
    #[error("product is {state}; {kind} callback is no longer accepted")]
    Terminal {
        kind: CallbackKind,
        state: LifecycleState,
    },
    #[error("{event} is not valid while product is {state}")]
    Invalid {
        event: &'static str,
        state: LifecycleState,
    },
}

/// Whether [`decide`] will consult [`Observations::quarantine_present`] for this event
pub fn needs_quarantine_check(product: &Product, event: &LifecycleEvent) -> bool {
    matches!(event, LifecycleEvent::Callback(CallbackEvent::Finished(_)))
        && product.state == LifecycleState::MetadataValidated
        && !product.has_applied(CallbackKind::Finished)
}

/// Decide how `event` changes `product`
///
/// Pure: side effects come back as [`Effect`] values that the caller records
/// with the new state before running them.
pub fn decide(
    product: &Product,
    event: &LifecycleEvent,
    observations: &Observations,
) -> Result<Decision, TransitionError> {
    let state = product.state;
    match event {
        LifecycleEvent::Callback(callback) => decide_callback(product, callback, observations),
        LifecycleEvent::PromotionSucceeded => match state {
            LifecycleState::Finished if product.pending_effects.is_empty() => {
                Ok(Decision::Advance(Transition::to(LifecycleState::Promoted)))
            }
            LifecycleState::Promoted => Ok(Decision::Unchanged),
            _ => Err(TransitionError::Invalid {
                event: event.name(),
                state,
            }),
        },
        // once Finished has been seen the product is repaired, never failed on time
        LifecycleEvent::DeadlineExceeded => match state {
            LifecycleState::Finished => Ok(Decision::Unchanged),
            s if s.is_terminal() => Ok(Decision::Unchanged),
            _ => Ok(Decision::Advance(failure(
                product,
                "transform deadline exceeded".to_string(),
            ))),
        },
        LifecycleEvent::TransformFailed { reason } => match state {
            LifecycleState::Finished => Ok(Decision::Unchanged),
            s if s.is_terminal() => Ok(Decision::Unchanged),
            _ => Ok(Decision::Advance(failure(
                product,
                format!("transform failed: {reason}"),
            ))),
        },
        LifecycleEvent::EffectRejected { reason } => {
            if state.is_terminal() {
                Ok(Decision::Unchanged)
            } else {
                Ok(Decision::Advance(failure(product, reason.clone())))
            }
        }
    }
}

fn decide_callback(
    product: &Product,
    callback: &CallbackEvent,
    observations: &Observations,
) -> Result<Decision, TransitionError> {
    let kind = callback.kind();
    let state = product.state;

    if state == LifecycleState::Failed {
        return if product.has_applied(kind) {
            Ok(Decision::Duplicate { kind })
        } else {
            Err(TransitionError::Terminal { kind, state })
        };
    }

    // invalid markings fail the product even if metadata was accepted before
    if let CallbackEvent::Metadata(metadata) = callback {
        if matches!(
            state,
            LifecycleState::AwaitingCallbacks | LifecycleState::MetadataValidated
        ) && !metadata.security_markings.is_valid()
        {
            let mut transition = failure(
                product,
                "security markings are missing classification or owner producer".to_string(),
            );
            transition.applied = Some(kind);
            return Ok(Decision::Advance(transition));
        }
    }

    if product.has_applied(kind) {
        return Ok(Decision::Duplicate { kind });
    }

    match (callback, state) {
        (CallbackEvent::Product(_), LifecycleState::Quarantined) => Ok(Decision::Advance(
            Transition::to(LifecycleState::AwaitingCallbacks).consuming(kind),
        )),
        (CallbackEvent::Metadata(metadata), LifecycleState::AwaitingCallbacks) => {
            let key = metadata_key(product.id, &metadata.metadata_type);
            let mut transition =
                Transition::to(LifecycleState::MetadataValidated).consuming(kind);
            transition.effects = vec![
                Effect::StoreMetadata {
                    location: metadata.location.clone(),
                    key: key.clone(),
                },
                Effect::IndexMetadata { key: key.clone() },
            ];
            transition.markings = Some(metadata.security_markings.clone());
            transition.metadata_key = Some(key);
            Ok(Decision::Advance(transition))
        }
        (CallbackEvent::Finished(_), LifecycleState::MetadataValidated) => {
            match &product.quarantine_key {
                Some(quarantine_key) if observations.quarantine_present => {
                    let mut transition = Transition::to(LifecycleState::Finished).consuming(kind);
                    transition.effects = vec![
                        Effect::PromoteObject {
                            quarantine_key: quarantine_key.clone(),
                            permanent_key: permanent_key(product.id),
                        },
                        Effect::DeleteQuarantine {
                            key: quarantine_key.clone(),
                        },
                    ];
                    Ok(Decision::Advance(transition))
                }
                _ => {
                    let mut transition =
                        failure(product, "quarantined object is missing".to_string());
                    transition.applied = Some(kind);
                    Ok(Decision::Advance(transition))
                }
            }
        }
        _ => Err(TransitionError::OutOfOrder { kind, state }),
    }
}

fn failure(product: &Product, reason: String) -> Transition {
    let mut effects = vec![Effect::RecordFailure {
        reason: reason.clone(),
    }];
    if let Some(key) = &product.quarantine_key {
        effects.push(Effect::DeleteQuarantine { key: key.clone() });
    }
    if product.state == LifecycleState::Finished {
        effects.push(Effect::DeletePermanent {
            key: permanent_key(product.id),
        });
    }
    if product.has_applied(CallbackKind::Metadata) {
        effects.push(Effect::Unindex);
    }

    let mut transition = Transition::to(LifecycleState::Failed);
    transition.effects = effects;
    transition.failure_reason = Some(reason);
    transition
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{FinishedCallback, MetadataCallback, ProductCallback};
    use crate::object_store::quarantine_key;
    use crate::product::{ProductId, UploadAttributes};

    fn product() -> Product {
        let id = ProductId::new();
        Product::quarantined(
            id,
            UploadAttributes {
                mime_type: "text/plain".to_string(),
                file_name: "a.txt".to_string(),
                file_size: 100,
            },
            quarantine_key(id),
            Utc::now(),
        )
    }

    fn product_cb(id: ProductId) -> LifecycleEvent {
        LifecycleEvent::Callback(CallbackEvent::Product(ProductCallback { id }))
    }

    fn finished_cb(id: ProductId) -> LifecycleEvent {
        LifecycleEvent::Callback(CallbackEvent::Finished(FinishedCallback { id }))
    }

    fn metadata_cb(id: ProductId, classification: &str) -> LifecycleEvent {
        LifecycleEvent::Callback(CallbackEvent::Metadata(MetadataCallback {
            id,
            status: "SUCCESS".to_string(),
            metadata_type: "irm".to_string(),
            mime_type: "text/xml".to_string(),
            bytes: 10,
            location: "http://transform/metadata/1".to_string(),
            security_markings: SecurityMarkings {
                classification: classification.to_string(),
                owner_producer: "USA".to_string(),
            },
        }))
    }

    const PRESENT: Observations = Observations {
        quarantine_present: true,
    };

    /// Apply an event the way the orchestrator does, completing effects at once
    fn step(p: &mut Product, event: &LifecycleEvent) -> Result<Decision, TransitionError> {
        let decision = decide(p, event, &PRESENT)?;
        if let Decision::Advance(transition) = decision.clone() {
            transition.apply_to(p, Utc::now());
            p.pending_effects.clear();
        }
        Ok(decision)
    }

    #[test]
    fn test_happy_path() {
        let mut p = product();
        let id = p.id;

        step(&mut p, &product_cb(id)).unwrap();
        assert_eq!(p.state, LifecycleState::AwaitingCallbacks);

        let decision = decide(&p, &metadata_cb(id, "U"), &PRESENT).unwrap();
        match &decision {
            Decision::Advance(t) => {
                assert_eq!(t.to, LifecycleState::MetadataValidated);
                assert!(matches!(t.effects[0], Effect::StoreMetadata { .. }));
                assert!(matches!(t.effects[1], Effect::IndexMetadata { .. }));
            }
            other => panic!("unexpected decision {other:?}"),
        }
        step(&mut p, &metadata_cb(id, "U")).unwrap();
        assert_eq!(p.security_markings.as_ref().unwrap().classification, "U");
        assert!(p.metadata_key.is_some());

        match decide(&p, &finished_cb(id), &PRESENT).unwrap() {
            Decision::Advance(t) => {
                assert_eq!(t.to, LifecycleState::Finished);
                assert_eq!(t.effects.len(), 2);
                assert!(matches!(t.effects[0], Effect::PromoteObject { .. }));
            }
            other => panic!("unexpected decision {other:?}"),
        }
        step(&mut p, &finished_cb(id)).unwrap();
        step(&mut p, &LifecycleEvent::PromotionSucceeded).unwrap();
        assert_eq!(p.state, LifecycleState::Promoted);
    }

    #[test]
    fn test_promotion_waits_for_pending_effects() {
        let mut p = product();
        let id = p.id;
        step(&mut p, &product_cb(id)).unwrap();
        step(&mut p, &metadata_cb(id, "U")).unwrap();
        let Decision::Advance(t) = decide(&p, &finished_cb(id), &PRESENT).unwrap() else {
            panic!("expected advance");
        };
        t.apply_to(&mut p, Utc::now());

        assert!(decide(&p, &LifecycleEvent::PromotionSucceeded, &PRESENT).is_err());
    }

    #[test]
    fn test_invalid_markings_fail_product() {
        let mut p = product();
        let id = p.id;
        step(&mut p, &product_cb(id)).unwrap();

        let Decision::Advance(t) = decide(&p, &metadata_cb(id, ""), &PRESENT).unwrap() else {
            panic!("expected advance");
        };
        assert_eq!(t.to, LifecycleState::Failed);
        assert!(!t.effects.contains(&Effect::Unindex));
        assert!(t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::DeleteQuarantine { .. })));
    }

    #[test]
    fn test_invalid_markings_after_validation_fail_and_unindex() {
        let mut p = product();
        let id = p.id;
        step(&mut p, &product_cb(id)).unwrap();
        step(&mut p, &metadata_cb(id, "U")).unwrap();

        let Decision::Advance(t) = decide(&p, &metadata_cb(id, " "), &PRESENT).unwrap() else {
            panic!("expected advance");
        };
        assert_eq!(t.to, LifecycleState::Failed);
        assert!(t.effects.contains(&Effect::Unindex));
    }

    #[test]
    fn test_duplicates_are_no_ops() {
        let mut p = product();
        let id = p.id;
        step(&mut p, &product_cb(id)).unwrap();
        assert_eq!(
            decide(&p, &product_cb(id), &PRESENT).unwrap(),
            Decision::Duplicate {
                kind: CallbackKind::Product
            }
        );

        step(&mut p, &metadata_cb(id, "U")).unwrap();
        assert_eq!(
            decide(&p, &metadata_cb(id, "U"), &PRESENT).unwrap(),
            Decision::Duplicate {
                kind: CallbackKind::Metadata
            }
        );

        step(&mut p, &finished_cb(id)).unwrap();
        assert_eq!(
            decide(&p, &finished_cb(id), &PRESENT).unwrap(),
            Decision::Duplicate {
                kind: CallbackKind::Finished
            }
        );

        step(&mut p, &LifecycleEvent::PromotionSucceeded).unwrap();
        let before = p.clone();
        for event in [product_cb(id), metadata_cb(id, "U"), finished_cb(id)] {
            assert!(matches!(
                step(&mut p, &event).unwrap(),
                Decision::Duplicate { .. }
            ));
        }
        assert_eq!(p, before);
    }

    #[test]
    fn test_out_of_order_callbacks_are_rejected() {
        let p = product();
        let id = p.id;
        assert_eq!(
            decide(&p, &metadata_cb(id, "U"), &PRESENT).unwrap_err(),
            TransitionError::OutOfOrder {
                kind: CallbackKind::Metadata,
                state: LifecycleState::Quarantined
            }
        );
        assert!(matches!(
            decide(&p, &finished_cb(id), &PRESENT),
            Err(TransitionError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_missing_quarantine_object_fails_finish() {
        let mut p = product();
        let id = p.id;
        step(&mut p, &product_cb(id)).unwrap();
        step(&mut p, &metadata_cb(id, "U")).unwrap();

        assert!(needs_quarantine_check(&p, &finished_cb(id)));
        let Decision::Advance(t) =
            decide(&p, &finished_cb(id), &Observations::default()).unwrap()
        else {
            panic!("expected advance");
        };
        assert_eq!(t.to, LifecycleState::Failed);
        assert!(t.effects.contains(&Effect::Unindex));
    }

    #[test]
    fn test_deadline_spares_finished_products() {
        let mut p = product();
        let id = p.id;
        let Decision::Advance(t) =
            decide(&p, &LifecycleEvent::DeadlineExceeded, &PRESENT).unwrap()
        else {
            panic!("expected advance");
        };
        assert_eq!(t.to, LifecycleState::Failed);

        step(&mut p, &product_cb(id)).unwrap();
        step(&mut p, &metadata_cb(id, "U")).unwrap();
        step(&mut p, &finished_cb(id)).unwrap();
        assert_eq!(
            decide(&p, &LifecycleEvent::DeadlineExceeded, &PRESENT).unwrap(),
            Decision::Unchanged
        );
        assert_eq!(
            decide(
                &p,
                &LifecycleEvent::TransformFailed {
                    reason: "late".to_string()
                },
                &PRESENT
            )
            .unwrap(),
            Decision::Unchanged
        );
    }

    #[test]
    fn test_failed_products_refuse_new_callbacks() {
        let mut p = product();
        let id = p.id;
        step(&mut p, &LifecycleEvent::DeadlineExceeded).unwrap();
        assert_eq!(p.state, LifecycleState::Failed);
        assert_eq!(
            p.failure_reason.as_deref(),
            Some("transform deadline exceeded")
        );

        assert!(matches!(
            decide(&p, &product_cb(id), &PRESENT),
            Err(TransitionError::Terminal { .. })
        ));
        assert_eq!(
            decide(&p, &LifecycleEvent::DeadlineExceeded, &PRESENT).unwrap(),
            Decision::Unchanged
        );
    }

    #[test]
    fn test_promoted_only_after_validated_metadata() {
        // every event order up to length five; promotion must imply valid markings
        let template = product();
        let events = [
            product_cb(template.id),
            metadata_cb(template.id, "U"),
            metadata_cb(template.id, ""),
            finished_cb(template.id),
            LifecycleEvent::PromotionSucceeded,
            LifecycleEvent::DeadlineExceeded,
        ];

        let mut stack = vec![(template.clone(), 0usize)];
        while let Some((p, depth)) = stack.pop() {
            if p.state == LifecycleState::Promoted {
                assert!(p.has_applied(CallbackKind::Metadata));
                assert!(p.security_markings.as_ref().is_some_and(|m| m.is_valid()));
            }
            if depth == 5 {
                continue;
            }
            for event in &events {
                let mut next = p.clone();
                if step(&mut next, event).is_ok() {
                    stack.push((next, depth + 1));
                }
            }
        }
    }
}
