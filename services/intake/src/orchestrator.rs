use crate::callback::{classify_slice, CallbackEvent};
use crate::config::Config;
use crate::error::IntakeError;
use crate::ledger::Ledger;
use crate::lifecycle::{
    decide, needs_quarantine_check, Decision, Effect, LifecycleEvent, Observations,
};
use crate::locks::{ProductGuard, ProductLocks};
use crate::object_store::{
    quarantine_key, Buckets, ByteChunks, ObjectMetadata, ObjectStore, StorageError,
};
use crate::product::{CallbackKind, LifecycleState, Product, ProductId, UploadAttributes};
use crate::search_index::SearchIndex;
use crate::transform::{TransformRequest, TransformService};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const METADATA_CONTENT_TYPE: &str = "application/octet-stream";
const FRESH_ID_ATTEMPTS: usize = 3;

/// Settings the orchestrator needs from the service configuration
#[derive(Debug, Clone)]
pub struct IntakeSettings {
    pub buckets: Buckets,
    pub max_file_size_bytes: u64,
    /// Base URL the transform service posts callbacks to
    pub callback_base_url: String,
}

impl IntakeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            buckets: Buckets {
                quarantine: config.s3.quarantine_bucket.clone(),
                permanent: config.s3.permanent_bucket.clone(),
                metadata: config.s3.metadata_bucket.clone(),
            },
            max_file_size_bytes: config.ingest.max_file_size_bytes,
            callback_base_url: config.transform.callback_base_url.clone(),
        }
    }
}

/// Result of a callback that was accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackOutcome {
    pub id: ProductId,
    pub kind: CallbackKind,
    pub state: LifecycleState,
    /// The kind had already been applied; nothing changed
    pub duplicate: bool,
}

impl CallbackOutcome {
    fn new(id: ProductId, kind: CallbackKind, applied: &Applied) -> Self {
        Self {
            id,
            kind,
            state: applied.product.state,
            duplicate: applied.is_duplicate(),
        }
    }
}

/// What applying one lifecycle event did
#[derive(Debug, Clone)]
pub struct Applied {
    pub product: Product,
    pub decision: Decision,
    /// Effects left by an earlier transition moved the product on before the
    /// event was decided
    pub settled: bool,
}

impl Applied {
    pub fn is_duplicate(&self) -> bool {
        matches!(self.decision, Decision::Duplicate { .. })
    }
}

/// Payload of a promoted product, streamed from the permanent bucket
pub struct RetrievedProduct {
    pub body: ByteChunks,
    pub content_type: String,
    pub file_name: String,
    pub size: Option<u64>,
}

/// Entry point for uploads, callbacks and reads
///
/// Every mutation runs under the product's lock: drain pending effects, decide,
/// save the new state with its effects, then run each effect and remove it
/// from the record once it completes.
#[derive(Clone)]
pub struct Orchestrator {
    ledger: Arc<dyn Ledger>,
    objects: Arc<dyn ObjectStore>,
    index: Arc<dyn SearchIndex>,
    transform: Arc<dyn TransformService>,
    settings: IntakeSettings,
    locks: ProductLocks,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        objects: Arc<dyn ObjectStore>,
        index: Arc<dyn SearchIndex>,
        transform: Arc<dyn TransformService>,
        settings: IntakeSettings,
    ) -> Self {
        Self {
            ledger,
            objects,
            index,
            transform,
            settings,
            locks: ProductLocks::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn transform(&self) -> &Arc<dyn TransformService> {
        &self.transform
    }

    /// Accept an upload: quarantine it, record it, and hand it to the transform
    /// service in the background.
    ///
    /// The body is streamed into the quarantine bucket. A body that runs past
    /// `declared_size` is cut off, one that falls short is deleted again.
    #[instrument(skip(self, body))]
    pub async fn ingest(
        &self,
        body: ByteChunks,
        declared_size: u64,
        mime_type: &str,
        file_name: &str,
    ) -> Result<ProductId, IntakeError> {
        let start = Instant::now();

        if declared_size == 0 {
            return Err(IntakeError::Validation(
                "file size must be greater than zero".to_string(),
            ));
        }
        if declared_size > self.settings.max_file_size_bytes {
            return Err(IntakeError::Validation(format!(
                "file size {declared_size} exceeds the maximum of {} bytes",
                self.settings.max_file_size_bytes
            )));
        }
        if file_name.trim().is_empty() {
            return Err(IntakeError::Validation(
                "file name must not be empty".to_string(),
            ));
        }

        let id = self.fresh_id().await?;
        let key = quarantine_key(id);

        let mut received = 0u64;
        let body = body
            .map(move |chunk| -> Result<_, StorageError> {
                let chunk = chunk?;
                received += chunk.len() as u64;
                if received > declared_size {
                    return Err(StorageError::InvalidBody(format!(
                        "body is longer than the declared {declared_size} bytes"
                    )));
                }
                Ok(chunk)
            })
            .boxed();

        let written = self
            .objects
            .put_stream(
                &self.settings.buckets.quarantine,
                &key,
                body,
                mime_type,
                ObjectMetadata {
                    filename: Some(file_name.to_string()),
                },
            )
            .await
            .map_err(|e| {
                if matches!(e, StorageError::InvalidBody(_)) {
                    warn!(product_id = %id, error = %e, "Upload body rejected");
                } else {
                    error!(product_id = %id, error = %e, "Failed to write quarantine object");
                }
                IntakeError::from(e)
            })?;

        if written != declared_size {
            self.remove_quarantined(id, &key).await;
            return Err(IntakeError::Validation(format!(
                "declared size {declared_size} does not match body length {written}"
            )));
        }

        let product = Product::quarantined(
            id,
            UploadAttributes {
                mime_type: mime_type.to_string(),
                file_name: file_name.to_string(),
                file_size: declared_size,
            },
            key.clone(),
            Utc::now(),
        );

        if let Err(e) = self.ledger.create(product).await {
            error!(product_id = %id, error = %e, "Failed to record product");
            self.remove_quarantined(id, &key).await;
            return Err(e.into());
        }

        metrics::counter!("intake.products.ingested").increment(1);
        metrics::counter!("intake.bytes.ingested").increment(declared_size);
        metrics::histogram!("intake.ingest.duration_seconds")
            .record(start.elapsed().as_secs_f64());

        info!(product_id = %id, file_name = %file_name, "Product quarantined");

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.submit(id).await {
                warn!(product_id = %id, error = %e, "Transform submission failed; watchdog will retry");
            }
        });

        Ok(id)
    }

    async fn remove_quarantined(&self, id: ProductId, key: &str) {
        if let Err(e) = self
            .objects
            .delete(&self.settings.buckets.quarantine, key)
            .await
        {
            warn!(product_id = %id, error = %e, "Failed to remove orphaned quarantine object");
        }
    }

    async fn fresh_id(&self) -> Result<ProductId, IntakeError> {
        let mut id = ProductId::new();
        for _ in 0..FRESH_ID_ATTEMPTS {
            if self.ledger.get(id).await?.is_none() {
                return Ok(id);
            }
            id = ProductId::new();
        }
        Err(IntakeError::DuplicateId(id))
    }

    /// Submit a product to the transform service and record the acknowledgement
    #[instrument(skip(self))]
    pub async fn submit(&self, id: ProductId) -> Result<(), IntakeError> {
        let product = self.load(id).await?;
        if product.submitted || product.state.is_terminal() {
            return Ok(());
        }

        let request = TransformRequest {
            id,
            quarantine_bucket: self.settings.buckets.quarantine.clone(),
            quarantine_key: product
                .quarantine_key
                .clone()
                .unwrap_or_else(|| quarantine_key(id)),
            mime_type: product.mime_type.clone(),
            file_size: product.file_size,
            callback_url: format!(
                "{}/store/{}",
                self.settings.callback_base_url.trim_end_matches('/'),
                id
            ),
        };
        self.transform.submit(&request).await?;
        metrics::counter!("intake.transform.submitted").increment(1);

        let _guard = self.locks.lock(id).await;
        let mut product = self.load(id).await?;
        if !product.submitted {
            product.submitted = true;
            product.updated_at = Utc::now();
            self.ledger.save(&product).await?;
        }

        debug!(product_id = %id, "Transform submission recorded");
        Ok(())
    }

    /// Classify and apply a callback posted to `/store/{path_id}`
    #[instrument(skip(self, body), fields(product_id = %path_id))]
    pub async fn handle_callback(
        &self,
        path_id: ProductId,
        body: &[u8],
    ) -> Result<CallbackOutcome, IntakeError> {
        let event = classify_slice(body).map_err(|rejected| {
            warn!(product_id = %path_id, reason = %rejected, "Callback rejected");
            metrics::counter!("intake.callbacks.rejected").increment(1);
            IntakeError::Rejected(rejected)
        })?;

        if event.id() != path_id {
            return Err(IntakeError::Validation(format!(
                "payload id {} does not match path id {path_id}",
                event.id()
            )));
        }

        let kind = event.kind();
        metrics::counter!("intake.callbacks.received", "kind" => kind.as_str()).increment(1);

        let guard = self.locks.lock(path_id).await;
        let applied = self
            .apply(&guard, path_id, LifecycleEvent::Callback(event), Utc::now())
            .await;
        drop(guard);

        match applied {
            // a repeat that completed a stalled promotion still reports the new state
            Ok(applied) if kind.is_singular() && applied.is_duplicate() && !applied.settled => {
                warn!(product_id = %path_id, "Finished callback delivered twice");
                Err(IntakeError::AlreadyFinished(path_id))
            }
            Ok(applied) => Ok(CallbackOutcome::new(path_id, kind, &applied)),
            Err(e) => {
                warn!(product_id = %path_id, kind = %kind, error = %e, "Callback not applied");
                Err(e)
            }
        }
    }

    /// Apply a classified callback; the caller holds the product's lock
    pub async fn apply_callback(
        &self,
        guard: &ProductGuard,
        event: CallbackEvent,
        now: DateTime<Utc>,
    ) -> Result<CallbackOutcome, IntakeError> {
        let id = event.id();
        let kind = event.kind();
        let applied = self
            .apply(guard, id, LifecycleEvent::Callback(event), now)
            .await?;
        Ok(CallbackOutcome::new(id, kind, &applied))
    }

    /// Apply any lifecycle event to a product; the caller holds its lock.
    ///
    /// Effects left over from earlier transitions are drained first and a failure
    /// to drain them aborts the event. Effects of the new transition that cannot
    /// complete yet stay pending for the watchdog.
    pub async fn apply(
        &self,
        _guard: &ProductGuard,
        id: ProductId,
        event: LifecycleEvent,
        now: DateTime<Utc>,
    ) -> Result<Applied, IntakeError> {
        let product = self.load(id).await?;
        let before = product.state;
        let product = self.settle(product, now).await?;
        let settled = product.state != before;

        let observations = if needs_quarantine_check(&product, &event) {
            Observations {
                quarantine_present: self.quarantine_present(&product).await?,
            }
        } else {
            Observations::default()
        };

        let (product, decision) = self.commit(product, &event, observations, now).await?;
        if !matches!(decision, Decision::Advance(_)) {
            return Ok(Applied {
                product,
                decision,
                settled,
            });
        }

        let product = match self.settle(product.clone(), now).await {
            Ok(after) => after,
            Err(e) if e.is_retryable() => {
                warn!(product_id = %id, error = %e, "Effects left pending");
                product
            }
            Err(e) => return Err(e),
        };
        Ok(Applied {
            product,
            decision,
            settled,
        })
    }

    /// Drain pending effects of a product and promote it if it is ready; the
    /// caller holds its lock
    pub async fn settle_locked(
        &self,
        _guard: &ProductGuard,
        id: ProductId,
        now: DateTime<Utc>,
    ) -> Result<Product, IntakeError> {
        let product = self.load(id).await?;
        self.settle(product, now).await
    }

    async fn settle(&self, product: Product, now: DateTime<Utc>) -> Result<Product, IntakeError> {
        let product = self.drain(product, now).await?;
        if product.state == LifecycleState::Finished && product.pending_effects.is_empty() {
            let (product, _) = self
                .commit(
                    product,
                    &LifecycleEvent::PromotionSucceeded,
                    Observations::default(),
                    now,
                )
                .await?;
            return Ok(product);
        }
        Ok(product)
    }

    /// Decide and, if the product changes, save it
    async fn commit(
        &self,
        mut product: Product,
        event: &LifecycleEvent,
        observations: Observations,
        now: DateTime<Utc>,
    ) -> Result<(Product, Decision), IntakeError> {
        let decision = decide(&product, event, &observations)?;

        match &decision {
            Decision::Advance(transition) => {
                let from = product.state;
                transition.clone().apply_to(&mut product, now);
                let product = self.ledger.save(&product).await?;

                info!(
                    product_id = %product.id,
                    event = event.name(),
                    from = %from,
                    to = %product.state,
                    "Product state changed"
                );
                match product.state {
                    LifecycleState::Promoted => {
                        metrics::counter!("intake.products.promoted").increment(1)
                    }
                    LifecycleState::Failed => {
                        metrics::counter!("intake.products.failed").increment(1)
                    }
                    _ => {}
                }
                Ok((product, decision))
            }
            Decision::Duplicate { kind } => {
                debug!(product_id = %product.id, kind = %kind, "Duplicate callback ignored");
                Ok((product, decision))
            }
            Decision::Unchanged => Ok((product, decision)),
        }
    }

    /// Run pending effects in order, removing each from the record once it is done
    async fn drain(&self, mut product: Product, now: DateTime<Utc>) -> Result<Product, IntakeError> {
        while let Some(effect) = product.pending_effects.first().cloned() {
            match self.execute(&mut product, &effect).await {
                Ok(()) => {
                    product.pending_effects.remove(0);
                    product.updated_at = now;
                    product = self.ledger.save(&product).await?;
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        product_id = %product.id,
                        effect = effect.name(),
                        error = %e,
                        "Effect failed; will retry"
                    );
                    metrics::counter!("intake.effects.retried", "effect" => effect.name())
                        .increment(1);
                    return Err(e);
                }
                Err(e) => {
                    error!(
                        product_id = %product.id,
                        effect = effect.name(),
                        error = %e,
                        "Effect rejected"
                    );
                    metrics::counter!("intake.effects.rejected", "effect" => effect.name())
                        .increment(1);

                    product.pending_effects.remove(0);
                    let rejected = LifecycleEvent::EffectRejected {
                        reason: format!("{} failed: {e}", effect.name()),
                    };
                    let (next, decision) = self
                        .commit(product, &rejected, Observations::default(), now)
                        .await?;
                    product = match decision {
                        Decision::Advance(_) => next,
                        _ => self.ledger.save(&next).await?,
                    };
                }
            }
        }
        Ok(product)
    }

    /// Run one effect; every effect may be repeated safely
    async fn execute(&self, product: &mut Product, effect: &Effect) -> Result<(), IntakeError> {
        let buckets = &self.settings.buckets;
        match effect {
            Effect::StoreMetadata { location, key } => {
                if self.objects.exists(&buckets.metadata, key).await? {
                    return Ok(());
                }
                let metadata = self.transform.fetch_metadata(location).await?;
                self.objects
                    .put(
                        &buckets.metadata,
                        key,
                        metadata,
                        METADATA_CONTENT_TYPE,
                        ObjectMetadata::default(),
                    )
                    .await?;
            }
            Effect::IndexMetadata { key } => {
                let stored = self.objects.get(&buckets.metadata, key).await?;
                let contents = String::from_utf8_lossy(&stored.body);
                self.index.index(product.id, &contents).await?;
            }
            Effect::PromoteObject {
                quarantine_key,
                permanent_key,
            } => {
                if !self.objects.exists(&buckets.permanent, permanent_key).await? {
                    match self
                        .objects
                        .copy(
                            &buckets.quarantine,
                            quarantine_key,
                            &buckets.permanent,
                            permanent_key,
                        )
                        .await
                    {
                        Ok(()) => {}
                        Err(StorageError::NotFound { .. }) => {
                            return Err(IntakeError::ServiceRejected(
                                "quarantined object is missing".to_string(),
                            ))
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                product.permanent_key = Some(permanent_key.clone());
            }
            Effect::DeleteQuarantine { key } => {
                self.objects.delete(&buckets.quarantine, key).await?;
                product.quarantine_key = None;
            }
            Effect::DeletePermanent { key } => {
                self.objects.delete(&buckets.permanent, key).await?;
                product.permanent_key = None;
            }
            Effect::Unindex => {
                self.index.delete(product.id).await?;
            }
            Effect::RecordFailure { reason } => {
                error!(
                    product_id = %product.id,
                    file_name = %product.file_name,
                    reason = %reason,
                    "Product failed"
                );
            }
        }
        Ok(())
    }

    async fn quarantine_present(&self, product: &Product) -> Result<bool, IntakeError> {
        match &product.quarantine_key {
            Some(key) => Ok(self
                .objects
                .exists(&self.settings.buckets.quarantine, key)
                .await?),
            None => Ok(false),
        }
    }

    async fn load(&self, id: ProductId) -> Result<Product, IntakeError> {
        self.ledger.get(id).await?.ok_or(IntakeError::NotFound(id))
    }

    /// Take a product's lock without waiting
    pub fn try_lock(&self, id: ProductId) -> Option<ProductGuard> {
        self.locks.try_lock(id)
    }

    pub async fn lock(&self, id: ProductId) -> ProductGuard {
        self.locks.lock(id).await
    }

    /// Payload of a promoted product
    #[instrument(skip(self))]
    pub async fn retrieve(&self, id: ProductId) -> Result<RetrievedProduct, IntakeError> {
        let product = self.load(id).await?;
        if !product.is_visible() {
            return Err(IntakeError::NotFound(id));
        }

        let key = product
            .permanent_key
            .clone()
            .unwrap_or_else(|| crate::object_store::permanent_key(id));
        let object = match self.objects.open(&self.settings.buckets.permanent, &key).await {
            Ok(object) => object,
            Err(StorageError::NotFound { .. }) => {
                error!(product_id = %id, "Promoted product has no permanent object");
                return Err(IntakeError::NotFound(id));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(RetrievedProduct {
            body: object.body,
            content_type: object.content_type,
            file_name: object.metadata.filename.unwrap_or(product.file_name),
            size: object.size,
        })
    }

    /// Ids of promoted products whose metadata contains `keyword`
    #[instrument(skip(self))]
    pub async fn search(&self, keyword: &str) -> Result<Vec<ProductId>, IntakeError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(IntakeError::Validation(
                "search keyword must not be empty".to_string(),
            ));
        }

        let candidates = self.index.find_by_keyword(keyword).await?;
        let mut visible = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(product) = self.ledger.get(id).await? {
                if product.is_visible() {
                    visible.push(id);
                }
            }
        }
        Ok(visible)
    }

    /// Ledger record of a product
    pub async fn product(&self, id: ProductId) -> Result<Product, IntakeError> {
        self.load(id).await
    }

    /// Whether the ledger is reachable
    pub async fn ready(&self) -> Result<(), IntakeError> {
        self.ledger.ping().await.map_err(IntakeError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::object_store::{collect_chunks, permanent_key, single_chunk, InMemoryObjectStore};
    use crate::search_index::InMemorySearchIndex;
    use crate::transform::{MockTransformService, TransformError};
    use bytes::Bytes;
    use futures::stream;
    use serde_json::json;

    const METADATA_DOC: &[u8] = b"<metadata><title>Harbor Survey</title></metadata>";

    struct Harness {
        orchestrator: Orchestrator,
        ledger: Arc<InMemoryLedger>,
        objects: Arc<InMemoryObjectStore>,
        index: Arc<InMemorySearchIndex>,
    }

    fn settings() -> IntakeSettings {
        IntakeSettings {
            buckets: Buckets {
                quarantine: "quarantine".to_string(),
                permanent: "products".to_string(),
                metadata: "metadata".to_string(),
            },
            max_file_size_bytes: 1024,
            callback_base_url: "http://intake:8080".to_string(),
        }
    }

    fn harness(transform: MockTransformService) -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let index = Arc::new(InMemorySearchIndex::new());
        let orchestrator = Orchestrator::new(
            ledger.clone(),
            objects.clone(),
            index.clone(),
            Arc::new(transform),
            settings(),
        );
        Harness {
            orchestrator,
            ledger,
            objects,
            index,
        }
    }

    fn accepting_transform() -> MockTransformService {
        let mut transform = MockTransformService::new();
        transform.expect_submit().returning(|_| Ok(()));
        transform
            .expect_fetch_metadata()
            .returning(|_| Ok(Bytes::from_static(METADATA_DOC)));
        transform
    }

    fn metadata_body(id: ProductId, classification: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": id.to_string(),
            "status": "SUCCESS",
            "type": "irm",
            "mimeType": "text/xml",
            "bytes": METADATA_DOC.len(),
            "location": format!("http://transform:8080/metadata/{id}"),
            "securityMarkings": {
                "classification": classification,
                "ownerProducer": "USA"
            }
        }))
        .unwrap()
    }

    fn product_body(id: ProductId) -> Vec<u8> {
        serde_json::to_vec(&json!({ "id": id.to_string() })).unwrap()
    }

    fn finished_body(id: ProductId) -> Vec<u8> {
        serde_json::to_vec(&json!({ "id": id.to_string(), "status": "FINISHED" })).unwrap()
    }

    async fn ingest(h: &Harness) -> ProductId {
        let id = h
            .orchestrator
            .ingest(single_chunk(Bytes::from(vec![7u8; 100])), 100, "text/plain", "a.txt")
            .await
            .unwrap();
        // settle the background submission so later snapshots are stable
        h.orchestrator.submit(id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_ingest_validates_size() {
        let h = harness(accepting_transform());
        for (body, size) in [
            (vec![], 0u64),
            (vec![0u8; 2048], 2048),
            (vec![0u8; 10], 11),
            (vec![0u8; 12], 11),
        ] {
            assert!(matches!(
                h.orchestrator
                    .ingest(single_chunk(Bytes::from(body)), size, "text/plain", "a.txt")
                    .await,
                Err(IntakeError::Validation(_))
            ));
        }
        assert!(h.objects.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_streams_chunked_body() {
        let h = harness(accepting_transform());
        let chunks: ByteChunks =
            stream::iter((0..4).map(|_| Ok(Bytes::from(vec![1u8; 25])))).boxed();
        let id = h
            .orchestrator
            .ingest(chunks, 100, "text/plain", "a.txt")
            .await
            .unwrap();

        let object = h.objects.get("quarantine", &quarantine_key(id)).await.unwrap();
        assert_eq!(object.body.len(), 100);

        // a body that breaks off mid-upload leaves nothing behind
        let broken: ByteChunks = stream::iter(vec![
            Ok(Bytes::from(vec![1u8; 25])),
            Err(StorageError::InvalidBody("connection reset".to_string())),
        ])
        .boxed();
        assert!(matches!(
            h.orchestrator
                .ingest(broken, 100, "text/plain", "b.txt")
                .await,
            Err(IntakeError::Validation(_))
        ));
        assert_eq!(h.objects.len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_quarantines_and_records() {
        let h = harness(accepting_transform());
        let id = ingest(&h).await;

        let product = h.ledger.get(id).await.unwrap().unwrap();
        assert_eq!(product.state, LifecycleState::Quarantined);
        assert_eq!(product.file_size, 100);

        let object = h.objects.get("quarantine", &quarantine_key(id)).await.unwrap();
        assert_eq!(object.metadata.filename.as_deref(), Some("a.txt"));
        assert_eq!(object.content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_submit_marks_product() {
        let h = harness(accepting_transform());
        let id = ingest(&h).await;
        let product = h.ledger.get(id).await.unwrap().unwrap();
        assert!(product.submitted);

        // already acknowledged; nothing to write
        h.orchestrator.submit(id).await.unwrap();
        assert_eq!(h.ledger.get(id).await.unwrap().unwrap(), product);
    }

    #[tokio::test]
    async fn test_full_callback_sequence_promotes() {
        let h = harness(accepting_transform());
        let id = ingest(&h).await;

        h.orchestrator
            .handle_callback(id, &product_body(id))
            .await
            .unwrap();
        let outcome = h
            .orchestrator
            .handle_callback(id, &metadata_body(id, "U"))
            .await
            .unwrap();
        assert_eq!(outcome.state, LifecycleState::MetadataValidated);
        assert!(h.index.contains(id));

        // indexed but not yet visible
        assert!(h.orchestrator.search("harbor").await.unwrap().is_empty());
        assert!(matches!(
            h.orchestrator.retrieve(id).await,
            Err(IntakeError::NotFound(_))
        ));

        let outcome = h
            .orchestrator
            .handle_callback(id, &finished_body(id))
            .await
            .unwrap();
        assert_eq!(outcome.state, LifecycleState::Promoted);

        let product = h.ledger.get(id).await.unwrap().unwrap();
        assert!(product.pending_effects.is_empty());
        assert_eq!(product.quarantine_key, None);
        assert_eq!(product.permanent_key, Some(permanent_key(id)));
        assert!(!h.objects.exists("quarantine", &quarantine_key(id)).await.unwrap());

        let retrieved = h.orchestrator.retrieve(id).await.unwrap();
        assert_eq!(retrieved.size, Some(100));
        assert_eq!(retrieved.file_name, "a.txt");
        assert_eq!(retrieved.content_type, "text/plain");
        assert_eq!(collect_chunks(retrieved.body).await.unwrap().len(), 100);
        assert_eq!(h.orchestrator.search("HARBOR").await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_duplicate_callbacks() {
        let h = harness(accepting_transform());
        let id = ingest(&h).await;

        h.orchestrator
            .handle_callback(id, &product_body(id))
            .await
            .unwrap();
        let again = h
            .orchestrator
            .handle_callback(id, &product_body(id))
            .await
            .unwrap();
        assert!(again.duplicate);

        h.orchestrator
            .handle_callback(id, &metadata_body(id, "U"))
            .await
            .unwrap();
        h.orchestrator
            .handle_callback(id, &finished_body(id))
            .await
            .unwrap();
        let before = h.ledger.get(id).await.unwrap().unwrap();

        assert!(matches!(
            h.orchestrator.handle_callback(id, &finished_body(id)).await,
            Err(IntakeError::AlreadyFinished(_))
        ));
        assert_eq!(h.ledger.get(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_repeated_finished_completes_stalled_promotion() {
        let h = harness(accepting_transform());
        let id = ingest(&h).await;
        h.orchestrator
            .handle_callback(id, &product_body(id))
            .await
            .unwrap();
        h.orchestrator
            .handle_callback(id, &metadata_body(id, "U"))
            .await
            .unwrap();

        // Finished recorded, but the promotion effects never ran
        let mut product = h.ledger.get(id).await.unwrap().unwrap();
        product.state = LifecycleState::Finished;
        product.applied_callbacks.insert(CallbackKind::Finished);
        product.pending_effects = vec![
            Effect::PromoteObject {
                quarantine_key: quarantine_key(id),
                permanent_key: permanent_key(id),
            },
            Effect::DeleteQuarantine {
                key: quarantine_key(id),
            },
        ];
        h.ledger.save(&product).await.unwrap();

        let outcome = h
            .orchestrator
            .handle_callback(id, &finished_body(id))
            .await
            .unwrap();
        assert!(outcome.duplicate);
        assert_eq!(outcome.state, LifecycleState::Promoted);
        assert!(h.objects.exists("products", &permanent_key(id)).await.unwrap());

        // nothing left to settle; now it is a plain repeat
        assert!(matches!(
            h.orchestrator.handle_callback(id, &finished_body(id)).await,
            Err(IntakeError::AlreadyFinished(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_callbacks_apply_once() {
        let h = harness(accepting_transform());
        let id = ingest(&h).await;

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let orchestrator = h.orchestrator.clone();
                let body = product_body(id);
                tokio::spawn(async move { orchestrator.handle_callback(id, &body).await })
            })
            .collect();

        let mut fresh = 0;
        for task in futures::future::join_all(tasks).await {
            let outcome = task.unwrap().unwrap();
            assert_eq!(outcome.state, LifecycleState::AwaitingCallbacks);
            if !outcome.duplicate {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);

        let product = h.ledger.get(id).await.unwrap().unwrap();
        assert_eq!(product.state, LifecycleState::AwaitingCallbacks);
        assert!(product.has_applied(CallbackKind::Product));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_finished_callbacks_promote_once() {
        let h = harness(accepting_transform());
        let id = ingest(&h).await;
        h.orchestrator
            .handle_callback(id, &product_body(id))
            .await
            .unwrap();
        h.orchestrator
            .handle_callback(id, &metadata_body(id, "U"))
            .await
            .unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let orchestrator = h.orchestrator.clone();
                let body = finished_body(id);
                tokio::spawn(async move { orchestrator.handle_callback(id, &body).await })
            })
            .collect();

        let mut promoted = 0;
        for task in futures::future::join_all(tasks).await {
            match task.unwrap() {
                Ok(outcome) => {
                    assert_eq!(outcome.state, LifecycleState::Promoted);
                    promoted += 1;
                }
                Err(IntakeError::AlreadyFinished(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(promoted, 1);
        assert!(h
            .ledger
            .get(id)
            .await
            .unwrap()
            .unwrap()
            .pending_effects
            .is_empty());
    }

    #[tokio::test]
    async fn test_callback_errors() {
        let h = harness(accepting_transform());
        let id = ingest(&h).await;

        assert!(matches!(
            h.orchestrator.handle_callback(id, b"{\"nope\": 1}").await,
            Err(IntakeError::Rejected(_))
        ));
        assert!(matches!(
            h.orchestrator
                .handle_callback(ProductId::new(), &product_body(id))
                .await,
            Err(IntakeError::Validation(_))
        ));
        let unknown = ProductId::new();
        assert!(matches!(
            h.orchestrator
                .handle_callback(unknown, &product_body(unknown))
                .await,
            Err(IntakeError::NotFound(_))
        ));
        assert!(matches!(
            h.orchestrator
                .handle_callback(id, &finished_body(id))
                .await,
            Err(IntakeError::OutOfOrder(_))
        ));
        assert_eq!(
            h.ledger.get(id).await.unwrap().unwrap().state,
            LifecycleState::Quarantined
        );
    }

    #[tokio::test]
    async fn test_empty_markings_fail_and_clean_up() {
        let h = harness(accepting_transform());
        let id = ingest(&h).await;

        h.orchestrator
            .handle_callback(id, &product_body(id))
            .await
            .unwrap();
        let outcome = h
            .orchestrator
            .handle_callback(id, &metadata_body(id, ""))
            .await
            .unwrap();
        assert_eq!(outcome.state, LifecycleState::Failed);

        let product = h.ledger.get(id).await.unwrap().unwrap();
        assert!(product.pending_effects.is_empty());
        assert!(product.failure_reason.is_some());
        assert!(!h.index.contains(id));
        assert!(h.objects.is_empty());
        assert!(matches!(
            h.orchestrator.handle_callback(id, &finished_body(id)).await,
            Err(IntakeError::Terminal(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_metadata_stays_pending() {
        let mut transform = MockTransformService::new();
        transform.expect_submit().returning(|_| Ok(()));
        let calls = std::sync::atomic::AtomicUsize::new(0);
        transform.expect_fetch_metadata().returning(move |_| {
            if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Err(TransformError::Unavailable("connection refused".to_string()))
            } else {
                Ok(Bytes::from_static(METADATA_DOC))
            }
        });
        let h = harness(transform);
        let id = ingest(&h).await;

        h.orchestrator
            .handle_callback(id, &product_body(id))
            .await
            .unwrap();
        // the transition is durable even though its effects could not run
        let outcome = h
            .orchestrator
            .handle_callback(id, &metadata_body(id, "U"))
            .await
            .unwrap();
        assert_eq!(outcome.state, LifecycleState::MetadataValidated);
        let product = h.ledger.get(id).await.unwrap().unwrap();
        assert_eq!(product.pending_effects.len(), 2);
        assert!(!h.index.contains(id));

        // the next event drains them first
        let outcome = h
            .orchestrator
            .handle_callback(id, &finished_body(id))
            .await
            .unwrap();
        assert_eq!(outcome.state, LifecycleState::Promoted);
        assert!(h.index.contains(id));
    }

    #[tokio::test]
    async fn test_rejected_metadata_download_fails_product() {
        let mut transform = MockTransformService::new();
        transform.expect_submit().returning(|_| Ok(()));
        transform
            .expect_fetch_metadata()
            .returning(|_| Err(TransformError::Rejected("404 Not Found".to_string())));
        let h = harness(transform);
        let id = ingest(&h).await;

        h.orchestrator
            .handle_callback(id, &product_body(id))
            .await
            .unwrap();
        let outcome = h
            .orchestrator
            .handle_callback(id, &metadata_body(id, "U"))
            .await
            .unwrap();
        assert_eq!(outcome.state, LifecycleState::Failed);
        assert!(h.objects.is_empty());
    }

    #[tokio::test]
    async fn test_missing_quarantine_object_fails_finish() {
        let h = harness(accepting_transform());
        let id = ingest(&h).await;
        h.orchestrator
            .handle_callback(id, &product_body(id))
            .await
            .unwrap();
        h.orchestrator
            .handle_callback(id, &metadata_body(id, "U"))
            .await
            .unwrap();

        h.objects
            .delete("quarantine", &quarantine_key(id))
            .await
            .unwrap();
        let outcome = h
            .orchestrator
            .handle_callback(id, &finished_body(id))
            .await
            .unwrap();
        assert_eq!(outcome.state, LifecycleState::Failed);
        assert!(!h.index.contains(id));
    }

    #[tokio::test]
    async fn test_search_requires_keyword() {
        let h = harness(accepting_transform());
        assert!(matches!(
            h.orchestrator.search("  ").await,
            Err(IntakeError::Validation(_))
        ));
    }
}
