//! End-to-end product lifecycle over the HTTP API, backed by in-memory stores.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use intake_service::config::ApiConfig;
use intake_service::transform::{TransformError, TransformRequest};
use intake_service::{
    create_router, AppState, Buckets, InMemoryLedger, InMemoryObjectStore, InMemorySearchIndex,
    IntakeSettings, Ledger, LifecycleState, Orchestrator, ProductId, TransformService,
    TransformStatus,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const METADATA_DOC: &str = r#"<metadata><title>Coastal Survey</title><region>north</region></metadata>"#;

/// Transform service that accepts everything and serves one metadata document
#[derive(Default)]
struct FakeTransform {
    submitted: Mutex<Vec<ProductId>>,
}

#[async_trait]
impl TransformService for FakeTransform {
    async fn submit(&self, request: &TransformRequest) -> Result<(), TransformError> {
        assert!(request.callback_url.ends_with(&format!("/store/{}", request.id)));
        self.submitted.lock().push(request.id);
        Ok(())
    }

    async fn status(&self, _id: ProductId) -> Result<TransformStatus, TransformError> {
        Ok(TransformStatus::Pending)
    }

    async fn fetch_metadata(&self, _location: &str) -> Result<Bytes, TransformError> {
        Ok(Bytes::from_static(METADATA_DOC.as_bytes()))
    }
}

struct TestService {
    app: Router,
    orchestrator: Orchestrator,
    ledger: Arc<InMemoryLedger>,
    objects: Arc<InMemoryObjectStore>,
    index: Arc<InMemorySearchIndex>,
    transform: Arc<FakeTransform>,
}

fn service() -> TestService {
    let ledger = Arc::new(InMemoryLedger::new());
    let objects = Arc::new(InMemoryObjectStore::new());
    let index = Arc::new(InMemorySearchIndex::new());
    let transform = Arc::new(FakeTransform::default());
    let orchestrator = Orchestrator::new(
        ledger.clone(),
        objects.clone(),
        index.clone(),
        transform.clone(),
        IntakeSettings {
            buckets: Buckets {
                quarantine: "quarantine".to_string(),
                permanent: "products".to_string(),
                metadata: "metadata".to_string(),
            },
            max_file_size_bytes: 4096,
            callback_base_url: "http://intake.local".to_string(),
        },
    );
    let app = create_router(
        AppState {
            orchestrator: orchestrator.clone(),
        },
        &ApiConfig::default(),
    );
    TestService {
        app,
        orchestrator,
        ledger,
        objects,
        index,
        transform,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Bytes) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, body)
}

async fn ingest(svc: &TestService, payload: Vec<u8>) -> ProductId {
    let request = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("Content-Length", payload.len().to_string())
        .header("Content-Type", "text/plain")
        .header("X-File-Name", "a.txt")
        .header("Accept-Version", "1.0")
        .body(Body::from(payload))
        .expect("request");
    let (status, body) = send(&svc.app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let body: Value = serde_json::from_slice(&body).expect("json");
    let id: ProductId = body["id"].as_str().expect("id").parse().expect("product id");

    // wait out the background submission so the ledger is quiet
    svc.orchestrator.submit(id).await.expect("submit");
    id
}

async fn callback(svc: &TestService, id: ProductId, payload: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/store/{id}"))
        .header("Content-Type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request");
    let (status, body) = send(&svc.app, request).await;
    (status, serde_json::from_slice(&body).expect("json"))
}

fn metadata_callback(id: ProductId, classification: &str) -> Value {
    json!({
        "id": id.to_string(),
        "status": "SUCCESS",
        "type": "irm",
        "mimeType": "application/xml",
        "bytes": METADATA_DOC.len(),
        "location": format!("http://transform.local/metadata/{id}"),
        "securityMarkings": {
            "classification": classification,
            "ownerProducer": "USA"
        }
    })
}

async fn get(svc: &TestService, uri: String) -> (StatusCode, axum::http::HeaderMap, Bytes) {
    let response = svc
        .app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, headers, body)
}

#[tokio::test]
async fn test_product_is_promoted_after_all_callbacks() {
    let svc = service();
    let payload: Vec<u8> = (0..100u8).collect();
    let id = ingest(&svc, payload.clone()).await;
    assert!(svc.transform.submitted.lock().contains(&id));

    let (status, body) = callback(&svc, id, json!({ "id": id.to_string() })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "AWAITING_CALLBACKS");

    let (status, body) = callback(&svc, id, metadata_callback(id, "U")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "METADATA_VALIDATED");

    // nothing is visible before the finished callback
    let (status, _, _) = get(&svc, format!("/retrieve/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = callback(
        &svc,
        id,
        json!({ "id": id.to_string(), "status": "FINISHED" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "PROMOTED");

    let (status, headers, body) = get(&svc, format!("/retrieve/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), payload.as_slice());
    assert_eq!(headers["content-type"], "text/plain");
    assert_eq!(headers["content-length"], "100");
    assert!(headers["content-disposition"]
        .to_str()
        .expect("header")
        .contains("a.txt"));

    let (status, _, body) = get(&svc, "/search?q=coastal".to_string()).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(body["ids"], json!([id.to_string()]));

    // a second finished callback conflicts and changes nothing
    let before = svc.ledger.get(id).await.expect("ledger").expect("product");
    let (status, body) = callback(
        &svc,
        id,
        json!({ "id": id.to_string(), "status": "FINISHED" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ALREADY_FINISHED");
    assert_eq!(
        svc.ledger.get(id).await.expect("ledger").expect("product"),
        before
    );

    // other duplicates are accepted as no-ops
    let (status, body) = callback(&svc, id, json!({ "id": id.to_string() })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);
}

#[tokio::test]
async fn test_empty_classification_fails_product() {
    let svc = service();
    let id = ingest(&svc, vec![1u8; 100]).await;

    callback(&svc, id, json!({ "id": id.to_string() })).await;
    let (status, body) = callback(&svc, id, metadata_callback(id, "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "FAILED");

    let product = svc.ledger.get(id).await.expect("ledger").expect("product");
    assert_eq!(product.state, LifecycleState::Failed);
    assert!(product.pending_effects.is_empty());
    assert!(!svc.index.contains(id));

    let (status, _, _) = get(&svc, format!("/retrieve/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = get(&svc, "/search?q=coastal".to_string()).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(body["ids"], json!([]));

    let (status, body) = callback(
        &svc,
        id,
        json!({ "id": id.to_string(), "status": "FINISHED" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "TERMINAL_STATE");
}

#[tokio::test]
async fn test_out_of_order_callbacks_conflict() {
    let svc = service();
    let id = ingest(&svc, vec![2u8; 10]).await;

    let (status, body) = callback(&svc, id, metadata_callback(id, "U")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "OUT_OF_ORDER");

    let product = svc.ledger.get(id).await.expect("ledger").expect("product");
    assert_eq!(product.state, LifecycleState::Quarantined);
    assert!(product.applied_callbacks.is_empty());
}

#[tokio::test]
async fn test_ingest_rejects_oversized_and_mismatched_uploads() {
    let svc = service();

    let request = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("Content-Length", "0")
        .header("X-File-Name", "empty.txt")
        .header("Accept-Version", "1.0")
        .body(Body::empty())
        .expect("request");
    let (status, _) = send(&svc.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("Content-Length", "50")
        .header("X-File-Name", "short.txt")
        .header("Accept-Version", "1.0")
        .body(Body::from(vec![0u8; 10]))
        .expect("request");
    let (status, _) = send(&svc.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("Content-Length", "10")
        .header("X-File-Name", "long.txt")
        .header("Accept-Version", "1.0")
        .body(Body::from(vec![0u8; 50]))
        .expect("request");
    let (status, _) = send(&svc.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(svc.objects.is_empty());
    assert!(svc.transform.submitted.lock().is_empty());
}
